use lazy_static::lazy_static;

use super::attribute_decl::{self, AttributeDeclaration};
use super::complex_type_def::{ComplexTypeDefinition, ContentType, DerivationMethod};
use super::error::XsdError;
use super::mapping_context::RootContext;
use super::particle::{Compositor, MaxOccurs};
use super::simple_type_def::{Facets, SimpleTypeDefinition, Variety};
use super::wildcard::{NamespaceConstraint, ProcessContents};
use super::xstypes::{QName, XML_NAMESPACE};
use super::{ModelGroup, Particle, Ref, Term, TypeDefinition, Wildcard};

// Namespaces defined by XML Schema (pt. 1, §1.3.1)
pub const XS_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
pub const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

lazy_static! {
    /// The `xs:anyType` qualified name
    pub static ref XS_ANY_TYPE_NAME: QName = QName::with_namespace(XS_NAMESPACE, "anyType");
    /// The `xs:anySimpleType` qualified name
    pub static ref XS_ANY_SIMPLE_TYPE_NAME: QName = QName::with_namespace(XS_NAMESPACE, "anySimpleType");
    pub static ref XS_QNAME_NAME: QName = QName::with_namespace(XS_NAMESPACE, "QName");
    pub static ref XS_ANY_URI_NAME: QName = QName::with_namespace(XS_NAMESPACE, "anyURI");
    pub static ref XS_BOOLEAN_NAME: QName = QName::with_namespace(XS_NAMESPACE, "boolean");
    pub static ref XS_STRING_NAME: QName = QName::with_namespace(XS_NAMESPACE, "string");
}

/// The attributes of the XML namespace that are always available.
const XML_ATTRIBUTES: [&str; 4] = ["lang", "space", "base", "id"];

/// Whether `name` belongs to a component that is registered before any schema is read.
pub fn is_builtin_name(name: &QName) -> bool {
    match name.namespace() {
        Some(XS_NAMESPACE) | Some(XSI_NAMESPACE) => true,
        Some(XML_NAMESPACE) => XML_ATTRIBUTES.contains(&name.local_name.as_str()),
        _ => false,
    }
}

pub(super) fn register_builtins(context: &mut RootContext) -> Result<(), XsdError> {
    register_xs_any_type(context)?;
    register_xs_any_simple_type(context)?;
    register_builtin_primitive_types(context)?;
    register_builtin_ordinary_types(context)?;

    register_builtin_attribute_decls(context)
}

fn any_wildcard(context: &mut RootContext) -> Ref<Wildcard> {
    context.create(Wildcard {
        namespace_constraint: NamespaceConstraint::Any,
        process_contents: ProcessContents::Lax,
    })
}

/// Registers the only built-in complex type, `xs:anyType` (§3.4.7 Built-in Complex Type Definition)
fn register_xs_any_type(context: &mut RootContext) -> Result<(), XsdError> {
    // The inner particle of ·xs:anyType· contains a wildcard which matches any element:
    let inner_particle_term = any_wildcard(context);
    let inner_particle = context.create(Particle {
        min_occurs: 0,
        max_occurs: MaxOccurs::Unbounded,
        term: Term::Wildcard(inner_particle_term),
    });

    // The outer particle of ·xs:anyType· contains a sequence with a single term:
    let outer_particle_term = context.create(ModelGroup {
        compositor: Compositor::Sequence,
        particles: vec![inner_particle],
        annotation: None,
    });
    let outer_particle = context.create(Particle {
        min_occurs: 1,
        max_occurs: MaxOccurs::Count(1),
        term: Term::ModelGroup(outer_particle_term),
    });

    let wildcard = any_wildcard(context);

    let xs_any_type = context.reserve();
    context.insert(
        xs_any_type,
        ComplexTypeDefinition {
            name: Some("anyType".into()),
            target_namespace: Some(XS_NAMESPACE.into()),
            base_type_definition: TypeDefinition::Complex(xs_any_type),
            derivation_method: Some(DerivationMethod::Restriction),
            abstract_: false,
            attribute_uses: Vec::new(),
            attribute_wildcard: Some(wildcard),
            content_type: ContentType::Mixed {
                particle: outer_particle,
            },
            annotation: None,
            is_builtin: true,
        },
    );
    context.register(TypeDefinition::Complex(xs_any_type))
}

fn builtin_simple_type(
    name: &str,
    base: TypeDefinition,
    variety: Option<Variety>,
    item_type_definition: Option<Ref<SimpleTypeDefinition>>,
) -> SimpleTypeDefinition {
    SimpleTypeDefinition {
        name: Some(name.into()),
        target_namespace: Some(XS_NAMESPACE.into()),
        base_type_definition: base,
        facets: Facets::default(),
        variety,
        item_type_definition,
        member_type_definitions: Vec::new(),
        annotation: None,
        is_builtin: true,
    }
}

/// Registers `xs:anySimpleType` (pt. 2, §3.2.1)
fn register_xs_any_simple_type(context: &mut RootContext) -> Result<(), XsdError> {
    let xs_any_type: TypeDefinition = context.resolve(&XS_ANY_TYPE_NAME)?;
    let xs_any_simple_type =
        context.create(builtin_simple_type("anySimpleType", xs_any_type, None, None));
    context.register(TypeDefinition::Simple(xs_any_simple_type))
}

/// Registers the 19 builtin primitive types (pt. 1, §3.16.7.4)
fn register_builtin_primitive_types(context: &mut RootContext) -> Result<(), XsdError> {
    const PRIMITIVE_TYPES: [&str; 19] = [
        "string",
        "boolean",
        "float",
        "double",
        "decimal",
        "dateTime",
        "duration",
        "time",
        "date",
        "gMonth",
        "gMonthDay",
        "gDay",
        "gYear",
        "gYearMonth",
        "hexBinary",
        "base64Binary",
        "anyURI",
        "QName",
        "NOTATION",
    ];

    let xs_any_simple_type: TypeDefinition = context.resolve(&XS_ANY_SIMPLE_TYPE_NAME)?;
    for name in PRIMITIVE_TYPES {
        let primitive = context.create(builtin_simple_type(
            name,
            xs_any_simple_type,
            Some(Variety::Atomic),
            None,
        ));
        context.register(TypeDefinition::Simple(primitive))?;
    }
    Ok(())
}

/// Registers the built-in ordinary (derived) datatypes (pt. 2, §3.4), in derivation order.
/// List types name their item type in the third column.
fn register_builtin_ordinary_types(context: &mut RootContext) -> Result<(), XsdError> {
    const ORDINARY_TYPES: [(&str, &str, Option<&str>); 28] = [
        ("normalizedString", "string", None),
        ("token", "normalizedString", None),
        ("language", "token", None),
        ("NMTOKEN", "token", None),
        ("NMTOKENS", "anySimpleType", Some("NMTOKEN")),
        ("Name", "token", None),
        ("String", "Name", None),
        ("ID", "String", None),
        ("IDREF", "String", None),
        ("IDREFS", "anySimpleType", Some("IDREF")),
        ("ENTITY", "String", None),
        ("ENTITIES", "anySimpleType", Some("ENTITY")),
        ("integer", "decimal", None),
        ("nonPositiveInteger", "integer", None),
        ("negativeInteger", "nonPositiveInteger", None),
        ("long", "integer", None),
        ("int", "long", None),
        ("short", "int", None),
        ("byte", "short", None),
        ("nonNegativeInteger", "integer", None),
        ("unsignedLong", "nonNegativeInteger", None),
        ("unsignedInt", "unsignedLong", None),
        ("unsignedShort", "unsignedInt", None),
        ("unsignedByte", "unsignedShort", None),
        ("positiveInteger", "nonNegativeInteger", None),
        ("yearMonthDuration", "duration", None),
        ("dayTimeDuration", "duration", None),
        ("dateTimeStamp", "dateTime", None),
    ];

    for (name, base, item) in ORDINARY_TYPES {
        let base: TypeDefinition = context.resolve(&QName::with_namespace(XS_NAMESPACE, base))?;
        let (variety, item_type_definition) = match item {
            Some(item) => (
                Variety::List,
                Some(context.resolve(&QName::with_namespace(XS_NAMESPACE, item))?),
            ),
            None => (Variety::Atomic, None),
        };
        let ordinary = context.create(builtin_simple_type(
            name,
            base,
            Some(variety),
            item_type_definition,
        ));
        context.register(TypeDefinition::Simple(ordinary))?;
    }
    Ok(())
}

fn builtin_attribute(
    context: &mut RootContext,
    namespace: &str,
    name: &str,
    type_definition: Ref<SimpleTypeDefinition>,
) -> Result<(), XsdError> {
    let declaration = context.create(AttributeDeclaration {
        name: name.into(),
        target_namespace: Some(namespace.into()),
        type_definition,
        scope: attribute_decl::Scope::Global,
        value_constraint: None,
        annotation: None,
        is_builtin: true,
    });
    context.register(declaration)
}

/// Built-in Attribute Declarations according to pt. 1, §3.2.7, plus the attributes of the XML
/// namespace
fn register_builtin_attribute_decls(context: &mut RootContext) -> Result<(), XsdError> {
    let qname = context.resolve(&XS_QNAME_NAME)?;
    let boolean = context.resolve(&XS_BOOLEAN_NAME)?;
    let any_uri = context.resolve(&XS_ANY_URI_NAME)?;
    let string = context.resolve(&XS_STRING_NAME)?;
    let any_simple_type: TypeDefinition = context.resolve(&XS_ANY_SIMPLE_TYPE_NAME)?;

    builtin_attribute(context, XSI_NAMESPACE, "type", qname)?;
    builtin_attribute(context, XSI_NAMESPACE, "nil", boolean)?;

    let schema_location_list = context.create(SimpleTypeDefinition {
        name: None,
        target_namespace: Some(XSI_NAMESPACE.into()),
        base_type_definition: any_simple_type,
        facets: Facets::default(),
        variety: Some(Variety::List),
        item_type_definition: Some(any_uri),
        member_type_definitions: Vec::new(),
        annotation: None,
        is_builtin: true,
    });
    builtin_attribute(context, XSI_NAMESPACE, "schemaLocation", schema_location_list)?;
    builtin_attribute(context, XSI_NAMESPACE, "noNamespaceSchemaLocation", any_uri)?;

    for name in XML_ATTRIBUTES {
        let type_definition = if name == "base" { any_uri } else { string };
        builtin_attribute(context, XML_NAMESPACE, name, type_definition)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::ComponentTable;
    use crate::BuiltinOverwriteAction;

    #[test]
    fn registers_builtins() {
        let mut root_context = RootContext::new(BuiltinOverwriteAction::Deny, true);
        register_builtins(&mut root_context).unwrap();

        let int: Ref<SimpleTypeDefinition> = root_context
            .resolve(&QName::with_namespace(XS_NAMESPACE, "int"))
            .unwrap();
        let builtin = int.get(root_context.components());
        assert!(builtin.is_builtin);
        assert_eq!(builtin.variety, Some(Variety::Atomic));

        let idrefs: Ref<SimpleTypeDefinition> = root_context
            .resolve(&QName::with_namespace(XS_NAMESPACE, "IDREFS"))
            .unwrap();
        assert!(idrefs.get(root_context.components()).is_list());
    }

    #[test]
    fn any_type_is_its_own_base() {
        let mut root_context = RootContext::new(BuiltinOverwriteAction::Deny, true);
        register_builtins(&mut root_context).unwrap();

        let any_type: TypeDefinition = root_context.resolve(&XS_ANY_TYPE_NAME).unwrap();
        assert_eq!(
            any_type.base_type_definition(root_context.components()),
            any_type
        );
        assert_eq!(
            any_type.ancestors_or_self(root_context.components()).count(),
            1
        );
    }

    #[test]
    fn builtin_names() {
        assert!(is_builtin_name(&XS_STRING_NAME));
        assert!(is_builtin_name(&QName::with_namespace(XML_NAMESPACE, "lang")));
        assert!(!is_builtin_name(&QName::with_namespace(XML_NAMESPACE, "foo")));
        assert!(!is_builtin_name(&QName::with_namespace("urn:x", "string")));
    }
}
