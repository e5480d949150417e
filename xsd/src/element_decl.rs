use roxmltree::Node;

use super::{
    annotation::Annotation,
    builtins::XS_ANY_TYPE_NAME,
    complex_type_def::ComplexTypeDefinition,
    components::{Named, NamedXml},
    error::XsdError,
    mapping_context::TopLevelMappable,
    model_group_def::ModelGroupDefinition,
    particle::MaxOccurs,
    shared::{self, TypeDefinition, ValueConstraint},
    values::{actual_value, attribute_value},
    xstypes::QName,
    MappingContext, Particle, Ref, SimpleTypeDefinition, Term,
};

/// An `<element>` declaration (§3.3).
#[derive(Clone, Debug)]
pub struct ElementDeclaration {
    pub name: String,
    pub target_namespace: Option<String>,
    pub type_definition: TypeDefinition,
    pub scope: Scope,
    pub value_constraint: Option<ValueConstraint>,
    pub nillable: bool,
    /// Heads of the substitution groups this element belongs to
    pub substitution_group_affiliations: Vec<Ref<ElementDeclaration>>,
    pub abstract_: bool,
    pub annotation: Option<Annotation>,
}

pub type Scope = shared::Scope<ScopeParent>;

/// The component a local element declaration is nested in.
#[derive(Copy, Clone, Debug)]
pub enum ScopeParent {
    ComplexType(Ref<ComplexTypeDefinition>),
    Group(Ref<ModelGroupDefinition>),
}

fn required_name(element: Node) -> Result<String, XsdError> {
    attribute_value::<String>(element, "name")?.ok_or_else(|| XsdError::MissingAttribute {
        element: ElementDeclaration::TAG_NAME.into(),
        attribute: "name",
    })
}

impl NamedXml for ElementDeclaration {
    fn get_name_from_xml(element: Node, schema: Node) -> Result<QName, XsdError> {
        Ok(QName::with_optional_namespace(
            schema.attribute("targetNamespace"),
            required_name(element)?,
        ))
    }
}

impl Named for ElementDeclaration {
    fn name(&self) -> Option<QName> {
        Some(QName::with_optional_namespace(
            self.target_namespace.as_ref(),
            &self.name,
        ))
    }
}

impl ElementDeclaration {
    pub const TAG_NAME: &'static str = "element";

    fn map_declaration(
        context: &mut MappingContext,
        element: Node,
        schema: Node,
        target_namespace: Option<String>,
        scope: Scope,
    ) -> Result<Self, XsdError> {
        let name = required_name(element)?;

        let mut substitution_group_affiliations = Vec::new();
        if let Some(heads) = element.attribute("substitutionGroup") {
            for head in actual_value::<Vec<QName>>(heads, element)? {
                substitution_group_affiliations
                    .extend(context.resolve_or_report::<Ref<Self>>(&head)?);
            }
        }
        let type_definition =
            Self::declared_type(context, element, schema, &substitution_group_affiliations)?;

        Ok(Self {
            name,
            target_namespace,
            type_definition,
            scope,
            value_constraint: ValueConstraint::map_from_xml(element),
            nillable: attribute_value::<bool>(element, "nillable")?.unwrap_or(false),
            substitution_group_affiliations,
            abstract_: attribute_value::<bool>(element, "abstract")?.unwrap_or(false),
            annotation: Annotation::map_from_xml(element),
        })
    }

    /// An inline type first, then the `type` attribute, then the type of the first
    /// substitution group head, then `xs:anyType`. An unresolved `type` falls back to
    /// `xs:anyType` outside strict mode.
    fn declared_type(
        context: &mut MappingContext,
        element: Node,
        schema: Node,
        heads: &[Ref<Self>],
    ) -> Result<TypeDefinition, XsdError> {
        for child in element.children().filter(Node::is_element) {
            match child.tag_name().name() {
                SimpleTypeDefinition::TAG_NAME => {
                    return SimpleTypeDefinition::map_from_xml(context, child, schema, None)
                        .map(TypeDefinition::Simple)
                }
                ComplexTypeDefinition::TAG_NAME => {
                    return ComplexTypeDefinition::map_from_xml(context, child, schema, None)
                        .map(TypeDefinition::Complex)
                }
                _ => {}
            }
        }
        if let Some(type_name) = attribute_value::<QName>(element, "type")? {
            if let Some(found) = context.resolve_or_report::<TypeDefinition>(&type_name)? {
                return Ok(found);
            }
        } else if let Some(&head) = heads.first() {
            return Ok(context.request(head)?.type_definition);
        }
        context.resolve(&XS_ANY_TYPE_NAME)
    }

    /// Maps an `<element>` inside a model group to a [`Particle`]. Elements with
    /// `maxOccurs="0"` and unresolvable references (outside strict mode) map to nothing.
    pub(super) fn map_from_xml_local(
        context: &mut MappingContext,
        element: Node,
        schema: Node,
        parent: ScopeParent,
    ) -> Result<Option<Ref<Particle>>, XsdError> {
        let (min_occurs, max_occurs) = Particle::occurs_from_xml(element)?;
        if max_occurs == MaxOccurs::Count(0) {
            return Ok(None);
        }

        let declaration = match attribute_value::<QName>(element, "ref")? {
            Some(name) => match context.resolve_or_report::<Ref<Self>>(&name)? {
                Some(declaration) => declaration,
                None => return Ok(None),
            },
            None => {
                let qualified = element
                    .attribute("form")
                    .or_else(|| schema.attribute("elementFormDefault"))
                    == Some("qualified");
                let target_namespace = schema
                    .attribute("targetNamespace")
                    .filter(|_| qualified)
                    .map(str::to_string);
                let declaration = Self::map_declaration(
                    context,
                    element,
                    schema,
                    target_namespace,
                    Scope::Local(parent),
                )?;
                context.create(declaration)
            }
        };

        Ok(Some(context.create(Particle {
            min_occurs,
            max_occurs,
            term: Term::ElementDeclaration(declaration),
        })))
    }
}

impl TopLevelMappable for ElementDeclaration {
    fn map_from_top_level_xml(
        context: &mut MappingContext,
        self_ref: Ref<Self>,
        element: Node,
        schema: Node,
    ) -> Result<(), XsdError> {
        let target_namespace = schema.attribute("targetNamespace").map(str::to_string);
        let declaration =
            Self::map_declaration(context, element, schema, target_namespace, Scope::Global)?;
        context.insert(self_ref, declaration);
        Ok(())
    }
}
