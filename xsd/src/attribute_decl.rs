use roxmltree::Node;

use super::{
    annotation::Annotation,
    builtins::XS_ANY_SIMPLE_TYPE_NAME,
    components::{Named, NamedXml},
    error::XsdError,
    mapping_context::TopLevelMappable,
    shared::{self, ValueConstraint},
    values::attribute_value,
    xstypes::QName,
    AttributeGroupDefinition, ComplexTypeDefinition, MappingContext, Ref, SimpleTypeDefinition,
    TypeDefinition,
};

/// Schema Component: Attribute Declaration, a kind of Annotated Component (§3.2)
#[derive(Clone, Debug)]
pub struct AttributeDeclaration {
    pub name: String,
    pub target_namespace: Option<String>,
    pub type_definition: Ref<SimpleTypeDefinition>,
    pub scope: Scope,
    pub value_constraint: Option<ValueConstraint>,
    pub annotation: Option<Annotation>,

    pub is_builtin: bool,
}

/// Property Record: Scope (§3.2)
pub type Scope = shared::Scope<ScopeParent>;

#[derive(Copy, Clone, Debug)]
pub enum ScopeParent {
    ComplexType(Ref<ComplexTypeDefinition>),
    AttributeGroup(Ref<AttributeGroupDefinition>),
}


impl Named for AttributeDeclaration {
    fn name(&self) -> Option<QName> {
        Some(QName::with_optional_namespace(
            self.target_namespace.as_ref(),
            &self.name,
        ))
    }
}

impl NamedXml for AttributeDeclaration {
    fn get_name_from_xml(attribute: Node, schema: Node) -> Result<QName, XsdError> {
        let name = attribute
            .attribute("name")
            .ok_or_else(|| XsdError::MissingAttribute {
                element: Self::TAG_NAME.into(),
                attribute: "name",
            })?;
        Ok(QName::with_optional_namespace(
            schema.attribute("targetNamespace"),
            name,
        ))
    }
}

impl AttributeDeclaration {
    pub const TAG_NAME: &'static str = "attribute";

    fn map_from_xml_common(
        context: &mut MappingContext,
        attribute: Node,
        schema: Node,
        target_namespace: Option<String>,
        scope: Scope,
    ) -> Result<Self, XsdError> {
        let name = attribute_value::<String>(attribute, "name")?.ok_or_else(|| {
            XsdError::MissingAttribute {
                element: Self::TAG_NAME.into(),
                attribute: "name",
            }
        })?;

        // {type definition}
        //   The simple type definition corresponding to the <simpleType> element information item
        //   in the [children], if present, otherwise the simple type definition ·resolved· to by
        //   the ·actual value· of the type [attribute], if present, otherwise ·xs:anySimpleType·.
        let inline = attribute
            .children()
            .find(|c| c.tag_name().name() == SimpleTypeDefinition::TAG_NAME);
        let type_definition = if let Some(inline) = inline {
            SimpleTypeDefinition::map_from_xml(context, inline, schema, None)?
        } else if let Some(type_name) = attribute_value::<QName>(attribute, "type")? {
            match context.resolve_or_report::<TypeDefinition>(&type_name)? {
                Some(TypeDefinition::Simple(simple)) => simple,
                Some(TypeDefinition::Complex(_)) => {
                    context.report(XsdError::InvalidValue {
                        what: "attribute type",
                        value: type_name.to_string(),
                    })?;
                    context.resolve(&XS_ANY_SIMPLE_TYPE_NAME)?
                }
                None => context.resolve(&XS_ANY_SIMPLE_TYPE_NAME)?,
            }
        } else {
            context.resolve(&XS_ANY_SIMPLE_TYPE_NAME)?
        };

        Ok(Self {
            name,
            target_namespace,
            type_definition,
            scope,
            value_constraint: ValueConstraint::map_from_xml(attribute),
            annotation: Annotation::map_from_xml(attribute),
            is_builtin: false,
        })
    }

    /// Maps a local `<attribute name="...">` declaration.
    pub(super) fn map_from_xml_local(
        context: &mut MappingContext,
        attribute: Node,
        schema: Node,
        parent: ScopeParent,
    ) -> Result<Ref<Self>, XsdError> {
        // {target namespace}
        //   If form is present and its ·actual value· is qualified, or if form is absent and the
        //   ·actual value· of attributeFormDefault on the <schema> ancestor is qualified, then the
        //   ·actual value· of the targetNamespace [attribute] of the ancestor <schema> element
        //   information item, or ·absent· if there is none, otherwise ·absent·.
        let qualified = attribute
            .attribute("form")
            .or_else(|| schema.attribute("attributeFormDefault"))
            == Some("qualified");
        let target_namespace = if qualified {
            schema.attribute("targetNamespace").map(str::to_string)
        } else {
            None
        };
        let declaration = Self::map_from_xml_common(
            context,
            attribute,
            schema,
            target_namespace,
            Scope::Local(parent),
        )?;
        Ok(context.create(declaration))
    }
}

impl TopLevelMappable for AttributeDeclaration {
    fn map_from_top_level_xml(
        context: &mut MappingContext,
        self_ref: Ref<Self>,
        self_node: Node,
        schema_node: Node,
    ) -> Result<(), XsdError> {
        let target_namespace = schema_node.attribute("targetNamespace").map(str::to_string);
        let declaration = Self::map_from_xml_common(
            context,
            self_node,
            schema_node,
            target_namespace,
            Scope::Global,
        )?;
        context.insert(self_ref, declaration);
        Ok(())
    }
}
