use roxmltree::Node;

use super::{
    annotation::Annotation,
    attribute_decl::ScopeParent,
    attribute_use::AttributeUse,
    components::{Named, NamedXml},
    error::XsdError,
    mapping_context::TopLevelMappable,
    xstypes::QName,
    MappingContext, Ref, Wildcard,
};

/// Schema Component: Attribute Group Definition, a kind of Annotated Component (§3.6)
#[derive(Clone, Debug)]
pub struct AttributeGroupDefinition {
    pub name: String,
    pub target_namespace: Option<String>,
    pub attribute_uses: Vec<Ref<AttributeUse>>,
    pub attribute_wildcard: Option<Ref<Wildcard>>,
    pub annotation: Option<Annotation>,
}


impl Named for AttributeGroupDefinition {
    fn name(&self) -> Option<QName> {
        Some(QName::with_optional_namespace(
            self.target_namespace.as_ref(),
            &self.name,
        ))
    }
}

impl NamedXml for AttributeGroupDefinition {
    fn get_name_from_xml(group: Node, schema: Node) -> Result<QName, XsdError> {
        let name = group
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

impl AttributeGroupDefinition {
    pub const TAG_NAME: &'static str = "attributeGroup";
}

impl TopLevelMappable for AttributeGroupDefinition {
    fn map_from_top_level_xml(
        context: &mut MappingContext,
        self_ref: Ref<Self>,
        self_node: Node,
        schema_node: Node,
    ) -> Result<(), XsdError> {
        let name = Self::get_name_from_xml(self_node, schema_node)?;
        let content = AttributeUse::map_attribute_content(
            context,
            self_node,
            schema_node,
            ScopeParent::AttributeGroup(self_ref),
        )?;

        context.insert(
            self_ref,
            Self {
                name: name.local_name,
                target_namespace: name.namespace_name,
                attribute_uses: content.uses,
                attribute_wildcard: content.wildcard,
                annotation: Annotation::map_from_xml(self_node),
            },
        );
        Ok(())
    }
}
