use roxmltree::Node;

use super::{
    annotation::Annotation,
    components::{Named, NamedXml},
    element_decl,
    error::XsdError,
    mapping_context::TopLevelMappable,
    xstypes::QName,
    MappingContext, ModelGroup, Particle, Ref,
};

/// Schema Component: Model Group Definition, a kind of Annotated Component (§3.7)
#[derive(Clone, Debug)]
pub struct ModelGroupDefinition {
    pub name: String,
    pub target_namespace: Option<String>,
    /// Shared by every particle that references this definition
    pub model_group: Ref<ModelGroup>,
    pub annotation: Option<Annotation>,
}


impl Named for ModelGroupDefinition {
    fn name(&self) -> Option<QName> {
        Some(QName::with_optional_namespace(
            self.target_namespace.as_ref(),
            &self.name,
        ))
    }
}

impl NamedXml for ModelGroupDefinition {
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

impl ModelGroupDefinition {
    pub const TAG_NAME: &'static str = "group";
}

impl TopLevelMappable for ModelGroupDefinition {
    fn map_from_top_level_xml(
        context: &mut MappingContext,
        self_ref: Ref<Self>,
        self_node: Node,
        schema_node: Node,
    ) -> Result<(), XsdError> {
        let name = Self::get_name_from_xml(self_node, schema_node)?;

        // {model group}
        //   A model group which is the {term} of a particle corresponding to the <all>, <choice>
        //   or <sequence> among the [children]. There must be one.
        let group_node = self_node
            .children()
            .find(|c| matches!(c.tag_name().name(), "all" | "choice" | "sequence"))
            .ok_or_else(|| XsdError::Unsupported(format!("empty group {name}")))?;
        let model_group = Particle::map_from_xml_model_group_term(
            context,
            group_node,
            schema_node,
            element_decl::ScopeParent::Group(self_ref),
        )?;

        context.insert(
            self_ref,
            Self {
                name: name.local_name,
                target_namespace: name.namespace_name,
                model_group,
                annotation: Annotation::map_from_xml(self_node),
            },
        );
        Ok(())
    }
}
