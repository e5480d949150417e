use roxmltree::Node;

use super::{
    attribute_decl::{self, AttributeDeclaration},
    components::{ComponentTable, Named},
    error::XsdError,
    shared::ValueConstraint,
    values::attribute_value,
    xstypes::QName,
    AttributeGroupDefinition, MappingContext, Ref, Wildcard,
};

/// Schema Component: Attribute Use, a kind of Annotated Component (§3.5)
#[derive(Clone, Debug)]
pub struct AttributeUse {
    pub required: bool,
    pub attribute_declaration: Ref<AttributeDeclaration>,
    pub value_constraint: Option<ValueConstraint>,
}


/// The attribute-related content of a complex type or attribute group definition.
#[derive(Default)]
pub(super) struct AttributeContent {
    pub uses: Vec<Ref<AttributeUse>>,
    pub wildcard: Option<Ref<Wildcard>>,
    /// Names of attributes declared with `use="prohibited"`
    pub prohibited: Vec<QName>,
}

impl AttributeUse {
    /// The effective value constraint: the one on the use, otherwise the declaration's.
    pub fn effective_value_constraint<'a>(
        &'a self,
        components: &'a impl ComponentTable,
    ) -> Option<&'a ValueConstraint> {
        self.value_constraint.as_ref().or_else(|| {
            self.attribute_declaration
                .get(components)
                .value_constraint
                .as_ref()
        })
    }

    /// Maps the `<attribute>`, `<attributeGroup>` and `<anyAttribute>` children of `node`.
    pub(super) fn map_attribute_content(
        context: &mut MappingContext,
        node: Node,
        schema: Node,
        parent: attribute_decl::ScopeParent,
    ) -> Result<AttributeContent, XsdError> {
        let mut content = AttributeContent::default();

        for child in node.children().filter(Node::is_element) {
            match child.tag_name().name() {
                AttributeDeclaration::TAG_NAME => {
                    let use_ = attribute_value::<&str>(child, "use")?.unwrap_or("optional");
                    if let Some(ref_name) = attribute_value::<QName>(child, "ref")? {
                        if use_ == "prohibited" {
                            content.prohibited.push(ref_name);
                            continue;
                        }
                        let Some(declaration) =
                            context.resolve_or_report::<Ref<AttributeDeclaration>>(&ref_name)?
                        else {
                            continue;
                        };
                        context.request(declaration)?;
                        content.uses.push(context.create(AttributeUse {
                            required: use_ == "required",
                            attribute_declaration: declaration,
                            value_constraint: ValueConstraint::map_from_xml(child),
                        }));
                    } else {
                        let declaration = AttributeDeclaration::map_from_xml_local(
                            context, child, schema, parent,
                        )?;
                        if use_ == "prohibited" {
                            content
                                .prohibited
                                .extend(context.components().get(declaration).name());
                            continue;
                        }
                        // The value constraint lives on the declaration for local attributes
                        content.uses.push(context.create(AttributeUse {
                            required: use_ == "required",
                            attribute_declaration: declaration,
                            value_constraint: None,
                        }));
                    }
                }
                AttributeGroupDefinition::TAG_NAME => {
                    let Some(ref_name) = attribute_value::<QName>(child, "ref")? else {
                        continue;
                    };
                    let Some(group) = context
                        .resolve_or_report::<Ref<AttributeGroupDefinition>>(&ref_name)?
                    else {
                        continue;
                    };
                    let group = context.request(group)?;
                    let (uses, wildcard) = (group.attribute_uses.clone(), group.attribute_wildcard);
                    content.uses.extend(uses);
                    if content.wildcard.is_none() {
                        content.wildcard = wildcard;
                    }
                }
                Wildcard::ANY_ATTRIBUTE_TAG_NAME => {
                    content.wildcard = Some(Wildcard::map_from_xml(context, child, schema)?);
                }
                _ => {}
            }
        }

        Ok(content)
    }
}
