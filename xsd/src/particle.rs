use roxmltree::Node;

use super::{
    annotation::Annotation,
    element_decl::ScopeParent,
    error::XsdError,
    shared::Term,
    values::attribute_value,
    xstypes::QName,
    ElementDeclaration, MappingContext, ModelGroupDefinition, Ref, Wildcard,
};

/// A term with occurrence bounds (§3.9).
#[derive(Clone, Debug)]
pub struct Particle {
    pub min_occurs: u64,
    pub max_occurs: MaxOccurs,
    pub term: Term,
}

/// A sequence, choice or `all` group of particles (§3.8).
#[derive(Clone, Debug)]
pub struct ModelGroup {
    pub compositor: Compositor,
    pub particles: Vec<Ref<Particle>>,
    pub annotation: Option<Annotation>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Compositor {
    All,
    Choice,
    Sequence,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MaxOccurs {
    Unbounded,
    Count(u64),
}

impl MaxOccurs {
    /// Whether more than one occurrence is allowed.
    pub fn is_many(self) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Count(n) => n > 1,
        }
    }

    /// The count, with `None` standing for unbounded.
    pub fn count(self) -> Option<u64> {
        match self {
            Self::Unbounded => None,
            Self::Count(n) => Some(n),
        }
    }
}

impl Particle {
    /// Reads `minOccurs` and `maxOccurs`, both defaulting to 1.
    pub(super) fn occurs_from_xml(node: Node) -> Result<(u64, MaxOccurs), XsdError> {
        let min_occurs = attribute_value::<u64>(node, "minOccurs")?.unwrap_or(1);
        let max_occurs = match node.attribute("maxOccurs").map(str::trim) {
            Some("unbounded") => MaxOccurs::Unbounded,
            Some(_) => MaxOccurs::Count(attribute_value::<u64>(node, "maxOccurs")?.unwrap_or(1)),
            None => MaxOccurs::Count(1),
        };
        Ok((min_occurs, max_occurs))
    }

    /// Maps the content of an `<all>`, `<choice>` or `<sequence>` element. Children that map
    /// to nothing, such as `maxOccurs="0"` elements, are left out.
    pub(super) fn map_from_xml_model_group_term(
        context: &mut MappingContext,
        group: Node,
        schema: Node,
        parent: ScopeParent,
    ) -> Result<Ref<ModelGroup>, XsdError> {
        let compositor = match group.tag_name().name() {
            "all" => Compositor::All,
            "choice" => Compositor::Choice,
            _ => Compositor::Sequence,
        };

        let mut particles = Vec::new();
        for child in group.children().filter(Node::is_element) {
            let particle = match child.tag_name().name() {
                "all" | "choice" | "sequence" => Some(Self::map_from_xml_model_group(
                    context, child, schema, parent,
                )?),
                Wildcard::ANY_TAG_NAME => {
                    Some(Self::map_from_xml_wildcard_any(context, child, schema)?)
                }
                ModelGroupDefinition::TAG_NAME => {
                    Self::map_from_xml_group_reference(context, child)?
                }
                ElementDeclaration::TAG_NAME => {
                    ElementDeclaration::map_from_xml_local(context, child, schema, parent)?
                }
                _ => None,
            };
            particles.extend(particle);
        }

        Ok(context.create(ModelGroup {
            compositor,
            particles,
            annotation: Annotation::map_from_xml(group),
        }))
    }

    /// A nested `<all>`, `<choice>` or `<sequence>` as a particle.
    pub(super) fn map_from_xml_model_group(
        context: &mut MappingContext,
        group: Node,
        schema: Node,
        parent: ScopeParent,
    ) -> Result<Ref<Self>, XsdError> {
        let (min_occurs, max_occurs) = Self::occurs_from_xml(group)?;
        let model_group = Self::map_from_xml_model_group_term(context, group, schema, parent)?;
        Ok(context.create(Particle {
            min_occurs,
            max_occurs,
            term: Term::ModelGroup(model_group),
        }))
    }

    /// A `<group ref="..."/>`. The particle shares the model group of the definition. Returns
    /// `None` for `maxOccurs="0"` and, outside strict mode, for unresolved references.
    pub(super) fn map_from_xml_group_reference(
        context: &mut MappingContext,
        group: Node,
    ) -> Result<Option<Ref<Particle>>, XsdError> {
        let (min_occurs, max_occurs) = Self::occurs_from_xml(group)?;
        if max_occurs == MaxOccurs::Count(0) {
            return Ok(None);
        }
        let name = attribute_value::<QName>(group, "ref")?.ok_or_else(|| {
            XsdError::MissingAttribute {
                element: ModelGroupDefinition::TAG_NAME.into(),
                attribute: "ref",
            }
        })?;
        let Some(definition) = context.resolve_or_report::<Ref<ModelGroupDefinition>>(&name)?
        else {
            return Ok(None);
        };
        let model_group = context.request(definition)?.model_group;
        Ok(Some(context.create(Particle {
            min_occurs,
            max_occurs,
            term: Term::ModelGroup(model_group),
        })))
    }

    pub(super) fn map_from_xml_wildcard_any(
        context: &mut MappingContext,
        any: Node,
        schema: Node,
    ) -> Result<Ref<Self>, XsdError> {
        let (min_occurs, max_occurs) = Self::occurs_from_xml(any)?;
        let wildcard = Wildcard::map_from_xml(context, any, schema)?;
        Ok(context.create(Particle {
            min_occurs,
            max_occurs,
            term: Term::Wildcard(wildcard),
        }))
    }
}
