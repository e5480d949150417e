use roxmltree::Node;

use super::{
    annotation::Annotation,
    attribute_decl,
    attribute_use::{AttributeContent, AttributeUse},
    builtins::{XS_ANY_TYPE_NAME, XS_STRING_NAME},
    components::{ComponentTable, Named, NamedXml, RefNamed},
    element_decl,
    error::XsdError,
    mapping_context::TopLevelMappable,
    particle::{Compositor, MaxOccurs, Particle},
    shared::{Term, TypeDefinition},
    simple_type_def::SimpleTypeDefinition,
    values::attribute_value,
    xstypes::QName,
    MappingContext, ModelGroup, ModelGroupDefinition, Ref, Wildcard,
};

/// Schema Component: Complex Type Definition, a kind of Type Definition (§3.4)
#[derive(Clone, Debug)]
pub struct ComplexTypeDefinition {
    pub name: Option<String>,
    pub target_namespace: Option<String>,
    pub base_type_definition: TypeDefinition,
    pub derivation_method: Option<DerivationMethod>,
    pub abstract_: bool,
    pub attribute_uses: Vec<Ref<AttributeUse>>,
    pub attribute_wildcard: Option<Ref<Wildcard>>,
    pub content_type: ContentType,
    pub annotation: Option<Annotation>,

    pub is_builtin: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DerivationMethod {
    Extension,
    Restriction,
}

/// Property Record: Content Type (§3.4)
#[derive(Copy, Clone, Debug)]
pub enum ContentType {
    Empty,
    Simple {
        simple_type_definition: Ref<SimpleTypeDefinition>,
    },
    ElementOnly {
        particle: Ref<Particle>,
    },
    Mixed {
        particle: Ref<Particle>,
    },
}

impl ContentType {
    pub fn particle(&self) -> Option<Ref<Particle>> {
        match self {
            Self::ElementOnly { particle } | Self::Mixed { particle } => Some(*particle),
            _ => None,
        }
    }

    pub fn simple_type_definition(&self) -> Option<Ref<SimpleTypeDefinition>> {
        match self {
            Self::Simple {
                simple_type_definition,
            } => Some(*simple_type_definition),
            _ => None,
        }
    }

    pub fn is_mixed(&self) -> bool {
        matches!(self, Self::Mixed { .. })
    }
}


impl Named for ComplexTypeDefinition {
    fn name(&self) -> Option<QName> {
        self.name
            .as_ref()
            .map(|name| QName::with_optional_namespace(self.target_namespace.as_ref(), name))
    }
}

impl NamedXml for ComplexTypeDefinition {
    fn get_name_from_xml(complex_type: Node, schema: Node) -> Result<QName, XsdError> {
        let name = complex_type
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

/// Intermediate result of mapping the content of a `<complexType>`
struct MappedContent {
    base_type_definition: TypeDefinition,
    derivation_method: DerivationMethod,
    attribute_uses: Vec<Ref<AttributeUse>>,
    attribute_wildcard: Option<Ref<Wildcard>>,
    content_type: ContentType,
}

impl ComplexTypeDefinition {
    pub const TAG_NAME: &'static str = "complexType";

    /// Maps a `<complexType>` element; a top-level definition passes its pre-reserved reference
    /// in `self_ref`.
    pub(super) fn map_from_xml(
        context: &mut MappingContext,
        complex_type: Node,
        schema: Node,
        self_ref: Option<Ref<Self>>,
    ) -> Result<Ref<Self>, XsdError> {
        let self_ref = self_ref.unwrap_or_else(|| context.reserve());

        // {name}
        //   The ·actual value· of the name [attribute] if present, otherwise ·absent·.
        let name = attribute_value::<String>(complex_type, "name")?;

        // {target namespace}
        //   The ·actual value· of the targetNamespace [attribute] of the <schema> ancestor element
        //   information item if present, otherwise ·absent·.
        let target_namespace = schema.attribute("targetNamespace").map(str::to_string);

        // {abstract}
        //   The ·actual value· of the abstract [attribute], if present, otherwise false.
        let abstract_ = attribute_value::<bool>(complex_type, "abstract")?.unwrap_or(false);

        let simple_content = complex_type
            .children()
            .find(|c| c.tag_name().name() == "simpleContent");
        let complex_content = complex_type
            .children()
            .find(|c| c.tag_name().name() == "complexContent");

        let content = if let Some(simple_content) = simple_content {
            Self::map_simple_content(context, self_ref, simple_content, schema)?
        } else if let Some(complex_content) = complex_content {
            Self::map_explicit_complex_content(
                context,
                self_ref,
                complex_type,
                complex_content,
                schema,
            )?
        } else {
            Self::map_implicit_complex_content(context, self_ref, complex_type, schema)?
        };

        Ok(context.insert(
            self_ref,
            Self {
                name,
                target_namespace,
                base_type_definition: content.base_type_definition,
                derivation_method: Some(content.derivation_method),
                abstract_,
                attribute_uses: content.attribute_uses,
                attribute_wildcard: content.attribute_wildcard,
                content_type: content.content_type,
                annotation: Annotation::map_from_xml(complex_type),
                is_builtin: false,
            },
        ))
    }

    /// Returns the `<restriction>` or `<extension>` child of a `<simpleContent>` or
    /// `<complexContent>` element.
    fn derivation_node<'a, 'input>(
        content: Node<'a, 'input>,
    ) -> Result<(Node<'a, 'input>, DerivationMethod), XsdError> {
        content
            .children()
            .find_map(|c| match c.tag_name().name() {
                "restriction" => Some((c, DerivationMethod::Restriction)),
                "extension" => Some((c, DerivationMethod::Extension)),
                _ => None,
            })
            .ok_or_else(|| XsdError::Unsupported(format!("empty <{}>", content.tag_name().name())))
    }

    /// Resolves the base attribute of a derivation. Unresolvable bases fall back to
    /// `xs:anyType` outside strict mode.
    fn resolve_base(
        context: &mut MappingContext,
        derivation: Node,
    ) -> Result<TypeDefinition, XsdError> {
        let base = attribute_value::<QName>(derivation, "base")?.ok_or_else(|| {
            XsdError::MissingAttribute {
                element: derivation.tag_name().name().into(),
                attribute: "base",
            }
        })?;
        match context.resolve_or_report::<TypeDefinition>(&base)? {
            Some(base) => Ok(base),
            None => context.resolve(&XS_ANY_TYPE_NAME),
        }
    }

    /// Mapping for complex types with simple content (§3.4.2.2)
    fn map_simple_content(
        context: &mut MappingContext,
        self_ref: Ref<Self>,
        simple_content: Node,
        schema: Node,
    ) -> Result<MappedContent, XsdError> {
        let (derivation, derivation_method) = Self::derivation_node(simple_content)?;
        let base_type_definition = Self::resolve_base(context, derivation)?;

        // {content type}.{simple type definition}
        //   The inline <simpleType> of a restriction if there is one, otherwise the simple type
        //   definition of the base (or the simple content of a complex base).
        let inline = derivation
            .children()
            .find(|c| c.tag_name().name() == SimpleTypeDefinition::TAG_NAME);
        let (base_uses, base_wildcard, base_simple) = match base_type_definition {
            TypeDefinition::Simple(simple) => {
                context.request(simple)?;
                (Vec::new(), None, Some(simple))
            }
            TypeDefinition::Complex(complex) => {
                let base = context.request(complex)?;
                (
                    base.attribute_uses.clone(),
                    base.attribute_wildcard,
                    base.content_type.simple_type_definition(),
                )
            }
        };
        let simple_type_definition = match (inline, base_simple) {
            (Some(inline), _) => SimpleTypeDefinition::map_from_xml(context, inline, schema, None)?,
            (None, Some(simple)) => simple,
            (None, None) => {
                let value = base_name(base_type_definition, context);
                context.report(XsdError::InvalidValue {
                    what: "simpleContent base",
                    value,
                })?;
                context.resolve(&XS_STRING_NAME)?
            }
        };

        let own = AttributeUse::map_attribute_content(
            context,
            derivation,
            schema,
            attribute_decl::ScopeParent::ComplexType(self_ref),
        )?;
        let (attribute_uses, attribute_wildcard) =
            Self::merge_attributes(context, base_uses, base_wildcard, own, derivation_method);

        Ok(MappedContent {
            base_type_definition,
            derivation_method,
            attribute_uses,
            attribute_wildcard,
            content_type: ContentType::Simple {
                simple_type_definition,
            },
        })
    }

    /// Mapping for complex types with explicit `<complexContent>` (§3.4.2.3)
    fn map_explicit_complex_content(
        context: &mut MappingContext,
        self_ref: Ref<Self>,
        complex_type: Node,
        complex_content: Node,
        schema: Node,
    ) -> Result<MappedContent, XsdError> {
        let (derivation, derivation_method) = Self::derivation_node(complex_content)?;
        let base_type_definition = Self::resolve_base(context, derivation)?;

        // [Definition:] Let the effective mixed be the appropriate case among the following:
        //   1 If the mixed [attribute] is present on <complexContent>, then its ·actual value·;
        //   2 If the mixed [attribute] is present on <complexType>, then its ·actual value·;
        //   3 otherwise false.
        let mixed = match attribute_value::<bool>(complex_content, "mixed")? {
            Some(mixed) => mixed,
            None => attribute_value::<bool>(complex_type, "mixed")?.unwrap_or(false),
        };

        let own_particle = Self::map_particle(context, self_ref, derivation, schema)?;

        let (base_uses, base_wildcard, base_content) = match base_type_definition {
            TypeDefinition::Complex(complex) => {
                let base = context.request(complex)?;
                (
                    base.attribute_uses.clone(),
                    base.attribute_wildcard,
                    base.content_type,
                )
            }
            TypeDefinition::Simple(_) => {
                let value = base_name(base_type_definition, context);
                context.report(XsdError::InvalidValue {
                    what: "complexContent base",
                    value,
                })?;
                (Vec::new(), None, ContentType::Empty)
            }
        };

        let content_type = match derivation_method {
            DerivationMethod::Restriction => Self::content_from_particle(context, own_particle, mixed)?,
            DerivationMethod::Extension => match (base_content, own_particle) {
                (ContentType::Simple { .. }, None) => base_content,
                (_, None) => match base_content.particle() {
                    Some(particle) if mixed || base_content.is_mixed() => {
                        ContentType::Mixed { particle }
                    }
                    Some(particle) => ContentType::ElementOnly { particle },
                    None => Self::content_from_particle(context, None, mixed)?,
                },
                (_, Some(own)) => {
                    // {particle}
                    //   A sequence of the base's particle followed by the explicit content, when
                    //   both are present.
                    let particle = match base_content.particle() {
                        Some(base_particle) => {
                            let group = context.create(ModelGroup {
                                compositor: Compositor::Sequence,
                                particles: vec![base_particle, own],
                                annotation: None,
                            });
                            context.create(Particle {
                                min_occurs: 1,
                                max_occurs: MaxOccurs::Count(1),
                                term: Term::ModelGroup(group),
                            })
                        }
                        None => own,
                    };
                    Self::content_from_particle(
                        context,
                        Some(particle),
                        mixed || base_content.is_mixed(),
                    )?
                }
            },
        };

        let own = AttributeUse::map_attribute_content(
            context,
            derivation,
            schema,
            attribute_decl::ScopeParent::ComplexType(self_ref),
        )?;
        let (attribute_uses, attribute_wildcard) =
            Self::merge_attributes(context, base_uses, base_wildcard, own, derivation_method);

        Ok(MappedContent {
            base_type_definition,
            derivation_method,
            attribute_uses,
            attribute_wildcard,
            content_type,
        })
    }

    /// Mapping for complex types with implicit complex content, i.e. a restriction of
    /// `xs:anyType` (§3.4.2.3)
    fn map_implicit_complex_content(
        context: &mut MappingContext,
        self_ref: Ref<Self>,
        complex_type: Node,
        schema: Node,
    ) -> Result<MappedContent, XsdError> {
        let base_type_definition: TypeDefinition = context.resolve(&XS_ANY_TYPE_NAME)?;
        let mixed = attribute_value::<bool>(complex_type, "mixed")?.unwrap_or(false);
        let particle = Self::map_particle(context, self_ref, complex_type, schema)?;
        let content_type = Self::content_from_particle(context, particle, mixed)?;

        let own = AttributeUse::map_attribute_content(
            context,
            complex_type,
            schema,
            attribute_decl::ScopeParent::ComplexType(self_ref),
        )?;

        Ok(MappedContent {
            base_type_definition,
            derivation_method: DerivationMethod::Restriction,
            attribute_uses: own.uses,
            attribute_wildcard: own.wildcard,
            content_type,
        })
    }

    /// Maps the first model group or group reference among the children of `node`.
    fn map_particle(
        context: &mut MappingContext,
        self_ref: Ref<Self>,
        node: Node,
        schema: Node,
    ) -> Result<Option<Ref<Particle>>, XsdError> {
        for child in node.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "all" | "choice" | "sequence" => {
                    return Particle::map_from_xml_model_group(
                        context,
                        child,
                        schema,
                        element_decl::ScopeParent::ComplexType(self_ref),
                    )
                    .map(Some);
                }
                ModelGroupDefinition::TAG_NAME => {
                    return Particle::map_from_xml_group_reference(context, child);
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Derives the content type from the explicit content. An empty model group counts as no
    /// content; mixed content without any particle holds plain text.
    fn content_from_particle(
        context: &mut MappingContext,
        particle: Option<Ref<Particle>>,
        mixed: bool,
    ) -> Result<ContentType, XsdError> {
        let particle = particle.filter(|&p| !is_empty_particle(p, context.components()));
        Ok(match (particle, mixed) {
            (Some(particle), true) => ContentType::Mixed { particle },
            (Some(particle), false) => ContentType::ElementOnly { particle },
            (None, true) => ContentType::Simple {
                simple_type_definition: context.resolve(&XS_STRING_NAME)?,
            },
            (None, false) => ContentType::Empty,
        })
    }

    /// {attribute uses}
    ///   Extension keeps the base's uses and adds the local ones; restriction keeps the base's
    ///   uses unless they are redeclared or prohibited. Local uses win on name clashes.
    fn merge_attributes(
        context: &MappingContext,
        base_uses: Vec<Ref<AttributeUse>>,
        base_wildcard: Option<Ref<Wildcard>>,
        own: AttributeContent,
        derivation_method: DerivationMethod,
    ) -> (Vec<Ref<AttributeUse>>, Option<Ref<Wildcard>>) {
        let components = context.components();
        let use_name = |u: &Ref<AttributeUse>| {
            u.get(components)
                .attribute_declaration
                .get(components)
                .name()
        };
        let own_names = own.uses.iter().filter_map(use_name).collect::<Vec<_>>();

        let mut uses = base_uses
            .into_iter()
            .filter(|u| {
                use_name(u).map_or(true, |name| {
                    !own_names.contains(&name) && !own.prohibited.contains(&name)
                })
            })
            .collect::<Vec<_>>();
        uses.extend(own.uses);

        let wildcard = match derivation_method {
            DerivationMethod::Extension => own.wildcard.or(base_wildcard),
            DerivationMethod::Restriction => own.wildcard,
        };
        (uses, wildcard)
    }
}

fn base_name(base: TypeDefinition, context: &MappingContext) -> String {
    base.name(context.components())
        .map(|n| n.to_string())
        .unwrap_or_default()
}

/// Whether `particle` is a model group without any particles.
fn is_empty_particle(particle: Ref<Particle>, components: &impl ComponentTable) -> bool {
    match particle.get(components).term {
        Term::ModelGroup(group) => group.get(components).particles.is_empty(),
        _ => false,
    }
}

impl TopLevelMappable for ComplexTypeDefinition {
    fn map_from_top_level_xml(
        context: &mut MappingContext,
        self_ref: Ref<Self>,
        self_node: Node,
        schema_node: Node,
    ) -> Result<(), XsdError> {
        Self::map_from_xml(context, self_node, schema_node, Some(self_ref))?;
        Ok(())
    }
}
