use roxmltree::Node;

use super::{
    annotation::Annotation,
    builtins::XS_ANY_SIMPLE_TYPE_NAME,
    components::{ComponentTable, Named, NamedXml},
    error::XsdError,
    mapping_context::TopLevelMappable,
    shared::TypeDefinition,
    values::{actual_value, attribute_value},
    xstypes::QName,
    MappingContext, Ref,
};

/// Schema Component: Simple Type Definition, a kind of Type Definition (§3.16)
#[derive(Clone, Debug)]
pub struct SimpleTypeDefinition {
    pub name: Option<String>,
    pub target_namespace: Option<String>,
    pub base_type_definition: TypeDefinition,
    pub facets: Facets,
    /// `None` only for `xs:anySimpleType`
    pub variety: Option<Variety>,
    pub item_type_definition: Option<Ref<SimpleTypeDefinition>>,
    pub member_type_definitions: Vec<Ref<SimpleTypeDefinition>>,
    pub annotation: Option<Annotation>,

    pub is_builtin: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Variety {
    Atomic,
    List,
    Union,
}

/// The subset of constraining facets the relational mapping cares about.
#[derive(Clone, Debug, Default)]
pub struct Facets {
    pub length: Option<u64>,
    pub min_length: Option<u64>,
    pub max_length: Option<u64>,
    pub enumeration: Vec<String>,
    pub pattern: Vec<String>,
}


impl Named for SimpleTypeDefinition {
    fn name(&self) -> Option<QName> {
        self.name
            .as_ref()
            .map(|name| QName::with_optional_namespace(self.target_namespace.as_ref(), name))
    }
}

impl NamedXml for SimpleTypeDefinition {
    fn get_name_from_xml(simple_type: Node, schema: Node) -> Result<QName, XsdError> {
        let name = simple_type
            .attribute("name")
            .ok_or_else(|| XsdError::MissingAttribute {
                element: Self::TAG_NAME.into(),
                attribute: "name",
            })?;
        let target_namespace = schema.attribute("targetNamespace");
        Ok(QName::with_optional_namespace(target_namespace, name))
    }
}

impl SimpleTypeDefinition {
    pub const TAG_NAME: &'static str = "simpleType";

    /// Maps a `<simpleType>` element; a top-level definition passes its pre-reserved reference
    /// in `self_ref`.
    pub(super) fn map_from_xml(
        context: &mut MappingContext,
        simple_type: Node,
        schema: Node,
        self_ref: Option<Ref<Self>>,
    ) -> Result<Ref<Self>, XsdError> {
        let self_ref = self_ref.unwrap_or_else(|| context.reserve());

        // {name} The ·actual value· of the name [attribute] if present on the <simpleType>
        //   element, otherwise ·absent·.
        let name = attribute_value::<String>(simple_type, "name")?;

        // {target namespace} The ·actual value· of the targetNamespace [attribute] of the
        //   ancestor <schema> element information item if present, otherwise ·absent·.
        let target_namespace = schema.attribute("targetNamespace").map(str::to_string);

        let annotation = Annotation::map_from_xml(simple_type);
        let any_simple_type: Ref<Self> = context.resolve(&XS_ANY_SIMPLE_TYPE_NAME)?;

        let derivation = simple_type
            .children()
            .find(|c| matches!(c.tag_name().name(), "restriction" | "list" | "union"));

        let mut definition = Self {
            name,
            target_namespace,
            base_type_definition: TypeDefinition::Simple(any_simple_type),
            facets: Facets::default(),
            variety: Some(Variety::Atomic),
            item_type_definition: None,
            member_type_definitions: Vec::new(),
            annotation,
            is_builtin: false,
        };

        match derivation.as_ref().map(|d| (d.tag_name().name(), *d)) {
            Some(("restriction", restriction)) => {
                let base = Self::map_base_or_inline(context, restriction, "base", schema)?
                    .unwrap_or(any_simple_type);
                let base_def = context.components().get(base);
                definition.base_type_definition = TypeDefinition::Simple(base);
                definition.variety = base_def.variety.or(Some(Variety::Atomic));
                definition.item_type_definition = base_def.item_type_definition;
                definition.member_type_definitions = base_def.member_type_definitions.clone();
                definition.facets = Facets::map_from_xml(restriction)?;
            }
            Some(("list", list)) => {
                definition.variety = Some(Variety::List);
                definition.item_type_definition =
                    Self::map_base_or_inline(context, list, "itemType", schema)?;
            }
            Some(("union", union)) => {
                definition.variety = Some(Variety::Union);
                let mut members = Vec::new();
                if let Some(member_types) = union.attribute("memberTypes") {
                    for name in actual_value::<Vec<QName>>(member_types, union)? {
                        if let Some(member) = context.resolve_or_report::<Ref<Self>>(&name)? {
                            members.push(member);
                        }
                    }
                }
                for inline in union
                    .children()
                    .filter(|c| c.tag_name().name() == Self::TAG_NAME)
                {
                    members.push(Self::map_from_xml(context, inline, schema, None)?);
                }
                definition.member_type_definitions = members;
            }
            _ => {
                context.report(XsdError::Unsupported(format!(
                    "simpleType without derivation{}",
                    definition
                        .name
                        .as_ref()
                        .map(|n| format!(" ({n})"))
                        .unwrap_or_default()
                )))?;
            }
        }

        Ok(context.insert(self_ref, definition))
    }

    /// Resolves the type named by `attribute` on `node` or, failing that, maps the inline
    /// `<simpleType>` child. Unresolvable names are reported.
    fn map_base_or_inline(
        context: &mut MappingContext,
        node: Node,
        attribute: &str,
        schema: Node,
    ) -> Result<Option<Ref<Self>>, XsdError> {
        if let Some(name) = attribute_value::<QName>(node, attribute)? {
            let Some(type_def) = context.resolve_or_report::<TypeDefinition>(&name)? else {
                return Ok(None);
            };
            match type_def {
                TypeDefinition::Simple(simple) => {
                    context.request(simple)?;
                    Ok(Some(simple))
                }
                TypeDefinition::Complex(_) => {
                    context.report(XsdError::InvalidValue {
                        what: "simple type reference",
                        value: name.to_string(),
                    })?;
                    Ok(None)
                }
            }
        } else if let Some(inline) = node
            .children()
            .find(|c| c.tag_name().name() == Self::TAG_NAME)
        {
            Self::map_from_xml(context, inline, schema, None).map(Some)
        } else {
            Ok(None)
        }
    }

    /// The closest built-in type in the derivation chain (this type itself if it is built-in).
    /// For list types the built-in ancestor of the item type is returned.
    pub fn builtin_ancestor<'a>(&'a self, components: &'a impl ComponentTable) -> Option<&'a Self> {
        let mut current = if self.variety == Some(Variety::List) && !self.is_builtin {
            self.item_type_definition?.get(components)
        } else {
            self
        };
        loop {
            if current.is_builtin {
                return Some(current);
            }
            current = current.base_type_definition.simple()?.get(components);
        }
    }

    /// The first `length` or `maxLength` facet found along the derivation chain.
    pub fn max_length(&self, components: &impl ComponentTable) -> Option<u64> {
        let mut current = self;
        loop {
            if let Some(length) = current.facets.length.or(current.facets.max_length) {
                return Some(length);
            }
            if current.is_builtin {
                return None;
            }
            current = current.base_type_definition.simple()?.get(components);
        }
    }

    pub fn is_list(&self) -> bool {
        self.variety == Some(Variety::List)
    }
}

impl Facets {
    fn map_from_xml(restriction: Node) -> Result<Self, XsdError> {
        let mut facets = Self::default();
        for facet in restriction.children().filter(Node::is_element) {
            let value = facet.attribute("value");
            match (facet.tag_name().name(), value) {
                ("length", Some(v)) => facets.length = Some(actual_value(v, facet)?),
                ("minLength", Some(v)) => facets.min_length = Some(actual_value(v, facet)?),
                ("maxLength", Some(v)) => facets.max_length = Some(actual_value(v, facet)?),
                ("enumeration", Some(v)) => facets.enumeration.push(v.into()),
                ("pattern", Some(v)) => facets.pattern.push(v.into()),
                _ => {}
            }
        }
        Ok(facets)
    }
}

impl TopLevelMappable for SimpleTypeDefinition {
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
