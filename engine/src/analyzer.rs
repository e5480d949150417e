//! Derivation of the relational model from a loaded schema set.
//!
//! The analysis runs in two stages. The first one decides which elements become top-level
//! classes: the requested global elements, plus every element that is reachable from several
//! places (substitution group members, elements referenced through `targetElement`, elements met
//! again while walking the content models). The second one walks the content model of each
//! top-level class and turns attributes and simple elements into fields, non-repeated complex
//! elements into flattened fields or nested classes, repeated content into nested classes and
//! references to top-level elements into link fields or junction classes.

use std::collections::{BTreeMap, HashMap, HashSet};

use relmap_xsd::{
    builtins::{XSI_NAMESPACE, XS_NAMESPACE},
    xstypes::XML_NAMESPACE,
    Annotation, AttributeUse, ComplexTypeDefinition, Compositor, ContentType, ElementDeclaration,
    MaxOccurs, ModelGroup, Particle, Ref, RefNamed, SchemaComponentTable, SchemaSet,
    SimpleTypeDefinition, Term, TypeDefinition,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    conf::Conf,
    identifier::IdentifierRules,
    is_gml_namespace,
    model::{
        FeatureClass, Field, FieldCategory, FieldType, GeometryType, NamespaceInfo, SchemaModel,
    },
    xpath::XPathMatcher,
    GML32_NAMESPACE, GML_NAMESPACE_PREFIX, XLINK_NAMESPACE,
};

const MAX_DEPTH: usize = 100;
const DEFAULT_POSTGRESQL_MAX_LENGTH: usize = 63;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("schema nesting too deep at {0}")]
    TooDeep(String),
    #[error("model group already visited at {0}")]
    AlreadyVisited(String),
    #[error("element {0} contains itself through a type that cannot be linked")]
    Recursion(String),
    #[error("cannot build a class for element {0}")]
    Unresolved(String),
    #[error("{0}")]
    Strict(String),
}

/// Builds a [`SchemaModel`] from a [`SchemaSet`].
pub struct SchemaAnalyzer<'c> {
    conf: &'c Conf,
    postgresql_target: bool,
}

impl<'c> SchemaAnalyzer<'c> {
    pub fn new(conf: &'c Conf) -> Self {
        Self {
            conf,
            postgresql_target: false,
        }
    }

    /// Whether the tables will be written to PostgreSQL, which enables identifier laundering
    /// when the configuration asks for it.
    pub fn postgresql_target(mut self, yes: bool) -> Self {
        self.postgresql_target = yes;
        self
    }

    pub fn identifier_rules(&self) -> IdentifierRules {
        let rules = &self.conf.layer_building;
        let postgresql_laundering = rules.postgresql_identifier_laundering && self.postgresql_target;
        let max_length = match self.conf.identifier_max_length() {
            None if postgresql_laundering => Some(DEFAULT_POSTGRESQL_MAX_LENGTH),
            other => other,
        };
        IdentifierRules {
            max_length,
            case_insensitive: rules.case_insensitive_identifier,
            postgresql_laundering,
        }
    }

    /// Analyzes `schemas`, returning the model and the warnings raised on the way.
    pub fn analyze(&self, schemas: &SchemaSet) -> Result<(SchemaModel, Vec<String>), AnalyzerError> {
        let mut analysis = Analysis::new(self.conf, self.identifier_rules(), schemas);
        analysis.warnings.extend(schemas.warnings.iter().cloned());
        let tops = analysis.run()?;
        analysis.finalize(tops)
    }
}

/// How the final name of a class is derived.
#[derive(Clone, Debug)]
enum Naming {
    /// Decided when the class was created
    Fixed,
    /// `short` when it is unambiguous, the parent name followed by `suffix` otherwise
    Nested {
        short: Option<String>,
        suffix: String,
    },
    /// The name of the class owning the link followed by the suffix
    Junction(String),
}

/// A class under construction, owning its nested classes.
#[derive(Debug)]
struct ClassDraft {
    class: FeatureClass,
    naming: Naming,
    nested: Vec<ClassDraft>,
}

impl ClassDraft {
    fn new(class: FeatureClass, naming: Naming) -> Self {
        Self {
            class,
            naming,
            nested: Vec::new(),
        }
    }

    fn visit_mut(&mut self, f: &mut impl FnMut(&mut ClassDraft)) {
        f(self);
        for nested in &mut self.nested {
            nested.visit_mut(f);
        }
    }
}

/// The particles of a content model.
#[derive(Clone, Debug)]
struct Content {
    particles: Vec<Ref<Particle>>,
    compositor: Compositor,
    group: Option<Ref<ModelGroup>>,
}

/// A particle of element type, as seen from the class being explored.
struct ElementUse<'a> {
    decl: &'a ElementDeclaration,
    /// `prefix_name` when the local name is ambiguous within the content model, the name otherwise
    label: String,
    xpath: String,
    min_occurs: u64,
    max_occurs: MaxOccurs,
    repeated: bool,
    in_choice: bool,
    out_of_order: bool,
    documentation: String,
}

struct Analysis<'a> {
    conf: &'a Conf,
    rules: IdentifierRules,
    schemas: &'a SchemaSet,
    c: &'a SchemaComponentTable,
    namespaces: Vec<NamespaceInfo>,
    uri_to_prefix: HashMap<String, String>,
    ignored: XPathMatcher,
    force_flattening: XPathMatcher,
    disable_flattening: XPathMatcher,
    /// (container, allowed children)
    typing_constraints: Vec<(XPathMatcher, XPathMatcher)>,
    substitutions: HashMap<Ref<ElementDeclaration>, Vec<Ref<ElementDeclaration>>>,
    group_names: HashMap<Ref<ModelGroup>, String>,
    top_set: HashSet<Ref<ElementDeclaration>>,
    top_order: Vec<Ref<ElementDeclaration>>,
    top_xpaths: HashSet<String>,
    simple_enough: HashSet<Ref<ElementDeclaration>>,
    name_counts: HashMap<String, usize>,
    junctions: Vec<ClassDraft>,
    anonymous_groups: usize,
    warnings: Vec<String>,
}

impl<'a> Analysis<'a> {
    fn new(conf: &'a Conf, rules: IdentifierRules, schemas: &'a SchemaSet) -> Self {
        let namespaces = collect_namespaces(schemas);
        let uri_to_prefix = namespaces
            .iter()
            .map(|n| (n.uri.clone(), n.prefix.clone()))
            .collect::<HashMap<_, _>>();

        let with_prefixes = |mut matcher: XPathMatcher| {
            matcher.set_document_uri_to_prefix(&uri_to_prefix);
            matcher
        };
        let ignored = with_prefixes(XPathMatcher::compile(
            conf.ignored_xpaths.xpaths.iter().map(|x| x.xpath.clone()),
            conf.ignored_xpaths.namespaces.clone(),
        ));
        let flattening = &conf.layer_building.flattening;
        let force_flattening = with_prefixes(XPathMatcher::compile(
            flattening.force_xpaths.iter().cloned(),
            flattening.namespaces.clone(),
        ));
        let disable_flattening = with_prefixes(XPathMatcher::compile(
            flattening.disable_xpaths.iter().cloned(),
            flattening.namespaces.clone(),
        ));
        let typing_constraints = conf
            .typing_constraints
            .child_constraints
            .iter()
            .map(|constraint| {
                let namespaces = conf.typing_constraints.namespaces.clone();
                (
                    with_prefixes(XPathMatcher::compile(
                        [constraint.container_xpath.clone()],
                        namespaces.clone(),
                    )),
                    with_prefixes(XPathMatcher::compile(
                        constraint.children.iter().cloned(),
                        namespaces,
                    )),
                )
            })
            .collect();

        let c = &schemas.components;
        let mut substitutions: HashMap<_, Vec<_>> = HashMap::new();
        for elt in schemas.top_level_elements() {
            for head in &elt.get(c).substitution_group_affiliations {
                substitutions.entry(*head).or_default().push(elt);
            }
        }
        let group_names = schemas
            .documents
            .iter()
            .flat_map(|d| d.model_group_definitions.iter())
            .map(|g| {
                let g = g.get(c);
                (g.model_group, g.name.clone())
            })
            .collect();

        Self {
            conf,
            rules,
            schemas,
            c,
            namespaces,
            uri_to_prefix,
            ignored,
            force_flattening,
            disable_flattening,
            typing_constraints,
            substitutions,
            group_names,
            top_set: HashSet::new(),
            top_order: Vec::new(),
            top_xpaths: HashSet::new(),
            simple_enough: HashSet::new(),
            name_counts: HashMap::new(),
            junctions: Vec::new(),
            anonymous_groups: 0,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, message: String) -> Result<(), AnalyzerError> {
        if self.conf.schema_full_checking {
            return Err(AnalyzerError::Strict(message));
        }
        warn!("{message}");
        self.warnings.push(message);
        Ok(())
    }

    fn run(&mut self) -> Result<Vec<ClassDraft>, AnalyzerError> {
        let c = self.c;
        let gml_features_only = self.conf.layer_building.instantiate_gml_features_only;
        let found_gml_feature = gml_features_only
            && self.schemas.top_level_elements().any(|e| {
                let decl = e.get(c);
                !decl
                    .target_namespace
                    .as_deref()
                    .is_some_and(|ns| self.is_gml(ns))
                    && self.derives_from_gml_feature(e)
            });
        if found_gml_feature {
            info!("Only elements derived from a GML feature become top-level classes");
        }

        let requested = self
            .schemas
            .documents
            .iter()
            .filter(|d| d.requested)
            .map(|d| d.target_namespace.clone())
            .collect::<HashSet<_>>();
        let candidates = self
            .schemas
            .top_level_elements()
            .filter(|e| requested.contains(&e.get(c).target_namespace))
            .collect::<Vec<_>>();

        let mut visited_elts = HashSet::new();
        for &elt in &candidates {
            let decl = elt.get(c);
            let xpath = self.element_xpath(decl);
            if self.is_ignored(&xpath) || decl.abstract_ || self.compatible_type(decl).is_none() {
                continue;
            }
            if found_gml_feature && !self.derives_from_gml_feature(elt) {
                continue;
            }
            visited_elts.insert(elt);
            if !self.top_xpaths.contains(&xpath) {
                self.promote(elt, xpath);
            }
        }

        let mut visited_groups = HashSet::new();
        for &elt in &candidates {
            let decl = elt.get(c);
            let xpath = self.element_xpath(decl);
            if self.is_ignored(&xpath) {
                continue;
            }
            if let Some(content) = self.compatible_type(decl).and_then(|ct| self.content_of(ct)) {
                let mut simple_enough = true;
                self.find_must_be_top(
                    &xpath,
                    &content,
                    0,
                    &mut visited_elts,
                    &mut visited_groups,
                    &mut simple_enough,
                )?;
            }
        }

        for &elt in &self.top_set {
            *self
                .name_counts
                .entry(elt.get(c).name.clone())
                .or_default() += 1;
        }

        let mut tops = Vec::new();
        for elt in self.top_order.clone() {
            if let Some(draft) = self.instantiate(elt)? {
                tops.push(draft);
            }
        }
        Ok(tops)
    }

    // -- Namespaces and paths

    fn prefix(&self, uri: &str) -> &str {
        self.uri_to_prefix.get(uri).map_or("", String::as_str)
    }

    fn make_xpath(&self, namespace: Option<&str>, name: &str) -> String {
        match namespace.map(|ns| self.prefix(ns)) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}:{name}"),
            _ => name.to_string(),
        }
    }

    fn element_xpath(&self, decl: &ElementDeclaration) -> String {
        self.make_xpath(decl.target_namespace.as_deref(), &decl.name)
    }

    fn is_gml(&self, uri: &str) -> bool {
        is_gml_namespace(uri) || self.prefix(uri) == "gml"
    }

    fn is_ignored(&self, xpath: &str) -> bool {
        match self.ignored.matches(xpath) {
            Some(pattern) => {
                debug!("{xpath} is ignored because of {pattern}");
                true
            }
            None => false,
        }
    }

    // -- Schema inspection

    /// The complex type of `decl` when it has element content and may become a class.
    fn compatible_type(&self, decl: &ElementDeclaration) -> Option<&'a ComplexTypeDefinition> {
        let ct = decl.type_definition.complex()?.get(self.c);
        let element_content = matches!(
            ct.content_type,
            ContentType::ElementOnly { .. } | ContentType::Mixed { .. }
        );
        (element_content && decl.name != "FeatureCollection").then_some(ct)
    }

    fn group_content(&self, group: Ref<ModelGroup>) -> Content {
        let g = group.get(self.c);
        Content {
            particles: g.particles.clone(),
            compositor: g.compositor,
            group: Some(group),
        }
    }

    fn content_of(&self, ct: &ComplexTypeDefinition) -> Option<Content> {
        let particle = ct.content_type.particle()?;
        Some(match particle.get(self.c).term {
            Term::ModelGroup(group) => self.group_content(group),
            _ => Content {
                particles: vec![particle],
                compositor: Compositor::Sequence,
                group: None,
            },
        })
    }

    fn type_name(&self, decl: &ElementDeclaration) -> Option<(String, String)> {
        let name = decl.type_definition.name(self.c)?;
        Some((name.namespace_name.unwrap_or_default(), name.local_name))
    }

    fn geometry_property_type(&self, decl: &ElementDeclaration) -> Option<GeometryType> {
        let (ns, local) = self.type_name(decl)?;
        if !self.is_gml(&ns) {
            return None;
        }
        GeometryType::from_gml_property_type(&local)
    }

    fn is_gml_abstract(&self, decl: &ElementDeclaration) -> bool {
        decl.abstract_
            && decl
                .target_namespace
                .as_deref()
                .is_some_and(|ns| self.is_gml(ns))
            && decl.name != "_Feature"
            && decl.name != "AbstractFeature"
    }

    fn derives_from_gml_feature(&self, elt: Ref<ElementDeclaration>) -> bool {
        let mut seen = HashSet::new();
        let mut current = elt;
        while seen.insert(current) {
            let decl = current.get(self.c);
            if decl
                .target_namespace
                .as_deref()
                .is_some_and(|ns| self.is_gml(ns))
                && (decl.name == "AbstractFeature" || decl.name == "_Feature")
            {
                return true;
            }
            match decl.substitution_group_affiliations.first() {
                Some(head) => current = *head,
                None => return false,
            }
        }
        false
    }

    /// The element a `gml:ReferenceType` property points to, from its `targetElement` app info.
    /// Returns the app info text and the resolved declaration.
    fn reference_target(
        &self,
        decl: &ElementDeclaration,
    ) -> Option<(String, Option<Ref<ElementDeclaration>>)> {
        let (ns, local) = self.type_name(decl)?;
        if !self.is_gml(&ns) || local != "ReferenceType" {
            return None;
        }
        let entry = decl
            .annotation
            .as_ref()?
            .app_info
            .iter()
            .find(|e| e.name.local_name == "targetElement")?;
        let target = entry
            .text_as_qname
            .as_ref()
            .and_then(|q| self.schemas.find_element_by_name(q));
        Some((entry.text.clone(), target))
    }

    /// Non-abstract, class-compatible members of the substitution group of `head`, transitively.
    fn substitution_members(&self, head: Ref<ElementDeclaration>) -> Vec<Ref<ElementDeclaration>> {
        let mut members = Vec::new();
        let mut seen = HashSet::from([head]);
        let mut stack = vec![head];
        while let Some(current) = stack.pop() {
            let Some(children) = self.substitutions.get(&current) else {
                continue;
            };
            for &child in children {
                let decl = child.get(self.c);
                if !seen.insert(child) || self.compatible_type(decl).is_none() {
                    continue;
                }
                if !decl.abstract_ {
                    members.push(child);
                }
                stack.push(child);
            }
        }
        members
    }

    /// The substitution group members allowed at `xpath`.
    fn implementations(
        &self,
        head: Ref<ElementDeclaration>,
        xpath: &str,
    ) -> Vec<Ref<ElementDeclaration>> {
        let mut members = self.substitution_members(head);
        if let Some((_, children)) = self
            .typing_constraints
            .iter()
            .find(|(container, _)| container.matches(xpath).is_some())
        {
            members.retain(|m| children.matches(&self.element_xpath(m.get(self.c))).is_some());
        }
        members
    }

    // -- Top-level classes

    fn promote(&mut self, elt: Ref<ElementDeclaration>, xpath: String) {
        debug!("{xpath} becomes a top-level class");
        if self.top_set.insert(elt) {
            self.top_order.push(elt);
        }
        self.top_xpaths.insert(xpath);
    }

    fn max_fields(&self) -> usize {
        self.conf.layer_building.flattening.maximum_number_of_fields
    }

    /// Promotes to top-level the elements of `content` that are reachable from several places.
    /// `simple_enough` is cleared when the content cannot be flattened into a single table.
    fn find_must_be_top(
        &mut self,
        parent_xpath: &str,
        content: &Content,
        depth: usize,
        visited_elts: &mut HashSet<Ref<ElementDeclaration>>,
        visited_groups: &mut HashSet<Ref<ModelGroup>>,
        simple_enough: &mut bool,
    ) -> Result<(), AnalyzerError> {
        let already_visited = content.group.is_some_and(|g| !visited_groups.insert(g));
        if depth == MAX_DEPTH {
            return Err(AnalyzerError::TooDeep(parent_xpath.to_string()));
        }
        let c = self.c;
        let mut count = 0;
        for &particle in &content.particles {
            let p = particle.get(c);
            if p.max_occurs.is_many() {
                *simple_enough = false;
            }
            let elt = match p.term {
                Term::ElementDeclaration(elt) => elt,
                Term::ModelGroup(group) => {
                    if !already_visited {
                        let content = self.group_content(group);
                        self.find_must_be_top(
                            parent_xpath,
                            &content,
                            depth + 1,
                            visited_elts,
                            visited_groups,
                            simple_enough,
                        )?;
                    }
                    continue;
                }
                Term::Wildcard(_) => continue,
            };

            let decl = elt.get(c);
            let xpath = self.element_xpath(decl);
            let full_xpath = format!("{parent_xpath}/{xpath}");
            if self.is_ignored(&full_xpath) {
                continue;
            }
            count += 1;
            if count > self.max_fields() {
                *simple_enough = false;
            }

            if self.geometry_property_type(decl).is_some() || self.is_gml_abstract(decl) {
                continue;
            }

            let mut impls = self.implementations(elt, &full_xpath);
            if !impls.is_empty() {
                if !decl.abstract_ {
                    impls.insert(0, elt);
                }
                for sub in impls {
                    let sub_decl = sub.get(c);
                    let sub_xpath = self.element_xpath(sub_decl);
                    if self.is_ignored(&format!("{parent_xpath}/{sub_xpath}"))
                        || self.top_set.contains(&sub)
                        || self.top_xpaths.contains(&sub_xpath)
                    {
                        continue;
                    }
                    visited_elts.insert(sub);
                    self.promote(sub, sub_xpath.clone());
                    if already_visited {
                        continue;
                    }
                    if let Some(content) =
                        self.compatible_type(sub_decl).and_then(|ct| self.content_of(ct))
                    {
                        let mut sub_simple = true;
                        self.find_must_be_top(
                            &sub_xpath,
                            &content,
                            depth + 1,
                            visited_elts,
                            visited_groups,
                            &mut sub_simple,
                        )?;
                    }
                }
                continue;
            }

            if decl.abstract_ || decl.type_definition.complex().is_none() {
                continue;
            }

            if let Some(ct) = self.compatible_type(decl) {
                *simple_enough = false;
                if visited_elts.contains(&elt) {
                    if !self.top_set.contains(&elt)
                        && !self.simple_enough.contains(&elt)
                        && !self.top_xpaths.contains(&xpath)
                    {
                        self.promote(elt, xpath.clone());
                    }
                } else {
                    visited_elts.insert(elt);
                    if let Some(content) = self.content_of(ct).filter(|_| !already_visited) {
                        let mut sub_simple = true;
                        self.find_must_be_top(
                            &full_xpath,
                            &content,
                            depth + 1,
                            visited_elts,
                            visited_groups,
                            &mut sub_simple,
                        )?;
                        if sub_simple {
                            self.simple_enough.insert(elt);
                        } else {
                            *simple_enough = false;
                        }
                    }
                }
            }

            if let Some((_, Some(target))) = self.reference_target(decl) {
                let target_decl = target.get(c);
                let target_xpath = self.element_xpath(target_decl);
                if target_decl.abstract_ || self.is_ignored(&target_xpath) {
                    continue;
                }
                if !self.top_set.contains(&target) && !self.top_xpaths.contains(&target_xpath) {
                    visited_elts.insert(target);
                    self.promote(target, target_xpath.clone());
                }
                if let Some(content) = self
                    .compatible_type(target_decl)
                    .and_then(|ct| self.content_of(ct))
                    .filter(|_| !already_visited)
                {
                    let mut sub_simple = true;
                    self.find_must_be_top(
                        &target_xpath,
                        &content,
                        depth + 1,
                        visited_elts,
                        visited_groups,
                        &mut sub_simple,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Builds the class of a top-level element.
    fn instantiate(
        &mut self,
        elt: Ref<ElementDeclaration>,
    ) -> Result<Option<ClassDraft>, AnalyzerError> {
        let c = self.c;
        let decl = elt.get(c);
        let xpath = self.element_xpath(decl);
        let Some(ct) = self.compatible_type(decl).filter(|_| !decl.abstract_) else {
            self.warn(format!("{xpath} has no element content and cannot become a table"))?;
            return Ok(None);
        };
        let name = if self.name_counts.get(&decl.name).copied().unwrap_or(0) > 1 {
            xpath.replace(':', "_")
        } else {
            decl.name.clone()
        };
        debug!("Building class {name} for {xpath}");
        let mut draft = ClassDraft::new(
            FeatureClass {
                name,
                xpath,
                is_top_level: decl.scope.is_global(),
                documentation: documentation(decl.annotation.as_ref()),
                ..Default::default()
            },
            Naming::Fixed,
        );
        let content = self.content_of(ct).unwrap_or(Content {
            particles: Vec::new(),
            compositor: Compositor::Sequence,
            group: None,
        });
        let counts = self.count_names(&content);
        self.explore(
            &content,
            &ct.attribute_uses,
            ct.attribute_wildcard.is_some(),
            &mut draft,
            0,
            &HashSet::new(),
            &counts,
        )?;
        Ok(Some(draft))
    }

    /// Occurrences of each element name in `content`, looking through nested model groups.
    fn count_names(&self, content: &Content) -> HashMap<String, usize> {
        fn walk(
            c: &SchemaComponentTable,
            particles: &[Ref<Particle>],
            counts: &mut HashMap<String, usize>,
            seen: &mut HashSet<Ref<ModelGroup>>,
        ) {
            for particle in particles {
                match particle.get(c).term {
                    Term::ElementDeclaration(elt) => {
                        *counts.entry(elt.get(c).name.clone()).or_default() += 1;
                    }
                    Term::ModelGroup(group) if seen.insert(group) => {
                        walk(c, &group.get(c).particles, counts, seen);
                    }
                    _ => {}
                }
            }
        }
        let mut counts = HashMap::new();
        walk(
            self.c,
            &content.particles,
            &mut counts,
            &mut HashSet::new(),
        );
        counts
    }

    // -- Fields

    /// Sets the type and width of `field` from the first built-in ancestor of `st`.
    fn set_simple_type(
        &mut self,
        st: Ref<SimpleTypeDefinition>,
        field: &mut Field,
    ) -> Result<(), AnalyzerError> {
        let c = self.c;
        let mut current = st.get(c);
        let mut width: Option<u64> = None;
        loop {
            if current.is_builtin {
                let name = current.name.clone().unwrap_or_default();
                field.set_type(FieldType::from_xsd_name(&name), name);
                break;
            }
            if let Some(length) = current.facets.length.or(current.facets.max_length) {
                width = Some(width.map_or(length, |w| w.max(length)));
            }
            match current.base_type_definition.simple() {
                Some(base) if base != st => current = base.get(c),
                _ => {
                    self.warn(format!("Base type of {} is not a built-in one", field.xpath))?;
                    field.set_type(FieldType::String, "string");
                    break;
                }
            }
        }
        field.width = width;
        Ok(())
    }

    /// List types become arrays of their item type when possible, strings otherwise.
    fn apply_list_type(
        &mut self,
        st: Ref<SimpleTypeDefinition>,
        field: &mut Field,
        force_string: bool,
    ) -> Result<(), AnalyzerError> {
        let st = st.get(self.c);
        if !st.is_list() {
            return Ok(());
        }
        if let Some(item) = st.item_type_definition {
            self.set_simple_type(item, field)?;
        }
        if force_string
            || !self.conf.layer_building.use_arrays
            || !field.field_type.is_array_compatible()
        {
            field.set_type(FieldType::String, "string");
        } else {
            field.is_list = true;
            field.is_array = true;
        }
        Ok(())
    }

    fn attribute_field(
        &mut self,
        attribute_use: Ref<AttributeUse>,
        owner_xpath: &str,
    ) -> Result<Option<Field>, AnalyzerError> {
        let c = self.c;
        let attribute_use = attribute_use.get(c);
        let decl = attribute_use.attribute_declaration.get(c);
        let xpath = format!(
            "{owner_xpath}/@{}",
            self.make_xpath(decl.target_namespace.as_deref(), &decl.name)
        );
        let mut field = Field::new(decl.name.clone(), xpath, FieldCategory::Regular);
        self.set_simple_type(decl.type_definition, &mut field)?;
        self.apply_list_type(decl.type_definition, &mut field, false)?;
        field.not_nullable = attribute_use.required;
        field.min_occurs = u64::from(attribute_use.required);
        if let Some(constraint) = attribute_use.effective_value_constraint(c) {
            field.fixed_value = constraint.fixed_value().map(str::to_string);
            field.default_value = constraint.default_value().map(str::to_string);
        }
        field.documentation = documentation(decl.annotation.as_ref());
        if self.is_ignored(&field.xpath) {
            if field.fixed_value.is_none() {
                return Ok(None);
            }
            field.ignored = true;
        }
        Ok(Some(field))
    }

    fn any_attributes_field(owner_xpath: &str, name: &str) -> Field {
        let mut field = Field::new(name, format!("{owner_xpath}/@*"), FieldCategory::Regular);
        field.set_type(FieldType::String, "json_dict");
        field
    }

    // -- Content exploration

    #[allow(clippy::too_many_arguments)]
    fn explore(
        &mut self,
        content: &Content,
        attributes: &[Ref<AttributeUse>],
        any_attribute: bool,
        class: &mut ClassDraft,
        depth: usize,
        visited: &HashSet<Ref<ModelGroup>>,
        counts: &HashMap<String, usize>,
    ) -> Result<(), AnalyzerError> {
        let mut visited = visited.clone();
        if let Some(group) = content.group {
            if !visited.insert(group) {
                return Err(AnalyzerError::AlreadyVisited(class.class.xpath.clone()));
            }
        }
        if depth == MAX_DEPTH {
            return Err(AnalyzerError::TooDeep(class.class.xpath.clone()));
        }

        for &attribute in attributes {
            if let Some(field) = self.attribute_field(attribute, &class.class.xpath)? {
                class.class.fields.push(field);
            }
        }
        if any_attribute {
            let field = Self::any_attributes_field(&class.class.xpath, "anyAttributes");
            class.class.fields.push(field);
        }

        let c = self.c;
        for &particle in &content.particles {
            let p = particle.get(c);
            match p.term {
                Term::ElementDeclaration(elt) => {
                    self.explore_element(p, elt, content.compositor, class, depth, &visited, counts)?
                }
                Term::ModelGroup(group) => {
                    self.explore_group(p, group, class, depth, &visited, counts)?
                }
                Term::Wildcard(_) => debug!("Skipping wildcard in {}", class.class.xpath),
            }
        }
        Ok(())
    }

    fn explore_group(
        &mut self,
        particle: &Particle,
        group: Ref<ModelGroup>,
        class: &mut ClassDraft,
        depth: usize,
        visited: &HashSet<Ref<ModelGroup>>,
        counts: &HashMap<String, usize>,
    ) -> Result<(), AnalyzerError> {
        let content = self.group_content(group);
        if !particle.max_occurs.is_many() {
            return self.explore(&content, &[], false, class, depth + 1, visited, counts);
        }

        let group_name = match self.group_names.get(&group) {
            Some(name) => name.clone(),
            None => {
                self.anonymous_groups += 1;
                format!("_group{}", self.anonymous_groups)
            }
        };
        let mut nested = ClassDraft::new(
            FeatureClass {
                xpath: class.class.xpath.clone(),
                is_group: true,
                is_repeated_sequence: true,
                ..Default::default()
            },
            Naming::Nested {
                short: None,
                suffix: format!("_{group_name}"),
            },
        );
        self.explore(&content, &[], false, &mut nested, depth + 1, visited, counts)?;
        nested.class.xpath = format!("{};extra={group_name}", class.class.xpath);

        if self.conf.layer_building.use_arrays
            && nested.nested.is_empty()
            && nested.class.fields.len() == 1
            && nested.class.fields[0].category == FieldCategory::Regular
            && nested.class.fields[0].field_type.is_array_compatible()
            && !nested.class.fields[0].is_array
        {
            let mut field = nested.class.fields.remove(0);
            field.is_array = true;
            field.max_occurs = MaxOccurs::Unbounded;
            class.class.fields.push(field);
            return Ok(());
        }

        let mut field = Field::new(group_name, nested.class.xpath.clone(), FieldCategory::Group);
        field.min_occurs = particle.min_occurs;
        field.max_occurs = particle.max_occurs;
        field.related_class_xpath = Some(nested.class.xpath.clone());
        class.nested.push(nested);
        class.class.fields.push(field);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn explore_element(
        &mut self,
        particle: &Particle,
        elt: Ref<ElementDeclaration>,
        compositor: Compositor,
        class: &mut ClassDraft,
        depth: usize,
        visited: &HashSet<Ref<ModelGroup>>,
        counts: &HashMap<String, usize>,
    ) -> Result<(), AnalyzerError> {
        let c = self.c;
        let decl = elt.get(c);
        let only_xpath = self.element_xpath(decl);
        let xpath = format!("{}/{only_xpath}", class.class.xpath);
        if self.is_ignored(&xpath) {
            return Ok(());
        }
        let label = if counts.get(&decl.name).copied().unwrap_or(0) > 1 {
            only_xpath.replace(':', "_")
        } else {
            decl.name.clone()
        };
        let eu = ElementUse {
            decl,
            label,
            xpath,
            min_occurs: particle.min_occurs,
            max_occurs: particle.max_occurs,
            repeated: particle.max_occurs.is_many(),
            in_choice: compositor == Compositor::Choice,
            out_of_order: compositor != Compositor::Sequence,
            documentation: documentation(decl.annotation.as_ref()),
        };
        let impls = self.implementations(elt, &eu.xpath);

        if let Some(geometry_type) = self.geometry_property_type(decl) {
            let mut field = self.element_field(&eu, &decl.name);
            field.set_type(FieldType::Geometry, "geometry");
            if eu.repeated {
                field.geometry_type = Some(GeometryType::Unknown);
                field.is_array = true;
            } else {
                field.geometry_type = Some(geometry_type);
            }
            class.class.fields.push(field);
            return Ok(());
        }

        if self.is_gml_abstract(decl) {
            let mut field = self.element_field(&eu, &decl.name);
            if decl.name == "AbstractGeometry" || decl.name == "_Geometry" {
                field.set_type(FieldType::Geometry, "geometry");
                field.geometry_type = Some(GeometryType::Unknown);
                field.is_array = eu.repeated;
            } else {
                field.set_type(FieldType::AnyType, "anyType");
            }
            field.include_this_element_in_blob = true;
            field.alternate_xpaths = impls
                .iter()
                .map(|i| format!("{}/{}", class.class.xpath, self.element_xpath(i.get(c))))
                .collect();
            class.class.fields.push(field);
            return Ok(());
        }

        if !impls.is_empty() || self.top_set.contains(&elt) {
            return self.create_non_nested_relationship(elt, impls, class, eu.max_occurs, false);
        }
        if decl.abstract_ {
            return Ok(());
        }

        match decl.type_definition {
            TypeDefinition::Simple(st) => self.simple_element(&eu, st, class),
            TypeDefinition::Complex(ct) => self.complex_element(&eu, ct, class, depth, visited),
        }
    }

    /// A field for the element itself, carrying its occurrence constraints.
    fn element_field(&self, eu: &ElementUse, name: &str) -> Field {
        let mut field = Field::new(name, eu.xpath.clone(), FieldCategory::Regular);
        field.min_occurs = eu.min_occurs;
        field.max_occurs = eu.max_occurs;
        field.documentation = eu.documentation.clone();
        field.may_appear_out_of_order = eu.out_of_order;
        field
    }

    fn no_link_field(&self, eu: &ElementUse, related_xpath: &str) -> Field {
        let mut field = self.element_field(eu, &eu.decl.name);
        field.category = FieldCategory::PathToChildElementNoLink;
        field.related_class_xpath = Some(related_xpath.to_string());
        field
    }

    fn nested_draft(&self, eu: &ElementUse, xpath: String, short: bool) -> ClassDraft {
        ClassDraft::new(
            FeatureClass {
                xpath,
                documentation: eu.documentation.clone(),
                ..Default::default()
            },
            Naming::Nested {
                short: short.then(|| eu.decl.name.clone()),
                suffix: format!("_{}", eu.label),
            },
        )
    }

    fn simple_element(
        &mut self,
        eu: &ElementUse,
        st: Ref<SimpleTypeDefinition>,
        class: &mut ClassDraft,
    ) -> Result<(), AnalyzerError> {
        let mut field = self.element_field(eu, &eu.decl.name);
        self.set_simple_type(st, &mut field)?;
        self.apply_list_type(st, &mut field, eu.repeated)?;

        let mut needs_table = eu.repeated;
        if eu.repeated
            && self.conf.layer_building.use_arrays
            && field.field_type.is_array_compatible()
        {
            field.is_array = true;
            needs_table = false;
        }

        if needs_table {
            let mut nested = self.nested_draft(eu, eu.xpath.clone(), false);
            field.name = "value".into();
            field.min_occurs = 1;
            field.max_occurs = MaxOccurs::Count(1);
            field.not_nullable = true;
            field.may_appear_out_of_order = false;
            nested.class.fields.push(field);
            class.class.fields.push(self.no_link_field(eu, &eu.xpath));
            class.nested.push(nested);
            return Ok(());
        }

        field.not_nullable = !eu.in_choice && eu.min_occurs > 0 && !eu.decl.nillable;
        if let Some(constraint) = &eu.decl.value_constraint {
            field.fixed_value = constraint.fixed_value().map(str::to_string);
            field.default_value = constraint.default_value().map(str::to_string);
        }
        class.class.fields.push(field);

        if eu.min_occurs == 0 && eu.decl.nillable {
            let mut nil = Field::new(
                format!("{}_nil", eu.decl.name),
                format!("{}/@{}:nil", eu.xpath, self.prefix(XSI_NAMESPACE)),
                FieldCategory::Regular,
            );
            nil.set_type(FieldType::Boolean, "boolean");
            class.class.fields.push(nil);
        }
        Ok(())
    }

    fn is_any_type(&self, ct: &ComplexTypeDefinition) -> bool {
        let c = self.c;
        let base_is_any = ct
            .base_type_definition
            .name(c)
            .is_some_and(|n| n.is(XS_NAMESPACE, "anyType"));
        base_is_any
            && self.content_of(ct).is_some_and(|content| {
                content.particles.len() == 1
                    && matches!(content.particles[0].get(c).term, Term::Wildcard(_))
            })
    }

    fn complex_element(
        &mut self,
        eu: &ElementUse,
        ct_ref: Ref<ComplexTypeDefinition>,
        class: &mut ClassDraft,
        depth: usize,
        visited: &HashSet<Ref<ModelGroup>>,
    ) -> Result<(), AnalyzerError> {
        let c = self.c;
        let ct = ct_ref.get(c);
        let use_arrays = self.conf.layer_building.use_arrays;
        let elt_repeated = ct
            .content_type
            .particle()
            .is_some_and(|p| p.get(c).max_occurs.is_many());
        let may_flatten = !eu.repeated && !elt_repeated;
        let name = eu.decl.name.as_str();

        // Attribute fields are named after the attribute alone and get the element name as prefix
        // when they end up in the parent class.
        let mut fields = Vec::new();
        for &attribute in &ct.attribute_uses {
            if let Some(mut field) = self.attribute_field(attribute, &eu.xpath)? {
                if eu.min_occurs == 0 {
                    field.min_occurs = 0;
                    field.not_nullable = false;
                }
                fields.push(field);
            }
        }
        if ct.attribute_wildcard.is_some() {
            fields.push(Self::any_attributes_field(&eu.xpath, "anyAttributes"));
        }
        let attribute_count = fields.len();

        let value_field = if let Some(st) = ct.content_type.simple_type_definition() {
            let mut field = self.element_field(eu, name);
            self.set_simple_type(st, &mut field)?;
            Some(field)
        } else if self.is_any_type(ct) {
            let mut field = self.element_field(eu, name);
            field.set_type(FieldType::AnyType, "anyType");
            Some(field)
        } else {
            None
        };

        if let Some(mut field) = value_field {
            if eu.repeated
                && attribute_count == 0
                && use_arrays
                && field.field_type.is_array_compatible()
            {
                field.is_array = true;
                class.class.fields.push(field);
                return Ok(());
            }
            if eu.repeated {
                field.name = "value".into();
                field.min_occurs = 1;
                field.max_occurs = MaxOccurs::Count(1);
                field.not_nullable = true;
                fields.push(field);
                let mut nested = self.nested_draft(eu, eu.xpath.clone(), true);
                nested.class.fields = fields;
                class.class.fields.push(self.no_link_field(eu, &eu.xpath));
                class.nested.push(nested);
            } else {
                field.not_nullable = !eu.in_choice && eu.min_occurs > 0 && !eu.decl.nillable;
                fields.push(field);
                prefix_names(&mut fields[..attribute_count], name);
                class.class.fields.extend(fields);
            }
            return Ok(());
        }

        let content = self.content_of(ct);
        if content
            .as_ref()
            .and_then(|content| content.group)
            .is_some_and(|g| visited.contains(&g))
        {
            return Err(AnalyzerError::Recursion(eu.xpath.clone()));
        }

        let mut nested = self.nested_draft(eu, eu.xpath.clone(), true);
        if let Some(content) = &content {
            let counts = self.count_names(content);
            self.explore(content, &[], false, &mut nested, depth + 1, visited, &counts)?;
        }

        if let Some((text, target)) = self.reference_target(eu.decl) {
            match target {
                Some(target) if !target.get(c).abstract_ => {
                    let href = format!("{}/@{}:href", eu.xpath, self.prefix(XLINK_NAMESPACE));
                    let mut field = Field::new(
                        format!("{name}_pkid"),
                        pkid_xpath(&href),
                        FieldCategory::PathToChildElementWithLink,
                    );
                    field.related_class_xpath = Some(self.element_xpath(target.get(c)));
                    fields.push(field);
                }
                Some(_) => debug!("targetElement {text} of {} is abstract", eu.xpath),
                None => debug!("Cannot resolve targetElement {text} of {}", eu.xpath),
            }
        }

        let flatten =
            may_flatten && self.should_flatten(eu, nested.class.fields.len() + fields.len());
        if flatten {
            let optional = eu.min_occurs == 0
                || ct
                    .content_type
                    .particle()
                    .is_some_and(|p| p.get(c).min_occurs == 0);
            prefix_names(&mut fields[..attribute_count], name);
            for mut field in std::mem::take(&mut nested.class.fields) {
                field.name = format!("{name}_{}", field.name);
                if optional {
                    field.min_occurs = 0;
                    field.not_nullable = false;
                }
                fields.push(field);
            }
            for mut moved in nested.nested {
                if let Naming::Nested { suffix, .. } = &mut moved.naming {
                    *suffix = format!("_{}{suffix}", eu.label);
                }
                class.nested.push(moved);
            }
            class.class.fields.extend(fields);
            return Ok(());
        }

        if eu.repeated
            && use_arrays
            && attribute_count == 0
            && fields.is_empty()
            && nested.nested.is_empty()
            && nested.class.fields.len() == 1
            && nested.class.fields[0].category == FieldCategory::Regular
            && nested.class.fields[0].field_type.is_array_compatible()
            && !nested.class.fields[0].is_array
        {
            let mut field = nested.class.fields.remove(0);
            field.name = format!("{name}_{}", field.name);
            field.is_array = true;
            field.max_occurs = MaxOccurs::Unbounded;
            class.class.fields.push(field);
            return Ok(());
        }

        if !fields.is_empty() && elt_repeated {
            let mut intermediate = self.nested_draft(eu, eu.xpath.clone(), true);
            let sequence_xpath = format!("{};extra=sequence", eu.xpath);
            nested.class.xpath = sequence_xpath.clone();
            nested.class.is_repeated_sequence = true;
            nested.naming = Naming::Nested {
                short: None,
                suffix: "_sequence".into(),
            };
            let mut link = Field::new(
                "sequence",
                eu.xpath.clone(),
                FieldCategory::PathToChildElementNoLink,
            );
            link.related_class_xpath = Some(sequence_xpath);
            intermediate.class.fields = fields;
            intermediate.class.fields.push(link);
            intermediate.nested.push(nested);
            class.nested.push(intermediate);
        } else {
            nested.class.is_repeated_sequence = elt_repeated;
            fields.append(&mut nested.class.fields);
            nested.class.fields = fields;
            class.nested.push(nested);
        }
        class.class.fields.push(self.no_link_field(eu, &eu.xpath));
        Ok(())
    }

    fn should_flatten(&mut self, eu: &ElementUse, field_count: usize) -> bool {
        let forced = self.force_flattening.matches(&eu.xpath).is_some();
        let disabled = self.disable_flattening.matches(&eu.xpath).is_some();
        match (forced, disabled) {
            (true, true) => {
                let message = format!(
                    "{} matches both forced and disabled flattening rules, keeping a child table",
                    eu.xpath
                );
                warn!("{message}");
                self.warnings.push(message);
                false
            }
            (true, false) => true,
            (false, true) => false,
            (false, false) => field_count <= self.max_fields(),
        }
    }

    /// Links `class` to the top-level classes of `elt` and of `impls`: a key column per target
    /// when the element appears at most once, a junction class per target otherwise.
    fn create_non_nested_relationship(
        &mut self,
        elt: Ref<ElementDeclaration>,
        mut impls: Vec<Ref<ElementDeclaration>>,
        class: &mut ClassDraft,
        max_occurs: MaxOccurs,
        force_junction: bool,
    ) -> Result<(), AnalyzerError> {
        let c = self.c;
        let decl = elt.get(c);
        let element_xpath = format!("{}/{}", class.class.xpath, self.element_xpath(decl));
        if !decl.abstract_ {
            impls.insert(0, elt);
        }
        let several = impls.len() > 1;
        let mut seen = HashSet::new();
        for sub in impls {
            let sub_decl = sub.get(c);
            let sub_xpath = self.element_xpath(sub_decl);
            if !seen.insert(sub_xpath.clone()) {
                continue;
            }
            let real_xpath = format!("{}/{sub_xpath}", class.class.xpath);
            if self.is_ignored(&real_xpath) {
                continue;
            }
            let sub_label = if self.name_counts.get(&sub_decl.name).copied().unwrap_or(0) > 1 {
                sub_xpath.replace(':', "_")
            } else {
                sub_decl.name.clone()
            };

            if !max_occurs.is_many() && !force_junction {
                let name = if several {
                    format!("{}_{sub_label}_pkid", decl.name)
                } else {
                    format!("{}_pkid", decl.name)
                };
                let mut field =
                    Field::new(name, real_xpath, FieldCategory::PathToChildElementWithLink);
                field.max_occurs = max_occurs;
                field.related_class_xpath = Some(sub_xpath);
                class.class.fields.push(field);
                continue;
            }

            let junction = FeatureClass {
                xpath: format!("{element_xpath}|{sub_xpath}"),
                is_junction_table: true,
                parent_xpath: Some(class.class.xpath.clone()),
                child_xpath: Some(sub_xpath.clone()),
                ..Default::default()
            };
            self.junctions.push(ClassDraft::new(
                junction,
                Naming::Junction(format!("_{}_{sub_label}", decl.name)),
            ));
            let mut field = Field::new(
                format!("{}_{}", decl.name, sub_decl.name),
                real_xpath,
                FieldCategory::PathToChildElementWithJunctionTable,
            );
            field.max_occurs = max_occurs;
            field.abstract_element_xpath = Some(element_xpath.clone());
            field.related_class_xpath = Some(sub_xpath);
            class.class.fields.push(field);
        }
        Ok(())
    }

    // -- Naming and model assembly

    fn finalize(
        mut self,
        mut tops: Vec<ClassDraft>,
    ) -> Result<(SchemaModel, Vec<String>), AnalyzerError> {
        let rules = self.rules;
        for top in &mut tops {
            top.visit_mut(&mut |draft| launder_field_names(&mut draft.class, rules));
        }

        let key = |name: &str| {
            if rules.case_insensitive {
                name.to_uppercase()
            } else {
                name.to_string()
            }
        };
        let mut short_counts: HashMap<String, usize> = HashMap::new();
        for top in &mut tops {
            top.visit_mut(&mut |draft| match &draft.naming {
                Naming::Fixed => *short_counts.entry(key(&draft.class.name)).or_default() += 1,
                Naming::Nested {
                    short: Some(short), ..
                } => *short_counts.entry(key(short)).or_default() += 1,
                _ => {}
            });
        }
        for top in &mut tops {
            resolve_names(top, "", &|s: &str| short_counts.get(&key(s)) == Some(&1));
        }

        // Flatten the drafts in depth-first order: (class, parent index)
        let mut flat: Vec<(FeatureClass, Option<usize>)> = Vec::new();
        fn flatten(
            draft: ClassDraft,
            parent: Option<usize>,
            flat: &mut Vec<(FeatureClass, Option<usize>)>,
        ) {
            let index = flat.len();
            flat.push((draft.class, parent));
            for nested in draft.nested {
                flatten(nested, Some(index), flat);
            }
        }
        for top in tops {
            flatten(top, None, &mut flat);
        }

        // Junction classes are named after the class holding the link field
        let mut owners: HashMap<String, (String, String)> = HashMap::new();
        for (class, _) in &flat {
            for field in &class.fields {
                if let (
                    FieldCategory::PathToChildElementWithJunctionTable,
                    Some(abstract_xpath),
                    Some(related),
                ) = (
                    field.category,
                    &field.abstract_element_xpath,
                    &field.related_class_xpath,
                ) {
                    owners.insert(
                        format!("{abstract_xpath}|{related}"),
                        (class.name.clone(), class.xpath.clone()),
                    );
                }
            }
        }
        for mut junction in std::mem::take(&mut self.junctions) {
            let suffix = match &junction.naming {
                Naming::Junction(suffix) => suffix.clone(),
                _ => String::new(),
            };
            match owners.get(&junction.class.xpath) {
                Some((owner_name, owner_xpath)) => {
                    junction.class.name = format!("{owner_name}{suffix}");
                    junction.class.parent_xpath = Some(owner_xpath.clone());
                }
                None => {
                    debug!("Dropping unreferenced junction {}", junction.class.xpath);
                    continue;
                }
            }
            if flat.iter().any(|(c, _)| c.xpath == junction.class.xpath) {
                continue;
            }
            flat.push((junction.class, None));
        }

        let mut names = flat.iter().map(|(c, _)| c.name.clone()).collect::<Vec<_>>();
        rules.make_unique(&mut names);
        for ((class, _), name) in flat.iter_mut().zip(names) {
            class.name = name;
        }
        let junction_names = flat
            .iter()
            .filter(|(c, _)| c.is_junction_table)
            .map(|(c, _)| (c.xpath.clone(), c.name.clone()))
            .collect::<HashMap<_, _>>();
        for (class, _) in &mut flat {
            for field in &mut class.fields {
                if field.category != FieldCategory::PathToChildElementWithJunctionTable {
                    continue;
                }
                if let (Some(abstract_xpath), Some(related)) =
                    (&field.abstract_element_xpath, &field.related_class_xpath)
                {
                    field.junction_layer = junction_names
                        .get(&format!("{abstract_xpath}|{related}"))
                        .cloned();
                }
            }
        }

        let gml_version = self.namespaces.iter().find_map(|n| {
            if n.uri == GML32_NAMESPACE {
                Some("3.2.1".to_string())
            } else if n.uri == GML_NAMESPACE_PREFIX {
                Some("3.1.1".to_string())
            } else {
                None
            }
        });
        let mut model = SchemaModel::new(self.namespaces, gml_version);
        let mut ids = Vec::with_capacity(flat.len());
        for (class, parent) in flat {
            let id = model.add_class(class, parent.map(|p| ids[p]));
            ids.push(id);
        }
        info!("Schema analysis produced {} tables", model.len());
        Ok((model, self.warnings))
    }
}

fn resolve_names(draft: &mut ClassDraft, parent_name: &str, unique: &dyn Fn(&str) -> bool) {
    if let Naming::Nested { short, suffix } = &draft.naming {
        draft.class.name = match short {
            Some(short) if unique(short) => short.clone(),
            _ => format!("{parent_name}{suffix}"),
        };
    }
    let name = draft.class.name.clone();
    for nested in &mut draft.nested {
        resolve_names(nested, &name, unique);
    }
}

fn prefix_names(fields: &mut [Field], prefix: &str) {
    for field in fields {
        field.name = format!("{prefix}_{}", field.name);
    }
}

/// The path of the column holding the key of the row an `xlink:href` points to.
pub fn pkid_xpath(href_xpath: &str) -> String {
    format!("{{{href_xpath}}}_pkid")
}

fn documentation(annotation: Option<&Annotation>) -> String {
    annotation.map(Annotation::documentation_text).unwrap_or_default()
}

/// The namespace prefix of the last component of `xpath`, if any.
fn last_component_prefix(xpath: &str) -> &str {
    let last = xpath.rsplit('/').next().unwrap_or(xpath);
    let last = last.strip_prefix('@').unwrap_or(last);
    last.split_once(':').map_or("", |(prefix, _)| prefix)
}

/// Renames the fields of `class` sharing a name, then applies the identifier rules.
fn launder_field_names(class: &mut FeatureClass, rules: IdentifierRules) {
    let class_prefix = last_component_prefix(class.element_xpath()).to_string();
    for _ in 0..32 {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, field) in class.fields.iter().enumerate() {
            if field.category == FieldCategory::Regular {
                groups.entry(field.name.clone()).or_default().push(i);
            }
        }
        let duplicates = groups
            .into_iter()
            .filter(|(_, indexes)| indexes.len() > 1)
            .collect::<Vec<_>>();
        if duplicates.is_empty() {
            break;
        }
        for (name, indexes) in duplicates {
            let mut renamed = false;
            for &i in &indexes {
                let field = &mut class.fields[i];
                let prefix = last_component_prefix(&field.xpath).to_string();
                if !prefix.is_empty()
                    && prefix != class_prefix
                    && !field.name.starts_with(&format!("{prefix}_"))
                {
                    field.name = format!("{prefix}_{}", field.name);
                    renamed = true;
                    break;
                }
                if prefix.is_empty() && field.is_attribute() && !field.name.ends_with("_attr") {
                    field.name.push_str("_attr");
                    renamed = true;
                    break;
                }
            }
            if !renamed {
                for (occurrence, &i) in indexes.iter().enumerate().skip(1) {
                    class.fields[i].name = format!("{name}{}", occurrence + 1);
                }
            }
        }
    }

    let columns = class
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.category.has_column())
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    let mut names = columns
        .iter()
        .map(|&i| class.fields[i].name.clone())
        .collect::<Vec<_>>();
    rules.make_unique(&mut names);
    for (&i, name) in columns.iter().zip(names) {
        class.fields[i].name = name;
    }
    for field in class.fields.iter_mut().filter(|f| !f.category.has_column()) {
        field.name = rules.normalize(&field.name);
    }
}

fn forge_prefix(uri: &str) -> String {
    let stripped = uri
        .strip_prefix("http://www.opengis.net/")
        .or_else(|| uri.strip_prefix("http://"))
        .unwrap_or(uri);
    stripped
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Every namespace of the schema set with a prefix unique among them. Declared prefixes win, the
/// requested namespaces come first.
fn collect_namespaces(schemas: &SchemaSet) -> Vec<NamespaceInfo> {
    let mut infos: Vec<NamespaceInfo> = Vec::new();
    let declared = |uri: &str| {
        schemas
            .documents
            .iter()
            .flat_map(|d| d.namespace_prefixes.iter())
            .find(|(prefix, u)| u == uri && !prefix.is_empty())
            .map(|(prefix, _)| prefix.clone())
    };
    let mut add = |uri: &str, prefix: Option<String>, location: Option<&str>| {
        if let Some(existing) = infos.iter_mut().find(|n| n.uri == uri) {
            if existing.location.is_none() {
                existing.location = location.map(str::to_string);
            }
            return;
        }
        let base = prefix.unwrap_or_else(|| forge_prefix(uri));
        let mut prefix = base.clone();
        let mut serial = 2;
        while infos.iter().any(|n| n.prefix == prefix) {
            prefix = format!("{base}{serial}");
            serial += 1;
        }
        infos.push(NamespaceInfo {
            uri: uri.to_string(),
            prefix,
            location: location.map(str::to_string),
        });
    };

    add(XML_NAMESPACE, Some("xml".into()), None);
    add(XSI_NAMESPACE, Some("xsi".into()), None);
    for document in schemas.documents.iter().filter(|d| d.requested) {
        if let Some(ns) = &document.target_namespace {
            add(ns, declared(ns), Some(&document.location));
        }
    }
    for document in &schemas.documents {
        if let Some(ns) = &document.target_namespace {
            add(ns, declared(ns), None);
        }
    }
    for (prefix, uri) in schemas.documents.iter().flat_map(|d| d.namespace_prefixes.iter()) {
        if !prefix.is_empty() && uri != XS_NAMESPACE {
            add(uri, Some(prefix.clone()), None);
        }
    }
    add(XLINK_NAMESPACE, Some("xlink".into()), None);
    infos
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{model::ClassId, testing::load_schema};

    const ROOT_ITEM: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
        xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
      <xs:element name="Root">
        <xs:complexType>
          <xs:sequence>
            <xs:element name="Item" maxOccurs="unbounded">
              <xs:complexType>
                <xs:sequence><xs:element name="Name" type="xs:string"/></xs:sequence>
                <xs:attribute name="id" type="xs:ID" use="required"/>
              </xs:complexType>
            </xs:element>
          </xs:sequence>
        </xs:complexType>
      </xs:element>
    </xs:schema>"#;

    fn analyze(xsd: &str, conf: &Conf) -> (SchemaModel, Vec<String>) {
        let schemas = load_schema(xsd);
        SchemaAnalyzer::new(conf).analyze(&schemas).expect("analysis")
    }

    fn class<'m>(model: &'m SchemaModel, name: &str) -> &'m FeatureClass {
        let id = model
            .find_by_name(name)
            .unwrap_or_else(|| panic!("no class {name}"));
        model.class(id)
    }

    fn field_names(class: &FeatureClass) -> Vec<&str> {
        class.fields.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn repeated_child_becomes_nested_class() {
        let (model, warnings) = analyze(ROOT_ITEM, &Conf::default());
        assert!(warnings.is_empty());
        let names = model
            .classes()
            .into_iter()
            .map(|id| model.class(id).name.clone())
            .collect::<Vec<_>>();
        assert_eq!(names, ["Root", "Item"]);

        let root = class(&model, "Root");
        assert_eq!(root.xpath, "t:Root");
        assert!(root.is_top_level);
        assert_eq!(root.fields.len(), 1);
        assert_eq!(root.fields[0].category, FieldCategory::PathToChildElementNoLink);
        assert_eq!(root.fields[0].related_class_xpath.as_deref(), Some("t:Root/t:Item"));

        let item = class(&model, "Item");
        assert_eq!(item.xpath, "t:Root/t:Item");
        assert_eq!(item.parent, Some(ClassId(0)));
        assert_eq!(field_names(item), ["id", "Name"]);
        assert_eq!(item.fields[0].xpath, "t:Root/t:Item/@id");
        assert!(item.fields[0].not_nullable);
        assert_eq!(item.id_field().map(|f| f.name.as_str()), Some("id"));
        assert!(item.fields[1].not_nullable);
    }

    #[test]
    fn shared_element_is_linked_through_junctions() {
        let xsd = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
            xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
          <xs:element name="Shared">
            <xs:complexType>
              <xs:sequence><xs:element name="v" type="xs:int"/></xs:sequence>
            </xs:complexType>
          </xs:element>
          <xs:element name="Foo">
            <xs:complexType><xs:sequence>
              <xs:element ref="t:Shared" maxOccurs="unbounded"/>
            </xs:sequence></xs:complexType>
          </xs:element>
          <xs:element name="Bar">
            <xs:complexType><xs:sequence>
              <xs:element ref="t:Shared" maxOccurs="unbounded"/>
            </xs:sequence></xs:complexType>
          </xs:element>
        </xs:schema>"#;
        let (model, _) = analyze(xsd, &Conf::default());
        let foo = class(&model, "Foo");
        assert_eq!(foo.fields.len(), 1);
        let link = &foo.fields[0];
        assert_eq!(link.category, FieldCategory::PathToChildElementWithJunctionTable);
        assert_eq!(link.related_class_xpath.as_deref(), Some("t:Shared"));
        assert_eq!(link.junction_layer.as_deref(), Some("Foo_Shared_Shared"));

        let junction = class(&model, "Foo_Shared_Shared");
        assert!(junction.is_junction_table);
        assert_eq!(junction.xpath, "t:Foo/t:Shared|t:Shared");
        assert_eq!(junction.parent_xpath.as_deref(), Some("t:Foo"));
        assert_eq!(junction.child_xpath.as_deref(), Some("t:Shared"));
        assert!(model.find_by_name("Bar_Shared_Shared").is_some());
        assert_eq!(field_names(class(&model, "Shared")), ["v"]);
    }

    #[test]
    fn single_reference_becomes_key_column() {
        let xsd = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
            xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
          <xs:element name="Shared">
            <xs:complexType><xs:sequence><xs:element name="v" type="xs:int"/></xs:sequence></xs:complexType>
          </xs:element>
          <xs:element name="Foo">
            <xs:complexType><xs:sequence>
              <xs:element ref="t:Shared" minOccurs="0"/>
            </xs:sequence></xs:complexType>
          </xs:element>
        </xs:schema>"#;
        let (model, _) = analyze(xsd, &Conf::default());
        let foo = class(&model, "Foo");
        assert_eq!(field_names(foo), ["Shared_pkid"]);
        assert_eq!(foo.fields[0].category, FieldCategory::PathToChildElementWithLink);
        assert_eq!(foo.fields[0].xpath, "t:Foo/t:Shared");
    }

    const ADDRESS: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
        xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
      <xs:element name="Person">
        <xs:complexType><xs:sequence>
          <xs:element name="Address" minOccurs="0">
            <xs:complexType>
              <xs:sequence>
                <xs:element name="street" type="xs:string"/>
                <xs:element name="city" type="xs:string"/>
              </xs:sequence>
              <xs:attribute name="kind" type="xs:string"/>
            </xs:complexType>
          </xs:element>
        </xs:sequence></xs:complexType>
      </xs:element>
    </xs:schema>"#;

    #[test]
    fn small_child_is_flattened() {
        let (model, _) = analyze(ADDRESS, &Conf::default());
        assert_eq!(model.len(), 1);
        let person = class(&model, "Person");
        assert_eq!(
            field_names(person),
            ["Address_kind", "Address_street", "Address_city"]
        );
        assert_eq!(person.fields[1].xpath, "t:Person/t:Address/t:street");
        assert!(person.fields.iter().all(|f| f.min_occurs == 0 && !f.not_nullable));
    }

    #[test]
    fn flattening_threshold_and_rules() {
        let mut conf = Conf::default();
        conf.layer_building.flattening.maximum_number_of_fields = 2;
        let (model, _) = analyze(ADDRESS, &conf);
        assert_eq!(model.len(), 2);
        let address = class(&model, "Address");
        assert_eq!(field_names(address), ["kind", "street", "city"]);
        let person = class(&model, "Person");
        assert_eq!(person.fields[0].category, FieldCategory::PathToChildElementNoLink);

        conf.layer_building.flattening.force_xpaths = vec!["//t:Address".into()];
        conf.layer_building.flattening.namespaces =
            HashMap::from([("t".to_string(), "urn:t".to_string())]);
        let (model, _) = analyze(ADDRESS, &conf);
        assert_eq!(model.len(), 1);

        conf.layer_building.flattening.disable_xpaths = vec!["//t:Address".into()];
        let (model, warnings) = analyze(ADDRESS, &conf);
        assert_eq!(model.len(), 2);
        assert_eq!(warnings.len(), 1);
    }

    const REPEATED_SIMPLE: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
        xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
      <xs:element name="Doc">
        <xs:complexType><xs:sequence>
          <xs:element name="tag" type="xs:string" maxOccurs="unbounded"/>
          <xs:element name="stamp" type="xs:date" maxOccurs="3"/>
          <xs:element name="note" type="xs:string" minOccurs="0" nillable="true"/>
        </xs:sequence></xs:complexType>
      </xs:element>
    </xs:schema>"#;

    #[test]
    fn repeated_simple_elements() {
        let (model, _) = analyze(REPEATED_SIMPLE, &Conf::default());
        let doc = class(&model, "Doc");
        assert_eq!(field_names(doc), ["tag", "stamp", "note", "note_nil"]);
        assert!(doc.fields[0].is_array);
        assert_eq!(doc.fields[1].category, FieldCategory::PathToChildElementNoLink);
        assert_eq!(doc.fields[3].xpath, "t:Doc/t:note/@xsi:nil");

        let stamp = class(&model, "Doc_stamp");
        assert_eq!(stamp.xpath, "t:Doc/t:stamp");
        assert_eq!(field_names(stamp), ["value"]);
        assert_eq!(stamp.fields[0].field_type, FieldType::Date);
    }

    #[test]
    fn repeated_values_never_land_in_scalar_columns() {
        let mut conf = Conf::default();
        conf.layer_building.use_arrays = false;
        let (model, _) = analyze(REPEATED_SIMPLE, &conf);
        for id in model.classes() {
            for field in &model.class(id).fields {
                if field.max_occurs.is_many() && field.category == FieldCategory::Regular {
                    assert!(field.is_array, "{} is a repeated scalar", field.name);
                }
            }
        }
        assert!(model.find_by_name("Doc_tag").is_some());
    }

    #[test]
    fn recursive_type_is_linked() {
        let xsd = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
            xmlns:t="urn:t" targetNamespace="urn:t" elementFormDefault="qualified">
          <xs:complexType name="NodeType">
            <xs:sequence>
              <xs:element name="label" type="xs:string"/>
              <xs:element name="child" type="t:NodeType" minOccurs="0" maxOccurs="unbounded"/>
            </xs:sequence>
          </xs:complexType>
          <xs:element name="Tree" type="t:NodeType"/>
        </xs:schema>"#;
        let (model, _) = analyze(xsd, &Conf::default());
        let child = class(&model, "child");
        assert!(!child.is_top_level);
        assert_eq!(child.xpath, "t:child");
        let tree = class(&model, "Tree");
        assert!(tree
            .fields
            .iter()
            .any(|f| f.category == FieldCategory::PathToChildElementWithJunctionTable));
    }

    #[test]
    fn duplicate_field_names_are_renamed() {
        let mut class = FeatureClass {
            xpath: "a:X".into(),
            ..Default::default()
        };
        class.fields.push(Field::new("id", "a:X/a:id", FieldCategory::Regular));
        class.fields.push(Field::new("id", "a:X/b:id", FieldCategory::Regular));
        class.fields.push(Field::new("code", "a:X/a:code", FieldCategory::Regular));
        class.fields.push(Field::new("code", "a:X/@code", FieldCategory::Regular));
        launder_field_names(&mut class, IdentifierRules::default());
        assert_eq!(field_names(&class), ["id", "b_id", "code", "code_attr"]);
    }

    #[test]
    fn forged_prefixes() {
        assert_eq!(forge_prefix("http://www.opengis.net/gml/3.2"), "gml_3_2");
        assert_eq!(forge_prefix("http://example.com/ns"), "example_com_ns");
        assert_eq!(forge_prefix("urn:x"), "urn_x");
    }
}
