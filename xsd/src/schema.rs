use std::collections::{HashSet, VecDeque};

use roxmltree::{Document, Node};
use tracing::{debug, info};

use super::{
    builtins::{self, XSI_NAMESPACE, XS_NAMESPACE},
    components::{NamedXml, SchemaComponentTable, Symbol},
    error::XsdError,
    import::{Import, ImportError, ImportKind, ImportResolver, LoadedDocument},
    mapping_context::{RootContext, TopLevelMappable},
    shared::TypeDefinition,
    xstypes::{QName, XML_NAMESPACE},
    AttributeDeclaration, AttributeGroupDefinition, ComplexTypeDefinition, ElementDeclaration,
    MappingContext, ModelGroupDefinition, Ref, SimpleTypeDefinition,
};
use crate::BuiltinOverwriteAction;

/// A schema document the loader starts from.
#[derive(Clone, Debug)]
pub struct SchemaSource {
    pub namespace: Option<String>,
    pub location: String,
}

#[derive(Clone, Debug)]
pub struct LoadOptions {
    pub builtin_overwrite: BuiltinOverwriteAction,
    /// Abort on the first recoverable schema problem instead of collecting warnings
    pub strict: bool,
    /// Load every document imported for a namespace, not only the first one
    pub handle_multiple_imports: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            builtin_overwrite: BuiltinOverwriteAction::Warn,
            strict: false,
            handle_multiple_imports: false,
        }
    }
}

/// The top-level components of one schema document, in document order.
#[derive(Clone, Debug)]
pub struct SchemaDocument {
    pub location: String,
    /// Whether the document was one of the sources, rather than reached through an import
    pub requested: bool,
    pub target_namespace: Option<String>,
    /// `(prefix, namespace)` pairs declared on the `<schema>` element
    pub namespace_prefixes: Vec<(String, String)>,
    pub element_declarations: Vec<Ref<ElementDeclaration>>,
    pub type_definitions: Vec<TypeDefinition>,
    pub attribute_declarations: Vec<Ref<AttributeDeclaration>>,
    pub attribute_group_definitions: Vec<Ref<AttributeGroupDefinition>>,
    pub model_group_definitions: Vec<Ref<ModelGroupDefinition>>,
}

/// Every document reachable from the schema sources, mapped into one component table.
pub struct SchemaSet {
    pub documents: Vec<SchemaDocument>,
    pub components: SchemaComponentTable,
    /// Recoverable problems found while loading
    pub warnings: Vec<String>,
}

impl SchemaSet {
    /// All top-level element declarations, in document order.
    pub fn top_level_elements(&self) -> impl Iterator<Item = Ref<ElementDeclaration>> + '_ {
        self.documents
            .iter()
            .flat_map(|d| d.element_declarations.iter().copied())
    }

    pub fn find_element_by_name(&self, name: &QName) -> Option<Ref<ElementDeclaration>> {
        self.top_level_elements()
            .find(|e| {
                let element = e.get(&self.components);
                element.name == name.local_name && element.target_namespace == name.namespace_name
            })
    }

    pub fn find_type_by_name(&self, name: &QName) -> Option<TypeDefinition> {
        use super::components::RefNamed;
        self.documents
            .iter()
            .flat_map(|d| d.type_definitions.iter().copied())
            .find(|t| t.name(&self.components).as_ref() == Some(name))
    }

    /// The elements that may substitute for `head`, directly or transitively, in document order.
    pub fn substitution_group_members(
        &self,
        head: Ref<ElementDeclaration>,
    ) -> Vec<Ref<ElementDeclaration>> {
        let mut heads = vec![head];
        let mut members = Vec::new();
        loop {
            let found = self
                .top_level_elements()
                .filter(|e| !members.contains(e) && *e != head)
                .filter(|e| {
                    e.get(&self.components)
                        .substitution_group_affiliations
                        .iter()
                        .any(|h| heads.contains(h))
                })
                .collect::<Vec<_>>();
            if found.is_empty() {
                break;
            }
            heads.extend(found.iter().copied());
            members.extend(found);
        }
        let order = self.top_level_elements().collect::<Vec<_>>();
        members.sort_by_key(|m| order.iter().position(|o| o == m));
        members
    }
}

/// Loads the schema documents referenced by `sources` and everything they import or include.
pub fn read_schemas(
    sources: &[SchemaSource],
    resolvers: &[Box<dyn ImportResolver>],
    options: &LoadOptions,
) -> Result<SchemaSet, XsdError> {
    let mut root_context = RootContext::new(options.builtin_overwrite, options.strict);
    builtins::register_builtins(&mut root_context)?;

    let loaded = collect_documents(&mut root_context, sources, resolvers, options)?;
    let mut parsed = Vec::with_capacity(loaded.len());
    for (document, requested) in &loaded {
        parsed.push((document.location.as_str(), *requested, parse_document(document)?));
    }
    let documents = map_documents(&mut root_context, &parsed)?;

    let (components, warnings) = root_context.into_parts();
    let components = components.freeze().ok_or(XsdError::IncompleteSchema)?;
    info!(
        "Loaded {} schema document(s) with {} warning(s)",
        documents.len(),
        warnings.len()
    );
    Ok(SchemaSet {
        documents,
        components,
        warnings,
    })
}

fn parse_document(document: &LoadedDocument) -> Result<Document<'_>, XsdError> {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..Default::default()
    };
    let xml = Document::parse_with_options(&document.content, options).map_err(|source| {
        XsdError::Parse {
            location: document.location.clone(),
            source,
        }
    })?;
    let root = xml.root_element();
    if root.tag_name().name() != "schema" || root.tag_name().namespace() != Some(XS_NAMESPACE) {
        return Err(XsdError::NotASchema {
            location: document.location.clone(),
            root: root.tag_name().name().into(),
        });
    }
    Ok(xml)
}

/// Fetches the documents reachable from the sources, breadth first.
fn collect_documents(
    root_context: &mut RootContext,
    sources: &[SchemaSource],
    resolvers: &[Box<dyn ImportResolver>],
    options: &LoadOptions,
) -> Result<Vec<(LoadedDocument, bool)>, XsdError> {
    let mut queue = sources
        .iter()
        .map(|source| {
            let import = Import {
                namespace: source.namespace.clone(),
                schema_location: Some(source.location.clone()),
                base_location: None,
                kind: ImportKind::Import,
            };
            (import, true)
        })
        .collect::<VecDeque<_>>();

    let mut seen_locations = HashSet::new();
    let mut seen_namespaces = HashSet::new();
    let mut documents = Vec::new();

    while let Some((import, mandatory)) = queue.pop_front() {
        // Attributes of these namespaces are built in
        if matches!(
            import.namespace.as_deref(),
            Some(XML_NAMESPACE | XS_NAMESPACE | XSI_NAMESPACE)
        ) {
            continue;
        }
        if import.kind == ImportKind::Import
            && !mandatory
            && !options.handle_multiple_imports
            && seen_namespaces.contains(&import.namespace)
        {
            debug!(
                "Skipping additional import of namespace {:?}",
                import.namespace
            );
            continue;
        }
        let requested = import.resolved_location();
        if let Some(location) = &requested {
            if !seen_locations.insert(location.clone()) {
                continue;
            }
        }

        let Some(document) = fetch(root_context, &import, resolvers, mandatory)? else {
            continue;
        };
        // The resolver may have followed a redirect or a cache entry
        if requested.as_ref() != Some(&document.location)
            && !seen_locations.insert(document.location.clone())
        {
            continue;
        }

        let mut nested = Vec::new();
        {
            let xml = match parse_document(&document) {
                Ok(xml) => xml,
                Err(e) if mandatory => return Err(e),
                Err(e) => {
                    root_context.report(e)?;
                    continue;
                }
            };
            let schema = xml.root_element();
            let target_namespace = schema.attribute("targetNamespace");

            if import.kind != ImportKind::Import
                && import.namespace.is_some()
                && target_namespace.is_none()
            {
                root_context.report(XsdError::Unsupported(format!(
                    "include of {} without target namespace",
                    document.location
                )))?;
                continue;
            }
            if import.kind == ImportKind::Import {
                seen_namespaces.insert(import.namespace.clone());
                seen_namespaces.insert(target_namespace.map(str::to_string));
            }

            for child in schema.children().filter(|c| {
                matches!(
                    c.tag_name().name(),
                    Import::TAG_NAME | Import::INCLUDE_TAG_NAME | Import::REDEFINE_TAG_NAME
                )
            }) {
                match Import::map_from_xml(child, schema, Some(&document.location)) {
                    Ok(nested_import) => nested.push((nested_import, false)),
                    Err(e) => root_context.report(e)?,
                }
            }
        }

        debug!("Loaded schema document {}", document.location);
        documents.push((document, mandatory));
        queue.extend(nested);
    }

    Ok(documents)
}

/// Asks the resolvers in order for the document behind `import`. Failures of non-mandatory
/// imports are reported and yield `None`.
fn fetch(
    root_context: &mut RootContext,
    import: &Import,
    resolvers: &[Box<dyn ImportResolver>],
    mandatory: bool,
) -> Result<Option<LoadedDocument>, XsdError> {
    let mut failure = ImportError::UnsupportedImport;
    for resolver in resolvers {
        match resolver.resolve_import(import) {
            Ok(document) => return Ok(Some(document)),
            Err(ImportError::UnsupportedImport) => continue,
            Err(e) => {
                failure = e;
                break;
            }
        }
    }

    let error = XsdError::Import {
        location: import
            .resolved_location()
            .or_else(|| import.namespace.clone())
            .unwrap_or_default(),
        source: failure,
    };
    if mandatory {
        return Err(error);
    }
    root_context.report(error)?;
    Ok(None)
}

fn reserve_top_level<'a, 'input: 'a, C, V>(
    context: &mut MappingContext<'a, 'input, '_>,
    node: Node<'a, 'input>,
    schema: Node,
    wrap: impl Fn(Ref<C>) -> V,
) -> Result<Ref<C>, XsdError>
where
    C: NamedXml + TopLevelMappable,
    V: Symbol,
{
    let ref_ = context.reserve::<C>();
    let name = C::get_name_from_xml(node, schema)?;
    match context.register_with_name(name, wrap(ref_)) {
        Ok(()) => {}
        Err(e @ XsdError::DuplicateComponent { .. }) => context.report(e)?,
        Err(e) => return Err(e),
    }
    context.add_top_level(ref_, node);
    Ok(ref_)
}

fn map_documents<'a, 'input: 'a>(
    root_context: &mut RootContext,
    parsed: &'a [(&'a str, bool, Document<'input>)],
) -> Result<Vec<SchemaDocument>, XsdError> {
    let mut context = MappingContext::new(root_context);
    let mut documents = Vec::with_capacity(parsed.len());

    // Every top-level name is registered before anything is mapped, so references may point
    // forward and across documents.
    for (location, requested, xml) in parsed {
        let schema = xml.root_element();
        let mut document = SchemaDocument {
            location: location.to_string(),
            requested: *requested,
            target_namespace: schema.attribute("targetNamespace").map(str::to_string),
            namespace_prefixes: schema
                .namespaces()
                .filter_map(|ns| Some((ns.name()?.to_string(), ns.uri().to_string())))
                .collect(),
            element_declarations: Vec::new(),
            type_definitions: Vec::new(),
            attribute_declarations: Vec::new(),
            attribute_group_definitions: Vec::new(),
            model_group_definitions: Vec::new(),
        };

        for child in schema.children().filter(Node::is_element) {
            match child.tag_name().name() {
                ElementDeclaration::TAG_NAME => {
                    let element = reserve_top_level::<ElementDeclaration, _>(
                        &mut context,
                        child,
                        schema,
                        |r| r,
                    )?;
                    document.element_declarations.push(element);
                }
                SimpleTypeDefinition::TAG_NAME => {
                    let simple = reserve_top_level::<SimpleTypeDefinition, _>(
                        &mut context,
                        child,
                        schema,
                        TypeDefinition::Simple,
                    )?;
                    document
                        .type_definitions
                        .push(TypeDefinition::Simple(simple));
                }
                ComplexTypeDefinition::TAG_NAME => {
                    let complex = reserve_top_level::<ComplexTypeDefinition, _>(
                        &mut context,
                        child,
                        schema,
                        TypeDefinition::Complex,
                    )?;
                    document
                        .type_definitions
                        .push(TypeDefinition::Complex(complex));
                }
                AttributeDeclaration::TAG_NAME => {
                    let attribute = reserve_top_level::<AttributeDeclaration, _>(
                        &mut context,
                        child,
                        schema,
                        |r| r,
                    )?;
                    document.attribute_declarations.push(attribute);
                }
                AttributeGroupDefinition::TAG_NAME => {
                    let group = reserve_top_level::<AttributeGroupDefinition, _>(
                        &mut context,
                        child,
                        schema,
                        |r| r,
                    )?;
                    document.attribute_group_definitions.push(group);
                }
                ModelGroupDefinition::TAG_NAME => {
                    let group = reserve_top_level::<ModelGroupDefinition, _>(
                        &mut context,
                        child,
                        schema,
                        |r| r,
                    )?;
                    document.model_group_definitions.push(group);
                }

                // These tags don't directly contribute top-level components
                "annotation" | "notation" | Import::TAG_NAME | Import::INCLUDE_TAG_NAME
                | Import::REDEFINE_TAG_NAME => {}

                other => context.report(XsdError::Unsupported(other.into()))?,
            }
        }
        documents.push(document);
    }

    for document in &documents {
        for &type_definition in &document.type_definitions {
            match type_definition {
                TypeDefinition::Simple(simple) => {
                    context.request(simple)?;
                }
                TypeDefinition::Complex(complex) => {
                    context.request(complex)?;
                }
            }
        }
        for &attribute in &document.attribute_declarations {
            context.request(attribute)?;
        }
        for &group in &document.attribute_group_definitions {
            context.request(group)?;
        }
        for &group in &document.model_group_definitions {
            context.request(group)?;
        }
        for &element in &document.element_declarations {
            context.request(element)?;
        }
    }

    Ok(documents)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        complex_type_def::ContentType,
        particle::{Compositor, MaxOccurs},
        Term,
    };

    struct MemoryResolver(HashMap<&'static str, &'static str>);

    impl ImportResolver for MemoryResolver {
        fn resolve_import(&self, import: &Import) -> Result<LoadedDocument, ImportError> {
            let location = import
                .resolved_location()
                .ok_or(ImportError::UnsupportedImport)?;
            let content = self
                .0
                .get(location.as_str())
                .ok_or_else(|| ImportError::NotAvailable(location.clone()))?;
            Ok(LoadedDocument {
                location,
                content: content.to_string(),
            })
        }
    }

    fn load(
        files: &[(&'static str, &'static str)],
        strict: bool,
    ) -> Result<SchemaSet, XsdError> {
        let resolver = MemoryResolver(files.iter().copied().collect());
        let options = LoadOptions {
            strict,
            ..Default::default()
        };
        read_schemas(
            &[SchemaSource {
                namespace: None,
                location: files[0].0.into(),
            }],
            &[Box::new(resolver)],
            &options,
        )
    }

    const MAIN: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
        xmlns:t="urn:test" targetNamespace="urn:test" elementFormDefault="qualified">
      <xs:include schemaLocation="types.xsd"/>
      <xs:element name="Root" type="t:RootType"/>
      <xs:element name="Child" type="t:Derived"/>
    </xs:schema>"#;

    const TYPES: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
        xmlns:t="urn:test" targetNamespace="urn:test" elementFormDefault="qualified">
      <xs:complexType name="RootType">
        <xs:sequence>
          <xs:element name="Item" maxOccurs="unbounded">
            <xs:complexType>
              <xs:sequence><xs:element name="Name" type="xs:string"/></xs:sequence>
              <xs:attribute name="id" type="xs:ID"/>
            </xs:complexType>
          </xs:element>
          <xs:group ref="t:Shared"/>
        </xs:sequence>
      </xs:complexType>
      <xs:group name="Shared">
        <xs:sequence><xs:element name="Common" type="xs:int" minOccurs="0"/></xs:sequence>
      </xs:group>
      <xs:complexType name="Base">
        <xs:sequence><xs:element name="a" type="xs:string"/></xs:sequence>
        <xs:attribute name="x" type="xs:string"/>
      </xs:complexType>
      <xs:complexType name="Derived">
        <xs:complexContent>
          <xs:extension base="t:Base">
            <xs:sequence><xs:element name="b" type="xs:string"/></xs:sequence>
            <xs:attribute name="y" type="xs:string"/>
          </xs:extension>
        </xs:complexContent>
      </xs:complexType>
    </xs:schema>"#;

    #[test]
    fn loads_included_documents() {
        let set = load(&[("main.xsd", MAIN), ("types.xsd", TYPES)], true).unwrap();
        assert_eq!(set.documents.len(), 2);
        assert!(set.warnings.is_empty());

        let root = set
            .find_element_by_name(&QName::with_namespace("urn:test", "Root"))
            .unwrap();
        let root_type = root
            .get(&set.components)
            .type_definition
            .complex()
            .unwrap()
            .get(&set.components);
        let particle = root_type.content_type.particle().unwrap();
        let group = particle
            .get(&set.components)
            .term
            .model_group()
            .unwrap()
            .get(&set.components);
        assert_eq!(group.compositor, Compositor::Sequence);
        assert_eq!(group.particles.len(), 2);

        let item = group.particles[0].get(&set.components);
        assert_eq!(item.max_occurs, MaxOccurs::Unbounded);
        let item_decl = item.term.element_declaration().unwrap().get(&set.components);
        assert_eq!(item_decl.name, "Item");
        assert_eq!(item_decl.target_namespace.as_deref(), Some("urn:test"));
    }

    #[test]
    fn group_references_share_the_model_group() {
        let set = load(&[("main.xsd", MAIN), ("types.xsd", TYPES)], true).unwrap();
        let shared = set.documents[1].model_group_definitions[0].get(&set.components);

        let root = set
            .find_element_by_name(&QName::with_namespace("urn:test", "Root"))
            .unwrap();
        let root_type = root
            .get(&set.components)
            .type_definition
            .complex()
            .unwrap()
            .get(&set.components);
        let outer = root_type
            .content_type
            .particle()
            .unwrap()
            .get(&set.components)
            .term
            .model_group()
            .unwrap()
            .get(&set.components);
        let reference = outer.particles[1].get(&set.components);
        assert_eq!(reference.term, Term::ModelGroup(shared.model_group));
    }

    #[test]
    fn extension_appends_content_and_attributes() {
        let set = load(&[("main.xsd", MAIN), ("types.xsd", TYPES)], true).unwrap();
        let derived = set
            .find_type_by_name(&QName::with_namespace("urn:test", "Derived"))
            .and_then(TypeDefinition::complex)
            .unwrap()
            .get(&set.components);
        assert_eq!(derived.attribute_uses.len(), 2);
        let ContentType::ElementOnly { particle } = derived.content_type else {
            panic!("unexpected content type {:?}", derived.content_type);
        };
        let sequence = particle
            .get(&set.components)
            .term
            .model_group()
            .unwrap()
            .get(&set.components);
        assert_eq!(sequence.particles.len(), 2);
    }

    #[test]
    fn unresolved_type_is_a_warning_unless_strict() {
        const BROKEN: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
          <xs:element name="A" type="Missing"/>
        </xs:schema>"#;
        let set = load(&[("broken.xsd", BROKEN)], false).unwrap();
        assert_eq!(set.warnings.len(), 1);
        let a = set
            .find_element_by_name(&QName::with_optional_namespace(None::<String>, "A"))
            .unwrap();
        assert!(a.get(&set.components).type_definition.complex().is_some());

        assert!(matches!(
            load(&[("broken.xsd", BROKEN)], true),
            Err(XsdError::UnresolvedReference { .. })
        ));
    }

    #[test]
    fn self_referencing_types_load() {
        const TREE: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
          <xs:complexType name="Node">
            <xs:sequence>
              <xs:element name="child" type="Node" minOccurs="0" maxOccurs="unbounded"/>
            </xs:sequence>
          </xs:complexType>
          <xs:element name="tree" type="Node"/>
        </xs:schema>"#;
        let set = load(&[("tree.xsd", TREE)], true).unwrap();
        assert_eq!(set.documents[0].type_definitions.len(), 1);
    }

    #[test]
    fn substitution_groups_are_transitive() {
        const SUBST: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
          <xs:element name="Abstract" abstract="true" type="xs:string"/>
          <xs:element name="Middle" substitutionGroup="Abstract"/>
          <xs:element name="Leaf" substitutionGroup="Middle"/>
        </xs:schema>"#;
        let set = load(&[("subst.xsd", SUBST)], true).unwrap();
        let elements = set.documents[0].element_declarations.clone();
        assert_eq!(set.substitution_group_members(elements[0]), elements[1..]);
        // Members without their own type take the type of their head
        assert_eq!(
            elements[2].get(&set.components).type_definition,
            elements[0].get(&set.components).type_definition
        );
    }

    #[test]
    fn missing_import_is_reported() {
        const IMPORTING: &str = r#"<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
          <xs:import namespace="urn:other" schemaLocation="other.xsd"/>
          <xs:import namespace="http://www.w3.org/XML/1998/namespace"/>
        </xs:schema>"#;
        let set = load(&[("importing.xsd", IMPORTING)], false).unwrap();
        assert_eq!(set.warnings.len(), 1);
        assert!(set.warnings[0].contains("other.xsd"));
    }
}
