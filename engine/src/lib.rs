//! Mapping between XSD-described XML documents and a set of relational tables.
//!
//! The [`analyzer`] turns a loaded [`relmap_xsd::SchemaSet`] into a [`model::SchemaModel`], the
//! [`reader`] streams documents into a [`storage::Storage`] following that model, and the
//! [`writer`] turns the stored rows back into XML.

pub mod analyzer;
pub mod cache;
pub mod conf;
pub mod geometry;
pub mod identifier;
pub mod metadata;
pub mod model;
pub mod reader;
pub mod storage;
pub mod writer;
pub mod xlink;
pub mod xpath;

pub use analyzer::{AnalyzerError, SchemaAnalyzer};
pub use cache::{load_schemas, ResourceCache, ResourceError};
pub use conf::{Conf, ConfError};
pub use model::{FeatureClass, Field, FieldCategory, FieldType, SchemaModel};
pub use reader::{
    EventSource, ReadError, ReadOutcome, ReadReport, Reader, SaxHandler, XmlEventSource,
};
pub use storage::{MemoryStore, Storage, StorageError, Value};
pub use writer::{WriteError, Writer};
pub use xlink::XLinkResolver;
pub use xpath::XPathMatcher;

pub const GML_NAMESPACE_PREFIX: &str = "http://www.opengis.net/gml";
pub const GML32_NAMESPACE: &str = "http://www.opengis.net/gml/3.2";
pub const XLINK_NAMESPACE: &str = "http://www.w3.org/1999/xlink";

/// Whether `uri` designates one of the GML namespaces.
pub fn is_gml_namespace(uri: &str) -> bool {
    uri.starts_with(GML_NAMESPACE_PREFIX)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use relmap_xsd::{
        import::{Import, ImportError, ImportResolver, LoadedDocument},
        read_schemas, LoadOptions, SchemaSet, SchemaSource,
    };

    /// Serves schema documents from memory, by location.
    pub struct MemoryResolver(pub HashMap<String, String>);

    impl ImportResolver for MemoryResolver {
        fn resolve_import(&self, import: &Import) -> Result<LoadedDocument, ImportError> {
            let location = import
                .resolved_location()
                .ok_or(ImportError::UnsupportedImport)?;
            let content = self
                .0
                .get(&location)
                .ok_or_else(|| ImportError::NotAvailable(location.clone()))?;
            Ok(LoadedDocument {
                location,
                content: content.clone(),
            })
        }
    }

    /// Loads `main.xsd` from `documents`, a list of (location, content).
    pub fn load_schemas(documents: &[(&str, &str)]) -> SchemaSet {
        let resolver = MemoryResolver(
            documents
                .iter()
                .map(|(l, c)| (l.to_string(), c.to_string()))
                .collect(),
        );
        let resolvers: Vec<Box<dyn ImportResolver>> = vec![Box::new(resolver)];
        read_schemas(
            &[SchemaSource {
                namespace: None,
                location: documents[0].0.to_string(),
            }],
            &resolvers,
            &LoadOptions::default(),
        )
        .expect("schemas load")
    }

    pub fn load_schema(xsd: &str) -> SchemaSet {
        load_schemas(&[("main.xsd", xsd)])
    }
}
