use std::path::Path;

use roxmltree::Node;
use thiserror::Error;

use super::{error::XsdError, values::attribute_value};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImportKind {
    Import,
    Include,
    /// Treated like an include; the redefinitions themselves are ignored
    Redefine,
}

/// This structure represents the `import`, `include` and `redefine` elements, as well as the
/// documents the loader starts from; it is not a schema component.
///
/// Note that an import is allowed to have neither a `schemaLocation` nor a `namespace` attribute.
#[derive(Clone, Debug)]
pub struct Import {
    pub namespace: Option<String>,
    pub schema_location: Option<String>,
    /// Location of the document containing the import, used to resolve relative locations
    pub base_location: Option<String>,
    pub kind: ImportKind,
}

impl Import {
    pub const TAG_NAME: &'static str = "import";
    pub const INCLUDE_TAG_NAME: &'static str = "include";
    pub const REDEFINE_TAG_NAME: &'static str = "redefine";

    pub fn map_from_xml(
        import: Node,
        schema: Node,
        base_location: Option<&str>,
    ) -> Result<Self, XsdError> {
        let kind = match import.tag_name().name() {
            Self::INCLUDE_TAG_NAME => ImportKind::Include,
            Self::REDEFINE_TAG_NAME => ImportKind::Redefine,
            _ => ImportKind::Import,
        };
        let schema_location = attribute_value::<String>(import, "schemaLocation")?;

        // Included documents share the target namespace of the including one
        let namespace = match kind {
            ImportKind::Import => attribute_value::<String>(import, "namespace")?,
            ImportKind::Include | ImportKind::Redefine => {
                schema.attribute("targetNamespace").map(str::to_string)
            }
        };

        // § 4.2.6 Schema Representation Constraint: Import Constraints and Semantics
        // 1.1 If the namespace [attribute] is present, then its ·actual value· does not match
        //   the ·actual value· of the enclosing <schema>'s targetNamespace [attribute].
        if kind == ImportKind::Import
            && namespace.is_some()
            && namespace.as_deref() == schema.attribute("targetNamespace")
        {
            return Err(XsdError::InvalidValue {
                what: "import namespace (matches the target namespace)",
                value: namespace.unwrap_or_default(),
            });
        }

        Ok(Import {
            namespace,
            schema_location,
            base_location: base_location.map(str::to_string),
            kind,
        })
    }

    /// The schema location, resolved against the location of the importing document.
    pub fn resolved_location(&self) -> Option<String> {
        let location = self.schema_location.as_deref()?;
        Some(match self.base_location.as_deref() {
            Some(base) => resolve_location(base, location),
            None => location.to_string(),
        })
    }
}

pub fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Resolves a (possibly relative) `location` against the location of the document containing
/// the reference.
pub fn resolve_location(base: &str, location: &str) -> String {
    if is_url(location) || Path::new(location).is_absolute() {
        return location.to_string();
    }
    if is_url(base) {
        let (scheme, rest) = base.split_once("://").unwrap_or(("http", base));
        let mut segments = rest.split('/').collect::<Vec<_>>();
        // Drop the file name of the base document
        if segments.len() > 1 {
            segments.pop();
        }
        for segment in location.split('/') {
            match segment {
                "." | "" => {}
                ".." if segments.len() > 1 => {
                    segments.pop();
                }
                ".." => {}
                segment => segments.push(segment),
            }
        }
        return format!("{scheme}://{}", segments.join("/"));
    }
    match Path::new(base).parent() {
        Some(parent) => parent.join(location).to_string_lossy().into_owned(),
        None => location.to_string(),
    }
}

/// The source text of a schema document, and the location it was ultimately loaded from.
#[derive(Clone, Debug)]
pub struct LoadedDocument {
    pub location: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("the resolver does not support the import")]
    UnsupportedImport,
    #[error("resource {0} is not available")]
    NotAvailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("an unspecified error occurred while loading the schema: {0}")]
    UnspecifiedLoad(Box<dyn std::error::Error + Send + Sync>),
}

pub trait ImportResolver {
    /// Fetches the document referenced by `import`. Resolvers that cannot handle the kind of
    /// location return [`ImportError::UnsupportedImport`] so the next resolver is tried.
    fn resolve_import(&self, import: &Import) -> Result<LoadedDocument, ImportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_locations() {
        assert_eq!(
            resolve_location("http://example.com/a/b/main.xsd", "../c/other.xsd"),
            "http://example.com/a/c/other.xsd"
        );
        assert_eq!(
            resolve_location("http://example.com/main.xsd", "./sub/x.xsd"),
            "http://example.com/sub/x.xsd"
        );
        assert_eq!(
            resolve_location("http://example.com/main.xsd", "https://other.org/x.xsd"),
            "https://other.org/x.xsd"
        );
        assert_eq!(
            resolve_location("schemas/main.xsd", "types.xsd"),
            Path::new("schemas").join("types.xsd").to_string_lossy()
        );
    }
}
