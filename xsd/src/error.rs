use thiserror::Error;

use super::xstypes::QName;

#[derive(Debug, Error)]
pub enum XsdError {
    #[error("failed to resolve prefix {0:?} to a namespace URI")]
    NamePrefixNotResolved(String),
    #[error("invalid value {value:?} for {what}")]
    InvalidValue { what: &'static str, value: String },
    #[error("missing attribute {attribute} on <{element}>")]
    MissingAttribute {
        element: String,
        attribute: &'static str,
    },
    #[error("unresolved reference to {kind} {name}")]
    UnresolvedReference { kind: &'static str, name: QName },
    #[error("duplicate component {name} ({kind})")]
    DuplicateComponent { kind: &'static str, name: QName },
    #[error("tried to overwrite built-in component {0}")]
    BuiltinOverwrite(QName),
    #[error("{0} has no name")]
    UnnamedComponent(&'static str),
    #[error("circular definition involving {0}")]
    CircularDefinition(String),
    #[error("unsupported construct <{0}>")]
    Unsupported(String),
    #[error("some components could not be mapped")]
    IncompleteSchema,
    #[error("{location}: document is not a schema (root element <{root}>)")]
    NotASchema { location: String, root: String },
    #[error("{location}: {source}")]
    Parse {
        location: String,
        #[source]
        source: roxmltree::Error,
    },
    #[error("failed to load {location}: {source}")]
    Import {
        location: String,
        #[source]
        source: super::import::ImportError,
    },
}
