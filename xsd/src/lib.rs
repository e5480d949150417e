//! Reading XML Schema documents into an arena of schema components.
//!
//! Only the parts of the component model needed for a relational mapping are kept: identity
//! constraints, assertions, notations and most constraining facets are skipped while reading.

pub mod annotation;
pub mod attribute_decl;
pub mod attribute_group_def;
pub mod attribute_use;
pub mod builtins;
pub mod complex_type_def;
pub mod element_decl;
pub mod error;
pub mod import;
pub mod model_group_def;
pub mod particle;
pub mod schema;
pub mod shared;
pub mod simple_type_def;
pub mod wildcard;
pub mod xstypes;

mod components;
mod mapping_context;
mod values;

pub use annotation::Annotation;
pub use attribute_decl::AttributeDeclaration;
pub use attribute_group_def::AttributeGroupDefinition;
pub use attribute_use::AttributeUse;
pub use complex_type_def::{ComplexTypeDefinition, ContentType};
pub use element_decl::ElementDeclaration;
pub use error::XsdError;
pub use model_group_def::ModelGroupDefinition;
pub use particle::{Compositor, MaxOccurs, ModelGroup, Particle};
pub use schema::{read_schemas, LoadOptions, SchemaDocument, SchemaSet, SchemaSource};
pub use shared::{Term, TypeDefinition};
pub use simple_type_def::SimpleTypeDefinition;
pub use wildcard::Wildcard;
pub use xstypes::QName;

pub use components::{Component, ComponentTable, Named, Ref, RefNamed, SchemaComponentTable};
use mapping_context::MappingContext;

/// What to do when a schema redefines a built-in component.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuiltinOverwriteAction {
    Deny,
    Warn,
    Allow,
}
