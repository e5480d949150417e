use roxmltree::Node;

use super::{
    complex_type_def::ComplexTypeDefinition,
    components::{ComponentTable, Named, RefNamed},
    element_decl::ElementDeclaration,
    particle::ModelGroup,
    simple_type_def::SimpleTypeDefinition,
    wildcard::Wildcard,
    xstypes::QName,
    Ref,
};

/// Where an element or attribute declaration applies: everywhere, or only inside its parent.
#[derive(Clone, Debug)]
pub enum Scope<P> {
    Global,
    Local(P),
}

impl<P> Scope<P> {
    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }
}

/// The `default` or `fixed` value of a declaration or attribute use, in lexical form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueConstraint {
    Default(String),
    Fixed(String),
}

impl ValueConstraint {
    /// `default` wins when both attributes are present.
    pub(super) fn map_from_xml(node: Node) -> Option<Self> {
        node.attribute("default")
            .map(|v| Self::Default(v.into()))
            .or_else(|| node.attribute("fixed").map(|v| Self::Fixed(v.into())))
    }

    pub fn fixed_value(&self) -> Option<&str> {
        match self {
            Self::Fixed(v) => Some(v),
            Self::Default(_) => None,
        }
    }

    pub fn default_value(&self) -> Option<&str> {
        match self {
            Self::Default(v) => Some(v),
            Self::Fixed(_) => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeDefinition {
    Simple(Ref<SimpleTypeDefinition>),
    Complex(Ref<ComplexTypeDefinition>),
}

impl RefNamed for TypeDefinition {
    fn name(&self, table: &impl ComponentTable) -> Option<QName> {
        match *self {
            Self::Simple(s) => s.get(table).name(),
            Self::Complex(c) => c.get(table).name(),
        }
    }
}

impl TypeDefinition {
    pub fn simple(self) -> Option<Ref<SimpleTypeDefinition>> {
        match self {
            Self::Simple(s) => Some(s),
            Self::Complex(_) => None,
        }
    }

    pub fn complex(self) -> Option<Ref<ComplexTypeDefinition>> {
        match self {
            Self::Complex(c) => Some(c),
            Self::Simple(_) => None,
        }
    }

    pub fn base_type_definition(self, table: &impl ComponentTable) -> TypeDefinition {
        match self {
            Self::Simple(s) => s.get(table).base_type_definition,
            Self::Complex(c) => c.get(table).base_type_definition,
        }
    }

    /// This type, then its base types up to `xs:anyType`, the only type that is its own base.
    pub fn ancestors_or_self<'a>(
        self,
        table: &'a impl ComponentTable,
    ) -> impl Iterator<Item = TypeDefinition> + 'a {
        std::iter::successors(Some(self), move |&t| {
            let base = t.base_type_definition(table);
            (base != t).then_some(base)
        })
    }
}

/// What a particle matches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Term {
    ElementDeclaration(Ref<ElementDeclaration>),
    ModelGroup(Ref<ModelGroup>),
    Wildcard(Ref<Wildcard>),
}

impl Term {
    pub fn model_group(self) -> Option<Ref<ModelGroup>> {
        match self {
            Self::ModelGroup(g) => Some(g),
            _ => None,
        }
    }

    pub fn element_declaration(self) -> Option<Ref<ElementDeclaration>> {
        match self {
            Self::ElementDeclaration(e) => Some(e),
            _ => None,
        }
    }
}
