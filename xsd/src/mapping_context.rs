use std::collections::{HashMap, HashSet};

use roxmltree::Node;
use tracing::warn;

use super::{
    components::{AnyRef, Component, ComponentArena, ComponentTable, NameResolver, RefNamed, Symbol},
    error::XsdError,
    xstypes::QName,
    Ref,
};
use crate::BuiltinOverwriteAction;

/// Components declared at the top level of a schema document, mapped on first use.
pub(super) trait TopLevelMappable: Component {
    /// Maps `node`, a child of the `<schema>` element `schema_node`, into the slot `self_ref`
    /// reserved for it.
    fn map_from_top_level_xml(
        context: &mut MappingContext,
        self_ref: Ref<Self>,
        node: Node,
        schema_node: Node,
    ) -> Result<(), XsdError>;
}

/// State shared by the mapping of every document of a schema set.
pub struct RootContext {
    components: ComponentArena,
    names: NameResolver,
    /// Whether recoverable schema problems abort loading
    strict: bool,
    warnings: Vec<String>,
}

impl RootContext {
    pub fn new(builtin_overwrite: BuiltinOverwriteAction, strict: bool) -> Self {
        Self {
            components: ComponentArena::new(),
            names: NameResolver::new(builtin_overwrite),
            strict,
            warnings: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(super) fn components(&self) -> &ComponentArena {
        &self.components
    }

    pub(super) fn into_parts(self) -> (ComponentArena, Vec<String>) {
        (self.components, self.warnings)
    }

    /// Binds a named component under its own name.
    pub(super) fn register<S: Symbol + RefNamed>(&mut self, value: S) -> Result<(), XsdError> {
        self.names.register(value, &self.components)
    }

    pub(super) fn reserve<C: Component>(&mut self) -> Ref<C> {
        self.components.reserve()
    }

    pub(super) fn create<C: Component>(&mut self, component: C) -> Ref<C> {
        self.components.create(component)
    }

    pub(super) fn insert<C: Component>(&mut self, r: Ref<C>, component: C) -> Ref<C> {
        self.components.insert(r, component)
    }

    pub(super) fn resolve<S: Symbol>(&self, name: &QName) -> Result<S, XsdError> {
        self.names.resolve(name)
    }

    /// Records a recoverable schema problem, or returns it in strict mode.
    pub(super) fn report(&mut self, error: XsdError) -> Result<(), XsdError> {
        if self.strict {
            return Err(error);
        }
        warn!("{error}");
        self.warnings.push(error.to_string());
        Ok(())
    }
}

/// Maps the documents of one schema set. Top-level components are reserved up front and mapped
/// lazily, the first time they are requested.
pub(super) struct MappingContext<'a, 'input: 'a, 'p> {
    root: &'p mut RootContext,
    pending: HashMap<AnyRef, Node<'a, 'input>>,
    mapping: HashSet<AnyRef>,
}

impl<'a, 'input: 'a, 'p> MappingContext<'a, 'input, 'p> {
    pub(super) fn new(root: &'p mut RootContext) -> Self {
        Self {
            root,
            pending: HashMap::new(),
            mapping: HashSet::new(),
        }
    }

    pub(super) fn components(&self) -> &ComponentArena {
        &self.root.components
    }

    pub(super) fn reserve<C: Component>(&mut self) -> Ref<C> {
        self.root.components.reserve()
    }

    pub(super) fn create<C: Component>(&mut self, component: C) -> Ref<C> {
        self.root.components.create(component)
    }

    pub(super) fn insert<C: Component>(&mut self, r: Ref<C>, component: C) -> Ref<C> {
        self.root.components.insert(r, component)
    }

    pub(super) fn register_with_name<S: Symbol>(
        &mut self,
        name: QName,
        value: S,
    ) -> Result<(), XsdError> {
        self.root.names.register_with_name(name, value)
    }

    pub(super) fn resolve<S: Symbol>(&self, name: &QName) -> Result<S, XsdError> {
        self.root.resolve(name)
    }

    /// Like [`Self::resolve`], but outside strict mode an unresolved name is reported and
    /// yields `None`.
    pub(super) fn resolve_or_report<S: Symbol>(
        &mut self,
        name: &QName,
    ) -> Result<Option<S>, XsdError> {
        match self.root.resolve(name) {
            Ok(value) => Ok(Some(value)),
            Err(e) => self.root.report(e).map(|_| None),
        }
    }

    pub(super) fn report(&mut self, error: XsdError) -> Result<(), XsdError> {
        self.root.report(error)
    }

    /// Remembers the element a reserved top-level component is mapped from.
    pub(super) fn add_top_level<C: Component>(&mut self, r: Ref<C>, node: Node<'a, 'input>) {
        self.pending.insert(r.into(), node);
    }

    fn map_pending<C: TopLevelMappable>(&mut self, r: Ref<C>) -> Result<(), XsdError> {
        if self.root.components.is_built(r) {
            return Ok(());
        }
        let key = AnyRef::from(r);
        let Some(node) = self.pending.get(&key).copied() else {
            return Ok(());
        };
        if !self.mapping.insert(key) {
            return Err(XsdError::CircularDefinition(format!(
                "{} {}",
                C::KIND,
                node.attribute("name").unwrap_or_default()
            )));
        }
        let schema_node = node.document().root_element();
        let result = C::map_from_top_level_xml(self, r, node, schema_node);
        self.mapping.remove(&key);
        result
    }

    /// The component behind a top-level reference, mapped first if needed.
    pub(super) fn request<C: TopLevelMappable>(&mut self, r: Ref<C>) -> Result<&C, XsdError> {
        self.map_pending(r)?;
        if !self.root.components.is_built(r) {
            return Err(XsdError::CircularDefinition(C::KIND.into()));
        }
        Ok(self.root.components.get(r))
    }
}
