//! Storage of schema components in typed arenas, addressed by [`Ref`]s.
//!
//! Components are created in a [`ComponentArena`] while documents are mapped. A slot can be
//! reserved before its component exists, so that components can refer to themselves or to
//! top-level components mapped later. Once every slot is filled, the arena is frozen into a
//! [`SchemaComponentTable`].

use std::{
    any::TypeId,
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    num::NonZeroU32,
};

use roxmltree::Node;
use tracing::warn;

use super::{
    builtins, error::XsdError, xstypes::QName, AttributeDeclaration, AttributeGroupDefinition,
    AttributeUse, ComplexTypeDefinition, ElementDeclaration, ModelGroup, ModelGroupDefinition,
    Particle, SimpleTypeDefinition, TypeDefinition, Wildcard,
};
use crate::BuiltinOverwriteAction;

mod sealed {
    use super::{ComponentArena, SchemaComponentTable};

    /// Access to the arena of one component type.
    pub trait Stored: Sized + 'static {
        fn slots(arena: &ComponentArena) -> &[Option<Self>];
        fn slots_mut(arena: &mut ComponentArena) -> &mut Vec<Option<Self>>;
        fn frozen(table: &SchemaComponentTable) -> &[Self];
    }
}

/// A schema component kept in an arena.
pub trait Component: sealed::Stored {
    /// What the component is called in messages
    const KIND: &'static str;
}

/// Index of a component of type `C` in its arena. Only meaningful for the arena or table it
/// was created with.
pub struct Ref<C: Component>(NonZeroU32, PhantomData<fn() -> C>);

impl<C: Component> Ref<C> {
    fn slot(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn get(self, table: &impl ComponentTable) -> &C {
        table.get(self)
    }
}

impl<C: Component> Clone for Ref<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Component> Copy for Ref<C> {}

impl<C: Component> PartialEq for Ref<C> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<C: Component> Eq for Ref<C> {}

impl<C: Component> Hash for Ref<C> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<C: Component> fmt::Debug for Ref<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} #{}", C::KIND, self.0)
    }
}

/// A [`Ref`] of any component type, usable as a map key across types.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(super) struct AnyRef(TypeId, NonZeroU32);

impl<C: Component> From<Ref<C>> for AnyRef {
    fn from(r: Ref<C>) -> Self {
        Self(TypeId::of::<C>(), r.0)
    }
}

/// Resolves [`Ref`]s to components.
pub trait ComponentTable {
    /// Panics if `r` was not created with this table or its slot is still empty.
    fn get<C: Component>(&self, r: Ref<C>) -> &C;
}

macro_rules! arena {
    ($($field:ident: $type:ty => $kind:literal,)*) => {
        /// Components under construction. Slots may be reserved and filled later.
        #[derive(Default)]
        pub struct ComponentArena {
            $($field: Vec<Option<$type>>,)*
        }

        /// The components of a loaded schema set. Every [`Ref`] handed out resolves.
        pub struct SchemaComponentTable {
            $($field: Box<[$type]>,)*
        }

        impl ComponentArena {
            /// Freezes the arena, or returns `None` if a reserved slot was never filled.
            pub(super) fn freeze(self) -> Option<SchemaComponentTable> {
                Some(SchemaComponentTable {
                    $($field: self.$field.into_iter().collect::<Option<Vec<_>>>()?.into(),)*
                })
            }
        }

        $(
            impl sealed::Stored for $type {
                fn slots(arena: &ComponentArena) -> &[Option<Self>] {
                    &arena.$field
                }

                fn slots_mut(arena: &mut ComponentArena) -> &mut Vec<Option<Self>> {
                    &mut arena.$field
                }

                fn frozen(table: &SchemaComponentTable) -> &[Self] {
                    &table.$field
                }
            }

            impl Component for $type {
                const KIND: &'static str = $kind;
            }
        )*
    };
}

arena! {
    attribute_declarations: AttributeDeclaration => "attribute declaration",
    attribute_group_definitions: AttributeGroupDefinition => "attribute group definition",
    attribute_uses: AttributeUse => "attribute use",
    complex_type_definitions: ComplexTypeDefinition => "complex type definition",
    element_declarations: ElementDeclaration => "element declaration",
    model_group_definitions: ModelGroupDefinition => "model group definition",
    model_groups: ModelGroup => "model group",
    particles: Particle => "particle",
    simple_type_definitions: SimpleTypeDefinition => "simple type definition",
    wildcards: Wildcard => "wildcard",
}

impl ComponentTable for ComponentArena {
    fn get<C: Component>(&self, r: Ref<C>) -> &C {
        match C::slots(self).get(r.slot()) {
            Some(Some(component)) => component,
            Some(None) => panic!("{r:?} is reserved but not built yet"),
            None => panic!("{r:?} does not belong to this arena"),
        }
    }
}

impl ComponentTable for SchemaComponentTable {
    fn get<C: Component>(&self, r: Ref<C>) -> &C {
        match C::frozen(self).get(r.slot()) {
            Some(component) => component,
            None => panic!("{r:?} does not belong to this schema"),
        }
    }
}

impl ComponentArena {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Reserves an empty slot, to be filled with [`Self::insert`].
    pub(super) fn reserve<C: Component>(&mut self) -> Ref<C> {
        let slots = C::slots_mut(self);
        slots.push(None);
        let id = u32::try_from(slots.len())
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or(NonZeroU32::MAX);
        Ref(id, PhantomData)
    }

    pub(super) fn insert<C: Component>(&mut self, r: Ref<C>, component: C) -> Ref<C> {
        if let Some(slot) = C::slots_mut(self).get_mut(r.slot()) {
            *slot = Some(component);
        }
        r
    }

    pub(super) fn create<C: Component>(&mut self, component: C) -> Ref<C> {
        let r = self.reserve();
        self.insert(r, component)
    }

    pub(super) fn is_built<C: Component>(&self, r: Ref<C>) -> bool {
        matches!(C::slots(self).get(r.slot()), Some(Some(_)))
    }
}

/// A component that may carry a [qualified name](QName).
pub trait Named: Component {
    fn name(&self) -> Option<QName>;
}

/// A handle whose name is found through a [`ComponentTable`]: a [`Ref`] to a [`Named`]
/// component, or a [`TypeDefinition`].
pub trait RefNamed {
    fn name(&self, table: &impl ComponentTable) -> Option<QName>;
}

impl<C: Named> RefNamed for Ref<C> {
    fn name(&self, table: &impl ComponentTable) -> Option<QName> {
        self.get(table).name()
    }
}

/// Top-level components, whose name is known from their element before they are mapped.
pub(super) trait NamedXml: Component {
    fn get_name_from_xml(this_node: Node, schema_node: Node) -> Result<QName, XsdError>;
}

/// The symbol spaces of a schema set (§3.17.6.2). Simple and complex types share one.
#[derive(Default)]
pub(super) struct SymbolSpaces {
    types: HashMap<QName, TypeDefinition>,
    attributes: HashMap<QName, Ref<AttributeDeclaration>>,
    elements: HashMap<QName, Ref<ElementDeclaration>>,
    attribute_groups: HashMap<QName, Ref<AttributeGroupDefinition>>,
    model_groups: HashMap<QName, Ref<ModelGroupDefinition>>,
}

/// A value that can be bound to a qualified name in one of the [`SymbolSpaces`].
pub(super) trait Symbol: Copy {
    const KIND: &'static str;

    /// Binds `name` to `self`, returning whether the name was already bound.
    fn bind(self, spaces: &mut SymbolSpaces, name: QName) -> bool;

    fn find(spaces: &SymbolSpaces, name: &QName) -> Option<Self>;
}

macro_rules! symbol {
    ($type:ty, $space:ident, $kind:literal) => {
        impl Symbol for $type {
            const KIND: &'static str = $kind;

            fn bind(self, spaces: &mut SymbolSpaces, name: QName) -> bool {
                spaces.$space.insert(name, self).is_some()
            }

            fn find(spaces: &SymbolSpaces, name: &QName) -> Option<Self> {
                spaces.$space.get(name).copied()
            }
        }
    };
}

symbol!(TypeDefinition, types, "type definition");
symbol!(Ref<AttributeDeclaration>, attributes, "attribute");
symbol!(Ref<ElementDeclaration>, elements, "element");
symbol!(Ref<AttributeGroupDefinition>, attribute_groups, "attribute group");
symbol!(Ref<ModelGroupDefinition>, model_groups, "model group");

impl Symbol for Ref<SimpleTypeDefinition> {
    const KIND: &'static str = "simple type definition";

    fn bind(self, spaces: &mut SymbolSpaces, name: QName) -> bool {
        TypeDefinition::Simple(self).bind(spaces, name)
    }

    fn find(spaces: &SymbolSpaces, name: &QName) -> Option<Self> {
        TypeDefinition::find(spaces, name).and_then(|t| t.simple())
    }
}

/// Binds the names of top-level components and resolves references to them.
pub(super) struct NameResolver {
    spaces: SymbolSpaces,
    builtin_overwrite: BuiltinOverwriteAction,
}

impl NameResolver {
    pub(super) fn new(builtin_overwrite: BuiltinOverwriteAction) -> Self {
        Self {
            spaces: SymbolSpaces::default(),
            builtin_overwrite,
        }
    }

    pub(super) fn resolve<S: Symbol>(&self, name: &QName) -> Result<S, XsdError> {
        S::find(&self.spaces, name).ok_or_else(|| XsdError::UnresolvedReference {
            kind: S::KIND,
            name: name.clone(),
        })
    }

    /// Binds `name`. Rebinding a built-in name follows the configured
    /// [`BuiltinOverwriteAction`]; rebinding any other name is an error.
    pub(super) fn register_with_name<S: Symbol>(
        &mut self,
        name: QName,
        value: S,
    ) -> Result<(), XsdError> {
        if !value.bind(&mut self.spaces, name.clone()) {
            return Ok(());
        }
        if !builtins::is_builtin_name(&name) {
            return Err(XsdError::DuplicateComponent {
                kind: S::KIND,
                name,
            });
        }
        match self.builtin_overwrite {
            BuiltinOverwriteAction::Deny => Err(XsdError::BuiltinOverwrite(name)),
            BuiltinOverwriteAction::Warn => {
                warn!("Built-in {} {name} redefined", S::KIND);
                Ok(())
            }
            BuiltinOverwriteAction::Allow => Ok(()),
        }
    }

    pub(super) fn register<S: Symbol + RefNamed>(
        &mut self,
        value: S,
        table: &impl ComponentTable,
    ) -> Result<(), XsdError> {
        match value.name(table) {
            Some(name) => self.register_with_name(name, value),
            None => Err(XsdError::UnnamedComponent(S::KIND)),
        }
    }
}
