//! The storage engine boundary.
//!
//! Everything that owns memory lives behind [`StorageEngine`]: entity
//! allocation, archetype tables, names, relationship bookkeeping and archetype
//! matching. The rest of the crate only sees opaque [`Entity`]/[`Id`] handles,
//! raw byte slices and [`RawColumn`] regions, and turns those into typed
//! views.
//!
//! [`memory::MemoryEngine`] is the in-process implementation.

pub mod archetype;
pub mod expr;
pub mod memory;

use std::ptr::NonNull;

use crate::entity::{Entity, Id};
use crate::term::{FilterDesc, Term};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by a storage engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: Entity },

    /// An expression referenced a name that resolves to nothing.
    #[error("unknown name '{name}' at column {column}")]
    UnknownName { name: String, column: usize },

    /// A value's byte length differs from the id's storage size.
    #[error("value for {id} is {found} bytes, storage expects {expected}")]
    SizeMismatch { id: Id, expected: usize, found: usize },

    /// The textual term list could not be parsed.
    #[error("cannot parse '{expr}' at column {column}: {message}")]
    Parse {
        expr: String,
        column: usize,
        message: String,
    },

    /// The relationship would make an entity its own ancestor or base.
    #[error("{entity:?} cannot be related to itself through {relation:?}")]
    Cycle { entity: Entity, relation: Entity },

    /// Names must be non-empty and must not contain the path separator.
    #[error("invalid entity name '{name}'")]
    InvalidName { name: String },

    /// Data was written to an id that has no storage.
    #[error("{id} has no data storage")]
    NotAComponent { id: Id },

    #[error("alignment {align} exceeds the supported maximum of {max}")]
    UnsupportedAlignment { align: usize, max: usize },

    /// More than one target was given for a relation that allows one.
    #[error("{count} targets given for exclusive relation {relation:?}")]
    ExclusiveRelation { relation: Entity, count: usize },

    /// A name was re-declared with a different storage layout.
    #[error("'{name}' is already declared with a different layout")]
    LayoutConflict { name: String },

    /// Relationship traversal exceeded the configured depth.
    #[error("traversal from {entity:?} exceeded depth {limit}")]
    DepthExceeded { entity: Entity, limit: usize },
}

// ---------------------------------------------------------------------------
// Boundary types
// ---------------------------------------------------------------------------

/// Storage layout of a component. A size of zero declares a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentLayout {
    pub size: usize,
    pub align: usize,
}

impl ComponentLayout {
    pub const TAG: ComponentLayout = ComponentLayout { size: 0, align: 1 };

    pub fn is_tag(&self) -> bool {
        self.size == 0
    }
}

/// A term's column region for the current iteration step.
///
/// `ptr` addresses `len` bytes inside engine storage. The region stays valid
/// until the iterator advances or is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawColumn {
    pub ptr: NonNull<u8>,
    pub len: usize,
    /// `false` when the data belongs to another entity (a base, an ancestor,
    /// or a fixed source) and is shared by every row of the step.
    pub owned: bool,
}

/// Group-at-a-time iteration over a compiled matcher.
pub trait EngineIter {
    /// Move to the next non-empty step. Returns `false` once exhausted.
    fn next(&mut self) -> bool;

    /// Rows in the current step.
    fn count(&self) -> usize;

    /// Entities of the current step, in row order.
    fn entities(&self) -> &[Entity];

    fn term_count(&self) -> usize;

    /// Column of term `index` (1-based) for the current step. `None` for tags,
    /// `Not` terms and optional terms that did not match.
    fn column(&self, index: usize) -> Option<RawColumn>;

    /// Whether term `index` (1-based) matched in the current step.
    fn is_set(&self, index: usize) -> bool;
}

/// The capability set required from a backing store.
pub trait StorageEngine {
    /// Compiled form of a [`FilterDesc`].
    type Matcher;

    type Iter<'e>: EngineIter
    where
        Self: 'e;

    // -- entities -----------------------------------------------------------

    /// Create an entity. A named request returns the existing root entity of
    /// that name if there is one.
    fn new_entity(&mut self, name: Option<&str>) -> Result<Entity, EngineError>;

    /// Create (or re-declare) a named component with the given layout.
    fn new_component(&mut self, name: &str, layout: ComponentLayout) -> Result<Entity, EngineError>;

    /// Destroy `entity` and every `ChildOf` descendant.
    fn destroy(&mut self, entity: Entity) -> Result<(), EngineError>;

    fn is_alive(&self, entity: Entity) -> bool;

    fn alive_count(&self) -> usize;

    fn name(&self, entity: Entity) -> Option<&str>;

    /// Dot-joined names from the root to `entity`.
    fn path(&self, entity: Entity) -> Result<String, EngineError>;

    /// Resolve a dotted path relative to `scope` (or from the roots).
    fn lookup(&self, scope: Option<Entity>, path: &str) -> Option<Entity>;

    /// Storage layout of `id`. Pairs take the relation's layout if it has
    /// data, else the target's; `None` for tags and plain entities.
    fn data_layout(&self, id: Id) -> Option<ComponentLayout>;

    // -- structure ----------------------------------------------------------

    /// Attach `id`. Idempotent. Adding a `ChildOf` pair replaces the current
    /// parent.
    fn add(&mut self, entity: Entity, id: Id) -> Result<(), EngineError>;

    /// Detach `id`. Absent ids are a no-op.
    fn remove(&mut self, entity: Entity, id: Id) -> Result<(), EngineError>;

    /// Owned or inherited through `IsA`.
    fn has(&self, entity: Entity, id: Id) -> bool;

    /// Owned directly.
    fn owns(&self, entity: Entity, id: Id) -> bool;

    /// The entity's owned ids, sorted.
    fn ids(&self, entity: Entity) -> Result<Vec<Id>, EngineError>;

    // -- data ---------------------------------------------------------------

    /// Bytes of `id` on `entity`, falling through `IsA` bases.
    fn get(&self, entity: Entity, id: Id) -> Result<Option<&[u8]>, EngineError>;

    /// Writable bytes of `id` owned by `entity`. An inherited value is copied
    /// into the entity first.
    fn get_mut(&mut self, entity: Entity, id: Id) -> Result<Option<&mut [u8]>, EngineError>;

    /// Write `bytes`, adding `id` if needed.
    fn set(&mut self, entity: Entity, id: Id, bytes: &[u8]) -> Result<(), EngineError>;

    /// Allocate `count` entities that all own `ids`, initialising each
    /// `(id, bytes)` column with `count` rows. Validates everything before
    /// allocating.
    fn bulk_new(
        &mut self,
        count: usize,
        ids: &[Id],
        columns: &[(Id, &[u8])],
    ) -> Result<Vec<Entity>, EngineError>;

    // -- built-ins ----------------------------------------------------------

    fn child_of(&self) -> Entity;

    fn is_a(&self) -> Entity;

    fn prefab(&self) -> Entity;

    // -- matching -----------------------------------------------------------

    fn compile(&mut self, desc: &FilterDesc) -> Result<Self::Matcher, EngineError>;

    /// The compiled term list: structured terms followed by expression terms,
    /// with access resolved.
    fn terms<'m>(&self, matcher: &'m Self::Matcher) -> &'m [Term];

    fn iter<'e>(&'e mut self, matcher: &'e mut Self::Matcher) -> Self::Iter<'e>;
}
