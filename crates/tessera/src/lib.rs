//! Tessera -- typed, zero-copy array views over an archetype ECS.
//!
//! Components are declared with an element type and a per-entity shape. The
//! storage engine keeps each component in a contiguous column per archetype;
//! this crate turns those columns into [`ArrayView`]s of shape
//! `(rows, *shape)` without copying. Relationships (`ChildOf`, `IsA`, user
//! pairs), prefabs, textual term expressions and cached queries are supported.
//!
//! # Quick Start
//!
//! ```
//! use tessera::prelude::*;
//!
//! let mut world = World::new();
//! let pos = world.component::<f32>("Position", &[2]).unwrap();
//! let vel = world.component::<f32>("Velocity", &[2]).unwrap();
//!
//! let mut bulk = world.bulk_entity_builder();
//! bulk.add(&pos, &[0.0f32, 0.0, 10.0, 10.0]).unwrap();
//! bulk.add(&vel, &[1.0f32, 0.0, 0.0, 1.0]).unwrap();
//! let entities = bulk.build().unwrap();
//!
//! let mut query = world.query_builder().expr("Position, [in] Velocity").build().unwrap();
//! let mut it = query.iter(&mut world);
//! while it.advance() {
//!     let mut p = it.column_mut::<f32>("Position").unwrap();
//!     let v = it.column::<f32>("Velocity").unwrap();
//!     for (p, v) in p.iter_mut().zip(v.iter()) {
//!         *p += v;
//!     }
//! }
//! drop(it);
//!
//! let e = world.entity_mut(entities[1]).unwrap();
//! assert_eq!(&*e.get::<f32>(&pos).unwrap(), &[10.0, 11.0]);
//! ```

#![deny(unsafe_code)]

pub mod bulk;
pub mod component;
#[allow(unsafe_code)]
pub mod cursor;
pub mod dtype;
pub mod engine;
pub mod entity;
pub mod filter;
pub mod handle;
pub mod term;
pub mod view;
pub mod world;

use crate::dtype::DType;
use crate::engine::EngineError;
use crate::entity::{Entity, Id};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the typed layer.
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    /// The requested element type differs from the component's.
    #[error("component '{component}' stores {expected}, not {found}")]
    TypeMismatch {
        component: String,
        expected: DType,
        found: DType,
    },

    /// A buffer is not a whole number of component values.
    #[error("{len} bytes is not a whole number of '{component}' values ({total_bytes} bytes each)")]
    ShapeMismatch {
        component: String,
        len: usize,
        total_bytes: usize,
    },

    /// Column memory is not aligned for the element type.
    #[error("column for '{component}' is not aligned for its element type")]
    Misaligned { component: String },

    /// Shapes must have no zero dimension.
    #[error("invalid component shape {shape:?}")]
    InvalidShape { shape: Vec<usize> },

    /// The entity neither owns nor inherits the id.
    #[error("{entity:?} has no value for {id}")]
    NotPresent { entity: Entity, id: Id },

    /// Bulk columns disagree on the number of entities.
    #[error("'{component}' supplies {found} rows, expected {expected}")]
    CountMismatch {
        component: String,
        expected: usize,
        found: usize,
    },

    /// A component name was reused with a different type or shape.
    #[error("component '{name}' already exists with a different type or shape")]
    ComponentConflict { name: String },

    /// Data was requested for an id with no typed component behind it.
    #[error("{id} has no typed component")]
    Untyped { id: Id },

    /// A cursor key matched no typed term.
    #[error("no typed term for key '{key}'")]
    UnknownTerm { key: String },

    /// Mutable access to a term compiled as read-only.
    #[error("term {index} is read-only")]
    ReadOnlyTerm { index: usize },

    /// The column is already borrowed in a conflicting way.
    #[error("column '{key}' is already borrowed")]
    BorrowConflict { key: String },

    #[error("{count} terms exceeds the limit of {max}")]
    TooManyTerms { count: usize, max: usize },

    /// Column access before `advance` or after the cursor finished.
    #[error("cursor is not positioned on a group")]
    NotPositioned,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::bulk::BulkEntityBuilder;
    pub use crate::component::TypedComponent;
    pub use crate::cursor::{CursorState, Entities, IterationCursor, TermKey};
    pub use crate::dtype::{DType, Element};
    pub use crate::engine::memory::MemoryEngine;
    pub use crate::engine::{EngineError, StorageEngine};
    pub use crate::entity::{AsEntity, Entity, Id, Pair};
    pub use crate::filter::{Filter, FilterBuilder, Query, QueryBuilder};
    pub use crate::handle::EntityMut;
    pub use crate::term::{Access, Term, TermOper, TermSource};
    pub use crate::view::{ArrayView, ArrayViewMut};
    pub use crate::world::{World, WorldConfig};
    pub use crate::TesseraError;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn engine_errors_convert() {
        let err: TesseraError = EngineError::InvalidName { name: "a.b".into() }.into();
        assert!(matches!(err, TesseraError::Engine(EngineError::InvalidName { .. })));
        assert_eq!(err.to_string(), "invalid entity name 'a.b'");
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut world = World::new();
        assert!(matches!(
            world.entity_named("Sun.Earth"),
            Err(TesseraError::Engine(EngineError::InvalidName { .. }))
        ));
        assert!(world.component::<f32>("", &[1]).is_err());
    }

    #[test]
    fn filter_sees_every_entity_with_the_components() {
        let mut world = World::new();
        let a = world.component::<i32>("A", &[1]).unwrap();
        let b = world.component::<i32>("B", &[1]).unwrap();
        for i in 0..5 {
            let e = world.entity().unwrap();
            let mut h = world.entity_mut(e).unwrap();
            h.set(&a, &[i]).unwrap();
            if i % 2 == 0 {
                h.set(&b, &[i * 10]).unwrap();
            }
        }
        let mut both = world.filter_builder().term(&a).term(&b).build().unwrap();
        let mut only_a = world.filter_builder().term(&a).build().unwrap();
        assert_eq!(both.count(&mut world), 3);
        assert_eq!(only_a.count(&mut world), 5);

        let mut seen = Vec::new();
        let mut it = both.iter(&mut world);
        while it.advance() {
            let av = it.column::<i32>(a.name()).unwrap();
            let bv = it.column::<i32>(1usize).unwrap();
            for (x, y) in av.iter().zip(bv.iter()) {
                seen.push((*x, *y));
            }
        }
        seen.sort();
        assert_eq!(seen, vec![(0, 0), (2, 20), (4, 40)]);
    }
}
