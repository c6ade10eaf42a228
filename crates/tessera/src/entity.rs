//! Entity identities, relationship pairs and allocation.
//!
//! Components, tags and relations are all entities. An [`Entity`] is a slot
//! number plus the number of times that slot has been reused; a handle from a
//! previous occupant of the slot therefore never compares equal to the
//! current one.
//!
//! Everything that can be attached to an entity is an [`Id`]: either a plain
//! entity (component or tag) or a [`Pair`] of `(relation, target)`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::component::TypedComponent;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

const SLOT_BITS: u32 = 32;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

/// Engine identity of an entity, component, tag or relation.
///
/// The slot sits in the low word and the reuse count in the high word.
/// Comparison and hashing use the packed value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity(u64);

impl Entity {
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self(u64::from(generation) << SLOT_BITS | u64::from(index))
    }

    /// Storage slot.
    #[inline]
    pub fn index(self) -> u32 {
        (self.0 & SLOT_MASK) as u32
    }

    /// How many earlier entities have occupied this slot.
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> SLOT_BITS) as u32
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

impl From<Entity> for u64 {
    fn from(e: Entity) -> u64 {
        e.0
    }
}

// ---------------------------------------------------------------------------
// Pair / Id
// ---------------------------------------------------------------------------

/// An ordered `(relation, target)` relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pair {
    pub relation: Entity,
    pub target: Entity,
}

impl Pair {
    pub fn new(relation: Entity, target: Entity) -> Self {
        Self { relation, target }
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.relation, self.target)
    }
}

/// Anything that can be attached to an entity: a component or tag entity, or
/// a relationship pair.
///
/// Ordering puts plain entities before pairs, which keeps archetype
/// signatures deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Id {
    Entity(Entity),
    Pair(Pair),
}

impl Id {
    /// Whether this id mentions `e` as the entity, relation or target.
    pub fn mentions(&self, e: Entity) -> bool {
        match *self {
            Id::Entity(x) => x == e,
            Id::Pair(p) => p.relation == e || p.target == e,
        }
    }

    pub fn as_pair(&self) -> Option<Pair> {
        match *self {
            Id::Pair(p) => Some(p),
            Id::Entity(_) => None,
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Entity(e) => write!(f, "{e}"),
            Id::Pair(p) => write!(f, "{p}"),
        }
    }
}

impl From<Entity> for Id {
    fn from(e: Entity) -> Self {
        Id::Entity(e)
    }
}

impl From<Pair> for Id {
    fn from(p: Pair) -> Self {
        Id::Pair(p)
    }
}

// ---------------------------------------------------------------------------
// AsEntity
// ---------------------------------------------------------------------------

/// Types that name an entity: plain handles and component descriptors.
pub trait AsEntity {
    fn entity(&self) -> Entity;
}

impl AsEntity for Entity {
    fn entity(&self) -> Entity {
        *self
    }
}

impl AsEntity for TypedComponent {
    fn entity(&self) -> Entity {
        self.id()
    }
}

impl<T: AsEntity + ?Sized> AsEntity for &T {
    fn entity(&self) -> Entity {
        (**self).entity()
    }
}

impl<T: AsEntity + ?Sized> AsEntity for Arc<T> {
    fn entity(&self) -> Entity {
        (**self).entity()
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u32,
    occupied: bool,
}

/// Hands out [`Entity`] ids and takes them back.
///
/// Released slots are reused oldest first. The generation is advanced on
/// release, so every handle to the released entity goes stale at once.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    slots: Vec<Slot>,
    released: VecDeque<u32>,
    live: usize,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Entity {
        self.live += 1;
        match self.released.pop_front() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.occupied = true;
                Entity::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    occupied: true,
                });
                Entity::new(index, 0)
            }
        }
    }

    /// `count` ids, handed out in allocation order.
    pub fn allocate_many(&mut self, count: usize) -> Vec<Entity> {
        let fresh = count.saturating_sub(self.released.len());
        self.slots.reserve(fresh);
        (0..count).map(|_| self.allocate()).collect()
    }

    /// Release `entity`'s slot. `false` when the handle is already stale.
    pub fn deallocate(&mut self, entity: Entity) -> bool {
        let Some(slot) = self.slot_mut(entity) else {
            return false;
        };
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        self.released.push_back(entity.index());
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.index() as usize)
            .is_some_and(|slot| slot.occupied && slot.generation == entity.generation())
    }

    pub fn alive_count(&self) -> usize {
        self.live
    }

    fn slot_mut(&mut self, entity: Entity) -> Option<&mut Slot> {
        self.slots
            .get_mut(entity.index() as usize)
            .filter(|slot| slot.occupied && slot.generation == entity.generation())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
