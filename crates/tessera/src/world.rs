//! The [`World`] is the top-level container. It owns the storage engine, the
//! component registry and the configuration, and hands out entity handles,
//! filter/query builders and bulk builders.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bulk::BulkEntityBuilder;
use crate::component::{ComponentRegistry, TypedComponent};
use crate::dtype::{DType, Element};
use crate::engine::memory::{MemoryEngine, DEFAULT_MAX_DEPTH};
use crate::engine::{ComponentLayout, EngineError, StorageEngine};
use crate::entity::{AsEntity, Entity, Id, Pair};
use crate::filter::{self, FilterBuilder, QueryBuilder};
use crate::handle::EntityMut;
use crate::view::ArrayView;
use crate::TesseraError;

// ---------------------------------------------------------------------------
// WorldConfig
// ---------------------------------------------------------------------------

/// Tunables for a [`World`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Largest term list a filter or query may compile to.
    pub max_terms: usize,
    /// Bound on `ChildOf` and `IsA` walks.
    pub max_traversal_depth: usize,
    /// Default for [`FilterBuilder::instanced`].
    pub default_instanced: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            max_terms: 32,
            max_traversal_depth: DEFAULT_MAX_DEPTH,
            default_instanced: false,
        }
    }
}

impl WorldConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

pub struct World<E: StorageEngine = MemoryEngine> {
    engine: E,
    registry: ComponentRegistry,
    config: WorldConfig,
}

impl World<MemoryEngine> {
    /// A world backed by a fresh [`MemoryEngine`].
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        let engine = MemoryEngine::with_max_depth(config.max_traversal_depth);
        Self::with_engine(engine, config)
    }
}

impl Default for World<MemoryEngine> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: StorageEngine> std::fmt::Debug for World<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.engine.alive_count())
            .field("component_count", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

impl<E: StorageEngine> World<E> {
    pub fn with_engine(engine: E, config: WorldConfig) -> Self {
        Self {
            engine,
            registry: ComponentRegistry::new(),
            config,
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Mutable engine access stays inside the crate: destruction has to go
    /// through [`World::destroy`] so the component registry is pruned too.
    pub(crate) fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    // -- entities -----------------------------------------------------------

    pub fn entity(&mut self) -> Result<Entity, TesseraError> {
        Ok(self.engine.new_entity(None)?)
    }

    /// Create a named root entity, or return the existing one.
    pub fn entity_named(&mut self, name: &str) -> Result<Entity, TesseraError> {
        Ok(self.engine.new_entity(Some(name))?)
    }

    /// Create an entity that starts out with `id`.
    pub fn entity_with(&mut self, id: impl Into<Id>) -> Result<Entity, TesseraError> {
        let e = self.engine.new_entity(None)?;
        self.engine.add(e, id.into())?;
        Ok(e)
    }

    /// Create an entity tagged `Prefab`. Prefabs are skipped by filters that
    /// do not name `Prefab` and are meant to be used as `IsA` bases.
    pub fn prefab(&mut self) -> Result<Entity, TesseraError> {
        let prefab = self.engine.prefab();
        self.entity_with(prefab)
    }

    pub fn prefab_named(&mut self, name: &str) -> Result<Entity, TesseraError> {
        let e = self.engine.new_entity(Some(name))?;
        let prefab = self.engine.prefab();
        self.engine.add(e, prefab.into())?;
        Ok(e)
    }

    /// Handle for structural and data operations on `entity`.
    pub fn entity_mut(&mut self, entity: Entity) -> Result<EntityMut<'_, E>, TesseraError> {
        if !self.engine.is_alive(entity) {
            return Err(EngineError::StaleEntity { entity }.into());
        }
        Ok(EntityMut::new(self, entity))
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.engine.is_alive(entity)
    }

    /// Destroy `entity` and its `ChildOf` descendants.
    pub fn destroy(&mut self, entity: Entity) -> Result<(), TesseraError> {
        self.engine.destroy(entity)?;
        let engine = &self.engine;
        self.registry.retain(|e| engine.is_alive(e));
        Ok(())
    }

    /// Live entities, including components, tags and built-ins.
    pub fn entity_count(&self) -> usize {
        self.engine.alive_count()
    }

    /// Resolve a dotted path from the root.
    pub fn lookup(&self, path: &str) -> Option<Entity> {
        self.engine.lookup(None, path)
    }

    // -- components ---------------------------------------------------------

    /// Create or fetch the component `name` storing `T` with `shape`.
    ///
    /// Repeated calls with the same name return the same `Arc`. A different
    /// element type or shape for an existing name is a
    /// [`TesseraError::ComponentConflict`].
    pub fn component<T: Element>(&mut self, name: &str, shape: &[usize]) -> Result<Arc<TypedComponent>, TesseraError> {
        self.component_dyn(name, T::DTYPE, shape)
    }

    pub fn component_dyn(
        &mut self,
        name: &str,
        dtype: DType,
        shape: &[usize],
    ) -> Result<Arc<TypedComponent>, TesseraError> {
        let engine = &mut self.engine;
        self.registry
            .get_or_try_insert_with(name, dtype, shape, |layout| engine.new_component(name, layout))
    }

    /// Component whose per-entity value has the shape of `example`.
    pub fn component_from_example<T: Element>(
        &mut self,
        name: &str,
        example: &[T],
    ) -> Result<Arc<TypedComponent>, TesseraError> {
        self.component::<T>(name, &[example.len()])
    }

    /// Create or fetch a data-less component.
    pub fn tag(&mut self, name: &str) -> Result<Entity, TesseraError> {
        Ok(self.engine.new_component(name, ComponentLayout::TAG)?)
    }

    pub fn lookup_component(&self, name: &str) -> Option<Arc<TypedComponent>> {
        self.registry.lookup_by_name(name)
    }

    /// The typed component carrying `id`'s data. For pairs: the relation if it
    /// is a typed component, else the target.
    pub fn component_for(&self, id: impl Into<Id>) -> Option<Arc<TypedComponent>> {
        filter::component_for(&self.registry, id.into())
    }

    // -- relationships ------------------------------------------------------

    pub fn pair(&self, relation: impl AsEntity, target: impl AsEntity) -> Id {
        Id::Pair(Pair::new(relation.entity(), target.entity()))
    }

    pub fn child_of_entity(&self) -> Entity {
        self.engine.child_of()
    }

    pub fn isa_entity(&self) -> Entity {
        self.engine.is_a()
    }

    pub fn prefab_tag(&self) -> Entity {
        self.engine.prefab()
    }

    // -- singletons ---------------------------------------------------------

    /// Store a world-wide value on the component's own entity.
    pub fn set_singleton<T: Element>(&mut self, component: &TypedComponent, values: &[T]) -> Result<(), TesseraError> {
        self.entity_mut(component.id())?.set(component, values)?;
        Ok(())
    }

    pub fn get_singleton<T: Element>(&self, component: &TypedComponent) -> Result<ArrayView<'_, T>, TesseraError> {
        let id = Id::Entity(component.id());
        let raw = self
            .engine
            .get(component.id(), id)?
            .ok_or(TesseraError::NotPresent {
                entity: component.id(),
                id,
            })?;
        component
            .create_view(raw)?
            .into_row(0)
            .ok_or(TesseraError::NotPresent {
                entity: component.id(),
                id,
            })
    }

    // -- builders -----------------------------------------------------------

    pub fn filter_builder(&mut self) -> FilterBuilder<'_, E> {
        FilterBuilder::new(self)
    }

    pub fn query_builder(&mut self) -> QueryBuilder<'_, E> {
        QueryBuilder::new(self)
    }

    pub fn bulk_entity_builder(&mut self) -> BulkEntityBuilder<'_, E> {
        BulkEntityBuilder::new(self)
    }

    /// Create `count` entities that all own `id`, typically a tag or an
    /// `(IsA, prefab)` pair.
    pub fn bulk_entity_w_id(&mut self, id: impl Into<Id>, count: usize) -> Result<Vec<Entity>, TesseraError> {
        Ok(self.engine.bulk_new(count, &[id.into()], &[])?)
    }
}
