//! [`EntityMut`]: a borrowed handle for one live entity.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::component::TypedComponent;
use crate::dtype::Element;
use crate::engine::memory::MemoryEngine;
use crate::engine::StorageEngine;
use crate::entity::{AsEntity, Entity, Id, Pair};
use crate::view::{ArrayView, ArrayViewMut};
use crate::world::World;
use crate::TesseraError;

/// Structural and data access for a single entity.
///
/// Obtained from [`World::entity_mut`], which checks liveness. Every data
/// accessor goes through the entity's [`TypedComponent`], so views always
/// carry the component's element type and shape.
pub struct EntityMut<'w, E: StorageEngine = MemoryEngine> {
    world: &'w mut World<E>,
    entity: Entity,
}

impl<'w, E: StorageEngine> EntityMut<'w, E> {
    pub(crate) fn new(world: &'w mut World<E>, entity: Entity) -> Self {
        Self { world, entity }
    }

    #[inline]
    pub fn id(&self) -> Entity {
        self.entity
    }

    pub fn is_alive(&self) -> bool {
        self.world.is_alive(self.entity)
    }

    // -- structure ----------------------------------------------------------

    /// Add a component, tag or pair with no data. Idempotent.
    pub fn add(&mut self, id: impl Into<Id>) -> Result<&mut Self, TesseraError> {
        self.world.engine_mut().add(self.entity, id.into())?;
        Ok(self)
    }

    /// Remove an owned id. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: impl Into<Id>) -> Result<&mut Self, TesseraError> {
        self.world.engine_mut().remove(self.entity, id.into())?;
        Ok(self)
    }

    /// Owned or inherited through `IsA`.
    pub fn has(&self, id: impl Into<Id>) -> bool {
        self.world.engine().has(self.entity, id.into())
    }

    /// Owned directly.
    pub fn owns(&self, id: impl Into<Id>) -> bool {
        self.world.engine().owns(self.entity, id.into())
    }

    // -- data ---------------------------------------------------------------

    /// Write one value of `component`. `values` must hold exactly
    /// `component.element_count()` elements of the component's type.
    pub fn set<T: Element>(&mut self, component: &TypedComponent, values: &[T]) -> Result<&mut Self, TesseraError> {
        self.write(component, Id::Entity(component.id()), values)?;
        Ok(self)
    }

    /// Read this entity's value, owned or inherited.
    pub fn get<T: Element>(&self, component: &TypedComponent) -> Result<ArrayView<'_, T>, TesseraError> {
        self.read(component, Id::Entity(component.id()))
    }

    /// Mutable access. An inherited value is first copied into the entity.
    pub fn get_mut<T: Element>(&mut self, component: &TypedComponent) -> Result<ArrayViewMut<'_, T>, TesseraError> {
        self.read_mut(component, Id::Entity(component.id()))
    }

    fn write<T: Element>(&mut self, component: &TypedComponent, id: Id, values: &[T]) -> Result<(), TesseraError> {
        let (bytes, rows) = component.encode(values)?;
        if rows != 1 {
            return Err(TesseraError::ShapeMismatch {
                component: component.name().to_owned(),
                len: bytes.len(),
                total_bytes: component.total_bytes(),
            });
        }
        self.world.engine_mut().set(self.entity, id, bytes)?;
        Ok(())
    }

    fn read<T: Element>(&self, component: &TypedComponent, id: Id) -> Result<ArrayView<'_, T>, TesseraError> {
        let not_present = || TesseraError::NotPresent {
            entity: self.entity,
            id,
        };
        let raw = self.world.engine().get(self.entity, id)?.ok_or_else(not_present)?;
        component.create_view(raw)?.into_row(0).ok_or_else(not_present)
    }

    fn read_mut<T: Element>(&mut self, component: &TypedComponent, id: Id) -> Result<ArrayViewMut<'_, T>, TesseraError> {
        let entity = self.entity;
        let not_present = || TesseraError::NotPresent { entity, id };
        let raw = self.world.engine_mut().get_mut(entity, id)?.ok_or_else(not_present)?;
        component.create_view_mut(raw)?.into_row(0).ok_or_else(not_present)
    }

    // -- pairs --------------------------------------------------------------

    fn pair_id(relation: impl AsEntity, target: impl AsEntity) -> Id {
        Id::Pair(Pair::new(relation.entity(), target.entity()))
    }

    fn pair_component(&self, id: Id) -> Result<Arc<TypedComponent>, TesseraError> {
        self.world.component_for(id).ok_or(TesseraError::Untyped { id })
    }

    pub fn add_pair(&mut self, relation: impl AsEntity, target: impl AsEntity) -> Result<&mut Self, TesseraError> {
        self.add(Self::pair_id(relation, target))
    }

    pub fn remove_pair(&mut self, relation: impl AsEntity, target: impl AsEntity) -> Result<&mut Self, TesseraError> {
        self.remove(Self::pair_id(relation, target))
    }

    pub fn has_pair(&self, relation: impl AsEntity, target: impl AsEntity) -> bool {
        self.has(Self::pair_id(relation, target))
    }

    /// Write the value stored on `(relation, target)`. The pair's data type is
    /// the relation's when it is a typed component, otherwise the target's.
    pub fn set_pair<T: Element>(
        &mut self,
        relation: impl AsEntity,
        target: impl AsEntity,
        values: &[T],
    ) -> Result<&mut Self, TesseraError> {
        let id = Self::pair_id(relation, target);
        let component = self.pair_component(id)?;
        self.write(&component, id, values)?;
        Ok(self)
    }

    pub fn get_pair<T: Element>(
        &self,
        relation: impl AsEntity,
        target: impl AsEntity,
    ) -> Result<ArrayView<'_, T>, TesseraError> {
        let id = Self::pair_id(relation, target);
        let component = self.pair_component(id)?;
        self.read(&component, id)
    }

    pub fn get_pair_mut<T: Element>(
        &mut self,
        relation: impl AsEntity,
        target: impl AsEntity,
    ) -> Result<ArrayViewMut<'_, T>, TesseraError> {
        let id = Self::pair_id(relation, target);
        let component = self.pair_component(id)?;
        self.read_mut(&component, id)
    }

    // -- hierarchy ----------------------------------------------------------

    /// Make `child` a `ChildOf` child of this entity, replacing its previous
    /// parent.
    pub fn add_child(&mut self, child: Entity) -> Result<&mut Self, TesseraError> {
        let child_of = self.world.child_of_entity();
        self.world
            .engine_mut()
            .add(child, Id::Pair(Pair::new(child_of, self.entity)))?;
        Ok(self)
    }

    /// Make this entity an instance of `base`.
    pub fn is_a(&mut self, base: impl AsEntity) -> Result<&mut Self, TesseraError> {
        let is_a = self.world.isa_entity();
        self.add(Pair::new(is_a, base.entity()))
    }

    pub fn parent(&self) -> Option<Entity> {
        let child_of = self.world.child_of_entity();
        self.ids()
            .ok()?
            .into_iter()
            .filter_map(|id| id.as_pair())
            .find(|p| p.relation == child_of)
            .map(|p| p.target)
    }

    /// Resolve a dotted path relative to this entity.
    pub fn lookup(&self, path: &str) -> Option<Entity> {
        self.world.engine().lookup(Some(self.entity), path)
    }

    /// Destroy the entity and its `ChildOf` descendants.
    pub fn destruct(self) -> Result<(), TesseraError> {
        self.world.destroy(self.entity)
    }

    // -- introspection ------------------------------------------------------

    pub fn name(&self) -> Option<&str> {
        self.world.engine().name(self.entity)
    }

    /// Dotted path from the root. Unnamed segments print as `#index`.
    pub fn path(&self) -> Result<String, TesseraError> {
        Ok(self.world.engine().path(self.entity)?)
    }

    /// Directly owned ids in storage order.
    pub fn ids(&self) -> Result<Vec<Id>, TesseraError> {
        Ok(self.world.engine().ids(self.entity)?)
    }
}

impl<E: StorageEngine> AsEntity for EntityMut<'_, E> {
    fn entity(&self) -> Entity {
        self.entity
    }
}

impl<E: StorageEngine> PartialEq for EntityMut<'_, E> {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
    }
}

impl<E: StorageEngine> Eq for EntityMut<'_, E> {}

impl<E: StorageEngine> Hash for EntityMut<'_, E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
    }
}

impl<E: StorageEngine> std::fmt::Debug for EntityMut<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMut").field("entity", &self.entity).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::EngineError;
    use crate::prelude::*;

    #[test]
    fn set_then_get_round_trips() {
        let mut world = World::new();
        let pos = world.component::<f32>("Position", &[3]).unwrap();
        let e = world.entity().unwrap();
        let mut handle = world.entity_mut(e).unwrap();
        handle.set(&pos, &[1.0f32, 2.0, 3.0]).unwrap();
        let view = handle.get::<f32>(&pos).unwrap();
        assert_eq!(view.shape(), &[3]);
        assert_eq!(&*view, &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn set_rejects_wrong_length_and_type() {
        let mut world = World::new();
        let pos = world.component::<f32>("Position", &[3]).unwrap();
        let e = world.entity().unwrap();
        let mut handle = world.entity_mut(e).unwrap();
        assert!(matches!(
            handle.set(&pos, &[1.0f32, 2.0]),
            Err(TesseraError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            handle.set(&pos, &[1.0f32; 6]),
            Err(TesseraError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            handle.set(&pos, &[1.0f64, 2.0, 3.0]),
            Err(TesseraError::TypeMismatch { .. })
        ));
        assert!(!handle.owns(&pos));
    }

    #[test]
    fn get_of_absent_component_is_not_present() {
        let mut world = World::new();
        let pos = world.component::<f32>("Position", &[2]).unwrap();
        let e = world.entity().unwrap();
        let handle = world.entity_mut(e).unwrap();
        assert!(matches!(handle.get::<f32>(&pos), Err(TesseraError::NotPresent { .. })));
    }

    #[test]
    fn mutable_view_writes_through() {
        let mut world = World::new();
        let vel = world.component::<f64>("Velocity", &[2]).unwrap();
        let e = world.entity().unwrap();
        let mut handle = world.entity_mut(e).unwrap();
        handle.set(&vel, &[0.0f64, 0.0]).unwrap();
        handle.get_mut::<f64>(&vel).unwrap().assign(&[4.0, 5.0]);
        assert_eq!(&*handle.get::<f64>(&vel).unwrap(), &[4.0, 5.0]);
    }

    #[test]
    fn pair_data_is_separate_from_component_data() {
        let mut world = World::new();
        let pos = world.component::<f32>("Position", &[2]).unwrap();
        let local = world.entity_named("Local").unwrap();
        let global = world.entity_named("World").unwrap();
        let e = world.entity().unwrap();

        let mut handle = world.entity_mut(e).unwrap();
        handle.set(&pos, &[9.0f32, 9.0]).unwrap();
        handle.set_pair(&pos, local, &[1.0f32, 2.0]).unwrap();
        handle.set_pair(&pos, global, &[3.0f32, 4.0]).unwrap();

        assert_eq!(&*handle.get::<f32>(&pos).unwrap(), &[9.0, 9.0]);
        assert_eq!(&*handle.get_pair::<f32>(&pos, local).unwrap(), &[1.0, 2.0]);
        assert_eq!(&*handle.get_pair::<f32>(&pos, global).unwrap(), &[3.0, 4.0]);
        assert!(handle.has_pair(&pos, local));

        handle.remove_pair(&pos, local).unwrap();
        assert!(!handle.has_pair(&pos, local));
        assert_eq!(&*handle.get::<f32>(&pos).unwrap(), &[9.0, 9.0]);
    }

    #[test]
    fn pair_with_typed_target_uses_target_type() {
        let mut world = World::new();
        let distance = world.component::<u32>("Distance", &[1]).unwrap();
        let near = world.tag("Near").unwrap();
        let e = world.entity().unwrap();
        let mut handle = world.entity_mut(e).unwrap();
        handle.set_pair(near, &distance, &[7u32]).unwrap();
        assert_eq!(&*handle.get_pair::<u32>(near, &distance).unwrap(), &[7]);
    }

    #[test]
    fn untyped_pair_data_is_rejected() {
        let mut world = World::new();
        let likes = world.tag("Likes").unwrap();
        let bob = world.entity_named("Bob").unwrap();
        let e = world.entity().unwrap();
        let mut handle = world.entity_mut(e).unwrap();
        handle.add_pair(likes, bob).unwrap();
        assert!(handle.has_pair(likes, bob));
        assert!(matches!(
            handle.set_pair(likes, bob, &[1u8]),
            Err(TesseraError::Untyped { .. })
        ));
    }

    #[test]
    fn children_paths_and_lookup() {
        let mut world = World::new();
        let sun = world.entity_named("Sun").unwrap();
        let earth = world.entity_named("Earth").unwrap();
        world.entity_mut(sun).unwrap().add_child(earth).unwrap();

        let handle = world.entity_mut(earth).unwrap();
        assert_eq!(handle.parent(), Some(sun));
        assert_eq!(handle.path().unwrap(), "Sun.Earth");
        assert_eq!(handle.name(), Some("Earth"));
        assert_eq!(world.lookup("Sun.Earth"), Some(earth));
        assert_eq!(world.entity_mut(sun).unwrap().lookup("Earth"), Some(earth));
        assert_eq!(world.lookup("Earth"), None);
    }

    #[test]
    fn instances_inherit_until_overridden() {
        let mut world = World::new();
        let mass = world.component::<f32>("Mass", &[1]).unwrap();
        let base = world.prefab().unwrap();
        world.entity_mut(base).unwrap().set(&mass, &[10.0f32]).unwrap();

        let inst = world.entity().unwrap();
        let mut handle = world.entity_mut(inst).unwrap();
        handle.is_a(base).unwrap();
        assert!(handle.has(&mass));
        assert!(!handle.owns(&mass));
        assert_eq!(&*handle.get::<f32>(&mass).unwrap(), &[10.0]);

        handle.get_mut::<f32>(&mass).unwrap()[0] = 2.0;
        assert!(handle.owns(&mass));
        assert_eq!(&*handle.get::<f32>(&mass).unwrap(), &[2.0]);
        assert_eq!(&*world.entity_mut(base).unwrap().get::<f32>(&mass).unwrap(), &[10.0]);
    }

    #[test]
    fn destruct_invalidates_handle_target() {
        let mut world = World::new();
        let e = world.entity().unwrap();
        world.entity_mut(e).unwrap().destruct().unwrap();
        assert!(!world.is_alive(e));
        assert!(matches!(
            world.entity_mut(e),
            Err(TesseraError::Engine(EngineError::StaleEntity { .. }))
        ));
    }
}
