//! Typed component descriptors and the per-world component registry.
//!
//! A [`TypedComponent`] binds an engine entity to an element type and a shape.
//! It is the only place raw column bytes are turned into typed views, so all
//! type, size and alignment checks happen here, once per view.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dtype::{DType, Element};
use crate::engine::{ComponentLayout, EngineError};
use crate::entity::{Entity, Id};
use crate::view::{ArrayView, ArrayViewMut};
use crate::TesseraError;

// ---------------------------------------------------------------------------
// TypedComponent
// ---------------------------------------------------------------------------

/// Maps a component entity to `(dtype, shape)`.
///
/// Immutable once created. `total_bytes` is the size of one entity's value:
/// `product(shape) * dtype.size()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedComponent {
    entity: Entity,
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    total_bytes: usize,
}

impl TypedComponent {
    /// Build a descriptor. Fails with [`TesseraError::InvalidShape`] if any
    /// dimension is zero or the element type has no bytes; data-less ids are
    /// tags.
    pub fn new(
        entity: Entity,
        name: impl Into<String>,
        dtype: DType,
        shape: &[usize],
    ) -> Result<Self, TesseraError> {
        if shape.contains(&0) || dtype.size() == 0 {
            return Err(TesseraError::InvalidShape {
                shape: shape.to_vec(),
            });
        }
        let total_bytes = shape.iter().product::<usize>() * dtype.size();
        Ok(Self {
            entity,
            name: name.into(),
            dtype,
            shape: shape.to_vec(),
            total_bytes,
        })
    }

    /// The component's engine identity.
    #[inline]
    pub fn id(&self) -> Entity {
        self.entity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Per-entity shape (without the leading row axis).
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements in one entity's value.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn element_size(&self) -> usize {
        self.dtype.size()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Storage layout to request from the engine.
    pub fn layout(&self) -> ComponentLayout {
        ComponentLayout {
            size: self.total_bytes,
            align: self.dtype.align(),
        }
    }

    fn check_dtype<T: Element>(&self) -> Result<(), TesseraError> {
        if T::DTYPE != self.dtype {
            return Err(TesseraError::TypeMismatch {
                component: self.name.clone(),
                expected: self.dtype,
                found: T::DTYPE,
            });
        }
        Ok(())
    }

    fn rows_for(&self, len: usize) -> Result<usize, TesseraError> {
        if len % self.total_bytes != 0 {
            return Err(TesseraError::ShapeMismatch {
                component: self.name.clone(),
                len,
                total_bytes: self.total_bytes,
            });
        }
        Ok(len / self.total_bytes)
    }

    fn view_shape(&self, rows: usize) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.shape.len() + 1);
        shape.push(rows);
        shape.extend_from_slice(&self.shape);
        shape
    }

    /// Reinterpret `raw` as `(rows, *shape)` elements of `T`, aliasing it.
    pub fn create_view<'a, T: Element>(&self, raw: &'a [u8]) -> Result<ArrayView<'a, T>, TesseraError> {
        self.check_dtype::<T>()?;
        let rows = self.rows_for(raw.len())?;
        let data: &'a [T] = bytemuck::try_cast_slice(raw).map_err(|_| TesseraError::Misaligned {
            component: self.name.clone(),
        })?;
        Ok(ArrayView::new(data, self.view_shape(rows)))
    }

    /// Mutable counterpart of [`create_view`](Self::create_view).
    pub fn create_view_mut<'a, T: Element>(
        &self,
        raw: &'a mut [u8],
    ) -> Result<ArrayViewMut<'a, T>, TesseraError> {
        self.check_dtype::<T>()?;
        let rows = self.rows_for(raw.len())?;
        let data: &'a mut [T] =
            bytemuck::try_cast_slice_mut(raw).map_err(|_| TesseraError::Misaligned {
                component: self.name.clone(),
            })?;
        Ok(ArrayViewMut::new(data, self.view_shape(rows)))
    }

    /// A zero-row view, for terms that matched without data.
    pub(crate) fn empty_view<T: Element>(&self) -> Result<ArrayView<'static, T>, TesseraError> {
        self.check_dtype::<T>()?;
        Ok(ArrayView::new(&[], self.view_shape(0)))
    }

    pub(crate) fn empty_view_mut<T: Element>(&self) -> Result<ArrayViewMut<'static, T>, TesseraError> {
        self.check_dtype::<T>()?;
        Ok(ArrayViewMut::new(&mut [], self.view_shape(0)))
    }

    /// Check a typed value buffer and return it as bytes, plus its row count.
    pub(crate) fn encode<'a, T: Element>(&self, values: &'a [T]) -> Result<(&'a [u8], usize), TesseraError> {
        self.check_dtype::<T>()?;
        let bytes: &'a [u8] = bytemuck::cast_slice(values);
        let rows = self.rows_for(bytes.len())?;
        Ok((bytes, rows))
    }
}

impl From<&TypedComponent> for Id {
    fn from(c: &TypedComponent) -> Self {
        Id::Entity(c.id())
    }
}

impl From<&Arc<TypedComponent>> for Id {
    fn from(c: &Arc<TypedComponent>) -> Self {
        Id::Entity(c.id())
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryInner {
    by_name: HashMap<String, Arc<TypedComponent>>,
    by_id: HashMap<Entity, Arc<TypedComponent>>,
}

/// Name-keyed cache of component descriptors.
///
/// Any two lookups of the same name return the same `Arc`. Creation happens
/// under the lock, so two callers racing on a new name cannot produce two
/// descriptors.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    inner: Mutex<RegistryInner>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the descriptor for `name`, or create it with `create`.
    ///
    /// `create` runs with the registry locked and must return the engine
    /// entity for the new component. A cached descriptor whose dtype or shape
    /// differs from the request is a [`TesseraError::ComponentConflict`].
    pub fn get_or_try_insert_with<F>(
        &self,
        name: &str,
        dtype: DType,
        shape: &[usize],
        create: F,
    ) -> Result<Arc<TypedComponent>, TesseraError>
    where
        F: FnOnce(ComponentLayout) -> Result<Entity, EngineError>,
    {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.by_name.get(name) {
            if existing.dtype != dtype || existing.shape != shape {
                return Err(TesseraError::ComponentConflict {
                    name: name.to_owned(),
                });
            }
            return Ok(Arc::clone(existing));
        }

        // Validate the shape before touching the engine.
        let probe = TypedComponent::new(Entity::from_raw(0), name, dtype, shape)?;
        let entity = create(probe.layout())?;
        let component = Arc::new(TypedComponent { entity, ..probe });

        tracing::debug!(
            component = name,
            entity = %entity,
            dtype = %dtype,
            total_bytes = component.total_bytes,
            "registered component"
        );
        inner.by_name.insert(name.to_owned(), Arc::clone(&component));
        inner.by_id.insert(entity, Arc::clone(&component));
        Ok(component)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<TypedComponent>> {
        self.inner.lock().by_name.get(name).cloned()
    }

    pub fn lookup_by_id(&self, entity: Entity) -> Option<Arc<TypedComponent>> {
        self.inner.lock().by_id.get(&entity).cloned()
    }

    /// Keep only descriptors whose entity satisfies `keep`. Used to drop
    /// components destroyed through the engine.
    pub fn retain(&self, mut keep: impl FnMut(Entity) -> bool) {
        let mut inner = self.inner.lock();
        let RegistryInner { by_name, by_id } = &mut *inner;
        by_id.retain(|entity, _| keep(*entity));
        by_name.retain(|_, component| by_id.contains_key(&component.id()));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(entity: u32) -> TypedComponent {
        TypedComponent::new(Entity::new(entity, 0), "Position", DType::F32, &[3]).unwrap()
    }

    #[test]
    fn total_bytes_is_shape_times_element_size() {
        let c = position(1);
        assert_eq!(c.total_bytes(), 12);
        assert_eq!(c.element_count(), 3);
        assert_eq!(c.layout(), ComponentLayout { size: 12, align: 4 });
    }

    #[test]
    fn zero_dimension_is_invalid() {
        let err = TypedComponent::new(Entity::new(1, 0), "Bad", DType::F32, &[2, 0]).unwrap_err();
        assert!(matches!(err, TesseraError::InvalidShape { .. }));
    }

    #[test]
    fn zero_sized_records_are_invalid() {
        let empty = DType::Record {
            name: "Empty",
            size: 0,
            align: 1,
        };
        let err = TypedComponent::new(Entity::new(1, 0), "Empty", empty, &[1]).unwrap_err();
        assert!(matches!(err, TesseraError::InvalidShape { .. }));
    }

    #[test]
    fn view_rows_follow_buffer_length() {
        let c = position(1);
        let values: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let raw: &[u8] = bytemuck::cast_slice(&values);
        let view = c.create_view::<f32>(raw).unwrap();
        assert_eq!(view.shape(), &[4, 3]);
        assert_eq!(view.row(2), Some(&[6.0, 7.0, 8.0][..]));
    }

    #[test]
    fn partial_row_is_shape_mismatch() {
        let c = position(1);
        let values = [0f32; 4];
        let err = c.create_view::<f32>(bytemuck::cast_slice(&values)).unwrap_err();
        assert!(matches!(err, TesseraError::ShapeMismatch { len: 16, total_bytes: 12, .. }));
    }

    #[test]
    fn wrong_element_type_is_type_mismatch() {
        let c = position(1);
        let values = [0f64; 3];
        let err = c.create_view::<f64>(bytemuck::cast_slice(&values)).unwrap_err();
        assert!(matches!(
            err,
            TesseraError::TypeMismatch {
                expected: DType::F32,
                found: DType::F64,
                ..
            }
        ));
    }

    #[test]
    fn mutable_view_aliases_buffer() {
        let c = position(1);
        let mut values = [0f32; 6];
        {
            let mut view = c.create_view_mut::<f32>(bytemuck::cast_slice_mut(&mut values)).unwrap();
            view.row_mut(1).unwrap()[0] = 2.5;
        }
        assert_eq!(values[3], 2.5);
    }

    #[test]
    fn registry_returns_same_instance_per_name() {
        let registry = ComponentRegistry::new();
        let mut calls = 0;
        let a = registry
            .get_or_try_insert_with("Position", DType::F32, &[3], |_| {
                calls += 1;
                Ok(Entity::new(7, 0))
            })
            .unwrap();
        let b = registry
            .get_or_try_insert_with("Position", DType::F32, &[3], |_| {
                calls += 1;
                Ok(Entity::new(8, 0))
            })
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls, 1);
        assert!(Arc::ptr_eq(&registry.lookup_by_id(Entity::new(7, 0)).unwrap(), &a));
    }

    #[test]
    fn registry_rejects_conflicting_redefinition() {
        let registry = ComponentRegistry::new();
        registry
            .get_or_try_insert_with("Mass", DType::F32, &[1], |_| Ok(Entity::new(1, 0)))
            .unwrap();
        let err = registry
            .get_or_try_insert_with("Mass", DType::F64, &[1], |_| Ok(Entity::new(2, 0)))
            .unwrap_err();
        assert!(matches!(err, TesseraError::ComponentConflict { .. }));
    }

    #[test]
    fn failed_creation_caches_nothing() {
        let registry = ComponentRegistry::new();
        let err = registry
            .get_or_try_insert_with("Bad", DType::U8, &[0], |_| Ok(Entity::new(1, 0)))
            .unwrap_err();
        assert!(matches!(err, TesseraError::InvalidShape { .. }));
        assert!(registry.is_empty());
    }
}
