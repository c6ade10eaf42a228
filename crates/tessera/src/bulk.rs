//! Batched entity creation from column buffers.

use crate::component::TypedComponent;
use crate::dtype::Element;
use crate::engine::memory::MemoryEngine;
use crate::engine::StorageEngine;
use crate::entity::{Entity, Id};
use crate::world::World;
use crate::TesseraError;

/// Creates many entities sharing one set of ids in a single step.
///
/// Every column buffer holds one value per entity, laid out row after row.
/// The first buffer (or [`count`](Self::count)) fixes the entity count; any
/// later buffer with a different row count fails before the world is touched,
/// so a rejected build creates nothing.
pub struct BulkEntityBuilder<'w, E: StorageEngine = MemoryEngine> {
    world: &'w mut World<E>,
    count: Option<usize>,
    ids: Vec<Id>,
    columns: Vec<(Id, Vec<u8>)>,
}

impl<'w, E: StorageEngine> BulkEntityBuilder<'w, E> {
    pub(crate) fn new(world: &'w mut World<E>) -> Self {
        Self {
            world,
            count: None,
            ids: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Fix the number of entities up front. Needed when only data-less ids
    /// are added.
    pub fn count(&mut self, count: usize) -> Result<&mut Self, TesseraError> {
        self.check_rows("<count>", count)?;
        self.count = Some(count);
        Ok(self)
    }

    /// Add a column. `values` holds `count * component.element_count()`
    /// elements. Adding the same component twice replaces the earlier buffer.
    pub fn add<T: Element>(&mut self, component: &TypedComponent, values: &[T]) -> Result<&mut Self, TesseraError> {
        let (bytes, rows) = component.encode(values)?;
        self.check_rows(component.name(), rows)?;
        self.count = Some(rows);

        let id = Id::Entity(component.id());
        match self.columns.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, buffer)) => *buffer = bytes.to_vec(),
            None => self.columns.push((id, bytes.to_vec())),
        }
        Ok(self)
    }

    /// Add a tag, pair or other id without data.
    pub fn add_id(&mut self, id: impl Into<Id>) -> &mut Self {
        let id = id.into();
        if !self.ids.contains(&id) {
            self.ids.push(id);
        }
        self
    }

    fn check_rows(&self, component: &str, rows: usize) -> Result<(), TesseraError> {
        match self.count {
            Some(expected) if expected != rows => Err(TesseraError::CountMismatch {
                component: component.to_owned(),
                expected,
                found: rows,
            }),
            _ => Ok(()),
        }
    }

    /// Create the entities. Returns them in row order.
    pub fn build(self) -> Result<Vec<Entity>, TesseraError> {
        let count = self.count.unwrap_or(0);
        let columns: Vec<(Id, &[u8])> = self
            .columns
            .iter()
            .map(|(id, bytes)| (*id, bytes.as_slice()))
            .collect();
        let entities = self.world.engine_mut().bulk_new(count, &self.ids, &columns)?;
        tracing::debug!(count, columns = columns.len(), ids = self.ids.len(), "bulk build");
        Ok(entities)
    }
}
