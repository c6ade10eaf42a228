//! Archetype tables for [`MemoryEngine`](super::memory::MemoryEngine).
//!
//! An [`Archetype`] stores every entity that owns exactly the same set of
//! [`Id`]s. Data is laid out Structure-of-Arrays: one byte [`Column`] per id
//! that carries data, plus a parallel `Vec<Entity>` mapping row to entity.
//! Tags and data-less pairs are part of the signature but get no column.

use bytemuck::Zeroable;

use super::{ComponentLayout, EngineError};
use crate::entity::{Entity, Id};

/// Largest element alignment a [`Column`] can honour.
pub const MAX_ALIGN: usize = 16;

/// Storage unit of a column. Its alignment is the column's base alignment.
#[derive(Clone, Copy, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
#[repr(C, align(16))]
struct Block([u8; MAX_ALIGN]);

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Index into the engine's archetype list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// A densely packed byte array of fixed-size items.
///
/// Backed by 16-byte aligned blocks, so row `i` starts at `i * item_size`
/// with the alignment of any layout the engine accepts.
pub struct Column {
    blocks: Vec<Block>,
    item_size: usize,
    len: usize,
}

impl Column {
    pub fn new(layout: ComponentLayout) -> Result<Self, EngineError> {
        if layout.align > MAX_ALIGN || !layout.align.is_power_of_two() {
            return Err(EngineError::UnsupportedAlignment {
                align: layout.align,
                max: MAX_ALIGN,
            });
        }
        Ok(Self {
            blocks: Vec::new(),
            item_size: layout.size,
            len: 0,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn bytes(&self) -> &[u8] {
        let all: &[u8] = bytemuck::cast_slice(&self.blocks);
        &all[..self.len * self.item_size]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let end = self.len * self.item_size;
        let all: &mut [u8] = bytemuck::cast_slice_mut(&mut self.blocks);
        &mut all[..end]
    }

    /// Base address of the column storage. Obtained without creating a
    /// reference, so earlier pointers from this method stay usable.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.blocks.as_mut_ptr().cast()
    }

    pub fn row(&self, row: usize) -> &[u8] {
        let start = row * self.item_size;
        &self.bytes()[start..start + self.item_size]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [u8] {
        let start = row * self.item_size;
        let size = self.item_size;
        &mut self.bytes_mut()[start..start + size]
    }

    fn grow_for(&mut self, rows: usize) {
        let needed = (rows * self.item_size).div_ceil(MAX_ALIGN);
        if needed > self.blocks.len() {
            self.blocks.resize(needed, Block::zeroed());
        }
    }

    /// Append one item. `bytes` must be exactly `item_size` long.
    pub fn push(&mut self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.item_size);
        self.grow_for(self.len + 1);
        self.len += 1;
        let row = self.len - 1;
        self.row_mut(row).copy_from_slice(bytes);
    }

    pub fn push_zeroed(&mut self) {
        self.grow_for(self.len + 1);
        self.len += 1;
        let row = self.len - 1;
        self.row_mut(row).fill(0);
    }

    /// Append `rows` items from a contiguous buffer.
    pub fn extend(&mut self, bytes: &[u8], rows: usize) {
        debug_assert_eq!(bytes.len(), rows * self.item_size);
        let start = self.len * self.item_size;
        self.grow_for(self.len + rows);
        self.len += rows;
        self.bytes_mut()[start..].copy_from_slice(bytes);
    }

    /// Remove `row` by moving the last item into its place.
    pub fn swap_remove(&mut self, row: usize) {
        debug_assert!(row < self.len);
        let last = self.len - 1;
        if row != last {
            let size = self.item_size;
            self.bytes_mut()
                .copy_within(last * size..(last + 1) * size, row * size);
        }
        self.len -= 1;
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("len", &self.len)
            .field("item_size", &self.item_size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// All entities sharing one exact id set.
///
/// `ids` is sorted; `columns` holds the data-carrying subset, also sorted, so
/// both support binary search.
#[derive(Debug)]
pub struct Archetype {
    id: ArchetypeId,
    ids: Vec<Id>,
    columns: Vec<(Id, Column)>,
    entities: Vec<Entity>,
}

impl Archetype {
    /// The archetype with no ids.
    pub fn empty(id: ArchetypeId) -> Self {
        Self {
            id,
            ids: Vec::new(),
            columns: Vec::new(),
            entities: Vec::new(),
        }
    }

    /// Create an empty archetype. `ids` must be sorted and deduplicated;
    /// `layout` gives the storage layout of every data-carrying id.
    pub fn new(
        id: ArchetypeId,
        ids: Vec<Id>,
        layout: impl Fn(Id) -> Option<ComponentLayout>,
    ) -> Result<Self, EngineError> {
        let mut columns = Vec::new();
        for &i in &ids {
            if let Some(l) = layout(i).filter(|l| !l.is_tag()) {
                columns.push((i, Column::new(l)?));
            }
        }
        Ok(Self {
            id,
            ids,
            columns,
            entities: Vec::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// The sorted id signature.
    #[inline]
    pub fn ids(&self) -> &[Id] {
        &self.ids
    }

    #[inline]
    pub fn has(&self, id: Id) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    #[inline]
    pub fn column_index(&self, id: Id) -> Option<usize> {
        self.columns.binary_search_by_key(&id, |(i, _)| *i).ok()
    }

    pub fn column(&self, id: Id) -> Option<&Column> {
        self.column_index(id).map(|i| &self.columns[i].1)
    }

    pub fn column_mut(&mut self, id: Id) -> Option<&mut Column> {
        let idx = self.column_index(id)?;
        Some(&mut self.columns[idx].1)
    }

    pub fn column_at_mut(&mut self, index: usize) -> &mut Column {
        &mut self.columns[index].1
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Append `entity`, filling each column from `data` or with zeroes.
    /// Returns the new row.
    pub fn push<'a>(&mut self, entity: Entity, data: impl Fn(Id) -> Option<&'a [u8]>) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        for (id, column) in &mut self.columns {
            match data(*id) {
                Some(bytes) => column.push(bytes),
                None => column.push_zeroed(),
            }
        }
        row
    }

    /// Append `entities` at once. Columns named in `data` are filled from
    /// their contiguous buffers; the rest are zeroed.
    pub fn extend(&mut self, entities: &[Entity], data: &[(Id, &[u8])]) -> usize {
        let first = self.entities.len();
        self.entities.extend_from_slice(entities);
        for (id, column) in &mut self.columns {
            match data.iter().find(|(i, _)| i == id) {
                Some((_, bytes)) => column.extend(bytes, entities.len()),
                None => {
                    for _ in 0..entities.len() {
                        column.push_zeroed();
                    }
                }
            }
        }
        first
    }

    /// Copy the data of `row`, one `(id, bytes)` per column.
    pub fn row_data(&self, row: usize) -> Vec<(Id, Vec<u8>)> {
        self.columns
            .iter()
            .map(|(id, column)| (*id, column.row(row).to_vec()))
            .collect()
    }

    pub fn get(&self, id: Id, row: usize) -> Option<&[u8]> {
        self.column(id).map(|c| c.row(row))
    }

    pub fn get_mut(&mut self, id: Id, row: usize) -> Option<&mut [u8]> {
        self.column_mut(id).map(|c| c.row_mut(row))
    }

    /// Remove the entity at `row`, keeping storage dense.
    ///
    /// Returns the entity that was moved into `row`, if any.
    pub fn swap_remove(&mut self, row: usize) -> Option<Entity> {
        let last = self.entities.len() - 1;
        self.entities.swap_remove(row);
        for (_, column) in &mut self.columns {
            column.swap_remove(row);
        }
        if row < last {
            Some(self.entities[row])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Pair;

    fn id(n: u32) -> Id {
        Id::Entity(Entity::new(n, 0))
    }

    fn layout(i: Id) -> Option<ComponentLayout> {
        match i {
            Id::Entity(e) if e.index() == 1 => Some(ComponentLayout { size: 12, align: 4 }),
            Id::Entity(e) if e.index() == 2 => Some(ComponentLayout { size: 8, align: 8 }),
            _ => None,
        }
    }

    fn archetype() -> Archetype {
        let ids = vec![id(1), id(2), id(3), Id::Pair(Pair::new(Entity::new(4, 0), Entity::new(5, 0)))];
        Archetype::new(ArchetypeId(0), ids, layout).unwrap()
    }

    #[test]
    fn tags_get_no_column() {
        let a = archetype();
        assert!(a.has(id(3)));
        assert!(a.column(id(1)).is_some());
        assert!(a.column(id(3)).is_none());
    }

    #[test]
    fn push_and_swap_remove_keep_rows_dense() {
        let mut a = archetype();
        let e0 = Entity::new(10, 0);
        let e1 = Entity::new(11, 0);
        let e2 = Entity::new(12, 0);
        let bytes = |n: u8| vec![n; 12];
        let b0 = bytes(0);
        let b1 = bytes(1);
        let b2 = bytes(2);
        a.push(e0, |i| (i == id(1)).then_some(&b0[..]));
        a.push(e1, |i| (i == id(1)).then_some(&b1[..]));
        a.push(e2, |i| (i == id(1)).then_some(&b2[..]));

        assert_eq!(a.swap_remove(0), Some(e2));
        assert_eq!(a.entities(), &[e2, e1]);
        assert_eq!(a.get(id(1), 0), Some(&b2[..]));
        assert_eq!(a.get(id(2), 1), Some(&[0u8; 8][..]));
        assert_eq!(a.swap_remove(1), None);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn column_rows_are_aligned() {
        let mut c = Column::new(ComponentLayout { size: 8, align: 8 }).unwrap();
        for i in 0..5u64 {
            c.push(&i.to_ne_bytes());
        }
        let values: &[u64] = bytemuck::cast_slice(c.bytes());
        assert_eq!(values, &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn oversized_alignment_is_rejected() {
        let err = Column::new(ComponentLayout { size: 32, align: 32 }).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedAlignment { align: 32, .. }));
    }

    #[test]
    fn extend_fills_named_columns() {
        let mut a = archetype();
        let es = [Entity::new(20, 0), Entity::new(21, 0)];
        let data = vec![7u8; 24];
        a.extend(&es, &[(id(1), &data[..])]);
        assert_eq!(a.len(), 2);
        assert_eq!(a.get(id(1), 1), Some(&data[12..]));
        assert_eq!(a.column(id(2)).unwrap().len(), 2);
    }
}
