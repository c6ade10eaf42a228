//! Group-at-a-time iteration over a compiled filter or query.
//!
//! An [`IterationCursor`] drives the engine iterator. While it is positioned
//! on a group it hands out typed column views and the matched entities. Views
//! borrow the cursor, and [`IterationCursor::advance`] takes `&mut self`, so a
//! view can never outlive the group it was created for.
//!
//! # Borrow tracking
//!
//! Several terms can resolve to overlapping storage (the same component named
//! twice, or two terms inheriting from one base). Every view registers its
//! byte range with a per-cursor ledger:
//!
//! | held               | read view | mutable view |
//! |--------------------|-----------|--------------|
//! | nothing            | ok        | ok           |
//! | read views         | ok        | conflict     |
//! | a mutable view     | conflict  | conflict     |
//!
//! A conflict is reported as [`TesseraError::BorrowConflict`]. Dropping the
//! view releases its range.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::{Bound, Index, Range, RangeBounds};

use crate::dtype::Element;
use crate::engine::{EngineIter, RawColumn, StorageEngine};
use crate::entity::Entity;
use crate::filter::ComponentEntry;
use crate::term::Term;
use crate::view::{ArrayView, ArrayViewMut};
use crate::TesseraError;

// ---------------------------------------------------------------------------
// Borrow ledger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Loan {
    id: u64,
    range: Range<usize>,
    exclusive: bool,
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// Outstanding view borrows of one cursor, keyed by address range.
#[derive(Debug, Default)]
pub(crate) struct BorrowLedger {
    loans: RefCell<Vec<Loan>>,
    next_id: Cell<u64>,
}

impl BorrowLedger {
    /// Register a borrow of `range`. `None` if it conflicts with a live one.
    fn acquire(&self, range: Range<usize>, exclusive: bool) -> Option<Lease<'_>> {
        let mut loans = self.loans.borrow_mut();
        let conflict = loans
            .iter()
            .any(|l| overlaps(&l.range, &range) && (exclusive || l.exclusive));
        if conflict {
            return None;
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        loans.push(Loan {
            id,
            range,
            exclusive,
        });
        Some(Lease { ledger: self, id })
    }

    fn outstanding(&self) -> usize {
        self.loans.borrow().len()
    }
}

/// Releases its ledger entry on drop.
pub(crate) struct Lease<'a> {
    ledger: &'a BorrowLedger,
    id: u64,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.ledger.loans.borrow_mut().retain(|l| l.id != self.id);
    }
}

// ---------------------------------------------------------------------------
// TermKey
// ---------------------------------------------------------------------------

/// Selects a bound component column: by position in the filter's component
/// list (0-based) or by component name (first match).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKey<'k> {
    Position(usize),
    Name(&'k str),
}

impl From<usize> for TermKey<'_> {
    fn from(i: usize) -> Self {
        TermKey::Position(i)
    }
}

impl<'k> From<&'k str> for TermKey<'k> {
    fn from(name: &'k str) -> Self {
        TermKey::Name(name)
    }
}

impl fmt::Display for TermKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermKey::Position(i) => write!(f, "#{i}"),
            TermKey::Name(n) => f.write_str(n),
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// The entities of the current group, in row order.
///
/// `entities[i]` is the entity whose data sits in row `i` of every owned
/// column of the group.
#[derive(Debug, Clone, Copy)]
pub struct Entities<'a> {
    slice: &'a [Entity],
}

impl<'a> Entities<'a> {
    pub fn len(&self) -> usize {
        self.slice.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slice.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<Entity> {
        self.slice.get(i).copied()
    }

    /// Sub-range of the rows. `None` if out of bounds.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Option<Entities<'a>> {
        let bounds: (Bound<usize>, Bound<usize>) = (range.start_bound().cloned(), range.end_bound().cloned());
        self.slice.get(bounds).map(|slice| Entities { slice })
    }

    pub fn iter(&self) -> std::iter::Copied<std::slice::Iter<'a, Entity>> {
        self.slice.iter().copied()
    }

    pub fn as_slice(&self) -> &'a [Entity] {
        self.slice
    }
}

impl Index<usize> for Entities<'_> {
    type Output = Entity;

    fn index(&self, i: usize) -> &Entity {
        &self.slice[i]
    }
}

impl<'a> IntoIterator for Entities<'a> {
    type Item = Entity;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, Entity>>;

    fn into_iter(self) -> Self::IntoIter {
        self.slice.iter().copied()
    }
}

// ---------------------------------------------------------------------------
// IterationCursor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    NotStarted,
    Positioned,
    Done,
}

/// Walks the matched groups of a filter or query.
///
/// ```
/// use tessera::prelude::*;
///
/// let mut world = World::new();
/// let pos = world.component::<f32>("Position", &[2]).unwrap();
/// let e = world.entity().unwrap();
/// world.entity_mut(e).unwrap().set(&pos, &[1.0f32, 2.0]).unwrap();
///
/// let mut filter = world.filter_builder().term(&pos).build().unwrap();
/// let mut it = filter.iter(&mut world);
/// while it.advance() {
///     let mut col = it.column_mut::<f32>("Position").unwrap();
///     col[0] += 10.0;
/// }
/// drop(it);
/// assert_eq!(&*world.entity_mut(e).unwrap().get::<f32>(&pos).unwrap(), &[11.0, 2.0]);
/// ```
pub struct IterationCursor<'w, E: StorageEngine + 'w> {
    iter: E::Iter<'w>,
    terms: &'w [Term],
    components: &'w [ComponentEntry],
    state: CursorState,
    ledger: BorrowLedger,
}

impl<'w, E: StorageEngine + 'w> IterationCursor<'w, E> {
    pub(crate) fn new(iter: E::Iter<'w>, terms: &'w [Term], components: &'w [ComponentEntry]) -> Self {
        Self {
            iter,
            terms,
            components,
            state: CursorState::NotStarted,
            ledger: BorrowLedger::default(),
        }
    }

    /// Move to the next group. Returns `false` once, when the match is
    /// exhausted, and on every call after that.
    pub fn advance(&mut self) -> bool {
        if self.state == CursorState::Done {
            return false;
        }
        debug_assert_eq!(self.ledger.outstanding(), 0);
        if self.iter.next() {
            self.state = CursorState::Positioned;
            true
        } else {
            self.state = CursorState::Done;
            false
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    fn positioned(&self) -> Result<(), TesseraError> {
        if self.state != CursorState::Positioned {
            return Err(TesseraError::NotPositioned);
        }
        Ok(())
    }

    fn entry(&self, key: TermKey<'_>) -> Result<&'w ComponentEntry, TesseraError> {
        let components: &'w [ComponentEntry] = self.components;
        let found = match key {
            TermKey::Position(i) => components.get(i),
            TermKey::Name(name) => components.iter().find(|c| c.component.name() == name),
        };
        found.ok_or_else(|| TesseraError::UnknownTerm { key: key.to_string() })
    }

    fn raw(&self, key: TermKey<'_>) -> Result<(&'w ComponentEntry, Option<RawColumn>), TesseraError> {
        self.positioned()?;
        let entry = self.entry(key)?;
        Ok((entry, self.iter.column(entry.index)))
    }

    fn lease(&self, raw: &RawColumn, exclusive: bool, key: TermKey<'_>) -> Result<Lease<'_>, TesseraError> {
        let start = raw.ptr.as_ptr() as usize;
        self.ledger
            .acquire(start..start + raw.len, exclusive)
            .ok_or_else(|| TesseraError::BorrowConflict { key: key.to_string() })
    }

    /// Typed view of a component column for the current group.
    ///
    /// Owned columns have [`count`](Self::count) rows, columns taken from
    /// another entity have one row and unmatched optional terms have none.
    pub fn column<'k, T: Element>(&self, key: impl Into<TermKey<'k>>) -> Result<ArrayView<'_, T>, TesseraError> {
        let key = key.into();
        let (entry, raw) = self.raw(key)?;
        let Some(raw) = raw else {
            return entry.component.empty_view();
        };
        let lease = self.lease(&raw, false, key)?;
        // SAFETY: the engine guarantees `raw` addresses `raw.len` initialised
        // bytes that stay valid until the iterator advances, which needs
        // `&mut self`. The ledger rules out a live mutable view over any of
        // these bytes.
        let bytes: &[u8] = unsafe { std::slice::from_raw_parts(raw.ptr.as_ptr(), raw.len) };
        Ok(entry.component.create_view(bytes)?.with_lease(Some(lease)))
    }

    /// Mutable typed view of a component column for the current group.
    ///
    /// Fails with [`TesseraError::ReadOnlyTerm`] for `[in]` and `[none]`
    /// terms, including terms matched on another entity without an explicit
    /// access modifier.
    pub fn column_mut<'k, T: Element>(
        &self,
        key: impl Into<TermKey<'k>>,
    ) -> Result<ArrayViewMut<'_, T>, TesseraError> {
        let key = key.into();
        let (entry, raw) = self.raw(key)?;
        let writable = self
            .terms
            .get(entry.index - 1)
            .is_some_and(|t| t.access.is_writable());
        if !writable {
            return Err(TesseraError::ReadOnlyTerm { index: entry.index });
        }
        let Some(raw) = raw else {
            return entry.component.empty_view_mut();
        };
        let lease = self.lease(&raw, true, key)?;
        // SAFETY: as in `column`; the exclusive lease guarantees no other
        // view of these bytes is live while this one exists.
        let bytes: &mut [u8] = unsafe { std::slice::from_raw_parts_mut(raw.ptr.as_ptr(), raw.len) };
        Ok(entry.component.create_view_mut(bytes)?.with_lease(Some(lease)))
    }

    /// Matched entities of the current group. Empty when not positioned.
    pub fn entities(&self) -> Entities<'_> {
        let slice = match self.state {
            CursorState::Positioned => self.iter.entities(),
            _ => &[],
        };
        Entities { slice }
    }

    /// Rows in the current group.
    pub fn count(&self) -> usize {
        match self.state {
            CursorState::Positioned => self.iter.count(),
            _ => 0,
        }
    }

    /// Number of declared terms, including tags and unbound pairs.
    pub fn term_count(&self) -> usize {
        self.iter.term_count()
    }

    /// Whether the column belongs to the iterated entities (as opposed to a
    /// base, an ancestor or a fixed source).
    pub fn is_owned<'k>(&self, key: impl Into<TermKey<'k>>) -> Result<bool, TesseraError> {
        let (_, raw) = self.raw(key.into())?;
        Ok(raw.is_some_and(|r| r.owned))
    }

    /// Whether the term matched in the current group.
    pub fn is_set<'k>(&self, key: impl Into<TermKey<'k>>) -> Result<bool, TesseraError> {
        self.positioned()?;
        let entry = self.entry(key.into())?;
        Ok(self.iter.is_set(entry.index))
    }

    /// Whether the 1-based term `index` matched, for terms without a bound
    /// component (tags, data-less pairs).
    pub fn term_is_set(&self, index: usize) -> Result<bool, TesseraError> {
        self.positioned()?;
        Ok(self.iter.is_set(index))
    }
}

impl<'w, E: StorageEngine + 'w> fmt::Debug for IterationCursor<'w, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterationCursor")
            .field("state", &self.state)
            .field("components", &self.components.len())
            .field("terms", &self.terms.len())
            .finish()
    }
}
