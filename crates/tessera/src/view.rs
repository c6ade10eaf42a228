//! Shaped, aliasing views over component storage.
//!
//! An [`ArrayView`] is a typed slice plus a shape. It never owns data: every
//! read goes to the storage the view was created over, and writes through an
//! [`ArrayViewMut`] land in that storage directly.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::cursor::Lease;

/// Row stride of a shape: the number of elements in one leading-axis slot.
fn stride(shape: &[usize]) -> usize {
    shape.iter().skip(1).product()
}

// ---------------------------------------------------------------------------
// ArrayView
// ---------------------------------------------------------------------------

/// Read-only typed view of shape `shape` over borrowed elements.
pub struct ArrayView<'a, T> {
    data: &'a [T],
    shape: Vec<usize>,
    _lease: Option<Lease<'a>>,
}

impl<'a, T> ArrayView<'a, T> {
    pub(crate) fn new(data: &'a [T], shape: Vec<usize>) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self {
            data,
            shape,
            _lease: None,
        }
    }

    pub(crate) fn with_lease(mut self, lease: Option<Lease<'a>>) -> Self {
        self._lease = lease;
        self
    }

    /// Full shape, leading axis first.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Extent of the leading axis.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Elements of the leading-axis slot `i`, or `None` past the end.
    pub fn row(&self, i: usize) -> Option<&'a [T]> {
        let n = stride(&self.shape);
        let data: &'a [T] = self.data;
        data.get(i * n..(i + 1) * n)
    }

    /// Iterate the leading-axis slots.
    pub fn rows_iter(&self) -> impl Iterator<Item = &'a [T]> + '_ {
        (0..self.rows()).filter_map(move |i| self.row(i))
    }

    /// Drop the leading axis, keeping only slot `i`.
    pub fn into_row(self, i: usize) -> Option<Self> {
        if self.shape.is_empty() {
            return None;
        }
        let data = self.row(i)?;
        Some(Self {
            data,
            shape: self.shape[1..].to_vec(),
            _lease: self._lease,
        })
    }

    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }
}

impl<T> Deref for ArrayView<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data
    }
}

impl<T: fmt::Debug> fmt::Debug for ArrayView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayView")
            .field("shape", &self.shape)
            .field("data", &self.data)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ArrayViewMut
// ---------------------------------------------------------------------------

/// Mutable typed view. Writes go straight into the backing storage.
pub struct ArrayViewMut<'a, T> {
    data: &'a mut [T],
    shape: Vec<usize>,
    _lease: Option<Lease<'a>>,
}

impl<'a, T> ArrayViewMut<'a, T> {
    pub(crate) fn new(data: &'a mut [T], shape: Vec<usize>) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self {
            data,
            shape,
            _lease: None,
        }
    }

    pub(crate) fn with_lease(mut self, lease: Option<Lease<'a>>) -> Self {
        self._lease = lease;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    pub fn row(&self, i: usize) -> Option<&[T]> {
        let n = stride(&self.shape);
        self.data.get(i * n..(i + 1) * n)
    }

    pub fn row_mut(&mut self, i: usize) -> Option<&mut [T]> {
        let n = stride(&self.shape);
        self.data.get_mut(i * n..(i + 1) * n)
    }

    /// Drop the leading axis, keeping only slot `i`.
    pub fn into_row(self, i: usize) -> Option<Self> {
        if self.shape.is_empty() {
            return None;
        }
        let n = stride(&self.shape);
        let Self {
            data,
            shape,
            _lease,
        } = self;
        let data = data.get_mut(i * n..(i + 1) * n)?;
        Some(Self {
            data,
            shape: shape[1..].to_vec(),
            _lease,
        })
    }

    pub fn as_slice(&self) -> &[T] {
        self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.data
    }
}

impl<T: Copy> ArrayViewMut<'_, T> {
    /// Overwrite every element with `value`.
    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Copy `src` over the whole view. Panics if the lengths differ, like
    /// [`slice::copy_from_slice`].
    pub fn assign(&mut self, src: &[T]) {
        self.data.copy_from_slice(src);
    }
}

impl<T> Deref for ArrayViewMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.data
    }
}

impl<T> DerefMut for ArrayViewMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.data
    }
}

impl<T: fmt::Debug> fmt::Debug for ArrayViewMut<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayViewMut")
            .field("shape", &self.shape)
            .field("data", &self.data)
            .finish()
    }
}
