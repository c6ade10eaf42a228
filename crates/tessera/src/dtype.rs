//! Element types for component data.
//!
//! A [`DType`] names the scalar (or record) type a component's bytes are
//! interpreted as. Rust types opt in through the [`Element`] trait, which
//! requires [`bytemuck::Pod`] so raw column bytes can be reinterpreted without
//! copying.

use std::fmt;

/// The element type of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// A user-defined `#[repr(C)]` plain-old-data struct.
    Record {
        name: &'static str,
        size: usize,
        align: usize,
    },
}

impl DType {
    /// Describe a record type `T` under `name`.
    pub const fn record<T>(name: &'static str) -> Self {
        DType::Record {
            name,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }

    /// Size of one element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
            DType::Record { size, .. } => *size,
        }
    }

    /// Required alignment of one element in bytes.
    pub const fn align(&self) -> usize {
        match self {
            DType::Record { align, .. } => *align,
            _ => self.size(),
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::U64 => "uint64",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::Record { name, .. } => name,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A Rust type that can be stored as a component element.
///
/// Implemented for the fixed-width integers and floats. Record types
/// implement it by hand:
///
/// ```
/// use tessera::dtype::{DType, Element};
///
/// #[derive(Clone, Copy, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
/// #[repr(C)]
/// struct Sample {
///     a: u32,
///     b: f32,
/// }
///
/// impl Element for Sample {
///     const DTYPE: DType = DType::record::<Sample>("sample");
/// }
///
/// assert_eq!(Sample::DTYPE.size(), 8);
/// ```
pub trait Element: bytemuck::Pod {
    const DTYPE: DType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;
            }
        )*
    };
}

impl_element! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, bytemuck_derive::Pod, bytemuck_derive::Zeroable)]
    #[repr(C)]
    struct Particle {
        a: u32,
        b: f64,
        c: [u8; 8],
    }

    impl Element for Particle {
        const DTYPE: DType = DType::record::<Particle>("particle");
    }

    #[test]
    fn scalar_sizes_match_rust() {
        assert_eq!(f32::DTYPE.size(), std::mem::size_of::<f32>());
        assert_eq!(u64::DTYPE.size(), 8);
        assert_eq!(i16::DTYPE.align(), std::mem::align_of::<i16>());
    }

    #[test]
    fn record_dtype_uses_struct_layout() {
        let dt = Particle::DTYPE;
        assert_eq!(dt.size(), std::mem::size_of::<Particle>());
        assert_eq!(dt.align(), std::mem::align_of::<Particle>());
        assert_eq!(dt.to_string(), "particle");
        assert_ne!(dt, DType::F64);
    }
}
