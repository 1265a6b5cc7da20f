//! Numeric element types accepted by the GEMM primitives.
//!
//! The device BLAS exposes one entry point per precision (`S` for `f32`,
//! `D` for `f64`). [`ElementKind`] carries that choice across the
//! type-erased backend boundary; [`Element`] is the static side of it.

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Mul};

use rand::Rng;

/// Precision tag used to select the `S`/`D` BLAS routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// 32-bit IEEE float (`cublasSgemm*`).
    F32,
    /// 64-bit IEEE float (`cublasDgemm*`).
    F64,
}

impl ElementKind {
    /// Size of one element in bytes.
    pub const fn size_of(self) -> usize {
        match self {
            ElementKind::F32 => 4,
            ElementKind::F64 => 8,
        }
    }

    /// Short BLAS prefix, for log messages.
    pub const fn blas_prefix(self) -> &'static str {
        match self {
            ElementKind::F32 => "S",
            ElementKind::F64 => "D",
        }
    }
}

/// A scalar type that can live in a [`Matrix`](crate::Matrix) and be
/// multiplied on the device.
pub trait Element:
    Copy
    + Default
    + PartialEq
    + PartialOrd
    + Debug
    + Send
    + Sync
    + Add<Output = Self>
    + AddAssign
    + Mul<Output = Self>
    + 'static
{
    /// Precision tag for backend dispatch.
    const KIND: ElementKind;
    /// Additive identity.
    const ZERO: Self;
    /// Multiplicative identity.
    const ONE: Self;

    /// Lossy conversion from `f64` (exact for `f64`).
    fn from_f64(v: f64) -> Self;

    /// Widening conversion to `f64`.
    fn to_f64(self) -> f64;

    /// Write the native-endian bytes of `self` into `out`
    /// (`out.len() == Self::KIND.size_of()`).
    fn write_ne(self, out: &mut [u8]);

    /// Read a value from native-endian bytes.
    fn read_ne(bytes: &[u8]) -> Self;

    /// Uniform sample in `[-1, 1]`.
    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self;
}

impl Element for f32 {
    const KIND: ElementKind = ElementKind::F32;
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn write_ne(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_ne_bytes());
    }

    fn read_ne(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        f32::from_ne_bytes(raw)
    }

    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.gen_range(-1.0f32..=1.0f32)
    }
}

impl Element for f64 {
    const KIND: ElementKind = ElementKind::F64;
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    fn from_f64(v: f64) -> Self {
        v
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn write_ne(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_ne_bytes());
    }

    fn read_ne(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        f64::from_ne_bytes(raw)
    }

    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.gen_range(-1.0f64..=1.0f64)
    }
}

/// Encode a slice of elements as native-endian bytes.
pub fn to_bytes<T: Element>(values: &[T]) -> Vec<u8> {
    let width = T::KIND.size_of();
    let mut out = vec![0u8; values.len() * width];
    for (chunk, v) in out.chunks_exact_mut(width).zip(values) {
        v.write_ne(chunk);
    }
    out
}

/// Decode native-endian bytes into elements. Trailing bytes that do not form
/// a whole element are ignored.
pub fn from_bytes<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::KIND.size_of())
        .map(T::read_ne)
        .collect()
}
