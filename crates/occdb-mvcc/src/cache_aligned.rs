//! Cache-line-aligned wrapper for per-core state arrays.
//!
//! We assume 64-byte cache lines (x86-64, AArch64). Over-aligning on
//! platforms with larger lines wastes a little memory but still prevents
//! false sharing on 64-byte platforms.

/// Cache line size in bytes.
pub const CACHE_LINE_BYTES: usize = 64;

/// Wraps a value to ensure it starts on a cache-line boundary.
///
/// In an array, each element then occupies a whole number of cache lines,
/// preventing false sharing between adjacent per-core slots.
#[repr(C, align(64))]
pub struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    /// Wrap `value` with cache-line alignment.
    #[inline]
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: Default> Default for CacheAligned<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CacheAligned<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}
