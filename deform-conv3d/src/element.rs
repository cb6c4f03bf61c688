use core::fmt::Debug;

use num_traits::Float;

/// Floating point types a [`Volume`](crate::Volume) can hold.
///
/// Sampling and accumulation always run in `f64`; values are widened on read
/// and narrowed once when a result buffer is written.
pub trait Element: Float + Debug + Default + Send + Sync + 'static {
    /// Narrows an `f64` accumulator into this element type.
    fn from_f64(value: f64) -> Self;

    /// Widens this element to `f64`.
    fn as_f64(self) -> f64;
}

impl Element for f32 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn as_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Element for f64 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }

    #[inline]
    fn as_f64(self) -> f64 {
        self
    }
}
