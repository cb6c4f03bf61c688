//! Dense five dimensional buffers.

use crate::{
    element::Element,
    error::{DeformConvError, DeformConvResult},
    sampler::Plane,
};

/// A dense row-major buffer with axes `[batch, channel, T, H, W]`.
///
/// Every operand of the engine (input, weight, offset, modulation, output and
/// all gradients) is a `Volume`. For the weight tensor the axes read
/// `[out_channel, in_channel / groups, kT, kH, kW]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<F> {
    shape: [usize; 5],
    data: Vec<F>,
}

impl<F: Element> Volume<F> {
    /// Wraps `data` as a volume of the given shape.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTensorShape` when `data.len()` is not the product of `shape`.
    pub fn new(shape: [usize; 5], data: Vec<F>) -> DeformConvResult<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(DeformConvError::InvalidTensorShape {
                tensor: "volume",
                expected: format!("{expected} elements for shape {shape:?}"),
                actual: format!("{} elements", data.len()),
            });
        }
        Ok(Self { shape, data })
    }

    /// A volume filled with zeros.
    pub fn zeros(shape: [usize; 5]) -> Self {
        Self {
            shape,
            data: vec![F::zero(); shape.iter().product()],
        }
    }

    /// Builds a volume by narrowing an `f64` accumulator buffer.
    pub(crate) fn from_f64(shape: [usize; 5], values: &[f64]) -> Self {
        debug_assert_eq!(values.len(), shape.iter().product::<usize>());
        Self {
            shape,
            data: values.iter().map(|&v| F::from_f64(v)).collect(),
        }
    }

    /// The five axis sizes.
    pub const fn shape(&self) -> [usize; 5] {
        self.shape
    }

    /// The `[T, H, W]` part of the shape.
    pub const fn spatial(&self) -> [usize; 3] {
        [self.shape[2], self.shape[3], self.shape[4]]
    }

    /// Number of elements in one `[T, H, W]` plane.
    pub fn plane_len(&self) -> usize {
        self.spatial().iter().product()
    }

    pub fn as_slice(&self) -> &[F] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [F] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<F> {
        self.data
    }

    /// Elements belonging to one batch entry.
    pub fn batch(&self, batch: usize) -> &[F] {
        let len = self.shape[1] * self.plane_len();
        &self.data[batch * len..(batch + 1) * len]
    }

    /// The `[T, H, W]` plane of one batch entry and channel.
    pub fn plane(&self, batch: usize, channel: usize) -> Plane<'_, F> {
        let len = self.plane_len();
        let start = (batch * self.shape[1] + channel) * len;
        Plane::new(&self.data[start..start + len], self.spatial())
    }

    /// Reads one element, or `None` when the index is out of bounds.
    pub fn get(&self, index: [usize; 5]) -> Option<F> {
        if index.iter().zip(self.shape).any(|(&i, n)| i >= n) {
            return None;
        }
        let [b, c, t, h, w] = index;
        let [_, channels, depth, height, width] = self.shape;
        let linear = (((b * channels + c) * depth + t) * height + h) * width + w;
        self.data.get(linear).copied()
    }

    /// Trilinearly samples channel `channel` of batch entry `batch` at a
    /// fractional `(t, h, w)` location with zero padding outside the volume.
    pub fn sample(&self, batch: usize, channel: usize, t: f64, h: f64, w: f64) -> f64 {
        self.plane(batch, channel).sample([t, h, w])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn volume_new_rejects_mismatched_length() {
        let err = Volume::<f32>::new([1, 2, 2, 2, 2], vec![0.0; 15]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn volume_get_follows_row_major_layout() {
        let data: Vec<f64> = (0..2 * 3 * 2 * 2 * 2).map(f64::from).collect();
        let volume = Volume::new([2, 3, 2, 2, 2], data).unwrap();

        assert_eq!(volume.get([0, 0, 0, 0, 1]), Some(1.0));
        assert_eq!(volume.get([0, 1, 0, 0, 0]), Some(8.0));
        assert_eq!(volume.get([1, 2, 1, 1, 1]), Some(47.0));
        assert_eq!(volume.get([2, 0, 0, 0, 0]), None);
    }

    #[test]
    fn plane_views_span_exactly_one_channel() {
        let data: Vec<f64> = (0..2 * 3 * 8).map(f64::from).collect();
        let volume = Volume::new([2, 3, 2, 2, 2], data).unwrap();
        let plane = volume.plane(1, 2);

        assert_eq!(plane.dims(), [2, 2, 2]);
        assert_eq!(plane.sample([0.0, 0.0, 0.0]), 40.0);
        assert_eq!(plane.sample([1.0, 1.0, 1.0]), 47.0);
        // past the last element of the channel, not into the next one
        assert_eq!(plane.sample([2.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn volume_sample_on_lattice_reads_element() {
        let data: Vec<f64> = (0..27).map(f64::from).collect();
        let volume = Volume::new([1, 1, 3, 3, 3], data).unwrap();

        assert_eq!(volume.sample(0, 0, 1.0, 2.0, 0.0), 15.0);
        assert_eq!(volume.sample(0, 0, 1.0, 2.0, 0.5), 15.5);
    }
}
