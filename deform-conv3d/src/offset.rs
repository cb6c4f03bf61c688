//! # Offset Field Evaluator
//!
//! Turns the learned offset and modulation fields of one batch entry into
//! per-tap sampling coordinates and modulation scalars.
//!
//! Layout of the offset field for one output position: deformable group
//! major, then kernel tap, then the deformed axes in mask order. The
//! modulation field holds one pre-activation logit per group and tap.

use crate::{element::Element, geometry::ConvGeometry};

#[inline]
pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Offsets and modulation logits of a single batch entry.
#[derive(Debug, Clone, Copy)]
pub struct OffsetField<'a, F> {
    geometry: &'a ConvGeometry,
    offset: &'a [F],
    modulation: Option<&'a [F]>,
}

impl<'a, F: Element> OffsetField<'a, F> {
    /// `offset` and `modulation` are the batch-entry slices of the full fields.
    pub fn new(geometry: &'a ConvGeometry, offset: &'a [F], modulation: Option<&'a [F]>) -> Self {
        debug_assert_eq!(
            offset.len(),
            geometry.offset_channels() * geometry.out_plane()
        );
        Self {
            geometry,
            offset,
            modulation,
        }
    }

    /// Channel of the offset field carrying slot `slot` of `tap` in `group`.
    pub fn offset_channel(&self, group: usize, tap: usize, slot: usize) -> usize {
        (group * self.geometry.taps() + tap) * self.geometry.dimension.count() + slot
    }

    /// Undeformed kernel grid coordinate of `tap` for output `position`.
    pub fn base_coordinate(&self, position: usize, tap: usize) -> [f64; 3] {
        let g = self.geometry;
        let out = g.output_position(position);
        let k = g.kernel_position(tap);
        [0, 1, 2].map(|axis| {
            (out[axis] * g.stride[axis] + k[axis] * g.dilation[axis]) as f64
                - g.padding[axis] as f64
        })
    }

    /// Sampling coordinate `[t, h, w]` of `tap` at output `position` for the
    /// channels of deformable group `group`.
    ///
    /// Axes outside the dimension mask stay on the kernel grid.
    pub fn resolve_tap_coordinate(&self, position: usize, tap: usize, group: usize) -> [f64; 3] {
        let mut coord = self.base_coordinate(position, tap);
        let plane = self.geometry.out_plane();
        for (slot, axis) in self.geometry.dimension.axes().iter().enumerate() {
            let channel = self.offset_channel(group, tap, slot);
            coord[axis.index()] += self.offset[channel * plane + position].as_f64();
        }
        coord
    }

    /// Stored pre-activation modulation of `tap`, if modulation is enabled.
    pub fn modulation_logit(&self, position: usize, tap: usize, group: usize) -> Option<f64> {
        let plane = self.geometry.out_plane();
        self.modulation.map(|modulation| {
            let channel = group * self.geometry.taps() + tap;
            modulation[channel * plane + position].as_f64()
        })
    }

    /// Modulation scalar in `[0, 1]`, or `1.0` when modulation is disabled.
    pub fn modulation(&self, position: usize, tap: usize, group: usize) -> f64 {
        self.modulation_logit(position, tap, group)
            .map_or(1.0, sigmoid)
    }
}
