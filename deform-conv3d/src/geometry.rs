//! Shape validation and index bookkeeping shared by both passes.

use crate::{
    element::Element,
    error::{DeformConvError, DeformConvResult},
    options::{conv_output_size, DeformConv3dOptions, DimensionMask},
    volume::Volume,
};

/// Sizes and group layout of one deformable convolution call.
///
/// Built by [`ConvGeometry::infer`], which checks every operand against the
/// options before anything is computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub input: [usize; 3],
    pub output: [usize; 3],
    pub kernel: [usize; 3],
    pub stride: [usize; 3],
    pub padding: [usize; 3],
    pub dilation: [usize; 3],
    pub groups: usize,
    pub deformable_groups: usize,
    pub dimension: DimensionMask,
    pub modulated: bool,
}

impl ConvGeometry {
    /// Validates the operands of a forward call and derives the geometry.
    ///
    /// # Errors
    ///
    /// - `InvalidConfiguration` for zero strides, dilations or group counts.
    /// - `InvalidGrouping` when channel counts are not divisible by the groups.
    /// - `InvalidTensorShape` for any operand whose shape disagrees.
    pub fn infer<F: Element>(
        input: &Volume<F>,
        offset: &Volume<F>,
        weight: &Volume<F>,
        modulation: Option<&Volume<F>>,
        bias: Option<&[F]>,
        options: &DeformConv3dOptions,
    ) -> DeformConvResult<Self> {
        options.validate()?;

        let [batch, in_channels, in_t, in_h, in_w] = input.shape();
        let [out_channels, weight_in, k_t, k_h, k_w] = weight.shape();
        let kernel = [k_t, k_h, k_w];
        let groups = options.groups;
        let deformable_groups = options.deformable_groups;

        if kernel.contains(&0) || out_channels == 0 {
            return Err(DeformConvError::shape(
                "weight",
                "[out_channels > 0, in_channels / groups, kT > 0, kH > 0, kW > 0]",
                &weight.shape(),
            ));
        }
        if [in_t, in_h, in_w].contains(&0) {
            return Err(DeformConvError::shape(
                "input",
                "[batch, in_channels, T > 0, H > 0, W > 0]",
                &input.shape(),
            ));
        }
        if in_channels == 0 || in_channels % groups != 0 {
            return Err(DeformConvError::InvalidGrouping {
                reason: format!(
                    "input channels ({in_channels}) must be a positive multiple of groups ({groups})"
                ),
            });
        }
        if out_channels % groups != 0 {
            return Err(DeformConvError::InvalidGrouping {
                reason: format!(
                    "output channels ({out_channels}) must be divisible by groups ({groups})"
                ),
            });
        }
        if in_channels % deformable_groups != 0 {
            return Err(DeformConvError::InvalidGrouping {
                reason: format!(
                    "input channels ({in_channels}) must be divisible by deformable groups \
                     ({deformable_groups})"
                ),
            });
        }
        if weight_in * groups != in_channels {
            return Err(DeformConvError::shape(
                "weight",
                format!(
                    "[{out_channels}, {}, {k_t}, {k_h}, {k_w}]",
                    in_channels / groups
                ),
                &weight.shape(),
            ));
        }

        let input_spatial = [in_t, in_h, in_w];
        let mut output = [0; 3];
        for axis in 0..3 {
            output[axis] = conv_output_size(
                input_spatial[axis],
                kernel[axis],
                options.stride[axis],
                options.padding[axis],
                options.dilation[axis],
            )
            .ok_or_else(|| {
                DeformConvError::shape(
                    "input",
                    format!(
                        "spatial size large enough for kernel {kernel:?} with padding {:?} and \
                         dilation {:?}",
                        options.padding, options.dilation
                    ),
                    &input.shape(),
                )
            })?;
        }

        let geometry = Self {
            batch,
            in_channels,
            out_channels,
            input: input_spatial,
            output,
            kernel,
            stride: options.stride,
            padding: options.padding,
            dilation: options.dilation,
            groups,
            deformable_groups,
            dimension: options.dimension,
            modulated: modulation.is_some(),
        };

        let [out_t, out_h, out_w] = output;
        let offset_shape = [batch, geometry.offset_channels(), out_t, out_h, out_w];
        if offset.shape() != offset_shape {
            return Err(DeformConvError::shape(
                "offset",
                format!("{offset_shape:?}"),
                &offset.shape(),
            ));
        }
        if let Some(modulation) = modulation {
            let modulation_shape = [batch, geometry.modulation_channels(), out_t, out_h, out_w];
            if modulation.shape() != modulation_shape {
                return Err(DeformConvError::shape(
                    "modulation",
                    format!("{modulation_shape:?}"),
                    &modulation.shape(),
                ));
            }
        }
        if let Some(bias) = bias {
            if bias.len() != out_channels {
                return Err(DeformConvError::shape(
                    "bias",
                    format!("[{out_channels}]"),
                    &[bias.len()],
                ));
            }
        }

        Ok(geometry)
    }

    /// Checks that an upstream gradient matches the output of this geometry.
    pub fn check_output_grad<F: Element>(&self, output_grad: &Volume<F>) -> DeformConvResult<()> {
        let expected = self.output_shape();
        if output_grad.shape() != expected {
            return Err(DeformConvError::shape(
                "output gradient",
                format!("{expected:?}"),
                &output_grad.shape(),
            ));
        }
        Ok(())
    }

    /// Kernel taps, `kT * kH * kW`.
    pub fn taps(&self) -> usize {
        self.kernel.iter().product()
    }

    pub fn in_plane(&self) -> usize {
        self.input.iter().product()
    }

    pub fn out_plane(&self) -> usize {
        self.output.iter().product()
    }

    pub const fn output_shape(&self) -> [usize; 5] {
        let [t, h, w] = self.output;
        [self.batch, self.out_channels, t, h, w]
    }

    pub fn weight_shape(&self) -> [usize; 5] {
        let [k_t, k_h, k_w] = self.kernel;
        [self.out_channels, self.in_per_group(), k_t, k_h, k_w]
    }

    /// Channels of the offset field: `taps * |dimension| * deformable_groups`.
    pub fn offset_channels(&self) -> usize {
        self.deformable_groups * self.taps() * self.dimension.count()
    }

    /// Channels of the modulation field: `taps * deformable_groups`.
    pub fn modulation_channels(&self) -> usize {
        self.deformable_groups * self.taps()
    }

    pub fn in_per_group(&self) -> usize {
        self.in_channels / self.groups
    }

    pub fn out_per_group(&self) -> usize {
        self.out_channels / self.groups
    }

    /// Deformable group that owns input channel `channel`.
    pub fn deformable_group_of(&self, channel: usize) -> usize {
        channel / (self.in_channels / self.deformable_groups)
    }

    /// Input channels sharing the offsets of deformable group `group`.
    pub fn deformable_group_channels(&self, group: usize) -> core::ops::Range<usize> {
        let per_group = self.in_channels / self.deformable_groups;
        group * per_group..(group + 1) * per_group
    }

    /// `[kt, kh, kw]` position of linear tap `tap`.
    pub fn kernel_position(&self, tap: usize) -> [usize; 3] {
        let [_, k_h, k_w] = self.kernel;
        [tap / (k_h * k_w), (tap / k_w) % k_h, tap % k_w]
    }

    /// `[t, h, w]` position of linear output index `position`.
    pub fn output_position(&self, position: usize) -> [usize; 3] {
        let [_, out_h, out_w] = self.output;
        [
            position / (out_h * out_w),
            (position / out_w) % out_h,
            position % out_w,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn operands(
        in_channels: usize,
        weight_in: usize,
        offset_channels: usize,
    ) -> (Volume<f32>, Volume<f32>, Volume<f32>) {
        (
            Volume::zeros([2, in_channels, 16, 16, 16]),
            Volume::zeros([8, weight_in, 2, 2, 2]),
            Volume::zeros([2, offset_channels, 17, 17, 17]),
        )
    }

    fn options(mask: &str) -> DeformConv3dOptions {
        DeformConv3dOptions {
            padding: [1; 3],
            dimension: DimensionMask::parse(mask).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn infer_reference_scenario_full_mask() {
        let (input, weight, offset) = operands(8, 8, 24);
        let geometry =
            ConvGeometry::infer(&input, &offset, &weight, None, None, &options("THW")).unwrap();

        assert_eq!(geometry.output, [17, 17, 17]);
        assert_eq!(geometry.offset_channels(), 24);
        assert_eq!(geometry.output_shape(), [2, 8, 17, 17, 17]);
    }

    #[test]
    fn infer_reference_scenario_two_axis_mask() {
        let (input, weight, offset) = operands(8, 8, 16);
        let geometry =
            ConvGeometry::infer(&input, &offset, &weight, None, None, &options("HW")).unwrap();

        assert_eq!(geometry.offset_channels(), 16);
    }

    #[test]
    fn infer_rejects_offset_channel_mismatch() {
        let (input, weight, offset) = operands(8, 8, 24);
        let err =
            ConvGeometry::infer(&input, &offset, &weight, None, None, &options("TW")).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn infer_rejects_indivisible_groups() {
        let (input, weight, offset) = operands(8, 8, 24);
        let options = DeformConv3dOptions {
            groups: 3,
            ..options("THW")
        };
        let err = ConvGeometry::infer(&input, &offset, &weight, None, None, &options).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Domain);
    }

    #[test]
    fn infer_rejects_weight_channel_mismatch() {
        let (input, weight, offset) = operands(8, 4, 24);
        let err =
            ConvGeometry::infer(&input, &offset, &weight, None, None, &options("THW")).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn infer_rejects_modulation_and_bias_mismatch() {
        let (input, weight, offset) = operands(8, 8, 24);
        let modulation = Volume::zeros([2, 7, 17, 17, 17]);
        let err = ConvGeometry::infer(
            &input,
            &offset,
            &weight,
            Some(&modulation),
            None,
            &options("THW"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);

        let bias = vec![0.0f32; 3];
        let err = ConvGeometry::infer(
            &input,
            &offset,
            &weight,
            None,
            Some(&bias),
            &options("THW"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn empty_input_extent_is_rejected_by_both_passes() {
        // padding alone would give a non-empty output along T
        let input = Volume::<f64>::zeros([1, 1, 0, 1, 1]);
        let weight = Volume::zeros([1, 1, 1, 1, 1]);
        let offset = Volume::zeros([1, 3, 2, 1, 1]);
        let output_grad = Volume::zeros([1, 1, 2, 1, 1]);
        let options = DeformConv3dOptions {
            padding: [1, 0, 0],
            ..Default::default()
        };

        let err = crate::deform_conv3d(&input, &offset, &weight, None, None, &options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);

        let err = crate::deform_conv3d_backward(
            &input,
            &offset,
            &weight,
            None,
            None,
            &output_grad,
            &options,
        )
        .unwrap_err();
        match err {
            DeformConvError::InvalidTensorShape { tensor, .. } => assert_eq!(tensor, "input"),
            other => panic!("Expected InvalidTensorShape error, got {other:?}"),
        }
    }

    #[test]
    fn positions_decompose_row_major() {
        let (input, weight, offset) = operands(8, 8, 24);
        let geometry =
            ConvGeometry::infer(&input, &offset, &weight, None, None, &options("THW")).unwrap();

        assert_eq!(geometry.kernel_position(5), [1, 0, 1]);
        assert_eq!(geometry.output_position(17 * 17 + 18), [1, 1, 1]);
    }
}
