//! # Forward Convolution Engine
//!
//! Each batch entry is processed in two parallel stages: a deformable
//! im2col that samples every `(input channel, tap)` row at its resolved
//! coordinates, then one accumulation per output channel plane over the
//! rows of its weight group.

use rayon::prelude::*;

use crate::{
    element::Element, error::DeformConvResult, geometry::ConvGeometry, offset::OffsetField,
    options::DeformConv3dOptions, volume::Volume,
};

/// Three dimensional deformable convolution.
///
/// # Shapes
///
/// input:      `[batch, in_channels, T, H, W]`,
/// offset:     `[batch, deformable_groups * taps * |dimension|, T_out, H_out, W_out]`,
/// weight:     `[out_channels, in_channels / groups, kT, kH, kW]`,
/// modulation: `[batch, deformable_groups * taps, T_out, H_out, W_out]` (pre-sigmoid),
/// bias:       `[out_channels]`.
///
/// # Errors
///
/// Fails before computing anything when an operand disagrees with the
/// options or with the other operands; see [`ConvGeometry::infer`].
pub fn deform_conv3d<F: Element>(
    input: &Volume<F>,
    offset: &Volume<F>,
    weight: &Volume<F>,
    modulation: Option<&Volume<F>>,
    bias: Option<&[F]>,
    options: &DeformConv3dOptions,
) -> DeformConvResult<Volume<F>> {
    let geometry = ConvGeometry::infer(input, offset, weight, modulation, bias, options)?;
    tracing::debug!(
        batch = geometry.batch,
        in_channels = geometry.in_channels,
        out_channels = geometry.out_channels,
        output = ?geometry.output,
        dimension = %geometry.dimension,
        modulated = geometry.modulated,
        "deform_conv3d forward",
    );

    let plane = geometry.out_plane();
    let per_batch = geometry.out_channels * plane;
    let mut output = vec![0.0; geometry.batch * per_batch];

    for (batch, out_batch) in output.chunks_mut(per_batch).enumerate() {
        let field = OffsetField::new(
            &geometry,
            offset.batch(batch),
            modulation.map(|m| m.batch(batch)),
        );
        let columns = deformable_columns(input, batch, &geometry, &field);

        out_batch
            .par_chunks_mut(plane)
            .enumerate()
            .for_each(|(out_channel, out_plane)| {
                if let Some(bias) = bias {
                    out_plane.fill(bias[out_channel].as_f64());
                }
                accumulate_output_plane(&geometry, weight, &columns, out_channel, out_plane);
            });
    }

    Ok(Volume::from_f64(geometry.output_shape(), &output))
}

/// Samples the modulated input for every `(channel, tap)` row of one batch
/// entry. Row `channel * taps + tap` holds one value per output position.
pub(crate) fn deformable_columns<F: Element>(
    input: &Volume<F>,
    batch: usize,
    geometry: &ConvGeometry,
    field: &OffsetField<'_, F>,
) -> Vec<f64> {
    let taps = geometry.taps();
    let plane = geometry.out_plane();
    let mut columns = vec![0.0; geometry.in_channels * taps * plane];

    columns
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(row, column)| {
            let (channel, tap) = (row / taps, row % taps);
            let group = geometry.deformable_group_of(channel);
            let source = input.plane(batch, channel);
            for (position, value) in column.iter_mut().enumerate() {
                let coord = field.resolve_tap_coordinate(position, tap, group);
                let sampled = source.sample(coord);
                if sampled != 0.0 {
                    *value = field.modulation(position, tap, group) * sampled;
                }
            }
        });

    columns
}

fn accumulate_output_plane<F: Element>(
    geometry: &ConvGeometry,
    weight: &Volume<F>,
    columns: &[f64],
    out_channel: usize,
    out_plane: &mut [f64],
) {
    let taps = geometry.taps();
    let plane = geometry.out_plane();
    let in_per_group = geometry.in_per_group();
    let group = out_channel / geometry.out_per_group();
    let weight = weight.as_slice();

    for local in 0..in_per_group {
        let channel = group * in_per_group + local;
        for tap in 0..taps {
            let w = weight[(out_channel * in_per_group + local) * taps + tap].as_f64();
            if w == 0.0 {
                continue;
            }
            let row = &columns[(channel * taps + tap) * plane..][..plane];
            out_plane
                .iter_mut()
                .zip(row)
                .for_each(|(out, &sample)| *out += w * sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, options::DimensionMask};

    #[test]
    fn single_tap_with_offset_shifts_input() {
        // 1x1x1 kernel: output is the input sampled at the offset location.
        let input = Volume::new([1, 1, 1, 1, 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let weight = Volume::new([1, 1, 1, 1, 1], vec![1.0]).unwrap();
        let offset = Volume::new([1, 1, 1, 1, 4], vec![0.5, 0.5, 0.5, 0.5]).unwrap();
        let options =
            DeformConv3dOptions::default().with_dimension(DimensionMask::parse("W").unwrap());

        let output = deform_conv3d(&input, &offset, &weight, None, None, &options).unwrap();

        assert_eq!(output.shape(), [1, 1, 1, 1, 4]);
        assert_eq!(output.as_slice(), &[1.5, 2.5, 3.5, 2.0]);
    }

    #[test]
    fn modulation_and_bias_scale_and_shift() {
        let input = Volume::new([1, 1, 1, 1, 2], vec![2.0, 4.0]).unwrap();
        let weight = Volume::new([1, 1, 1, 1, 1], vec![3.0]).unwrap();
        let offset = Volume::zeros([1, 3, 1, 1, 2]);
        // sigmoid(0) = 0.5
        let modulation = Volume::zeros([1, 1, 1, 1, 2]);
        let bias = vec![1.0];

        let output = deform_conv3d(
            &input,
            &offset,
            &weight,
            Some(&modulation),
            Some(bias.as_slice()),
            &DeformConv3dOptions::default(),
        )
        .unwrap();

        assert_eq!(output.as_slice(), &[4.0, 7.0]);
    }

    #[test]
    fn grouped_weights_only_see_their_channels() {
        // Two groups, one channel each: out0 reads in0, out1 reads in1.
        let input = Volume::new([1, 2, 1, 1, 1], vec![5.0, 7.0]).unwrap();
        let weight = Volume::new([2, 1, 1, 1, 1], vec![1.0, 10.0]).unwrap();
        let offset = Volume::zeros([1, 6, 1, 1, 1]);
        let options = DeformConv3dOptions {
            groups: 2,
            deformable_groups: 2,
            ..Default::default()
        };

        let output = deform_conv3d(&input, &offset, &weight, None, None, &options).unwrap();

        assert_eq!(output.as_slice(), &[5.0, 70.0]);
    }

    #[test]
    fn invalid_operands_fail_before_computing() {
        let input = Volume::<f32>::zeros([1, 3, 4, 4, 4]);
        let weight = Volume::zeros([2, 3, 3, 3, 3]);
        let offset = Volume::zeros([1, 81, 2, 2, 2]);
        let options = DeformConv3dOptions {
            deformable_groups: 2,
            ..Default::default()
        };

        let err = deform_conv3d(&input, &offset, &weight, None, None, &options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Domain);
    }
}
