//! # Backward Convolution Engine
//!
//! Gradients of [`deform_conv3d`](crate::deform_conv3d) with respect to the
//! input, offset, modulation, weight and bias.
//!
//! Scatter targets shared between output positions are partitioned so that
//! every parallel task owns its slice: the input gradient by input channel,
//! the weight gradient by output channel, and the offset and modulation
//! gradients by `(deformable group, tap)`. Partial results of successive
//! batch entries are reduced sequentially into `f64` accumulators.

use rayon::prelude::*;

use crate::{
    element::Element,
    error::DeformConvResult,
    forward::deformable_columns,
    geometry::ConvGeometry,
    offset::{sigmoid, OffsetField},
    options::DeformConv3dOptions,
    sampler::PlaneMut,
    volume::Volume,
};

/// Gradients computed by [`deform_conv3d_backward`].
#[derive(Debug, Clone)]
pub struct DeformConv3dBackward<F> {
    /// Input gradient, shaped like the input.
    pub input_grad: Volume<F>,

    /// Offset gradient, shaped like the offset field.
    pub offset_grad: Volume<F>,

    /// Weight gradient, shaped like the weight.
    pub weight_grad: Volume<F>,

    /// Gradient of the pre-sigmoid modulation, when modulation was supplied.
    pub modulation_grad: Option<Volume<F>>,

    /// Bias gradient, when a bias was supplied.
    pub bias_grad: Option<Vec<F>>,
}

/// Backward pass of [`deform_conv3d`](crate::deform_conv3d).
///
/// Must be called with the operands and options of the paired forward call;
/// nothing is cached between the two.
///
/// # Errors
///
/// Same validation as the forward pass, plus `InvalidTensorShape` when
/// `output_grad` does not have the output shape.
pub fn deform_conv3d_backward<F: Element>(
    input: &Volume<F>,
    offset: &Volume<F>,
    weight: &Volume<F>,
    modulation: Option<&Volume<F>>,
    bias: Option<&[F]>,
    output_grad: &Volume<F>,
    options: &DeformConv3dOptions,
) -> DeformConvResult<DeformConv3dBackward<F>> {
    let geometry = ConvGeometry::infer(input, offset, weight, modulation, bias, options)?;
    geometry.check_output_grad(output_grad)?;
    tracing::debug!(
        batch = geometry.batch,
        in_channels = geometry.in_channels,
        out_channels = geometry.out_channels,
        output = ?geometry.output,
        dimension = %geometry.dimension,
        modulated = geometry.modulated,
        "deform_conv3d backward",
    );

    let plane = geometry.out_plane();
    let input_len = geometry.in_channels * geometry.in_plane();
    let offset_len = geometry.offset_channels() * plane;
    let modulation_len = geometry.modulation_channels() * plane;

    let mut input_grad = vec![0.0; geometry.batch * input_len];
    let mut offset_grad = vec![0.0; geometry.batch * offset_len];
    let mut modulation_grad = geometry
        .modulated
        .then(|| vec![0.0; geometry.batch * modulation_len]);
    let mut weight_grad = vec![0.0; weight.as_slice().len()];

    for batch in 0..geometry.batch {
        let field = OffsetField::new(
            &geometry,
            offset.batch(batch),
            modulation.map(|m| m.batch(batch)),
        );
        let grad_out = output_grad.batch(batch);
        let columns = deformable_columns(input, batch, &geometry, &field);
        let grad_columns = column_gradient(&geometry, weight, grad_out);

        accumulate_weight_grad(&geometry, &columns, grad_out, &mut weight_grad);
        scatter_input_grad(
            &geometry,
            &field,
            &grad_columns,
            &mut input_grad[batch * input_len..(batch + 1) * input_len],
        );

        let rows = coordinate_gradient(input, batch, &geometry, &field, &grad_columns);
        let offset_rows = geometry.dimension.count() * plane;
        let offset_batch = &mut offset_grad[batch * offset_len..(batch + 1) * offset_len];
        for (row, (offsets, _)) in rows.iter().enumerate() {
            offset_batch[row * offset_rows..(row + 1) * offset_rows].copy_from_slice(offsets);
        }
        if let Some(modulation_grad) = modulation_grad.as_mut() {
            let modulation_batch =
                &mut modulation_grad[batch * modulation_len..(batch + 1) * modulation_len];
            for (row, (_, logits)) in rows.iter().enumerate() {
                modulation_batch[row * plane..(row + 1) * plane].copy_from_slice(logits);
            }
        }
    }

    let bias_grad = bias.map(|_| {
        (0..geometry.out_channels)
            .map(|out_channel| {
                let sum: f64 = (0..geometry.batch)
                    .flat_map(|batch| {
                        let start = (batch * geometry.out_channels + out_channel) * plane;
                        &output_grad.as_slice()[start..start + plane]
                    })
                    .map(|g| g.as_f64())
                    .sum();
                F::from_f64(sum)
            })
            .collect()
    });

    let [out_t, out_h, out_w] = geometry.output;
    let [in_t, in_h, in_w] = geometry.input;
    Ok(DeformConv3dBackward {
        input_grad: Volume::from_f64(
            [geometry.batch, geometry.in_channels, in_t, in_h, in_w],
            &input_grad,
        ),
        offset_grad: Volume::from_f64(
            [
                geometry.batch,
                geometry.offset_channels(),
                out_t,
                out_h,
                out_w,
            ],
            &offset_grad,
        ),
        weight_grad: Volume::from_f64(geometry.weight_shape(), &weight_grad),
        modulation_grad: modulation_grad.map(|values| {
            Volume::from_f64(
                [
                    geometry.batch,
                    geometry.modulation_channels(),
                    out_t,
                    out_h,
                    out_w,
                ],
                &values,
            )
        }),
        bias_grad,
    })
}

/// Gradient of the loss with respect to the deformable columns of one batch
/// entry: `sum over out channels of weight * grad_output`, per row.
fn column_gradient<F: Element>(
    geometry: &ConvGeometry,
    weight: &Volume<F>,
    grad_out: &[F],
) -> Vec<f64> {
    let taps = geometry.taps();
    let plane = geometry.out_plane();
    let in_per_group = geometry.in_per_group();
    let out_per_group = geometry.out_per_group();
    let weight = weight.as_slice();
    let mut grad_columns = vec![0.0; geometry.in_channels * taps * plane];

    grad_columns
        .par_chunks_mut(plane)
        .enumerate()
        .for_each(|(row, column)| {
            let (channel, tap) = (row / taps, row % taps);
            let (group, local) = (channel / in_per_group, channel % in_per_group);
            for out_channel in group * out_per_group..(group + 1) * out_per_group {
                let w = weight[(out_channel * in_per_group + local) * taps + tap].as_f64();
                if w == 0.0 {
                    continue;
                }
                let grad = &grad_out[out_channel * plane..(out_channel + 1) * plane];
                column
                    .iter_mut()
                    .zip(grad)
                    .for_each(|(c, g)| *c += w * g.as_f64());
            }
        });

    grad_columns
}

fn accumulate_weight_grad<F: Element>(
    geometry: &ConvGeometry,
    columns: &[f64],
    grad_out: &[F],
    weight_grad: &mut [f64],
) {
    let taps = geometry.taps();
    let plane = geometry.out_plane();
    let in_per_group = geometry.in_per_group();
    let out_per_group = geometry.out_per_group();

    weight_grad
        .par_chunks_mut(in_per_group * taps)
        .enumerate()
        .for_each(|(out_channel, filter)| {
            let group = out_channel / out_per_group;
            let grad = &grad_out[out_channel * plane..(out_channel + 1) * plane];
            for (index, value) in filter.iter_mut().enumerate() {
                let (local, tap) = (index / taps, index % taps);
                let channel = group * in_per_group + local;
                let row = &columns[(channel * taps + tap) * plane..][..plane];
                *value += row
                    .iter()
                    .zip(grad)
                    .map(|(c, g)| c * g.as_f64())
                    .sum::<f64>();
            }
        });
}

/// Scatters the column gradient of one batch entry back onto the input
/// lattice. `input_grad` is that entry's slice, one plane per channel.
fn scatter_input_grad<F: Element>(
    geometry: &ConvGeometry,
    field: &OffsetField<'_, F>,
    grad_columns: &[f64],
    input_grad: &mut [f64],
) {
    let taps = geometry.taps();
    let plane = geometry.out_plane();

    input_grad
        .par_chunks_mut(geometry.in_plane())
        .enumerate()
        .for_each(|(channel, target)| {
            let group = geometry.deformable_group_of(channel);
            let mut target = PlaneMut::new(target, geometry.input);
            for tap in 0..taps {
                let row = &grad_columns[(channel * taps + tap) * plane..][..plane];
                for (position, &grad) in row.iter().enumerate() {
                    if grad == 0.0 {
                        continue;
                    }
                    let coord = field.resolve_tap_coordinate(position, tap, group);
                    let scale = field.modulation(position, tap, group);
                    target.scatter(coord, grad * scale);
                }
            }
        });
}

/// Offset and modulation gradients of one batch entry, one entry per
/// `(deformable group, tap)` row in field order. Each entry holds the
/// `|dimension| * plane` offset values and, when modulated, `plane`
/// modulation values.
fn coordinate_gradient<F: Element>(
    input: &Volume<F>,
    batch: usize,
    geometry: &ConvGeometry,
    field: &OffsetField<'_, F>,
    grad_columns: &[f64],
) -> Vec<(Vec<f64>, Vec<f64>)> {
    let taps = geometry.taps();
    let plane = geometry.out_plane();
    let axes = geometry.dimension.axes();

    (0..geometry.deformable_groups * taps)
        .into_par_iter()
        .map(|row| {
            let (group, tap) = (row / taps, row % taps);
            let mut offsets = vec![0.0; axes.len() * plane];
            let mut logits = vec![0.0; if geometry.modulated { plane } else { 0 }];

            for position in 0..plane {
                let coord = field.resolve_tap_coordinate(position, tap, group);
                let mut value_grad = 0.0;
                let mut coord_grad = [0.0; 3];
                for channel in geometry.deformable_group_channels(group) {
                    let grad = grad_columns[(channel * taps + tap) * plane + position];
                    if grad == 0.0 {
                        continue;
                    }
                    let (value, slope) = input.plane(batch, channel).sample_and_gradient(coord);
                    value_grad += grad * value;
                    for axis in 0..3 {
                        coord_grad[axis] += grad * slope[axis];
                    }
                }

                let scale = field.modulation(position, tap, group);
                for (slot, axis) in axes.iter().enumerate() {
                    offsets[slot * plane + position] = scale * coord_grad[axis.index()];
                }
                if let Some(logit) = field.modulation_logit(position, tap, group) {
                    let s = sigmoid(logit);
                    logits[position] = value_grad * s * (1.0 - s);
                }
            }

            (offsets, logits)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, forward::deform_conv3d, options::DimensionMask};

    #[test]
    fn single_tap_gradients_match_hand_derivation() {
        // out[w] = weight * sample(input, w + offset[w])
        let input = Volume::new([1, 1, 1, 1, 3], vec![1.0, 3.0, 7.0]).unwrap();
        let weight = Volume::new([1, 1, 1, 1, 1], vec![2.0]).unwrap();
        let offset = Volume::new([1, 1, 1, 1, 3], vec![0.25, 0.0, -0.5]).unwrap();
        let output_grad = Volume::new([1, 1, 1, 1, 3], vec![1.0, 1.0, 1.0]).unwrap();
        let options =
            DeformConv3dOptions::default().with_dimension(DimensionMask::parse("W").unwrap());

        let grads = deform_conv3d_backward(
            &input,
            &offset,
            &weight,
            None,
            None,
            &output_grad,
            &options,
        )
        .unwrap();

        // Samples at 0.25, 1.0 and 1.5: 1.5 + 3 + 5 = 9.5.
        assert_eq!(grads.weight_grad.as_slice(), &[9.5]);
        // Slopes 2, 0 (on the lattice) and 4, scaled by the weight.
        assert_eq!(grads.offset_grad.as_slice(), &[4.0, 0.0, 8.0]);
        // Weights 0.75/0.25 onto 0/1, 1 onto 1, 0.5/0.5 onto 1/2; times 2.
        assert_eq!(grads.input_grad.as_slice(), &[1.5, 3.5, 1.0]);
        assert!(grads.modulation_grad.is_none());
        assert!(grads.bias_grad.is_none());
    }

    #[test]
    fn bias_gradient_sums_batch_and_positions() {
        let input = Volume::<f64>::zeros([2, 1, 1, 2, 2]);
        let weight = Volume::zeros([2, 1, 1, 1, 1]);
        let offset = Volume::zeros([2, 3, 1, 2, 2]);
        let output_grad =
            Volume::new([2, 2, 1, 2, 2], (0..16).map(f64::from).collect()).unwrap();
        let bias = vec![0.0; 2];

        let grads = deform_conv3d_backward(
            &input,
            &offset,
            &weight,
            None,
            Some(bias.as_slice()),
            &output_grad,
            &DeformConv3dOptions::default(),
        )
        .unwrap();

        // channel 0: 0+1+2+3 + 8+9+10+11, channel 1: 4+5+6+7 + 12+13+14+15
        assert_eq!(grads.bias_grad, Some(vec![44.0, 76.0]));
    }

    #[test]
    fn backward_rejects_mismatched_output_grad() {
        let input = Volume::<f32>::zeros([1, 1, 3, 3, 3]);
        let weight = Volume::zeros([1, 1, 2, 2, 2]);
        let offset = Volume::zeros([1, 24, 2, 2, 2]);
        let output_grad = Volume::zeros([1, 1, 3, 3, 3]);

        let err = deform_conv3d_backward(
            &input,
            &offset,
            &weight,
            None,
            None,
            &output_grad,
            &DeformConv3dOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn zero_upstream_gradient_gives_zero_gradients() {
        let input = Volume::new([1, 1, 2, 2, 2], (1..=8).map(f64::from).collect()).unwrap();
        let weight = Volume::new([1, 1, 2, 2, 2], vec![0.5; 8]).unwrap();
        let offset = Volume::new([1, 24, 3, 3, 3], vec![0.3; 648]).unwrap();
        let modulation = Volume::zeros([1, 8, 3, 3, 3]);
        let options = DeformConv3dOptions {
            padding: [1; 3],
            ..Default::default()
        };
        let output = deform_conv3d(&input, &offset, &weight, Some(&modulation), None, &options)
            .unwrap();
        let output_grad = Volume::zeros(output.shape());

        let grads = deform_conv3d_backward(
            &input,
            &offset,
            &weight,
            Some(&modulation),
            None,
            &output_grad,
            &options,
        )
        .unwrap();

        assert!(grads.input_grad.as_slice().iter().all(|&g| g == 0.0));
        assert!(grads.offset_grad.as_slice().iter().all(|&g| g == 0.0));
        assert!(grads.weight_grad.as_slice().iter().all(|&g| g == 0.0));
        let modulation_grad = grads.modulation_grad.unwrap();
        assert_eq!(modulation_grad.shape(), [1, 8, 3, 3, 3]);
        assert!(modulation_grad.as_slice().iter().all(|&g| g == 0.0));
    }
}
