use burn::prelude::*;
use deform_conv3d::{conv_output_size, DeformConvError, DeformConvResult};

use crate::deform_conv::{DeformConv3d, DeformConv3dGrads};

/// Deformable 3D convolution that predicts its own offsets.
///
/// `conv_offset` is a regular 3D convolution over the input (a deformable
/// convolution driven by an all-zero offset field) whose output channels are
/// the offsets followed, when modulation is enabled, by the modulation
/// logits. `conv` consumes them.
///
/// Should be created with [init_pack](crate::DeformConv3dConfig::init_pack).
#[derive(Module, Debug)]
pub struct DeformConv3dPack<B: Backend> {
    /// Generates `[offset ; modulation logits]` from the input.
    pub conv_offset: DeformConv3d<B>,
    /// The main deformable convolution.
    pub conv: DeformConv3d<B>,
    pub(crate) offset_channels: usize,
}

/// Gradients of [`DeformConv3dPack`].
#[derive(Debug, Clone)]
pub struct DeformConv3dPackGrads<B: Backend> {
    /// Total input gradient: through `conv` directly and through the
    /// generated offsets.
    pub input: Tensor<B, 5>,
    /// Gradients of the main convolution given the generated offsets.
    pub conv: DeformConv3dGrads<B>,
    /// Gradients of the offset generator.
    pub conv_offset: DeformConv3dGrads<B>,
}

impl<B: Backend> DeformConv3dPack<B> {
    /// Applies the forward pass on the input tensor.
    ///
    /// # Shapes
    ///
    /// - input: `[batch, in_channels, T, H, W]`
    /// - output: `[batch, out_channels, T_out, H_out, W_out]`
    pub fn forward(&self, input: Tensor<B, 5>) -> DeformConvResult<Tensor<B, 5>> {
        let (offset, modulation) = self.generate(input.clone())?;
        self.conv.forward(input, offset, modulation)
    }

    /// Offsets and modulation logits predicted for `input`.
    pub fn generate(
        &self,
        input: Tensor<B, 5>,
    ) -> DeformConvResult<(Tensor<B, 5>, Option<Tensor<B, 5>>)> {
        let idle = self.idle_offset(&input)?;
        let generated = self.conv_offset.forward(input, idle, None)?;
        Ok(self.split(generated))
    }

    /// Back-propagates dLoss/dOutput through `conv`, then through the offset
    /// generator, and sums both contributions to the input gradient.
    pub fn backward(
        &self,
        input: Tensor<B, 5>,
        output_grad: Tensor<B, 5>,
    ) -> DeformConvResult<DeformConv3dPackGrads<B>> {
        let idle = self.idle_offset(&input)?;
        let generated = self
            .conv_offset
            .forward(input.clone(), idle.clone(), None)?;
        let (offset, modulation) = self.split(generated);

        let conv = self
            .conv
            .backward(input.clone(), offset, modulation, output_grad)?;
        let generated_grad = match &conv.modulation {
            Some(modulation) => Tensor::cat(vec![conv.offset.clone(), modulation.clone()], 1),
            None => conv.offset.clone(),
        };
        let conv_offset = self
            .conv_offset
            .backward(input, idle, None, generated_grad)?;

        Ok(DeformConv3dPackGrads {
            input: conv.input.clone() + conv_offset.input.clone(),
            conv,
            conv_offset,
        })
    }

    /// Runs the forward pass, hands the output to `upstream` for dLoss/dOutput,
    /// and back-propagates it.
    pub fn forward_backward(
        &self,
        input: Tensor<B, 5>,
        upstream: impl FnOnce(&Tensor<B, 5>) -> Tensor<B, 5>,
    ) -> DeformConvResult<(Tensor<B, 5>, DeformConv3dPackGrads<B>)> {
        let output = self.forward(input.clone())?;
        let output_grad = upstream(&output);
        let grads = self.backward(input, output_grad)?;
        Ok((output, grads))
    }

    fn split(&self, generated: Tensor<B, 5>) -> (Tensor<B, 5>, Option<Tensor<B, 5>>) {
        let channels = generated.dims()[1];
        if self.conv.is_modulated() {
            let offset = generated.clone().narrow(1, 0, self.offset_channels);
            let modulation =
                generated.narrow(1, self.offset_channels, channels - self.offset_channels);
            (offset, Some(modulation))
        } else {
            (generated, None)
        }
    }

    /// All-zero full-mask offset field that turns `conv_offset` into a plain convolution.
    fn idle_offset(&self, input: &Tensor<B, 5>) -> DeformConvResult<Tensor<B, 5>> {
        let [batch, _, t, h, w] = input.dims();
        let [_, _, k_t, k_h, k_w] = self.conv_offset.weight.dims();
        let options = self.conv_offset.options();

        let spatial = [t, h, w];
        let kernel = [k_t, k_h, k_w];
        let mut out = [0; 3];
        for axis in 0..3 {
            out[axis] = conv_output_size(
                spatial[axis],
                kernel[axis],
                options.stride[axis],
                options.padding[axis],
                options.dilation[axis],
            )
            .ok_or_else(|| DeformConvError::InvalidTensorShape {
                tensor: "input",
                expected: format!("spatial size covering kernel {kernel:?}"),
                actual: format!("{:?}", input.dims()),
            })?;
        }

        let channels = kernel.iter().product::<usize>() * options.dimension.count();
        Ok(Tensor::zeros(
            [batch, channels, out[0], out[1], out[2]],
            &input.device(),
        ))
    }
}
