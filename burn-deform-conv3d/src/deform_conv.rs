use burn::{
    module::{Ignored, Param},
    prelude::*,
};
use deform_conv3d::{
    deform_conv3d, deform_conv3d_backward, DeformConv3dOptions, DeformConvError,
    DeformConvResult,
};

use crate::convert::{tensor_to_vec, tensor_to_volume, vec_to_tensor, volume_to_tensor};

/// Deformable 3D convolution with offsets supplied by the caller.
///
/// Covers both the full and the dimension-selective variant: the deformed
/// axes are fixed by the configured dimension mask.
///
/// Should be created with [DeformConv3dConfig](crate::DeformConv3dConfig).
#[derive(Module, Debug)]
pub struct DeformConv3d<B: Backend> {
    /// Tensor of shape `[out_channels, in_channels / groups, kT, kH, kW]`
    pub weight: Param<Tensor<B, 5>>,
    /// Tensor of shape `[out_channels]`
    pub bias: Option<Param<Tensor<B, 1>>>,
    pub(crate) options: Ignored<DeformConv3dOptions>,
    pub(crate) modulation: bool,
}

/// Gradients of a loss with respect to every operand of [`DeformConv3d`].
#[derive(Debug, Clone)]
pub struct DeformConv3dGrads<B: Backend> {
    pub input: Tensor<B, 5>,
    pub offset: Tensor<B, 5>,
    /// Gradient w.r.t. the modulation logits.
    pub modulation: Option<Tensor<B, 5>>,
    pub weight: Tensor<B, 5>,
    pub bias: Option<Tensor<B, 1>>,
}

impl<B: Backend> DeformConv3d<B> {
    /// Engine options of this layer.
    pub fn options(&self) -> &DeformConv3dOptions {
        &self.options.0
    }

    /// Whether the layer expects a modulation field.
    pub fn is_modulated(&self) -> bool {
        self.modulation
    }

    /// Applies the forward pass on the input tensor.
    ///
    /// # Shapes
    ///
    /// - input: `[batch, in_channels, T, H, W]`
    /// - offset: `[batch, deformable_groups * taps * |dimension|, T_out, H_out, W_out]`
    /// - modulation: `[batch, deformable_groups * taps, T_out, H_out, W_out]`, pre-sigmoid,
    ///   required exactly when the layer was configured with modulation
    /// - output: `[batch, out_channels, T_out, H_out, W_out]`
    pub fn forward(
        &self,
        input: Tensor<B, 5>,
        offset: Tensor<B, 5>,
        modulation: Option<Tensor<B, 5>>,
    ) -> DeformConvResult<Tensor<B, 5>> {
        self.check_modulation(modulation.as_ref())?;
        let device = input.device();

        let input = tensor_to_volume(input)?;
        let offset = tensor_to_volume(offset)?;
        let modulation = modulation.map(tensor_to_volume).transpose()?;
        let weight = tensor_to_volume(self.weight.val())?;
        let bias = self.bias_values()?;

        let output = deform_conv3d(
            &input,
            &offset,
            &weight,
            modulation.as_ref(),
            bias.as_deref(),
            self.options(),
        )?;

        Ok(volume_to_tensor(output, &device))
    }

    /// Computes the gradients of every operand given dLoss/dOutput.
    pub fn backward(
        &self,
        input: Tensor<B, 5>,
        offset: Tensor<B, 5>,
        modulation: Option<Tensor<B, 5>>,
        output_grad: Tensor<B, 5>,
    ) -> DeformConvResult<DeformConv3dGrads<B>> {
        self.check_modulation(modulation.as_ref())?;
        let device = input.device();

        let input = tensor_to_volume(input)?;
        let offset = tensor_to_volume(offset)?;
        let modulation = modulation.map(tensor_to_volume).transpose()?;
        let weight = tensor_to_volume(self.weight.val())?;
        let bias = self.bias_values()?;
        let output_grad = tensor_to_volume(output_grad)?;

        let grads = deform_conv3d_backward(
            &input,
            &offset,
            &weight,
            modulation.as_ref(),
            bias.as_deref(),
            &output_grad,
            self.options(),
        )?;

        Ok(DeformConv3dGrads {
            input: volume_to_tensor(grads.input_grad, &device),
            offset: volume_to_tensor(grads.offset_grad, &device),
            modulation: grads
                .modulation_grad
                .map(|grad| volume_to_tensor(grad, &device)),
            weight: volume_to_tensor(grads.weight_grad, &device),
            bias: grads.bias_grad.map(|grad| vec_to_tensor(grad, &device)),
        })
    }

    /// Runs the forward pass, hands the output to `upstream` for dLoss/dOutput,
    /// and back-propagates it.
    pub fn forward_backward(
        &self,
        input: Tensor<B, 5>,
        offset: Tensor<B, 5>,
        modulation: Option<Tensor<B, 5>>,
        upstream: impl FnOnce(&Tensor<B, 5>) -> Tensor<B, 5>,
    ) -> DeformConvResult<(Tensor<B, 5>, DeformConv3dGrads<B>)> {
        let output = self.forward(input.clone(), offset.clone(), modulation.clone())?;
        let output_grad = upstream(&output);
        let grads = self.backward(input, offset, modulation, output_grad)?;
        Ok((output, grads))
    }

    fn bias_values(&self) -> DeformConvResult<Option<Vec<f32>>> {
        self.bias
            .as_ref()
            .map(|bias| tensor_to_vec(bias.val()))
            .transpose()
    }

    fn check_modulation(&self, modulation: Option<&Tensor<B, 5>>) -> DeformConvResult<()> {
        match (self.modulation, modulation) {
            (true, None) => Err(DeformConvError::InvalidTensorShape {
                tensor: "modulation",
                expected: "a modulation tensor".to_string(),
                actual: "none".to_string(),
            }),
            (false, Some(tensor)) => Err(DeformConvError::InvalidTensorShape {
                tensor: "modulation",
                expected: "none (modulation disabled)".to_string(),
                actual: format!("{:?}", tensor.dims()),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeformConv3dConfig, TestBackend};
    use burn::tensor::{module::conv3d, ops::ConvOptions, Distribution};
    use deform_conv3d::ErrorKind;

    fn assert_close(actual: Tensor<TestBackend, 5>, expected: Tensor<TestBackend, 5>) {
        assert_eq!(actual.dims(), expected.dims());
        let actual = tensor_to_vec(actual).unwrap();
        let expected = tensor_to_vec(expected).unwrap();
        for (a, e) in actual.iter().zip(&expected) {
            assert!((a - e).abs() < 1e-4, "{a} vs {e}");
        }
    }

    #[test]
    fn zero_offsets_match_regular_conv3d() {
        let device = Default::default();
        let config = DeformConv3dConfig::new(4, 6, [3, 2, 2])
            .with_stride([2, 1, 1])
            .with_padding([1, 1, 0])
            .with_groups(2);
        let mut layer = config.init::<TestBackend>(&device).unwrap();
        layer.bias = Some(Param::from_tensor(Tensor::random(
            [6],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        )));

        let input = Tensor::<TestBackend, 5>::random(
            [2, 4, 5, 4, 4],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        // out = [3, 5, 3]
        let offset = Tensor::zeros([2, 36, 3, 5, 3], &device);

        let output = layer.forward(input.clone(), offset, None).unwrap();
        let expected = conv3d(
            input,
            layer.weight.val(),
            layer.bias.as_ref().map(Param::val),
            ConvOptions::new([2, 1, 1], [1, 1, 0], [1, 1, 1], 2),
        );

        assert_close(output, expected);
    }

    #[test]
    fn reference_scenarios_produce_expected_shapes() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 5>::random(
            [2, 8, 16, 16, 16],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        for (dimension, channels) in [("THW", 24), ("HW", 16)] {
            let layer = DeformConv3dConfig::new(8, 8, [2, 2, 2])
                .with_padding([1, 1, 1])
                .with_dimension(dimension.into())
                .init::<TestBackend>(&device)
                .unwrap();
            let offset = Tensor::random(
                [2, channels, 17, 17, 17],
                Distribution::Normal(0.0, 1.0),
                &device,
            );

            let output = layer.forward(input.clone(), offset, None).unwrap();
            assert_eq!(output.dims(), [2, 8, 17, 17, 17]);
        }
    }

    #[test]
    fn modulation_presence_must_match_configuration() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 5>::zeros([1, 2, 3, 3, 3], &device);
        let offset = Tensor::<TestBackend, 5>::zeros([1, 24, 2, 2, 2], &device);
        let modulation = Tensor::<TestBackend, 5>::zeros([1, 8, 2, 2, 2], &device);

        let plain = DeformConv3dConfig::new(2, 2, [2, 2, 2])
            .init::<TestBackend>(&device)
            .unwrap();
        let err = plain
            .forward(input.clone(), offset.clone(), Some(modulation.clone()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);

        let modulated = DeformConv3dConfig::new(2, 2, [2, 2, 2])
            .with_modulation(true)
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(modulated
            .forward(input.clone(), offset.clone(), None)
            .is_err());
        let output = modulated.forward(input, offset, Some(modulation)).unwrap();
        assert_eq!(output.dims(), [1, 2, 2, 2, 2]);
    }

    #[test]
    fn backward_returns_gradients_shaped_like_operands() {
        let device = Default::default();
        let layer = DeformConv3dConfig::new(4, 2, [2, 2, 2])
            .with_padding([1, 1, 1])
            .with_deformable_groups(2)
            .with_modulation(true)
            .with_dimension("TW".into())
            .init::<TestBackend>(&device)
            .unwrap();
        let input = Tensor::<TestBackend, 5>::random(
            [2, 4, 3, 3, 3],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let offset = Tensor::random([2, 32, 4, 4, 4], Distribution::Uniform(-1.0, 1.0), &device);
        let modulation =
            Tensor::random([2, 16, 4, 4, 4], Distribution::Uniform(-1.0, 1.0), &device);

        let (output, grads) = layer
            .forward_backward(input, offset, Some(modulation), |output| output.ones_like())
            .unwrap();

        assert_eq!(output.dims(), [2, 2, 4, 4, 4]);
        assert_eq!(grads.input.dims(), [2, 4, 3, 3, 3]);
        assert_eq!(grads.offset.dims(), [2, 32, 4, 4, 4]);
        assert_eq!(grads.modulation.unwrap().dims(), [2, 16, 4, 4, 4]);
        assert_eq!(grads.weight.dims(), [2, 4, 2, 2, 2]);
        // all-ones upstream: bias gradient counts batch * positions
        let bias = tensor_to_vec(grads.bias.unwrap()).unwrap();
        assert_eq!(bias, vec![128.0, 128.0]);
    }
}
