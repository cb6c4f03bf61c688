//! Hand-off between Burn tensors and the engine's dense buffers.
//!
//! The engine runs on `f32` buffers regardless of the backend float type.

use burn::{prelude::*, tensor::TensorData};
use deform_conv3d::{DeformConvError, DeformConvResult, Volume};

pub fn tensor_to_vec<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> DeformConvResult<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| DeformConvError::TensorConversion {
            reason: format!("{e:?}"),
        })
}

pub fn tensor_to_volume<B: Backend>(tensor: Tensor<B, 5>) -> DeformConvResult<Volume<f32>> {
    let shape = tensor.dims();
    Volume::new(shape, tensor_to_vec(tensor)?)
}

pub fn volume_to_tensor<B: Backend>(volume: Volume<f32>, device: &B::Device) -> Tensor<B, 5> {
    let shape = volume.shape();
    Tensor::from_data(
        TensorData::new(volume.into_vec(), shape).convert::<B::FloatElem>(),
        device,
    )
}

pub fn vec_to_tensor<B: Backend>(values: Vec<f32>, device: &B::Device) -> Tensor<B, 1> {
    let shape = [values.len()];
    Tensor::from_data(
        TensorData::new(values, shape).convert::<B::FloatElem>(),
        device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;

    #[test]
    fn volume_keeps_layout() {
        let device = Default::default();
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let tensor = Tensor::<TestBackend, 5>::from_data(
            TensorData::new(values.clone(), [1, 2, 3, 2, 2]),
            &device,
        );

        let volume = tensor_to_volume(tensor).unwrap();
        assert_eq!(volume.shape(), [1, 2, 3, 2, 2]);
        assert_eq!(volume.get([0, 1, 2, 0, 1]), Some(21.0));

        let back = volume_to_tensor::<TestBackend>(volume, &device);
        assert_eq!(back.dims(), [1, 2, 3, 2, 2]);
        assert_eq!(tensor_to_vec(back).unwrap(), values);
    }
}
