//! # Burn Deformable 3D Convolution
//!
//! Burn modules on top of the `deform-conv3d` engine:
//!
//! - [`DeformConv3d`]: offsets (and optional modulation) supplied by the caller,
//!   deforming all of `T`, `H`, `W` or any subset chosen by the `dimension` mask.
//! - [`DeformConv3dPack`]: offsets predicted from the input by a zero-initialised
//!   auxiliary convolution.
//!
//! Both are created from a [`DeformConv3dConfig`] and expose explicit `backward`
//! and `forward_backward` passes that return every gradient.
//!
//! ```rust,ignore
//! let dcn = DeformConv3dConfig::new(8, 8, [2, 2, 2])
//!     .with_padding([1, 1, 1])
//!     .with_dimension("TW".into())
//!     .init_pack::<B>(&device)?;
//! let output = dcn.forward(input)?;
//! ```

mod config;
mod convert;
mod deform_conv;
mod pack;

#[doc(inline)]
pub use config::DeformConv3dConfig;
#[doc(inline)]
pub use deform_conv::{DeformConv3d, DeformConv3dGrads, DeformConv3dRecord};
#[doc(inline)]
pub use pack::{DeformConv3dPack, DeformConv3dPackGrads, DeformConv3dPackRecord};

pub use deform_conv3d::{
    conv_output_size, DeformConv3dOptions, DeformConvError, DeformConvResult, ErrorKind,
};

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray;
