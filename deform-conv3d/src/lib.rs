//! # Deformable 3D convolution
//!
//! A framework-independent engine for deformable 3D convolution and its exact
//! gradient, operating on dense row-major buffers.
//!
//! Each kernel tap samples the input at its grid position plus a learned,
//! fractional offset, using trilinear interpolation with zero padding. The
//! offsets may be restricted to a subset of the `T`, `H`, `W` axes through a
//! [`DimensionMask`], and an optional modulation field scales every tap.
//!
//! ## Modules
//!
//! - `sampler`: trilinear sampling, its partial derivatives and the adjoint scatter.
//! - `offset`: maps offset and modulation fields onto per-tap coordinates.
//! - `forward`: [`deform_conv3d`].
//! - `backward`: [`deform_conv3d_backward`], yielding input, offset,
//!   modulation, weight and bias gradients.
//!
//! Both passes are pure, re-entrant functions: they validate every operand
//! before computing, allocate fresh outputs, and cache nothing.

mod backward;
mod element;
mod error;
mod forward;
mod geometry;
mod offset;
mod options;
mod sampler;
mod volume;

#[doc(inline)]
pub use backward::{deform_conv3d_backward, DeformConv3dBackward};
#[doc(inline)]
pub use element::Element;
#[doc(inline)]
pub use error::{DeformConvError, DeformConvResult, ErrorKind};
#[doc(inline)]
pub use forward::deform_conv3d;
#[doc(inline)]
pub use geometry::ConvGeometry;
#[doc(inline)]
pub use offset::OffsetField;
#[doc(inline)]
pub use options::{conv_output_size, Axis, DeformConv3dOptions, DimensionMask};
#[doc(inline)]
pub use sampler::Plane;
#[doc(inline)]
pub use volume::Volume;
