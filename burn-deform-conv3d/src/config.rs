use burn::{module::Ignored, nn::Initializer, prelude::*};
use deform_conv3d::{DeformConv3dOptions, DeformConvError, DeformConvResult, DimensionMask};

use crate::{deform_conv::DeformConv3d, pack::DeformConv3dPack};

/// Configuration to create a [deformable 3D convolution](DeformConv3d) layer,
/// using the [init function](DeformConv3dConfig::init), or its self-generating
/// counterpart through [init_pack](DeformConv3dConfig::init_pack).
#[derive(Config, Debug)]
pub struct DeformConv3dConfig {
    /// The number of input channels.
    pub in_channels: usize,
    /// The number of output channels.
    pub out_channels: usize,
    /// The size of the kernel `[kT, kH, kW]`.
    pub kernel_size: [usize; 3],
    /// The stride of the convolution.
    #[config(default = "[1, 1, 1]")]
    pub stride: [usize; 3],
    /// Zero padding added on both sides of every axis.
    #[config(default = "[0, 0, 0]")]
    pub padding: [usize; 3],
    /// Spacing between kernel elements.
    #[config(default = "[1, 1, 1]")]
    pub dilation: [usize; 3],
    /// Controls the connections between input and output channels.
    #[config(default = "1")]
    pub groups: usize,
    /// Number of channel groups sharing one offset field.
    #[config(default = "1")]
    pub deformable_groups: usize,
    /// Scale every tap by a learned modulation in `[0, 1]`.
    #[config(default = "false")]
    pub modulation: bool,
    /// Axes that receive learned offsets, any ordering of a subset of `"THW"`.
    #[config(default = "String::from(\"THW\")")]
    pub dimension: String,
    /// If bias should be added to the output.
    #[config(default = "true")]
    pub bias: bool,
}

impl DeformConv3dConfig {
    /// Checks the configuration without allocating anything.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` for zero kernel, stride or dilation entries and
    /// for channel counts the groups do not divide, `InvalidDimensionMask`
    /// for a malformed `dimension`.
    pub fn validate(&self) -> DeformConvResult<()> {
        self.options().map(|_| ())
    }

    /// The engine options described by this configuration.
    pub fn options(&self) -> DeformConvResult<DeformConv3dOptions> {
        if self.kernel_size.contains(&0) {
            return Err(DeformConvError::InvalidConfiguration {
                reason: format!(
                    "kernel_size must be positive on every axis, got {:?}",
                    self.kernel_size
                ),
            });
        }

        let dimension = DimensionMask::parse(&self.dimension)?;
        let options = DeformConv3dOptions::new(
            self.stride,
            self.padding,
            self.dilation,
            self.groups,
            self.deformable_groups,
            dimension,
        );
        options.validate()?;

        let divisible = |channels: usize, by: usize, what: &str| {
            if channels % by == 0 {
                Ok(())
            } else {
                Err(DeformConvError::InvalidConfiguration {
                    reason: format!("{what} ({channels}) must be divisible by {by}"),
                })
            }
        };
        divisible(self.in_channels, self.groups, "in_channels")?;
        divisible(self.out_channels, self.groups, "out_channels")?;
        divisible(
            self.in_channels,
            self.deformable_groups,
            "in_channels (deformable groups)",
        )?;

        Ok(options)
    }

    /// Number of kernel taps.
    pub fn taps(&self) -> usize {
        self.kernel_size.iter().product()
    }

    /// Channels of the offset field: one per deformable group, tap and deformed axis.
    pub fn offset_channels(&self) -> usize {
        self.deformable_groups * self.taps() * self.dimension.len()
    }

    /// Channels of the modulation field, zero when modulation is disabled.
    pub fn modulation_channels(&self) -> usize {
        if self.modulation {
            self.deformable_groups * self.taps()
        } else {
            0
        }
    }

    /// Initialize a new layer that expects its offsets from the caller.
    ///
    /// The weight is drawn from `Uniform(-1/sqrt(n), 1/sqrt(n))` with
    /// `n = in_channels * kT * kH * kW`; the bias starts at zero.
    pub fn init<B: Backend>(&self, device: &B::Device) -> DeformConvResult<DeformConv3d<B>> {
        let options = self.options()?;
        let bound = 1.0 / ((self.in_channels * self.taps()) as f64).sqrt();

        Ok(self.build(
            options,
            Initializer::Uniform {
                min: -bound,
                max: bound,
            },
            self.bias,
            self.modulation,
            device,
        ))
    }

    /// Initialize a layer that predicts its own offsets (and modulation) from
    /// the input with a zero-initialised auxiliary convolution.
    pub fn init_pack<B: Backend>(
        &self,
        device: &B::Device,
    ) -> DeformConvResult<DeformConv3dPack<B>> {
        let conv = self.init(device)?;

        let generated = self.offset_channels() + self.modulation_channels();
        let auxiliary = Self::new(self.in_channels, generated, self.kernel_size)
            .with_stride(self.stride)
            .with_padding(self.padding)
            .with_dilation(self.dilation);
        let conv_offset = auxiliary.build(
            auxiliary.options()?,
            Initializer::Zeros,
            true,
            false,
            device,
        );

        tracing::info!(
            in_channels = self.in_channels,
            out_channels = self.out_channels,
            offset_channels = self.offset_channels(),
            modulation_channels = self.modulation_channels(),
            dimension = %self.dimension,
            "initialised self-generating deformable convolution",
        );

        Ok(DeformConv3dPack {
            conv_offset,
            conv,
            offset_channels: self.offset_channels(),
        })
    }

    fn build<B: Backend>(
        &self,
        options: DeformConv3dOptions,
        initializer: Initializer,
        bias: bool,
        modulation: bool,
        device: &B::Device,
    ) -> DeformConv3d<B> {
        let [k_t, k_h, k_w] = self.kernel_size;
        let shape = [
            self.out_channels,
            self.in_channels / self.groups,
            k_t,
            k_h,
            k_w,
        ];

        DeformConv3d {
            weight: initializer.init(shape, device),
            bias: bias.then(|| Initializer::Zeros.init([self.out_channels], device)),
            options: Ignored(options),
            modulation,
        }
    }
}
