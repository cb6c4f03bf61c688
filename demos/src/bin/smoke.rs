//! Deformable 3D convolution smoke test
//!
//! Runs the four layer variants (self-generated or external offsets, all axes
//! or a subset of them) on random data, back-propagates
//! `mean(target - output)` and logs the shapes involved.
//!
//! ## Usage
//!
//! ```bash
//! # Kernel 2, stride 1, padding 1 on a 2x8x16x16x16 input
//! cargo run --bin smoke
//!
//! # Kernel 3 with modulation
//! cargo run --bin smoke -- --kernel 3 --modulation
//!
//! # More detail from the engine
//! RUST_LOG=debug cargo run --bin smoke
//! ```

use anyhow::{ensure, Context, Result};
use burn::{prelude::*, tensor::Distribution};
use burn_deform_conv3d::{conv_output_size, DeformConv3dConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

type SelectedBackend = burn::backend::NdArray;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Batch size
    #[arg(long, default_value_t = 2)]
    batch: usize,

    /// Input channels
    #[arg(long, default_value_t = 8)]
    in_channels: usize,

    /// Output channels
    #[arg(long, default_value_t = 8)]
    out_channels: usize,

    /// Spatial extent of the cubic input
    #[arg(long, default_value_t = 16)]
    size: usize,

    /// Kernel extent on every axis
    #[arg(short, long, default_value_t = 2)]
    kernel: usize,

    /// Stride on every axis
    #[arg(short, long, default_value_t = 1)]
    stride: usize,

    /// Zero padding on every axis
    #[arg(short, long, default_value_t = 1)]
    padding: usize,

    /// Deformed axes of the self-generating selective variant
    #[arg(long, default_value = "TW")]
    pack_dimension: String,

    /// Deformed axes of the external-offset selective variant
    #[arg(long, default_value = "HW")]
    offset_dimension: String,

    /// Enable modulated sampling
    #[arg(long)]
    modulation: bool,
}

impl Args {
    fn config(&self, dimension: &str) -> DeformConv3dConfig {
        DeformConv3dConfig::new(self.in_channels, self.out_channels, [self.kernel; 3])
            .with_stride([self.stride; 3])
            .with_padding([self.padding; 3])
            .with_modulation(self.modulation)
            .with_dimension(dimension.to_string())
    }

    fn output_size(&self) -> Result<usize> {
        conv_output_size(self.size, self.kernel, self.stride, self.padding, 1)
            .context("input is smaller than the kernel")
    }
}

/// dLoss/dOutput of `mean(target - output)`, logging the loss on the way.
fn mean_error_grad(
    target: Tensor<SelectedBackend, 5>,
) -> impl FnOnce(&Tensor<SelectedBackend, 5>) -> Tensor<SelectedBackend, 5> {
    move |output| {
        let error: f32 = (target - output.clone()).mean().into_scalar();
        tracing::info!(error, "loss");
        output.ones_like().div_scalar(-(output.shape().num_elements() as f64))
    }
}

fn random_target(
    shape: [usize; 5],
    device: &<SelectedBackend as Backend>::Device,
) -> Tensor<SelectedBackend, 5> {
    Tensor::random(shape, Distribution::Uniform(-0.01, 0.01), device)
}

fn run_pack(args: &Args, dimension: &str, input: &Tensor<SelectedBackend, 5>) -> Result<()> {
    let device = input.device();
    let dcn = args.config(dimension).init_pack::<SelectedBackend>(&device)?;
    tracing::info!(shape = ?input.dims(), dimension, "input");

    let out = args.output_size()?;
    let target = random_target([args.batch, args.out_channels, out, out, out], &device);
    let (output, grads) = dcn.forward_backward(input.clone(), mean_error_grad(target))?;

    ensure!(
        grads.input.dims() == input.dims(),
        "input gradient shape mismatch"
    );
    tracing::info!(shape = ?output.dims(), "output");
    Ok(())
}

fn run_external(args: &Args, dimension: &str, input: &Tensor<SelectedBackend, 5>) -> Result<()> {
    let device = input.device();
    let config = args.config(dimension);
    let dcn = config.init::<SelectedBackend>(&device)?;

    let out = args.output_size()?;
    let offset = Tensor::random(
        [args.batch, config.offset_channels(), out, out, out],
        Distribution::Normal(0.0, 1.0),
        &device,
    );
    let modulation = args.modulation.then(|| {
        Tensor::random(
            [args.batch, config.modulation_channels(), out, out, out],
            Distribution::Normal(0.0, 1.0),
            &device,
        )
    });
    tracing::info!(shape = ?input.dims(), dimension, "input");
    tracing::info!(shape = ?offset.dims(), "offset");

    let target = random_target([args.batch, args.out_channels, out, out, out], &device);
    let (output, grads) = dcn.forward_backward(
        input.clone(),
        offset.clone(),
        modulation,
        mean_error_grad(target),
    )?;

    ensure!(
        grads.offset.dims() == offset.dims(),
        "offset gradient shape mismatch"
    );
    tracing::info!(shape = ?output.dims(), "output");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let device = Default::default();
    let input = Tensor::<SelectedBackend, 5>::random(
        [
            args.batch,
            args.in_channels,
            args.size,
            args.size,
            args.size,
        ],
        Distribution::Normal(0.0, 1.0),
        &device,
    );

    tracing::info!("deforming all three axes");
    tracing::info!("using its own offsets");
    run_pack(&args, "THW", &input)?;
    tracing::info!("using extra offsets");
    run_external(&args, "THW", &input)?;

    tracing::info!("deforming selected axes");
    tracing::info!("using its own offsets");
    run_pack(&args, &args.pack_dimension, &input)?;
    tracing::info!("using extra offsets");
    run_external(&args, &args.offset_dimension, &input)?;

    Ok(())
}
