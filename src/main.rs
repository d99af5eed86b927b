use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{debug, info};
use logforth::append;
use logforth::layout::TextLayout;
use logforth::record::LevelFilter;

use aft_candle::{AftConv, AftConvConfig, AftFull, AftFullConfig, ExpPolicy, NestedTensor};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

/// Minimum severity written to stdout.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            Self::Trace => LevelFilter::Trace,
            Self::Debug => LevelFilter::Debug,
            Self::Info => LevelFilter::Info,
            Self::Warn => LevelFilter::Warn,
            Self::Error => LevelFilter::Error,
        }
    }
}

/// Where the layer runs. Accelerators are only offered when compiled in,
/// and the first one available is the default.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum DeviceType {
    Cpu,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "metal")]
    Metal,
}

impl DeviceType {
    fn device(self) -> anyhow::Result<Device> {
        let device = match self {
            Self::Cpu => Device::Cpu,
            #[cfg(feature = "cuda")]
            Self::Cuda => Device::new_cuda(0).context("no CUDA device 0")?,
            #[cfg(feature = "metal")]
            Self::Metal => Device::new_metal(0).context("no Metal device 0")?,
        };
        Ok(device)
    }
}

impl Default for DeviceType {
    fn default() -> Self {
        // variants after Cpu are the compiled-in accelerators
        Self::value_variants().get(1).copied().unwrap_or(Self::Cpu)
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Policy {
    Raw,
    MaxShifted,
}

impl From<Policy> for ExpPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Raw => Self::Raw,
            Policy::MaxShifted => Self::MaxShifted,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "aft-candle")]
#[command(about = "Run Attention Free Transformer layers on random input", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, value_enum, default_value_t = LogLevel::Info, help = "Log level")]
    log_level: LogLevel,

    #[arg(short, long, value_enum, default_value_t, help = "Compute device")]
    device: DeviceType,

    #[arg(short, long, help = "safetensors file with trained weights (random init if absent)")]
    weights: Option<PathBuf>,

    #[arg(short, long, help = "JSON layer config; overrides the shape flags")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// AFT-Full over [batch, seq_len, d_model]
    Full(FullArgs),
    /// AFT-Conv over [batch, height, width, dim]
    Conv(ConvArgs),
}

#[derive(Args, Debug)]
struct FullArgs {
    #[arg(long, default_value_t = 100)]
    max_len: usize,

    #[arg(long, default_value_t = 64)]
    d_model: usize,

    #[arg(short, long, default_value_t = 256)]
    batch: usize,

    #[arg(short, long, default_value_t = 56)]
    seq_len: usize,

    #[arg(long, value_enum, help = "Exponentiation policy (default: raw)")]
    exp_policy: Option<Policy>,
}

#[derive(Args, Debug)]
struct ConvArgs {
    #[arg(long, default_value_t = 48)]
    dim: usize,

    #[arg(long, default_value_t = 64)]
    hidden_dim: usize,

    #[arg(long, default_value_t = 1)]
    head_num: usize,

    #[arg(short, long, default_value_t = 7)]
    kernel_size: usize,

    #[arg(short, long, help = "Kernel padding (default: keep spatial size)")]
    padding: Option<usize>,

    #[arg(short, long, default_value_t = 20)]
    batch: usize,

    #[arg(long, default_value_t = 32)]
    height: usize,

    #[arg(long, default_value_t = 32)]
    width: usize,

    #[arg(long, value_enum, help = "Exponentiation policy (default: max-shifted)")]
    exp_policy: Option<Policy>,
}

fn var_builder(weights: Option<&PathBuf>, device: &Device, varmap: &VarMap) -> anyhow::Result<VarBuilder<'static>> {
    match weights {
        Some(path) => {
            info!("Loading weights from: {}", path.display());
            // SAFETY: the file is only read, and is not modified while mapped.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device) }
                .with_context(|| format!("failed to mmap {}", path.display()))?;
            Ok(vb)
        },
        None => {
            info!("No weights given, using random init");
            Ok(VarBuilder::from_varmap(varmap, DType::F32, device))
        },
    }
}

struct OutputStats {
    mean: f32,
    min: f32,
    max: f32,
    non_finite: usize,
}

fn output_stats(t: &Tensor) -> anyhow::Result<OutputStats> {
    let values: Vec<f32> = t.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    let finite: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let mean = if finite.is_empty() {
        f32::NAN
    } else {
        finite.iter().sum::<f32>() / finite.len() as f32
    };
    Ok(OutputStats {
        mean,
        min: finite.iter().copied().fold(f32::INFINITY, f32::min),
        max: finite.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        non_finite: values.len() - finite.len(),
    })
}

fn run_full(cli: &Cli, args: &FullArgs, device: &Device) -> anyhow::Result<()> {
    let mut cfg = match &cli.config {
        Some(path) => AftFullConfig::from_json_file(path).context("failed to load AFT-Full config")?,
        None => AftFullConfig::new(args.max_len, args.d_model),
    };
    if let Some(policy) = args.exp_policy {
        cfg = cfg.with_exp_policy(policy.into());
    }
    cfg.validate().context("invalid AFT-Full config")?;
    info!(
        "AFT-Full config: max_len={} d_model={} exp_policy={:?}",
        cfg.max_len, cfg.d_model, cfg.exp_policy
    );

    let varmap = VarMap::new();
    let vb = var_builder(cli.weights.as_ref(), device, &varmap)?;
    let d_model = cfg.d_model;
    let model = AftFull::new(cfg, vb).context("failed to build AFT-Full")?;

    let x = Tensor::randn(0f32, 1.0, (args.batch, args.seq_len, d_model), device)?;
    debug!("input shape: {:?}", x.dims());

    let start = Instant::now();
    let y = model.forward(&x).context("AFT-Full forward failed")?;
    let elapsed = start.elapsed();

    let stats = output_stats(&y)?;
    println!("\n=== AFT-Full ===");
    println!("input: {:?} -> output: {:?}", x.dims(), y.dims());
    println!(
        "mean={:.5} min={:.5} max={:.5} non_finite={}",
        stats.mean, stats.min, stats.max, stats.non_finite
    );
    println!("Time: {:.2}ms", elapsed.as_secs_f64() * 1e3);
    Ok(())
}

fn run_conv(cli: &Cli, args: &ConvArgs, device: &Device) -> anyhow::Result<()> {
    let mut cfg = match &cli.config {
        Some(path) => AftConvConfig::from_json_file(path).context("failed to load AFT-Conv config")?,
        None => {
            let cfg = AftConvConfig::new(args.dim)
                .with_hidden_dim(args.hidden_dim)
                .with_head_num(args.head_num)
                .with_kernel_size(args.kernel_size);
            match args.padding {
                Some(p) => cfg.with_padding(p),
                None => cfg,
            }
        },
    };
    if let Some(policy) = args.exp_policy {
        cfg = cfg.with_exp_policy(policy.into());
    }
    cfg.validate().context("invalid AFT-Conv config")?;
    info!(
        "AFT-Conv config: dim={} hidden_dim={} head_num={} kernel_size={} padding={} exp_policy={:?}",
        cfg.dim,
        cfg.hidden_dim,
        cfg.head_num,
        cfg.kernel_size,
        cfg.effective_padding(),
        cfg.exp_policy
    );

    let varmap = VarMap::new();
    let vb = var_builder(cli.weights.as_ref(), device, &varmap)?;
    let dim = cfg.dim;
    let model = AftConv::new(cfg, vb).context("failed to build AFT-Conv")?;

    let x = Tensor::randn(0f32, 1.0, (args.batch, args.height, args.width, dim), device)?;
    let input = NestedTensor::all_valid(x)?;

    let start = Instant::now();
    let levels = model.forward_levels(&input).context("AFT-Conv forward failed")?;
    let elapsed = start.elapsed();

    println!("\n=== AFT-Conv ===");
    for (level, out) in &levels {
        let stats = output_stats(&out.tensors)?;
        let mask_dims = out.mask.as_ref().map(|m| m.dims().to_vec());
        println!(
            "level {}: input {:?} -> features {:?}, mask {:?}",
            level,
            input.tensors.dims(),
            out.tensors.dims(),
            mask_dims
        );
        println!(
            "mean={:.5} min={:.5} max={:.5} non_finite={}",
            stats.mean, stats.min, stats.max, stats.non_finite
        );
    }
    println!("Time: {:.2}ms", elapsed.as_secs_f64() * 1e3);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = cli.log_level.filter();
    logforth::starter_log::builder()
        .dispatch(|d| {
            d.filter(filter)
                .append(append::Stdout::default().with_layout(TextLayout::default()))
        })
        .apply();

    info!("aft-candle starting");

    let device = cli.device.device()?;
    info!("Using device: {:?}", device);

    match &cli.command {
        Command::Full(args) => run_full(&cli, args, &device),
        Command::Conv(args) => run_conv(&cli, args, &device),
    }
}
