use std::{path::PathBuf, str::FromStr};

use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use clap::Parser;
use layers::Parameterized;
use model::{format_thousands, Acmix3d, NetworkConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Build an ACmix-3D network and run a forward pass", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Network config (TOML or JSON); defaults are used when omitted"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "B,C,D,H,W",
        default_value = "2,1,32,8,8",
        help = "Shape of the random input volume"
    )]
    input_shape: InputShape,

    #[arg(long, help = "Use running batch-norm statistics instead of batch statistics")]
    eval: bool,

    #[arg(long, help = "Print the per-layer table")]
    summary: bool,
}

#[derive(Debug, Clone, Copy)]
struct InputShape([usize; 5]);

impl FromStr for InputShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dims = s
            .split(',')
            .map(|part| part.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("input shape must be comma-separated integers: {err}"))?;
        let dims = <[usize; 5]>::try_from(dims.as_slice())
            .map_err(|_| format!("input shape needs 5 dimensions (B,C,D,H,W), got {}", dims.len()))?;
        if dims.contains(&0) {
            return Err("input shape dimensions must be non-zero".into());
        }
        Ok(Self(dims))
    }
}

fn main() {
    // `log` records from the library crates are forwarded by the subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    if let Err(err) = run() {
        eprintln!("acmix3d failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => NetworkConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NetworkConfig::default(),
    };
    let [_, channels, ..] = args.input_shape.0;
    if channels != config.input_channels {
        bail!(
            "input shape has {channels} channels but the network expects {}",
            config.input_channels
        );
    }

    let network = Acmix3d::new(config)?;
    network.set_training(!args.eval);
    let count = network.parameter_count();
    println!("Total params: {}", format_thousands(count.total as u64));
    println!("Trainable params: {}", format_thousands(count.trainable as u64));

    let device = &network.config().device;
    let input = Tensor::randn(0f32, 1.0, args.input_shape.0.to_vec(), device)?
        .to_dtype(network.config().dtype())?;
    let report = network.profile(&input)?;
    if args.summary {
        println!("{report}");
    }
    println!("output shape: {:?}", report.output_shape);
    println!("MACs: {:.3}G", report.giga_macs());
    println!("params: {:.3}M", report.mega_params());
    Ok(())
}
