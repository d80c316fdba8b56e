//! Phantom generation command.

use std::path::PathBuf;

use clap::Args;
use hmflow_config::Phantom;
use hmflow_core::Extent;

use super::common::parse_extent;

#[derive(Args)]
pub struct GenerateArgs {
    /// Output directory
    #[arg(value_name = "DIR")]
    dir: PathBuf,

    /// Grid size as X,Y,Z
    #[arg(long, default_value = "64,64,1", value_parser = parse_extent)]
    size: Extent,

    /// Number of leaf labels (background included)
    #[arg(long, default_value = "3")]
    labels: usize,

    /// Noise seed
    #[arg(long)]
    seed: Option<u64>,
}

pub fn run(args: GenerateArgs) -> anyhow::Result<()> {
    if args.size.is_empty() {
        anyhow::bail!("size must be non-zero in every dimension");
    }
    if args.labels < 2 {
        anyhow::bail!("--labels must be at least 2");
    }
    let mut phantom = Phantom::new(args.size, args.labels);
    if let Some(seed) = args.seed {
        phantom.seed = seed;
    }
    let path = phantom.write(&args.dir)?;

    println!(
        "Generated {} phantom with {} labels in {}",
        args.size,
        args.labels,
        args.dir.display()
    );
    println!("  solve file: {}", path.display());
    println!("Run: hmflow segment {}", path.display());
    Ok(())
}
