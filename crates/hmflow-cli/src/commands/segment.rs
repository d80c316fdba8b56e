//! Segmentation command: solve a problem and write leaf probabilities.

use std::path::PathBuf;

use clap::Args;
use hmflow_config::{ParamsConfig, write_volume};
use hmflow_core::{CancelToken, HierarchySolver, SolveReport};
use indicatif::{ProgressBar, ProgressStyle};

use super::common::{emulated_registry, load_setup};

#[derive(Args)]
pub struct SegmentArgs {
    /// Solve description (TOML)
    #[arg(value_name = "SOLVE")]
    solve: PathBuf,

    /// Number of passes (overrides the file)
    #[arg(short, long)]
    iterations: Option<usize>,

    /// Participating device ids, root device first (e.g., "0,1")
    #[arg(long, value_delimiter = ',')]
    devices: Option<Vec<u32>>,

    /// Share of each device's free memory to claim
    #[arg(long)]
    memory_fraction: Option<f32>,

    /// Memory of each emulated device in MiB
    #[arg(long, default_value = "1024")]
    emulated_memory_mib: usize,

    /// Do not show a progress bar
    #[arg(short, long)]
    quiet: bool,
}

pub fn run(args: SegmentArgs) -> anyhow::Result<()> {
    let overrides = ParamsConfig {
        iterations: args.iterations,
        device_memory_fraction: args.memory_fraction,
        devices: args.devices.clone(),
        ..ParamsConfig::default()
    };
    println!("Loading {}...", args.solve.display());
    let setup = load_setup(&args.solve, &overrides)?;
    let leaves: Vec<_> = setup.hierarchy.leaves().collect();
    println!(
        "  '{}': {} nodes, {} leaves, extent {}",
        setup.name,
        setup.hierarchy.len(),
        leaves.len(),
        setup.extent
    );

    let (_driver, registry) = emulated_registry(&setup.params.devices, args.emulated_memory_mib);
    let mut solver =
        HierarchySolver::new(registry, setup.hierarchy.clone(), setup.params.clone());
    solver.set_inputs(setup.inputs.clone())?;

    let token = CancelToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling after the current iteration...");
        handler_token.cancel();
    })?;
    solver.set_cancel_token(token);

    tracing::info!(
        iterations = setup.params.iterations,
        devices = setup.params.devices.len(),
        "starting solve"
    );
    let pb = if args.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(setup.params.iterations as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} iterations ({eta})")?
            .progress_chars("##-"),
    );

    solver.validate()?;
    solver.initialize()?;
    let result = solver.run_with_progress(|done, _total| pb.set_position(done as u64));
    pb.finish_and_clear();
    let solution = result?;

    println!("Writing outputs...");
    for &leaf in &leaves {
        let label = setup.hierarchy.label(leaf);
        let Some(volume) = solution.segmentation.get(leaf) else {
            continue;
        };
        match setup.outputs.get(&leaf) {
            Some(path) => {
                write_volume(path, volume)?;
                println!("  {label}: {} (mean {:.4})", path.display(), volume.mean());
            }
            None => println!("  {label}: no output configured (mean {:.4})", volume.mean()),
        }
    }

    print_report(&solution.report);
    Ok(())
}

fn print_report(report: &SolveReport) {
    println!();
    println!("Solve Report");
    println!("============");
    println!("  iterations: {}", report.iterations);
    for d in &report.devices {
        println!(
            "  device {}: {} slots, {} homed buffers, {} uploads, {} downloads, {} evictions, {} discards, peak {}",
            d.device.0,
            d.num_buffers,
            d.homed_buffers,
            d.stats.uploads,
            d.stats.downloads,
            d.stats.evictions,
            d.stats.discards,
            d.stats.peak_mapped
        );
    }
}
