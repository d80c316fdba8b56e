//! Energy command: evaluate a written segmentation.

use std::path::PathBuf;

use clap::Args;
use hmflow_config::ParamsConfig;
use hmflow_core::decompose;

use super::common::load_setup;

#[derive(Args)]
pub struct EnergyArgs {
    /// Solve description (TOML) whose outputs have been written
    #[arg(value_name = "SOLVE")]
    solve: PathBuf,
}

pub fn run(args: EnergyArgs) -> anyhow::Result<()> {
    let setup = load_setup(&args.solve, &ParamsConfig::default())?;
    let labels = setup.read_outputs()?;
    let report = decompose(&setup.hierarchy, &setup.inputs, &labels)?;

    println!("Energy of '{}'", setup.name);
    println!("  F0 = {:.6}", report.total);
    println!();
    for &node in setup.hierarchy.pre_order() {
        let indent = "  ".repeat(setup.hierarchy.depth(node) + 1);
        let energy = report.node(node).unwrap_or(0.0);
        println!(
            "{indent}{:<16} {:>8} {energy:.6}",
            setup.hierarchy.label(node),
            setup.hierarchy.role(node).name()
        );
    }
    Ok(())
}
