//! Validation command: check a solve file and print its label tree.

use std::path::PathBuf;

use clap::Args;
use hmflow_config::ParamsConfig;
use hmflow_core::NodeRole;

use super::common::load_setup;

#[derive(Args)]
pub struct ValidateArgs {
    /// Solve description (TOML)
    #[arg(value_name = "SOLVE")]
    solve: PathBuf,
}

pub fn run(args: ValidateArgs) -> anyhow::Result<()> {
    let setup = load_setup(&args.solve, &ParamsConfig::default())?;
    let h = &setup.hierarchy;

    println!("'{}' is valid", setup.name);
    println!("  extent: {}", setup.extent);
    println!(
        "  iterations: {}, cc: {}, step size: {}, devices: {:?}",
        setup.params.iterations,
        setup.params.cc,
        setup.params.step_size,
        setup.params.devices.iter().map(|d| d.0).collect::<Vec<_>>()
    );
    println!();
    for &node in h.pre_order() {
        let indent = "  ".repeat(h.depth(node) + 1);
        let mut line = format!("{indent}{} ({})", h.label(node), h.role(node).name());
        if h.role(node) != NodeRole::Root {
            line.push_str(&format!(" alpha={}", setup.inputs.alpha(node)));
        }
        if setup.inputs.smoothness(node).is_some() {
            line.push_str(" smoothness");
        }
        if let Some(path) = setup.outputs.get(&node) {
            line.push_str(&format!(" -> {}", path.display()));
        }
        println!("{line}");
    }
    println!();
    println!(
        "{} nodes, {} leaves, depth {}",
        h.len(),
        h.leaves().count(),
        h.max_depth()
    );
    Ok(())
}
