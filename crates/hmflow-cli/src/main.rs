//! hmflow CLI - Command-line interface for hierarchical max-flow segmentation.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hmflow")]
#[command(author, version, about = "Hierarchical max-flow segmentation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve a segmentation problem and write leaf probabilities
    Segment(commands::segment::SegmentArgs),

    /// Evaluate the energy of a written segmentation
    Energy(commands::energy::EnergyArgs),

    /// List emulated accelerator devices
    Devices(commands::devices::DevicesArgs),

    /// Check a solve file and print its label tree
    Validate(commands::validate::ValidateArgs),

    /// Write a synthetic phantom problem
    Generate(commands::generate::GenerateArgs),
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    tracing_log::LogTracer::init().ok();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Segment(args) => commands::segment::run(args),
        Commands::Energy(args) => commands::energy::run(args),
        Commands::Devices(args) => commands::devices::run(args),
        Commands::Validate(args) => commands::validate::run(args),
        Commands::Generate(args) => commands::generate::run(args),
    }
}
