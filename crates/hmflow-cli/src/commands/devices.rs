//! Device listing command.

use clap::Args;
use hmflow_core::DeviceId;

use super::common::{emulated_registry, format_mib};

#[derive(Args)]
pub struct DevicesArgs {
    /// Number of emulated devices
    #[arg(long, default_value = "1")]
    count: u32,

    /// Memory of each emulated device in MiB
    #[arg(long, default_value = "1024")]
    memory_mib: usize,
}

pub fn run(args: DevicesArgs) -> anyhow::Result<()> {
    if args.count == 0 {
        anyhow::bail!("--count must be at least 1");
    }
    let ids: Vec<DeviceId> = (0..args.count).map(DeviceId).collect();
    let (_driver, registry) = emulated_registry(&ids, args.memory_mib);
    let devices = registry.devices()?;

    println!("Available Devices");
    println!("=================\n");
    for device in &devices {
        println!(
            "  [{}] {} ({} total, {} free)",
            device.id.0,
            device.name,
            format_mib(device.total_bytes),
            format_mib(device.free_bytes)
        );
    }
    println!();
    println!("Total: {} device(s)", devices.len());
    Ok(())
}
