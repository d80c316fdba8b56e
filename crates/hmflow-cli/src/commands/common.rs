//! Helpers shared by several commands.

use std::path::Path;
use std::sync::Arc;

use hmflow_config::{ParamsConfig, SolveFile, SolveSetup, UserDefaults};
use hmflow_core::{DeviceId, DeviceRegistry, Extent, HostDriver};

const MIB: usize = 1 << 20;

/// Loads a solve file with user defaults beneath it and `overrides` above it.
pub fn load_setup(path: &Path, overrides: &ParamsConfig) -> anyhow::Result<SolveSetup> {
    let defaults = UserDefaults::load()?;
    let mut file = SolveFile::load(path)?;
    file.params = file.params.merged(overrides);
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(file.prepare(base, &defaults.params)?)
}

/// A registry over emulated devices covering every id in `devices`.
pub fn emulated_registry(
    devices: &[DeviceId],
    memory_mib: usize,
) -> (Arc<HostDriver>, Arc<DeviceRegistry>) {
    let count = devices.iter().map(|d| d.0 as usize + 1).max().unwrap_or(1);
    let driver = Arc::new(HostDriver::uniform(count, memory_mib * MIB));
    let registry = Arc::new(DeviceRegistry::new(driver.clone()));
    (driver, registry)
}

/// Parses `X`, `X,Y` or `X,Y,Z`; missing dimensions are 1.
pub fn parse_extent(s: &str) -> Result<Extent, String> {
    let dims = s
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid dimension '{}' in '{}'", part.trim(), s))
        })
        .collect::<Result<Vec<_>, _>>()?;
    match dims[..] {
        [x] => Ok(Extent::new(x, 1, 1)),
        [x, y] => Ok(Extent::new(x, y, 1)),
        [x, y, z] => Ok(Extent::new(x, y, z)),
        _ => Err(format!("expected X,Y,Z, got '{s}'")),
    }
}

/// Formats a byte count in MiB.
pub fn format_mib(bytes: usize) -> String {
    format!("{:.1} MiB", bytes as f64 / MIB as f64)
}
