//! Solve parameters and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::driver::DeviceId;
use crate::error::ConfigurationError;

/// Solve-wide parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct SolveParams {
    /// Number of passes; fixed up front, there is no convergence test.
    pub iterations: usize,
    /// Augmented-Lagrangian weight, in `[0, 1]`.
    pub cc: f32,
    /// Step size of the flow and label updates, in `[0, 1]`.
    pub step_size: f32,
    /// Share of each device's free memory the scheduler may claim, in `(0, 1]`.
    pub device_memory_fraction: f32,
    /// Participating devices. The root of the hierarchy lives on the first.
    pub devices: Vec<DeviceId>,
}

impl Default for SolveParams {
    fn default() -> Self {
        Self {
            iterations: 100,
            cc: 0.25,
            step_size: 0.1,
            device_memory_fraction: 0.9,
            devices: vec![DeviceId(0)],
        }
    }
}

impl SolveParams {
    /// Smallest `cc` used as a divisor; keeps `1 / cc` finite at `cc = 0`.
    pub const CC_FLOOR: f32 = 1e-3;

    /// Checks every parameter range.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        check_unit("cc", self.cc)?;
        check_unit("step_size", self.step_size)?;
        let f = self.device_memory_fraction;
        if f.is_nan() || f <= 0.0 || f > 1.0 {
            return Err(ConfigurationError::InvalidParameter {
                name: "device_memory_fraction",
                value: f64::from(f),
                range: "(0, 1]",
            });
        }
        if self.devices.is_empty() {
            return Err(ConfigurationError::NoDevices);
        }
        let mut seen = self.devices.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.devices.len() {
            return Err(ConfigurationError::InvalidParameter {
                name: "devices",
                value: self.devices.len() as f64,
                range: "distinct device ids",
            });
        }
        Ok(())
    }

    /// `1 / max(cc, CC_FLOOR)`.
    pub fn inv_cc(&self) -> f32 {
        1.0 / self.cc.max(Self::CC_FLOOR)
    }
}

fn check_unit(name: &'static str, value: f32) -> Result<(), ConfigurationError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidParameter {
            name,
            value: f64::from(value),
            range: "[0, 1]",
        })
    }
}

/// Cloneable cancellation flag checked by the solver between iterations.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
