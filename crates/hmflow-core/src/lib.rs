//! hmflow Core - multi-device hierarchical max-flow segmentation
//!
//! This crate runs the continuous max-flow relaxation of a hierarchical
//! (tree-structured) labelling problem on one or more accelerators whose
//! memory may be too small to hold every working field at once.
//!
//! # Core Abstractions
//!
//! ## Devices
//!
//! - [`Driver`] - Object-safe accelerator runtime seam (streams, slots, kernels)
//! - [`HostDriver`] - Host-memory emulation with a fixed byte budget per device
//! - [`DeviceRegistry`] - Owner/device/stream bookkeeping with reset-on-last-release
//!
//! ## Memory
//!
//! - [`HostArena`] - Authoritative host copy of every field, behind generation-checked [`BufferId`]s
//! - [`BufferScheduler`] - Maps host buffers onto a fixed pool of device slots,
//!   evicting by priority level then least recent use
//!
//! ## Solving
//!
//! - [`Hierarchy`] / [`HierarchyBuilder`] - The label tree
//! - [`SolveInputs`] / [`SolveParams`] - Data terms, smoothness, weights, and step sizes
//! - [`HierarchySolver`] - Lifecycle driver producing a [`Segmentation`]
//! - [`energy::decompose`] - Host evaluation of a labelling's energy
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │ HierarchySolver  │
//!                  └────────┬─────────┘
//!            one scheduler  │  per device
//!        ┌──────────────────┼──────────────────┐
//!        ▼                  ▼                  ▼
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │ Scheduler 0 │    │ Scheduler 1 │    │ Scheduler n │ ◀─▶ HostArena
//! └──────┬──────┘    └──────┬──────┘    └──────┬──────┘
//!        └──────────────────┼──────────────────┘
//!                           ▼
//!                  ┌──────────────────┐
//!                  │  DeviceRegistry  │ ──▶ Arc<dyn Driver>
//!                  └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use hmflow_core::{
//!     DeviceRegistry, Extent, HierarchyBuilder, HierarchySolver, HostDriver, SolveParams, Volume,
//! };
//!
//! let driver = Arc::new(HostDriver::uniform(1, 16 << 20));
//! let registry = Arc::new(DeviceRegistry::new(driver));
//!
//! let mut tree = HierarchyBuilder::new();
//! let root = tree.root();
//! let left = tree.add_child(root);
//! let right = tree.add_child(root);
//!
//! let extent = Extent::new(8, 8, 1);
//! let params = SolveParams { iterations: 10, ..SolveParams::default() };
//! let mut solver = HierarchySolver::new(registry, tree.build()?, params);
//! solver.set_data_term(left, Volume::filled(extent, 0.5))?;
//! solver.set_data_term(right, Volume::filled(extent, 0.5))?;
//!
//! let solution = solver.solve()?;
//! let p = solution.segmentation.get(left).map(|v| v.mean()).unwrap_or_default();
//! assert!((p - 0.5).abs() < 1e-4);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod arena;
pub mod driver;
pub mod energy;
pub mod error;
pub mod hierarchy;
pub mod inputs;
pub mod params;
pub mod registry;
pub mod scheduler;
pub mod solver;
pub mod volume;

// Re-export main types at crate root
pub use arena::{BufferDescriptor, BufferField, BufferId, HostArena};
pub use driver::{
    DeviceContext, DeviceId, DeviceInfo, DeviceSpec, Driver, DriverCounters, HostDriver, Kernel,
    SlotBlock, SlotHandle, StreamId,
};
pub use energy::{EnergyReport, decompose};
pub use error::{ConfigurationError, DeviceError, RegistryError, SchedulerError, SolveError};
pub use hierarchy::{Hierarchy, HierarchyBuilder, NodeId, NodeRole};
pub use inputs::SolveInputs;
pub use params::{CancelToken, SolveParams};
pub use registry::{DeviceRegistry, OwnerId};
pub use scheduler::{BufferScheduler, SchedulerPlan, SchedulerStats};
pub use solver::{
    DeviceReport, HierarchySolver, Segmentation, Solution, SolveReport, SolverState,
};
pub use volume::{Extent, Volume};
