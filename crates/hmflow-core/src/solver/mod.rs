//! Hierarchy Solver: continuous max-flow over a label tree.
//!
//! The solver walks a fixed lifecycle:
//!
//! ```text
//! Uninitialized ──validate()──▶ Validated ──initialize()──▶ Initialized
//!                                                               │ run()
//!                     Failed ◀── any error / cancel ──  Running ◀┘
//!                                                               │
//!                                                               ▼
//!                                                             Done
//! ```
//!
//! `validate` checks inputs without touching devices. `initialize` builds every
//! host buffer, acquires the participating devices through the registry and
//! opens one [`BufferScheduler`](crate::BufferScheduler) per device. `run`
//! executes the configured number of passes, writes the leaf labels back to
//! the host and normalizes them per sibling group.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hmflow_core::{
//!     DeviceRegistry, Extent, HierarchyBuilder, HierarchySolver, HostDriver, SolveParams, Volume,
//! };
//!
//! let registry = Arc::new(DeviceRegistry::new(Arc::new(HostDriver::uniform(1, 64 << 20))));
//! let mut b = HierarchyBuilder::new();
//! let root = b.root();
//! let fg = b.add_child(root);
//! let bg = b.add_child(root);
//!
//! let extent = Extent::new(32, 32, 1);
//! let mut solver = HierarchySolver::new(registry, b.build()?, SolveParams::default());
//! solver.set_data_term(fg, Volume::filled(extent, 0.2))?;
//! solver.set_data_term(bg, Volume::filled(extent, 0.8))?;
//! let solution = solver.solve()?;
//! println!("{:?}", solution.segmentation.get(fg).map(|v| v.mean()));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod executor;
mod layout;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::driver::DeviceId;
use crate::error::{ConfigurationError, SolveError};
use crate::hierarchy::{Hierarchy, NodeId, NodeRole};
use crate::inputs::SolveInputs;
use crate::params::{CancelToken, SolveParams};
use crate::registry::DeviceRegistry;
use crate::scheduler::SchedulerStats;
use crate::volume::{Extent, Volume};

use executor::Executor;

/// Lifecycle state of a [`HierarchySolver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverState {
    /// Inputs may still change.
    Uninitialized,
    /// Inputs checked; no device resources held.
    Validated,
    /// Buffers built and devices acquired.
    Initialized,
    /// Passes are executing.
    Running,
    /// A segmentation was produced; resources are released.
    Done,
    /// An error or cancellation ended the solve; resources are released.
    Failed,
}

impl SolverState {
    /// Lowercase state name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Validated => "validated",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Residency figures of one device over a solve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceReport {
    /// The device.
    pub device: DeviceId,
    /// Slots its scheduler acquired.
    pub num_buffers: usize,
    /// Host buffers of the nodes placed on it.
    pub homed_buffers: usize,
    /// Transfer and eviction counters.
    pub stats: SchedulerStats,
}

/// Summary of a finished run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolveReport {
    /// Passes executed.
    pub iterations: usize,
    /// One entry per participating device, in parameter order.
    pub devices: Vec<DeviceReport>,
}

/// Leaf probability volumes.
///
/// Within every group of leaves sharing a parent the volumes sum to 1 at
/// every voxel.
#[derive(Clone, Debug, PartialEq)]
pub struct Segmentation {
    extent: Extent,
    labels: BTreeMap<NodeId, Volume>,
}

impl Segmentation {
    /// Grid of every volume.
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Probability volume of a leaf.
    pub fn get(&self, leaf: NodeId) -> Option<&Volume> {
        self.labels.get(&leaf)
    }

    /// Leaves and their volumes in leaf order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Volume)> {
        self.labels.iter().map(|(&id, v)| (id, v))
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns true if there are no leaves.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Consumes the segmentation, returning the per-leaf volumes.
    pub fn into_labels(self) -> BTreeMap<NodeId, Volume> {
        self.labels
    }
}

/// Output of [`HierarchySolver::run`].
#[derive(Clone, Debug)]
pub struct Solution {
    /// Normalized leaf probabilities.
    pub segmentation: Segmentation,
    /// Per-device residency report.
    pub report: SolveReport,
}

/// Drives the hierarchical max-flow relaxation on one or more devices.
pub struct HierarchySolver {
    registry: Arc<DeviceRegistry>,
    hierarchy: Hierarchy,
    params: SolveParams,
    inputs: SolveInputs,
    cancel: Option<CancelToken>,
    state: SolverState,
    extent: Option<Extent>,
    executor: Option<Executor>,
}

impl HierarchySolver {
    /// Creates a solver; no devices are touched until [`initialize`](Self::initialize).
    pub fn new(registry: Arc<DeviceRegistry>, hierarchy: Hierarchy, params: SolveParams) -> Self {
        Self {
            registry,
            hierarchy,
            params,
            inputs: SolveInputs::new(),
            cancel: None,
            state: SolverState::Uninitialized,
            extent: None,
            executor: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SolverState {
        self.state
    }

    /// The label tree.
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// Solve parameters.
    pub fn params(&self) -> &SolveParams {
        &self.params
    }

    /// Inputs attached so far.
    pub fn inputs(&self) -> &SolveInputs {
        &self.inputs
    }

    fn expect_state(&self, expected: SolverState) -> Result<(), SolveError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SolveError::InvalidState {
                expected: expected.name(),
                actual: self.state.name(),
            })
        }
    }

    /// Input changes are allowed until device resources are held; they send
    /// the solver back to `Uninitialized`.
    fn begin_edit(&mut self) -> Result<(), SolveError> {
        match self.state {
            SolverState::Uninitialized | SolverState::Validated | SolverState::Failed => {
                self.state = SolverState::Uninitialized;
                Ok(())
            }
            other => Err(SolveError::InvalidState {
                expected: "uninitialized",
                actual: other.name(),
            }),
        }
    }

    /// Attaches a leaf's data term.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError::UnknownNode`] or
    /// [`ConfigurationError::DataTermOnNonLeaf`]; `InvalidState` once
    /// initialized.
    pub fn set_data_term(&mut self, leaf: NodeId, term: Volume) -> Result<(), SolveError> {
        self.begin_edit()?;
        self.hierarchy.check(leaf)?;
        if self.hierarchy.role(leaf) != NodeRole::Leaf {
            return Err(ConfigurationError::DataTermOnNonLeaf(leaf).into());
        }
        self.inputs.set_data_term(leaf, term);
        Ok(())
    }

    /// Attaches a smoothness field to a node. Has no effect on the root.
    pub fn set_smoothness(&mut self, node: NodeId, field: Volume) -> Result<(), SolveError> {
        self.begin_edit()?;
        self.hierarchy.check(node)?;
        self.inputs.set_smoothness(node, field);
        Ok(())
    }

    /// Sets a node's smoothness weight (default 1).
    pub fn set_alpha(&mut self, node: NodeId, alpha: f32) -> Result<(), SolveError> {
        self.begin_edit()?;
        self.hierarchy.check(node)?;
        self.inputs.set_alpha(node, alpha);
        Ok(())
    }

    /// Replaces every input at once.
    pub fn set_inputs(&mut self, inputs: SolveInputs) -> Result<(), SolveError> {
        self.begin_edit()?;
        self.inputs = inputs;
        Ok(())
    }

    /// Attaches a cancellation token, checked between passes.
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = Some(token);
    }

    /// Moves to `Failed`, releasing any device resources.
    fn fail<T>(&mut self, err: SolveError) -> Result<T, SolveError> {
        self.executor = None;
        self.state = SolverState::Failed;
        #[cfg(feature = "tracing")]
        tracing::info!("solve_failed: {err}");
        Err(err)
    }

    /// Checks parameters, hierarchy and inputs. No device is touched.
    pub fn validate(&mut self) -> Result<(), SolveError> {
        self.expect_state(SolverState::Uninitialized)?;
        let checked = self
            .params
            .validate()
            .and_then(|()| self.inputs.validate(&self.hierarchy));
        match checked {
            Ok(extent) => {
                self.extent = Some(extent);
                self.state = SolverState::Validated;
                Ok(())
            }
            Err(e) => self.fail(e.into()),
        }
    }

    /// Builds host buffers, acquires devices and opens their schedulers.
    pub fn initialize(&mut self) -> Result<(), SolveError> {
        self.expect_state(SolverState::Validated)?;
        let Some(extent) = self.extent else {
            return self.fail(SolveError::InvalidState {
                expected: "validated",
                actual: "validated without extent",
            });
        };
        match Executor::open(
            Arc::clone(&self.registry),
            &self.hierarchy,
            &self.inputs,
            &self.params,
            extent,
        ) {
            Ok(executor) => {
                #[cfg(feature = "tracing")]
                tracing::info!(
                    "solve_initialized: {} node(s), extent {extent}, {} device(s)",
                    self.hierarchy.len(),
                    self.params.devices.len()
                );
                self.executor = Some(executor);
                self.state = SolverState::Initialized;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Executes every pass and returns the normalized leaf probabilities.
    pub fn run(&mut self) -> Result<Solution, SolveError> {
        self.run_with_progress(|_, _| {})
    }

    /// Like [`run`](Self::run), calling `progress(done, total)` after each pass.
    pub fn run_with_progress(
        &mut self,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<Solution, SolveError> {
        self.expect_state(SolverState::Initialized)?;
        let Some(mut executor) = self.executor.take() else {
            return self.fail(SolveError::InvalidState {
                expected: "initialized",
                actual: "initialized without devices",
            });
        };
        self.state = SolverState::Running;

        let total = self.params.iterations;
        for completed in 0..total {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                drop(executor);
                return self.fail(SolveError::Cancelled { completed });
            }
            if let Err(e) = executor.pass(&self.hierarchy) {
                drop(executor);
                return self.fail(e);
            }
            progress(completed + 1, total);
        }

        let (arena, layout, devices) = match executor.close(&self.hierarchy) {
            Ok(closed) => closed,
            Err(e) => return self.fail(e),
        };
        let extent = self.extent.unwrap_or(Extent::new(0, 0, 0));
        let mut labels = BTreeMap::new();
        for (leaf, id) in layout.leaf_labels(&self.hierarchy) {
            let data = match arena.data(id) {
                Ok(data) => data.to_vec(),
                Err(e) => return self.fail(e.into()),
            };
            labels.insert(leaf, data);
        }
        normalize_sibling_groups(&self.hierarchy, &mut labels);

        let labels = labels
            .into_iter()
            .filter_map(|(leaf, data)| Volume::from_vec(extent, data).map(|v| (leaf, v)))
            .collect();
        self.state = SolverState::Done;
        #[cfg(feature = "tracing")]
        tracing::info!("solve_done: {total} iteration(s)");
        Ok(Solution {
            segmentation: Segmentation { extent, labels },
            report: SolveReport {
                iterations: total,
                devices,
            },
        })
    }

    /// `validate`, `initialize` and `run` in one call.
    pub fn solve(&mut self) -> Result<Solution, SolveError> {
        self.validate()?;
        self.initialize()?;
        self.run()
    }
}

impl core::fmt::Debug for HierarchySolver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HierarchySolver")
            .field("state", &self.state)
            .field("hierarchy", &self.hierarchy)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Divides each leaf by the sum over its sibling leaves; a zero sum gives
/// every sibling `1 / k`.
pub(crate) fn normalize_sibling_groups(
    hierarchy: &Hierarchy,
    labels: &mut BTreeMap<NodeId, Vec<f32>>,
) {
    for (_, group) in hierarchy.sibling_leaf_groups() {
        let k = group.len() as f32;
        let Some(len) = group
            .first()
            .and_then(|leaf| labels.get(leaf))
            .map(Vec::len)
        else {
            continue;
        };
        for i in 0..len {
            let sum: f32 = group
                .iter()
                .filter_map(|leaf| labels.get(leaf).map(|v| v[i]))
                .sum();
            for leaf in &group {
                if let Some(v) = labels.get_mut(leaf) {
                    v[i] = if sum > 0.0 { v[i] / sum } else { 1.0 / k };
                }
            }
        }
    }
}
