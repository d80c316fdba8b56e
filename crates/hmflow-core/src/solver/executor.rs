//! Pass executor: turns one max-flow pass into residency requests and kernel
//! launches on each participating device.
//!
//! Every pass is a sequence of *steps*. A step runs on the worker that homes
//! the node being updated, names at most five buffers, and launches one or
//! more kernels once they are resident:
//!
//! ```text
//!  step(worker, required, kernels)
//!    ├─ foreign buffer? flush on its home scheduler, map here as a mirror
//!    ├─ ensure_resident(required)
//!    ├─ launch kernels on the worker's stream (in order)
//!    └─ retire_all; discard mirrors
//! ```
//!
//! Kernel outputs are always buffers homed on the step's worker; mirrors are
//! read-only. An incremental buffer written by one step and read by the next
//! is named by both, so it is never dropped in between.

use std::sync::Arc;

use crate::arena::{BufferId, HostArena};
use crate::driver::{DeviceContext, Kernel};
use crate::error::{ConfigurationError, SchedulerError, SolveError};
use crate::hierarchy::{Hierarchy, NodeId, NodeRole};
use crate::inputs::SolveInputs;
use crate::params::SolveParams;
use crate::registry::{DeviceRegistry, OwnerId};
use crate::scheduler::{BufferScheduler, SchedulerPlan};
use crate::volume::Extent;

use super::DeviceReport;
use super::layout::{FlowBuffers, Layout, NodeBuffers};

/// Extra slots per device for buffers mirrored from other devices.
const MIRROR_SLOTS: usize = 4;

struct Worker {
    owner: OwnerId,
    context: DeviceContext,
}

/// Device-side state of an initialized solve.
pub(crate) struct Executor {
    registry: Arc<DeviceRegistry>,
    workers: Vec<Worker>,
    schedulers: Vec<BufferScheduler>,
    arena: HostArena,
    layout: Layout,
    extent: Extent,
    inv_cc: f32,
    step: f32,
    closed: bool,
}

impl Executor {
    /// Builds host buffers, acquires every device and opens its scheduler.
    ///
    /// On failure everything acquired so far is released again.
    pub fn open(
        registry: Arc<DeviceRegistry>,
        hierarchy: &Hierarchy,
        inputs: &SolveInputs,
        params: &SolveParams,
        extent: Extent,
    ) -> Result<Self, SolveError> {
        let mut arena = HostArena::new(extent.voxels());
        let home = Layout::place(hierarchy, params.devices.len());
        let layout = Layout::build(hierarchy, inputs, home, &mut arena)?;

        let mut exec = Self {
            registry: Arc::clone(&registry),
            workers: Vec::with_capacity(params.devices.len()),
            schedulers: Vec::with_capacity(params.devices.len()),
            arena,
            layout,
            extent,
            inv_cc: params.inv_cc(),
            step: params.step_size,
            closed: false,
        };

        for &device in &params.devices {
            let owner = registry.register_owner();
            registry.acquire_device(owner, device)?;
            let context = match registry
                .acquire_stream(owner, device, None)
                .and_then(|stream| registry.reserve_current_device(stream))
            {
                Ok(context) => context,
                Err(e) => {
                    if let Err(_release) = registry.release_device(owner, device) {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("executor_open: release {device}: {_release}");
                    }
                    return Err(e.into());
                }
            };
            exec.workers.push(Worker { owner, context });
        }

        let mirrors = if exec.workers.len() > 1 { MIRROR_SLOTS } else { 0 };
        for (w, worker) in exec.workers.iter().enumerate() {
            let plan = SchedulerPlan {
                slot_len: extent.voxels(),
                slots_wanted: exec.layout.buffers_on(&exec.arena, w) + mirrors,
                memory_fraction: params.device_memory_fraction,
            };
            let scheduler = BufferScheduler::new(Arc::clone(&registry), worker.context, plan)?;
            exec.schedulers.push(scheduler);
        }
        for (id, desc) in exec.arena.iter() {
            if desc.field.is_disposable() {
                exec.schedulers[exec.layout.home(desc.node)].mark_no_copy_back(id);
            }
        }
        Ok(exec)
    }

    /// Runs one full pass: label propagation, flow update, label update.
    pub fn pass(&mut self, hierarchy: &Hierarchy) -> Result<(), SolveError> {
        self.propagate_labels(hierarchy)?;
        self.solve_max_flow(hierarchy)?;
        self.update_labels(hierarchy)
    }

    /// Residency and transfer figures per device.
    pub fn reports(&self) -> Vec<DeviceReport> {
        self.schedulers
            .iter()
            .enumerate()
            .map(|(w, s)| DeviceReport {
                device: s.device(),
                num_buffers: s.num_buffers(),
                homed_buffers: self.layout.buffers_on(&self.arena, w),
                stats: s.stats(),
            })
            .collect()
    }

    /// Writes leaf labels back, frees every slot and releases every device.
    /// Returns the host buffers and the final per-device report.
    pub fn close(
        mut self,
        hierarchy: &Hierarchy,
    ) -> Result<(HostArena, Layout, Vec<DeviceReport>), SolveError> {
        let labels = self.layout.leaf_labels(hierarchy);
        for (w, scheduler) in self.schedulers.iter_mut().enumerate() {
            let homed: Vec<BufferId> = labels
                .iter()
                .filter(|&&(leaf, _)| self.layout.home(leaf) == w)
                .map(|&(_, id)| id)
                .collect();
            scheduler.teardown(&mut self.arena, &homed)?;
        }
        let reports = self.reports();
        self.schedulers.clear();
        let mut first_err = None;
        for worker in std::mem::take(&mut self.workers) {
            if let Err(e) = self
                .registry
                .release_device(worker.owner, worker.context.device)
            {
                first_err.get_or_insert(e);
            }
        }
        self.closed = true;
        if let Some(e) = first_err {
            return Err(e.into());
        }

        let arena = std::mem::replace(&mut self.arena, HostArena::new(0));
        let layout = std::mem::replace(&mut self.layout, Layout::empty());
        Ok((arena, layout, reports))
    }

    /// Best-effort release of every resource; failures are logged.
    fn abort(&mut self) {
        for scheduler in &mut self.schedulers {
            if let Err(_e) = scheduler.teardown(&mut self.arena, &[]) {
                #[cfg(feature = "tracing")]
                tracing::warn!("executor_abort: teardown on {}: {_e}", scheduler.device());
            }
        }
        self.schedulers.clear();
        for worker in self.workers.drain(..) {
            if let Err(_e) = self
                .registry
                .release_device(worker.owner, worker.context.device)
            {
                #[cfg(feature = "tracing")]
                tracing::warn!("executor_abort: release {}: {_e}", worker.context.device);
            }
        }
        self.closed = true;
    }

    /// Makes `required` resident on `worker` and launches the kernels `build`
    /// produces from their slots.
    fn step(
        &mut self,
        worker: usize,
        required: &[BufferId],
        build: impl FnOnce(&BufferScheduler) -> Result<Vec<Kernel>, SchedulerError>,
    ) -> Result<(), SolveError> {
        let mut mirrors = Vec::new();
        for &id in required {
            let home = self.layout.home(self.arena.descriptor(id)?.node);
            if home != worker {
                self.schedulers[home].flush(&mut self.arena, id)?;
                self.schedulers[worker].mark_no_copy_back(id);
                mirrors.push(id);
            }
        }

        let scheduler = &mut self.schedulers[worker];
        scheduler.ensure_resident(&mut self.arena, required)?;
        let kernels = build(scheduler)?;
        let stream = scheduler.context().stream;
        for kernel in &kernels {
            self.registry.driver().launch(stream, kernel)?;
        }
        scheduler.retire_all();
        for id in mirrors {
            scheduler.discard(id);
            scheduler.unmark_no_copy_back(id);
        }
        debug_assert!(scheduler.is_consistent());
        Ok(())
    }

    fn flow_buffers(&self, node: NodeId) -> Result<FlowBuffers, SolveError> {
        match self.layout.node(node) {
            NodeBuffers::Flow(f) => Ok(f.clone()),
            NodeBuffers::Root { .. } => Err(ConfigurationError::NotATree(format!(
                "{node} has no flow buffers"
            ))
            .into()),
        }
    }

    /// Branch and root labels become the clamped sum of their children's.
    fn propagate_labels(&mut self, hierarchy: &Hierarchy) -> Result<(), SolveError> {
        for &node in hierarchy.post_order() {
            if hierarchy.role(node) == NodeRole::Leaf {
                continue;
            }
            let w = self.layout.home(node);
            let label = self.layout.node(node).label();
            let children = hierarchy.children(node);
            for (i, &child) in children.iter().enumerate() {
                let child_label = self.layout.node(child).label();
                let last = i + 1 == children.len();
                self.step(w, &[label, child_label], |s| {
                    let (dst, src) = (s.slot(label)?, s.slot(child_label)?);
                    let mut k = vec![if i == 0 {
                        Kernel::Copy { src, dst }
                    } else {
                        Kernel::Accumulate { dst, src, scale: 1.0 }
                    }];
                    if last {
                        k.push(Kernel::Clamp { dst, lo: 0.0, hi: 1.0 });
                    }
                    Ok(k)
                })?;
            }
        }
        Ok(())
    }

    /// Spatial flows, divergences, then sink and source flows, children first.
    fn solve_max_flow(&mut self, hierarchy: &Hierarchy) -> Result<(), SolveError> {
        let (inv_cc, step, extent) = (self.inv_cc, self.step, self.extent);
        for &node in hierarchy.post_order() {
            let w = self.layout.home(node);
            let children = hierarchy.children(node);
            let k = children.len() as u32;

            let Some(parent) = hierarchy.parent(node) else {
                let (source, acc) = match self.layout.node(node) {
                    NodeBuffers::Root {
                        source, incremental, ..
                    } => (*source, *incremental),
                    NodeBuffers::Flow(f) => (f.sink, f.incremental),
                };
                self.child_terms(w, acc, children)?;
                self.step(w, &[source, acc], |s| {
                    Ok(vec![Kernel::RootSource {
                        source: s.slot(source)?,
                        acc: s.slot(acc)?,
                        inv_cc,
                        children: k,
                    }])
                })?;
                continue;
            };

            let b = self.flow_buffers(node)?;
            let src = self.layout.node(parent).outflow();
            let alpha = self.layout.alpha(node);
            let [fx, fy, fz] = b.flow;

            self.step(w, &[b.incremental, b.divergence, b.sink, src, b.label], |s| {
                Ok(vec![Kernel::FlowResidual {
                    dst: s.slot(b.incremental)?,
                    div: s.slot(b.divergence)?,
                    sink: s.slot(b.sink)?,
                    source: s.slot(src)?,
                    label: s.slot(b.label)?,
                    inv_cc,
                }])
            })?;
            self.step(w, &[fx, fy, fz, b.incremental], |s| {
                Ok(vec![Kernel::GradientStep {
                    flow: [s.slot(fx)?, s.slot(fy)?, s.slot(fz)?],
                    field: s.slot(b.incremental)?,
                    step,
                    extent,
                }])
            })?;
            let mut project = vec![fx, fy, fz];
            project.extend(b.smoothness);
            self.step(w, &project, |s| {
                Ok(vec![Kernel::ProjectFlow {
                    flow: [s.slot(fx)?, s.slot(fy)?, s.slot(fz)?],
                    smoothness: b.smoothness.map(|id| s.slot(id)).transpose()?,
                    alpha,
                }])
            })?;
            self.step(w, &[b.divergence, fx, fy, fz], |s| {
                Ok(vec![Kernel::Divergence {
                    dst: s.slot(b.divergence)?,
                    flow: [s.slot(fx)?, s.slot(fy)?, s.slot(fz)?],
                    extent,
                }])
            })?;

            if hierarchy.role(node) == NodeRole::Leaf {
                let data = b.data.ok_or(ConfigurationError::MissingDataTerm(node))?;
                self.step(w, &[b.sink, src, b.divergence, b.label, data], |s| {
                    Ok(vec![Kernel::LeafSink {
                        sink: s.slot(b.sink)?,
                        source: s.slot(src)?,
                        div: s.slot(b.divergence)?,
                        label: s.slot(b.label)?,
                        data: s.slot(data)?,
                        inv_cc,
                    }])
                })?;
            } else {
                self.child_terms(w, b.incremental, children)?;
                self.step(w, &[b.sink, src, b.divergence, b.label, b.incremental], |s| {
                    Ok(vec![Kernel::BranchSink {
                        sink: s.slot(b.sink)?,
                        source: s.slot(src)?,
                        div: s.slot(b.divergence)?,
                        label: s.slot(b.label)?,
                        acc: s.slot(b.incremental)?,
                        inv_cc,
                        children: k,
                    }])
                })?;
            }
        }
        Ok(())
    }

    /// `acc = Σ_c (sink_c + div_c - label_c / cc)` over `children`.
    fn child_terms(&mut self, w: usize, acc: BufferId, children: &[NodeId]) -> Result<(), SolveError> {
        let inv_cc = self.inv_cc;
        self.step(w, &[acc], |s| {
            Ok(vec![Kernel::Fill {
                dst: s.slot(acc)?,
                value: 0.0,
            }])
        })?;
        for &child in children {
            let c = self.flow_buffers(child)?;
            self.step(w, &[acc, c.sink, c.divergence, c.label], |s| {
                Ok(vec![Kernel::ChildTerm {
                    acc: s.slot(acc)?,
                    sink: s.slot(c.sink)?,
                    div: s.slot(c.divergence)?,
                    label: s.slot(c.label)?,
                    inv_cc,
                }])
            })?;
        }
        Ok(())
    }

    /// Dual ascent on every non-root label, parents first.
    fn update_labels(&mut self, hierarchy: &Hierarchy) -> Result<(), SolveError> {
        let step = self.step;
        for &node in hierarchy.pre_order() {
            let Some(parent) = hierarchy.parent(node) else {
                continue;
            };
            let w = self.layout.home(node);
            let b = self.flow_buffers(node)?;
            let src = self.layout.node(parent).outflow();
            self.step(w, &[b.label, b.divergence, b.sink, src], |s| {
                Ok(vec![Kernel::LabelUpdate {
                    label: s.slot(b.label)?,
                    div: s.slot(b.divergence)?,
                    sink: s.slot(b.sink)?,
                    source: s.slot(src)?,
                    step,
                }])
            })?;
        }
        Ok(())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if !self.closed {
            self.abort();
        }
    }
}
