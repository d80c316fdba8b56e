//! Accelerator driver abstraction.
//!
//! [`Driver`] is the seam between hmflow and an accelerator runtime. It exposes
//! the handful of calls the registry and schedulers need: stream lifecycle,
//! device reset, slot allocation, host/device transfers, and kernel launches.
//!
//! Every call names its device, stream, or slot explicitly. There is no
//! "current device" hidden in driver state; a caller that wants one carries a
//! [`DeviceContext`] obtained from the registry.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ DeviceRegistry / Scheduler   │
//! └──────────────┬───────────────┘
//!                │ Arc<dyn Driver>
//!                ▼
//! ┌──────────────────────────────┐
//! │ Driver trait                 │
//! │ streams / slots / kernels    │
//! └──────────────┬───────────────┘
//!        ┌───────┴────────┐
//!        ▼                ▼
//! ┌─────────────┐  ┌─────────────┐
//! │ HostDriver  │  │ (future)    │
//! │ (emulated)  │  │ CUDA, wgpu  │
//! └─────────────┘  └─────────────┘
//! ```
//!
//! [`HostDriver`] emulates devices in host memory with a fixed byte capacity,
//! which is what the CLI and the test suite run on.

mod host;
mod kernels;

pub use host::{DeviceSpec, DriverCounters, HostDriver};

use crate::error::DeviceError;
use crate::volume::Extent;

/// Index of a physical accelerator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Position of the device in driver order.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "gpu{}", self.0)
    }
}

/// Handle of an asynchronous, in-order execution queue on one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Explicit device context: which device and stream subsequent calls target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceContext {
    /// Target device.
    pub device: DeviceId,
    /// Stream on that device.
    pub stream: StreamId,
}

/// One device buffer slot, able to hold exactly one field of the solve extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotHandle {
    /// Device owning the memory.
    pub device: DeviceId,
    /// Driver-assigned slot index on that device.
    pub index: u32,
}

impl core::fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:slot{}", self.device, self.index)
    }
}

/// A contiguous group of slots returned by one allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotBlock {
    /// Device owning the block.
    pub device: DeviceId,
    /// Driver-assigned block id.
    pub id: u32,
    /// Slots in the block, in address order.
    pub slots: Vec<SlotHandle>,
    /// Values per slot.
    pub slot_len: usize,
}

impl SlotBlock {
    /// Number of slots in the block.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the allocation produced no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes covered by the block.
    pub fn bytes(&self) -> usize {
        self.slots.len() * self.slot_len * core::mem::size_of::<f32>()
    }
}

/// Static description of a device.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    /// Device id.
    pub id: DeviceId,
    /// Human-readable name.
    pub name: String,
    /// Memory capacity in bytes.
    pub total_bytes: usize,
    /// Memory not currently allocated, in bytes.
    pub free_bytes: usize,
}

/// A voxel-parallel operation executed on device slots.
///
/// The instruction set is what one hierarchical max-flow pass needs. Slots
/// named as outputs must be distinct from every input slot. `inv_cc` is the
/// reciprocal of the augmented-Lagrangian weight.
#[derive(Clone, Debug, PartialEq)]
pub enum Kernel {
    /// `dst = value`.
    Fill {
        /// Output slot.
        dst: SlotHandle,
        /// Value written to every voxel.
        value: f32,
    },

    /// `dst = src`.
    Copy {
        /// Input slot.
        src: SlotHandle,
        /// Output slot.
        dst: SlotHandle,
    },

    /// `dst += scale * src`.
    Accumulate {
        /// Accumulator slot.
        dst: SlotHandle,
        /// Input slot.
        src: SlotHandle,
        /// Multiplier applied to `src`.
        scale: f32,
    },

    /// `dst = clamp(dst, lo, hi)`.
    Clamp {
        /// Slot clamped in place.
        dst: SlotHandle,
        /// Lower bound.
        lo: f32,
        /// Upper bound.
        hi: f32,
    },

    /// `dst = div - source + sink - label * inv_cc`.
    FlowResidual {
        /// Incremental-update output.
        dst: SlotHandle,
        /// Divergence of the node's flow.
        div: SlotHandle,
        /// Node's sink flow.
        sink: SlotHandle,
        /// Parent's outgoing flow.
        source: SlotHandle,
        /// Node label.
        label: SlotHandle,
        /// Reciprocal penalty weight.
        inv_cc: f32,
    },

    /// `flow += step * grad(field)` with forward differences, zero at the upper face.
    GradientStep {
        /// Flow components x, y, z.
        flow: [SlotHandle; 3],
        /// Scalar field whose gradient is taken.
        field: SlotHandle,
        /// Step size.
        step: f32,
        /// Voxel grid of every slot.
        extent: Extent,
    },

    /// Rescale each voxel's flow vector so `|flow| <= alpha * smoothness`.
    ProjectFlow {
        /// Flow components x, y, z.
        flow: [SlotHandle; 3],
        /// Optional smoothness field; constant 1 when absent.
        smoothness: Option<SlotHandle>,
        /// Node's smoothness weight.
        alpha: f32,
    },

    /// `dst = div(flow)` with backward differences (adjoint of [`Kernel::GradientStep`]).
    Divergence {
        /// Output slot.
        dst: SlotHandle,
        /// Flow components x, y, z.
        flow: [SlotHandle; 3],
        /// Voxel grid of every slot.
        extent: Extent,
    },

    /// `sink = min(source - div + label * inv_cc, data)`.
    LeafSink {
        /// Sink flow, overwritten.
        sink: SlotHandle,
        /// Parent's outgoing flow.
        source: SlotHandle,
        /// Node divergence.
        div: SlotHandle,
        /// Node label.
        label: SlotHandle,
        /// Leaf data term (capacity).
        data: SlotHandle,
        /// Reciprocal penalty weight.
        inv_cc: f32,
    },

    /// `acc += sink + div - label * inv_cc` for one child.
    ChildTerm {
        /// Parent's accumulator.
        acc: SlotHandle,
        /// Child sink flow.
        sink: SlotHandle,
        /// Child divergence.
        div: SlotHandle,
        /// Child label.
        label: SlotHandle,
        /// Reciprocal penalty weight.
        inv_cc: f32,
    },

    /// `sink = (source - div + label * inv_cc + acc) / (children + 1)`.
    BranchSink {
        /// Sink flow, overwritten.
        sink: SlotHandle,
        /// Parent's outgoing flow.
        source: SlotHandle,
        /// Node divergence.
        div: SlotHandle,
        /// Node label.
        label: SlotHandle,
        /// Sum of child terms.
        acc: SlotHandle,
        /// Reciprocal penalty weight.
        inv_cc: f32,
        /// Number of children.
        children: u32,
    },

    /// `source = (inv_cc + acc) / children`.
    RootSource {
        /// Source flow, overwritten.
        source: SlotHandle,
        /// Sum of child terms.
        acc: SlotHandle,
        /// Reciprocal penalty weight.
        inv_cc: f32,
        /// Number of children.
        children: u32,
    },

    /// `label = clamp(label - step * (div + sink - source), 0, 1)`.
    LabelUpdate {
        /// Label, updated in place.
        label: SlotHandle,
        /// Node divergence.
        div: SlotHandle,
        /// Node sink flow.
        sink: SlotHandle,
        /// Parent's outgoing flow.
        source: SlotHandle,
        /// Step size.
        step: f32,
    },
}

impl Kernel {
    /// Short name for logs and counters.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fill { .. } => "fill",
            Self::Copy { .. } => "copy",
            Self::Accumulate { .. } => "accumulate",
            Self::Clamp { .. } => "clamp",
            Self::FlowResidual { .. } => "flow_residual",
            Self::GradientStep { .. } => "gradient_step",
            Self::ProjectFlow { .. } => "project_flow",
            Self::Divergence { .. } => "divergence",
            Self::LeafSink { .. } => "leaf_sink",
            Self::ChildTerm { .. } => "child_term",
            Self::BranchSink { .. } => "branch_sink",
            Self::RootSource { .. } => "root_source",
            Self::LabelUpdate { .. } => "label_update",
        }
    }
}

/// Accelerator runtime used by the registry and the buffer schedulers.
///
/// Implementations must be callable from any thread. Work submitted to one
/// stream executes in submission order; `synchronize` blocks until the
/// stream is drained.
pub trait Driver: Send + Sync {
    /// Number of devices visible to the runtime.
    fn device_count(&self) -> usize;

    /// Name and memory figures for a device.
    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo, DeviceError>;

    /// Creates a new stream on `device`.
    fn create_stream(&self, device: DeviceId) -> Result<StreamId, DeviceError>;

    /// Destroys a stream. Pending work is discarded.
    fn destroy_stream(&self, stream: StreamId) -> Result<(), DeviceError>;

    /// Blocks until all work queued on `stream` has completed.
    fn synchronize(&self, stream: StreamId) -> Result<(), DeviceError>;

    /// Frees every allocation and stream of `device`.
    fn reset_device(&self, device: DeviceId) -> Result<(), DeviceError>;

    /// Allocates up to `wanted` slots of `slot_len` values, using no more than
    /// `byte_limit` bytes. Returns an empty block when nothing fits.
    fn allocate_slots(
        &self,
        device: DeviceId,
        wanted: usize,
        slot_len: usize,
        byte_limit: usize,
    ) -> Result<SlotBlock, DeviceError>;

    /// Returns a block's memory to the device.
    fn free_block(&self, block: &SlotBlock) -> Result<(), DeviceError>;

    /// Copies host values into a slot.
    fn upload(&self, stream: StreamId, slot: SlotHandle, src: &[f32]) -> Result<(), DeviceError>;

    /// Copies a slot back to host memory.
    fn download(
        &self,
        stream: StreamId,
        slot: SlotHandle,
        dst: &mut [f32],
    ) -> Result<(), DeviceError>;

    /// Enqueues a kernel on `stream`.
    fn launch(&self, stream: StreamId, kernel: &Kernel) -> Result<(), DeviceError>;
}
