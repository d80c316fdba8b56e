//! Error types for device, scheduling, and solve operations.
//!
//! Every failure in this crate is terminal for the current solve: nothing is
//! retried, and each layer wraps the one below it with `#[from]` so the caller
//! sees the original cause.

use thiserror::Error;

use crate::arena::BufferId;
use crate::driver::{DeviceId, StreamId};
use crate::hierarchy::NodeId;
use crate::registry::OwnerId;
use crate::volume::Extent;

/// Failures reported by an accelerator driver call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    /// The device index is not known to the driver.
    #[error("device {0} does not exist")]
    NoSuchDevice(DeviceId),

    /// The stream was never created or has been destroyed.
    #[error("stream {0} is not alive")]
    DeadStream(StreamId),

    /// A slot handle refers to memory that was freed or belongs to another device.
    #[error("invalid device memory access: {0}")]
    InvalidSlot(String),

    /// A host/device transfer had mismatched lengths.
    #[error("transfer size mismatch: expected {expected} values, got {actual}")]
    TransferSize {
        /// Slot length in values.
        expected: usize,
        /// Host slice length in values.
        actual: usize,
    },

    /// A kernel was launched with inconsistent arguments.
    #[error("kernel launch failed: {0}")]
    Launch(String),

    /// A failure injected by a test harness.
    #[error("injected driver failure on {operation}")]
    Injected {
        /// The driver operation that failed.
        operation: &'static str,
    },
}

/// Contract violations of the device registry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    /// Device id outside `0..device_count`.
    #[error("invalid device {device}: driver reports {count} device(s)")]
    InvalidDevice {
        /// Requested device.
        device: DeviceId,
        /// Number of devices the driver exposes.
        count: usize,
    },

    /// A supplied stream is bound to a different device.
    #[error("stream {stream} is bound to device {bound}, not {requested}")]
    StreamDeviceMismatch {
        /// The supplied stream.
        stream: StreamId,
        /// Device the stream belongs to.
        bound: DeviceId,
        /// Device the caller asked for.
        requested: DeviceId,
    },

    /// The stream is not registered.
    #[error("stream {0} is not registered")]
    UnknownStream(StreamId),

    /// No unique mapping exists for the query.
    #[error("no mapping: {0}")]
    NoMapping(String),

    /// The underlying driver call failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl RegistryError {
    pub(crate) fn no_owner_device(owner: OwnerId) -> Self {
        Self::NoMapping(format!("owner {owner} has no unique device"))
    }
}

/// Failures of a buffer scheduler.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    /// No free slot and no evictable buffer for a required buffer.
    #[error(
        "device {device} exhausted: no slot for buffer {buffer} ({num_buffers} slot(s), all in use)"
    )]
    ResourceExhausted {
        /// Device whose scheduler ran out of slots.
        device: DeviceId,
        /// Buffer that could not be made resident.
        buffer: BufferId,
        /// Slots owned by the scheduler.
        num_buffers: usize,
    },

    /// The handle is stale or was never issued by this arena.
    #[error("unknown host buffer {0}")]
    UnknownBuffer(BufferId),

    /// A buffer was used on the device without being resident.
    #[error("host buffer {0} is not resident")]
    NotResident(BufferId),

    /// Host data does not fill exactly one device slot.
    #[error("host buffer holds {actual} values, slots hold {expected}")]
    BufferLength {
        /// Values per slot.
        expected: usize,
        /// Values supplied.
        actual: usize,
    },

    /// A driver call failed during a transfer.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Invalid solve inputs, detected before any device memory is touched.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    /// The hierarchy does not describe a rooted tree.
    #[error("hierarchy is not a tree: {0}")]
    NotATree(String),

    /// The hierarchy has no leaf labels.
    #[error("hierarchy has no leaves")]
    NoLeaves,

    /// A node id does not belong to the hierarchy.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// A leaf has no data term.
    #[error("leaf {0} has no data term")]
    MissingDataTerm(NodeId),

    /// A labelling has no volume for a leaf.
    #[error("leaf {0} has no label volume")]
    MissingLabel(NodeId),

    /// A data term was attached to a non-leaf node.
    #[error("node {0} is not a leaf; data terms apply to leaves only")]
    DataTermOnNonLeaf(NodeId),

    /// An input volume does not share the solve extent.
    #[error("extent mismatch for {what}: expected {expected}, got {actual}")]
    ExtentMismatch {
        /// Description of the offending input.
        what: String,
        /// Solve extent.
        expected: Extent,
        /// Extent of the offending input.
        actual: Extent,
    },

    /// The solve extent has no voxels.
    #[error("solve extent {0} has no voxels")]
    EmptyExtent(Extent),

    /// A solve parameter is outside its range.
    #[error("parameter '{name}' = {value} outside {range}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Supplied value.
        value: f64,
        /// Human-readable valid range.
        range: &'static str,
    },

    /// No devices were listed for the solve.
    #[error("no devices selected")]
    NoDevices,
}

/// Failures of the hierarchy solver.
#[derive(Debug, Error)]
pub enum SolveError {
    /// Invalid inputs.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Device registry contract violation.
    #[error("device registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Buffer scheduling failed (including resource exhaustion).
    #[error("buffer scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Direct driver failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// An operation was called in the wrong lifecycle state.
    #[error("solver is {actual}, expected {expected}")]
    InvalidState {
        /// State required by the operation.
        expected: &'static str,
        /// Current state.
        actual: &'static str,
    },

    /// The run was cancelled between iterations.
    #[error("solve cancelled after {completed} iteration(s)")]
    Cancelled {
        /// Iterations completed before cancellation.
        completed: usize,
    },
}

impl SolveError {
    /// Returns true if this error is a scheduler resource exhaustion.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            Self::Scheduler(SchedulerError::ResourceExhausted { .. })
        )
    }
}
