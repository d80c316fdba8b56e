//! Host buffer arena.
//!
//! Every host-resident field of a solve lives in one [`HostArena`] and is
//! addressed by a [`BufferId`]. Ids carry a generation counter: removing a
//! buffer bumps the generation of its entry, so a handle kept past removal is
//! rejected instead of silently reading whatever buffer reused the entry.

use crate::error::SchedulerError;
use crate::hierarchy::NodeId;

/// Generation-checked handle of a host buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    index: u32,
    generation: u32,
}

impl BufferId {
    /// Creates a handle from its raw parts.
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena entry index.
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the entry when the handle was issued.
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl core::fmt::Display for BufferId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "b{}g{}", self.index, self.generation)
    }
}

/// Which field of a node a buffer holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferField {
    /// Root source flow.
    Source,
    /// Label (primal estimate).
    Label,
    /// Incremental-update working field.
    Incremental,
    /// Spatial flow, x component.
    FlowX,
    /// Spatial flow, y component.
    FlowY,
    /// Spatial flow, z component.
    FlowZ,
    /// Divergence of the spatial flow.
    Divergence,
    /// Sink flow.
    Sink,
    /// Smoothness weight field.
    Smoothness,
    /// Leaf data term.
    Data,
}

impl BufferField {
    /// Short name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Label => "label",
            Self::Incremental => "incremental",
            Self::FlowX => "flow_x",
            Self::FlowY => "flow_y",
            Self::FlowZ => "flow_z",
            Self::Divergence => "divergence",
            Self::Sink => "sink",
            Self::Smoothness => "smoothness",
            Self::Data => "data",
        }
    }

    /// Fields whose device copy never needs writing back to the host.
    ///
    /// Incremental updates are rebuilt before every use; smoothness and data
    /// terms are read-only inputs.
    pub fn is_disposable(self) -> bool {
        matches!(self, Self::Incremental | Self::Smoothness | Self::Data)
    }
}

/// Identity of one logical field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    /// Node owning the field.
    pub node: NodeId,
    /// Field kind.
    pub field: BufferField,
    /// Eviction priority level; lower levels are evicted first.
    pub priority: usize,
}

struct Entry {
    generation: u32,
    buffer: Option<(BufferDescriptor, Vec<f32>)>,
}

/// Owner of every host buffer of one solve.
///
/// All buffers have the same length, one device slot's worth of values.
pub struct HostArena {
    entries: Vec<Entry>,
    free: Vec<u32>,
    slot_len: usize,
    live: usize,
}

impl HostArena {
    /// Creates an empty arena for buffers of `slot_len` values.
    pub fn new(slot_len: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            slot_len,
            live: 0,
        }
    }

    /// Values per buffer.
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns true if the arena holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Adds a buffer filled with `value`.
    pub fn allocate(&mut self, desc: BufferDescriptor, value: f32) -> BufferId {
        let data = vec![value; self.slot_len];
        self.place(desc, data)
    }

    /// Adds a buffer holding `data`, which must be exactly one slot long.
    pub fn insert(&mut self, desc: BufferDescriptor, data: Vec<f32>) -> Result<BufferId, SchedulerError> {
        if data.len() != self.slot_len {
            return Err(SchedulerError::BufferLength {
                expected: self.slot_len,
                actual: data.len(),
            });
        }
        Ok(self.place(desc, data))
    }

    fn place(&mut self, desc: BufferDescriptor, data: Vec<f32>) -> BufferId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.buffer = Some((desc, data));
            return BufferId::new(index, entry.generation);
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            buffer: Some((desc, data)),
        });
        BufferId::new(index, 0)
    }

    /// Removes a buffer, returning its data. The handle becomes stale.
    pub fn remove(&mut self, id: BufferId) -> Result<Vec<f32>, SchedulerError> {
        let entry = self.entry_mut(id)?;
        let (_, data) = entry.buffer.take().ok_or(SchedulerError::UnknownBuffer(id))?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Ok(data)
    }

    /// Returns true if `id` refers to a live buffer.
    pub fn contains(&self, id: BufferId) -> bool {
        self.buffer(id).is_ok()
    }

    /// Descriptor of a live buffer.
    pub fn descriptor(&self, id: BufferId) -> Result<BufferDescriptor, SchedulerError> {
        self.buffer(id).map(|(desc, _)| *desc)
    }

    /// Host data of a live buffer.
    pub fn data(&self, id: BufferId) -> Result<&[f32], SchedulerError> {
        self.buffer(id).map(|(_, data)| data.as_slice())
    }

    /// Mutable host data of a live buffer.
    pub fn data_mut(&mut self, id: BufferId) -> Result<&mut [f32], SchedulerError> {
        self.entry_mut(id)?
            .buffer
            .as_mut()
            .map(|(_, data)| data.as_mut_slice())
            .ok_or(SchedulerError::UnknownBuffer(id))
    }

    /// Live buffers with their descriptors, in entry order.
    pub fn iter(&self) -> impl Iterator<Item = (BufferId, BufferDescriptor)> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, entry)| {
            entry
                .buffer
                .as_ref()
                .map(|(desc, _)| (BufferId::new(i as u32, entry.generation), *desc))
        })
    }

    fn buffer(&self, id: BufferId) -> Result<&(BufferDescriptor, Vec<f32>), SchedulerError> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.buffer.as_ref())
            .ok_or(SchedulerError::UnknownBuffer(id))
    }

    fn entry_mut(&mut self, id: BufferId) -> Result<&mut Entry, SchedulerError> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .ok_or(SchedulerError::UnknownBuffer(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(field: BufferField) -> BufferDescriptor {
        BufferDescriptor {
            node: NodeId::new(0),
            field,
            priority: 0,
        }
    }

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut arena = HostArena::new(4);
        let a = arena.allocate(desc(BufferField::Label), 1.0);
        arena.remove(a).unwrap();
        let b = arena.allocate(desc(BufferField::Sink), 2.0);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(arena.data(a), Err(SchedulerError::UnknownBuffer(a)));
        assert_eq!(arena.data(b).unwrap(), &[2.0; 4]);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn insert_checks_length() {
        let mut arena = HostArena::new(3);
        let err = arena.insert(desc(BufferField::Data), vec![0.0; 2]).unwrap_err();
        assert_eq!(err, SchedulerError::BufferLength { expected: 3, actual: 2 });
        assert!(arena.is_empty());
    }

    #[test]
    fn double_remove_fails() {
        let mut arena = HostArena::new(1);
        let a = arena.allocate(desc(BufferField::Label), 0.0);
        arena.remove(a).unwrap();
        assert!(arena.remove(a).is_err());
    }

    #[test]
    fn disposable_fields() {
        assert!(BufferField::Incremental.is_disposable());
        assert!(BufferField::Data.is_disposable());
        assert!(!BufferField::Label.is_disposable());
        assert!(!BufferField::Sink.is_disposable());
    }
}
