//! Host-memory emulation of accelerator devices.
//!
//! [`HostDriver`] behaves like a small multi-GPU runtime: each device has a
//! fixed memory capacity, allocations come back as slot blocks, and work is
//! submitted through streams. Work executes at submission time, which is a
//! valid schedule for an in-order stream; `synchronize` therefore only checks
//! that the stream is alive.
//!
//! Per-device [`DriverCounters`] record transfers, launches, and resets so
//! callers can observe scheduling behaviour without real hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::DeviceError;

use super::kernels::{self, SlotMemory};
use super::{DeviceId, DeviceInfo, Driver, Kernel, SlotBlock, SlotHandle, StreamId};

/// Description of one emulated device.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceSpec {
    /// Human-readable device name.
    pub name: String,
    /// Memory capacity in bytes.
    pub memory_bytes: usize,
    /// Largest number of slots a single allocation may return.
    ///
    /// `None` means unlimited. Smaller values emulate fragmented memory, where
    /// a scheduler has to probe several times to collect its slots.
    pub max_slots_per_allocation: Option<usize>,
}

impl DeviceSpec {
    /// A device with `memory_bytes` of memory and unfragmented allocation.
    pub fn new(name: impl Into<String>, memory_bytes: usize) -> Self {
        Self {
            name: name.into(),
            memory_bytes,
            max_slots_per_allocation: None,
        }
    }

    /// Caps how many slots one allocation may return.
    pub fn with_max_slots_per_allocation(mut self, max: usize) -> Self {
        self.max_slots_per_allocation = Some(max);
        self
    }
}

/// Activity counters of one emulated device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriverCounters {
    /// Host to device transfers.
    pub uploads: u64,
    /// Device to host transfers.
    pub downloads: u64,
    /// Kernel launches.
    pub launches: u64,
    /// Device resets.
    pub resets: u64,
    /// Streams created.
    pub streams_created: u64,
    /// Streams destroyed (explicitly or by reset).
    pub streams_destroyed: u64,
    /// Stream synchronizations.
    pub synchronizations: u64,
}

struct BlockRecord {
    slots: Vec<u32>,
    bytes: usize,
}

struct EmulatedDevice {
    spec: DeviceSpec,
    memory: SlotMemory,
    blocks: HashMap<u32, BlockRecord>,
    next_block: u32,
    allocated_bytes: usize,
    counters: DriverCounters,
}

impl EmulatedDevice {
    fn new(spec: DeviceSpec) -> Self {
        Self {
            spec,
            memory: SlotMemory::default(),
            blocks: HashMap::new(),
            next_block: 1,
            allocated_bytes: 0,
            counters: DriverCounters::default(),
        }
    }

    fn free_bytes(&self) -> usize {
        self.spec.memory_bytes.saturating_sub(self.allocated_bytes)
    }
}

/// Emulated multi-device accelerator backed by host memory.
pub struct HostDriver {
    devices: Vec<Mutex<EmulatedDevice>>,
    streams: Mutex<HashMap<StreamId, DeviceId>>,
    next_stream: AtomicU64,
    transfers: AtomicU64,
    fail_transfer_at: Mutex<Option<u64>>,
    fail_reset: Mutex<Option<DeviceId>>,
}

impl HostDriver {
    /// Creates a driver exposing the given devices, in order.
    pub fn new(specs: Vec<DeviceSpec>) -> Self {
        Self {
            devices: specs
                .into_iter()
                .map(|spec| Mutex::new(EmulatedDevice::new(spec)))
                .collect(),
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            transfers: AtomicU64::new(0),
            fail_transfer_at: Mutex::new(None),
            fail_reset: Mutex::new(None),
        }
    }

    /// `count` identical devices with `memory_bytes` each.
    pub fn uniform(count: usize, memory_bytes: usize) -> Self {
        Self::new(
            (0..count)
                .map(|i| DeviceSpec::new(format!("emulated-{i}"), memory_bytes))
                .collect(),
        )
    }

    /// Counter snapshot for one device.
    pub fn counters(&self, device: DeviceId) -> Result<DriverCounters, DeviceError> {
        Ok(self.device(device)?.lock().counters.clone())
    }

    /// Number of live streams on `device`.
    pub fn live_streams(&self, device: DeviceId) -> usize {
        self.streams.lock().values().filter(|&&d| d == device).count()
    }

    /// Makes the transfer with zero-based sequence number `n` (counted from
    /// now, across all devices) fail with [`DeviceError::Injected`].
    pub fn fail_transfer_after(&self, n: u64) {
        let now = self.transfers.load(Ordering::SeqCst);
        *self.fail_transfer_at.lock() = Some(now + n);
    }

    /// Makes the next reset of `device` report [`DeviceError::Injected`].
    /// The device is still cleared.
    pub fn fail_reset_of(&self, device: DeviceId) {
        *self.fail_reset.lock() = Some(device);
    }

    fn device(&self, device: DeviceId) -> Result<&Mutex<EmulatedDevice>, DeviceError> {
        self.devices
            .get(device.index())
            .ok_or(DeviceError::NoSuchDevice(device))
    }

    fn stream_device(&self, stream: StreamId) -> Result<DeviceId, DeviceError> {
        self.streams
            .lock()
            .get(&stream)
            .copied()
            .ok_or(DeviceError::DeadStream(stream))
    }

    /// Resolves the stream and checks the slot lives on the same device.
    fn transfer_target(
        &self,
        stream: StreamId,
        slot: SlotHandle,
        operation: &'static str,
    ) -> Result<&Mutex<EmulatedDevice>, DeviceError> {
        let device = self.stream_device(stream)?;
        if slot.device != device {
            return Err(DeviceError::InvalidSlot(format!(
                "{slot} accessed through stream {stream} of {device}"
            )));
        }
        let seq = self.transfers.fetch_add(1, Ordering::SeqCst);
        let mut fail_at = self.fail_transfer_at.lock();
        if *fail_at == Some(seq) {
            *fail_at = None;
            return Err(DeviceError::Injected { operation });
        }
        self.device(device)
    }
}

impl Driver for HostDriver {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo, DeviceError> {
        let dev = self.device(device)?.lock();
        Ok(DeviceInfo {
            id: device,
            name: dev.spec.name.clone(),
            total_bytes: dev.spec.memory_bytes,
            free_bytes: dev.free_bytes(),
        })
    }

    fn create_stream(&self, device: DeviceId) -> Result<StreamId, DeviceError> {
        self.device(device)?.lock().counters.streams_created += 1;
        let stream = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        self.streams.lock().insert(stream, device);
        Ok(stream)
    }

    fn destroy_stream(&self, stream: StreamId) -> Result<(), DeviceError> {
        let device = self
            .streams
            .lock()
            .remove(&stream)
            .ok_or(DeviceError::DeadStream(stream))?;
        self.device(device)?.lock().counters.streams_destroyed += 1;
        Ok(())
    }

    fn synchronize(&self, stream: StreamId) -> Result<(), DeviceError> {
        let device = self.stream_device(stream)?;
        self.device(device)?.lock().counters.synchronizations += 1;
        Ok(())
    }

    fn reset_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        let target = self.device(device)?;
        let destroyed = {
            let mut streams = self.streams.lock();
            let before = streams.len();
            streams.retain(|_, d| *d != device);
            (before - streams.len()) as u64
        };
        let mut dev = target.lock();
        dev.memory.clear();
        dev.blocks.clear();
        dev.allocated_bytes = 0;
        dev.counters.resets += 1;
        dev.counters.streams_destroyed += destroyed;
        drop(dev);
        let mut fail = self.fail_reset.lock();
        if *fail == Some(device) {
            *fail = None;
            return Err(DeviceError::Injected { operation: "reset" });
        }
        Ok(())
    }

    fn allocate_slots(
        &self,
        device: DeviceId,
        wanted: usize,
        slot_len: usize,
        byte_limit: usize,
    ) -> Result<SlotBlock, DeviceError> {
        let mut dev = self.device(device)?.lock();
        let slot_bytes = slot_len * core::mem::size_of::<f32>();
        let mut count = if slot_bytes == 0 {
            0
        } else {
            wanted.min(byte_limit.min(dev.free_bytes()) / slot_bytes)
        };
        if let Some(max) = dev.spec.max_slots_per_allocation {
            count = count.min(max);
        }
        if count == 0 {
            return Ok(SlotBlock {
                device,
                id: 0,
                slots: Vec::new(),
                slot_len,
            });
        }

        let first = dev.memory.grow(count, slot_len);
        let indices: Vec<u32> = (first..first + count as u32).collect();
        let id = dev.next_block;
        dev.next_block += 1;
        dev.allocated_bytes += count * slot_bytes;
        dev.blocks.insert(
            id,
            BlockRecord {
                slots: indices.clone(),
                bytes: count * slot_bytes,
            },
        );
        Ok(SlotBlock {
            device,
            id,
            slots: indices
                .into_iter()
                .map(|index| SlotHandle { device, index })
                .collect(),
            slot_len,
        })
    }

    fn free_block(&self, block: &SlotBlock) -> Result<(), DeviceError> {
        if block.is_empty() {
            return Ok(());
        }
        let mut dev = self.device(block.device)?.lock();
        let record = dev.blocks.remove(&block.id).ok_or_else(|| {
            DeviceError::InvalidSlot(format!("block {} of {} is not allocated", block.id, block.device))
        })?;
        for index in record.slots {
            dev.memory.free(index);
        }
        dev.allocated_bytes -= record.bytes;
        Ok(())
    }

    fn upload(&self, stream: StreamId, slot: SlotHandle, src: &[f32]) -> Result<(), DeviceError> {
        let mut dev = self.transfer_target(stream, slot, "upload")?.lock();
        let dst = dev.memory.write(slot)?;
        if dst.len() != src.len() {
            return Err(DeviceError::TransferSize {
                expected: dst.len(),
                actual: src.len(),
            });
        }
        dst.copy_from_slice(src);
        dev.counters.uploads += 1;
        Ok(())
    }

    fn download(
        &self,
        stream: StreamId,
        slot: SlotHandle,
        dst: &mut [f32],
    ) -> Result<(), DeviceError> {
        let mut dev = self.transfer_target(stream, slot, "download")?.lock();
        let src = dev.memory.read(slot)?;
        if dst.len() != src.len() {
            return Err(DeviceError::TransferSize {
                expected: src.len(),
                actual: dst.len(),
            });
        }
        dst.copy_from_slice(src);
        dev.counters.downloads += 1;
        Ok(())
    }

    fn launch(&self, stream: StreamId, kernel: &Kernel) -> Result<(), DeviceError> {
        let device = self.stream_device(stream)?;
        if let Some(foreign) = kernels::slots(kernel).find(|s| s.device != device) {
            return Err(DeviceError::Launch(format!(
                "{} on {device} references {foreign}",
                kernel.name()
            )));
        }
        let mut dev = self.device(device)?.lock();
        kernels::execute(&mut dev.memory, kernel)?;
        dev.counters.launches += 1;
        Ok(())
    }
}
