//! Buffer Scheduler: pages host buffers through a fixed pool of device slots.
//!
//! One scheduler is bound to one device and stream. At construction it probes
//! the device for slots until an allocation comes back empty, so it works with
//! however many slots it could get. During a solve the caller declares which
//! buffers the next step needs; the scheduler maps them, evicting others when
//! the pool is full.
//!
//! # Residency tables
//!
//! ```text
//!  host_to_slot: BufferId  → SlotHandle     (exact inverses)
//!  slot_to_host: SlotHandle → BufferId
//!
//!  stacks[level]: front = least recently used ... back = most recent
//!  level 0  [ b7 b3 b9 ]      ← scanned first when evicting
//!  level 1  [ b2 b4 ]
//!  level 2  [ b0 ]            ← root buffers, evicted last
//! ```
//!
//! # Victim selection
//!
//! When a required buffer has no free slot, the scheduler first looks for a
//! mapped, not-in-use buffer in the no-copy-back set (dropped without a
//! transfer), then for any mapped, not-in-use buffer (written back to the host
//! first). Both scans walk the stacks from level 0 upwards and each stack
//! front to back. If nothing qualifies the call fails with
//! [`SchedulerError::ResourceExhausted`]; a required buffer is never skipped.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::arena::{BufferId, HostArena};
use crate::driver::{DeviceContext, DeviceId, Driver, SlotBlock, SlotHandle};
use crate::error::SchedulerError;
use crate::registry::DeviceRegistry;

/// Sizing request for a scheduler's slot pool.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SchedulerPlan {
    /// Values per slot (voxels of the solve extent).
    pub slot_len: usize,
    /// Slots still needed globally; the pool never exceeds this.
    pub slots_wanted: usize,
    /// Share of the device's free memory to claim, in `(0, 1]`.
    pub memory_fraction: f32,
}

/// Transfer and eviction counters of one scheduler.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Host to device transfers.
    pub uploads: u64,
    /// Device to host transfers (evictions, flushes, releases, teardown).
    pub downloads: u64,
    /// Mappings dropped without write-back.
    pub discards: u64,
    /// Mappings written back to make room for another buffer.
    pub evictions: u64,
    /// Largest number of simultaneously mapped buffers.
    pub peak_mapped: usize,
}

/// Per-device residency manager. Owned by exactly one worker.
pub struct BufferScheduler {
    registry: Arc<DeviceRegistry>,
    context: DeviceContext,
    blocks: Vec<SlotBlock>,
    num_buffers: usize,
    free_slots: Vec<SlotHandle>,
    host_to_slot: HashMap<BufferId, SlotHandle>,
    slot_to_host: HashMap<SlotHandle, BufferId>,
    stacks: Vec<VecDeque<BufferId>>,
    level_of: HashMap<BufferId, usize>,
    in_use: HashSet<BufferId>,
    no_copy_back: BTreeSet<BufferId>,
    stats: SchedulerStats,
    torn_down: bool,
}

impl BufferScheduler {
    /// Probes the context's device for slots and builds an empty scheduler.
    ///
    /// Each probe asks for the slots still wanted within the remaining byte
    /// budget (`free_bytes * memory_fraction`); probing stops at the first
    /// probe that returns nothing. A pool of zero slots is not an error here:
    /// the first [`ensure_resident`](Self::ensure_resident) reports it.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        context: DeviceContext,
        plan: SchedulerPlan,
    ) -> Result<Self, SchedulerError> {
        let driver = Arc::clone(registry.driver());
        let info = driver.device_info(context.device)?;
        let mut budget = (info.free_bytes as f64 * f64::from(plan.memory_fraction)) as usize;

        let mut blocks = Vec::new();
        let mut free_slots = Vec::new();
        let mut acquired = 0;
        while acquired < plan.slots_wanted {
            let block = driver.allocate_slots(
                context.device,
                plan.slots_wanted - acquired,
                plan.slot_len,
                budget,
            )?;
            if block.is_empty() {
                break;
            }
            budget = budget.saturating_sub(block.bytes());
            acquired += block.len();
            free_slots.extend(block.slots.iter().rev().copied());
            blocks.push(block);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "scheduler_new: {} acquired {acquired}/{} slot(s) in {} block(s)",
            context.device,
            plan.slots_wanted,
            blocks.len()
        );

        Ok(Self {
            registry,
            context,
            blocks,
            num_buffers: acquired,
            free_slots,
            host_to_slot: HashMap::new(),
            slot_to_host: HashMap::new(),
            stacks: Vec::new(),
            level_of: HashMap::new(),
            in_use: HashSet::new(),
            no_copy_back: BTreeSet::new(),
            stats: SchedulerStats::default(),
            torn_down: false,
        })
    }

    /// Device and stream this scheduler is bound to.
    pub fn context(&self) -> DeviceContext {
        self.context
    }

    /// Device this scheduler is bound to.
    pub fn device(&self) -> DeviceId {
        self.context.device
    }

    /// Number of slots acquired at construction.
    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    /// Number of currently mapped buffers.
    pub fn mapped(&self) -> usize {
        self.host_to_slot.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SchedulerStats {
        self.stats.clone()
    }

    /// Returns true if `id` currently has a device slot.
    pub fn is_mapped(&self, id: BufferId) -> bool {
        self.host_to_slot.contains_key(&id)
    }

    /// Returns true if `id` is in the in-use set.
    pub fn is_in_use(&self, id: BufferId) -> bool {
        self.in_use.contains(&id)
    }

    /// Slot holding `id`.
    pub fn slot(&self, id: BufferId) -> Result<SlotHandle, SchedulerError> {
        self.host_to_slot
            .get(&id)
            .copied()
            .ok_or(SchedulerError::NotResident(id))
    }

    /// Marks `id` as disposable: its device copy is dropped, never written back.
    pub fn mark_no_copy_back(&mut self, id: BufferId) {
        self.no_copy_back.insert(id);
    }

    /// Removes `id` from the no-copy-back set.
    pub fn unmark_no_copy_back(&mut self, id: BufferId) {
        self.no_copy_back.remove(&id);
    }

    /// Returns true if `id` is in the no-copy-back set.
    pub fn is_no_copy_back(&self, id: BufferId) -> bool {
        self.no_copy_back.contains(&id)
    }

    fn driver(&self) -> &Arc<dyn Driver> {
        self.registry.driver()
    }

    /// Adds `required` to the in-use set and makes every buffer in it resident.
    ///
    /// Already-mapped buffers are only moved to the recently used end of their
    /// stack, so repeating a call performs no transfers. Evicted buffers are
    /// written back into `arena` before their slot is reused.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownBuffer`] for a stale id (checked before
    /// anything changes), [`SchedulerError::ResourceExhausted`] when a buffer
    /// cannot be given a slot, [`SchedulerError::Device`] on transfer failure.
    pub fn ensure_resident(
        &mut self,
        arena: &mut HostArena,
        required: &[BufferId],
    ) -> Result<(), SchedulerError> {
        for &id in required {
            arena.descriptor(id)?;
        }
        self.in_use.extend(required.iter().copied());

        for &id in required {
            if self.host_to_slot.contains_key(&id) {
                self.touch(id);
                continue;
            }
            let slot = match self.free_slots.pop() {
                Some(slot) => slot,
                None => self.reclaim(arena, id)?,
            };
            if let Err(e) = self.map(arena, id, slot) {
                self.free_slots.push(slot);
                return Err(e);
            }
        }
        debug_assert!(self.is_consistent());
        Ok(())
    }

    /// Frees a slot for `wanted` by discarding or evicting a victim.
    fn reclaim(
        &mut self,
        arena: &mut HostArena,
        wanted: BufferId,
    ) -> Result<SlotHandle, SchedulerError> {
        if let Some(victim) = self.find_victim(true) {
            let slot = self.slot(victim)?;
            self.unmap(victim);
            self.stats.discards += 1;
            #[cfg(feature = "tracing")]
            tracing::debug!("scheduler_discard: {victim} dropped for {wanted}");
            return Ok(slot);
        }
        if let Some(victim) = self.find_victim(false) {
            let slot = self.slot(victim)?;
            self.write_back(arena, victim, slot)?;
            self.unmap(victim);
            self.stats.evictions += 1;
            #[cfg(feature = "tracing")]
            tracing::debug!("scheduler_evict: {victim} written back for {wanted}");
            return Ok(slot);
        }
        Err(SchedulerError::ResourceExhausted {
            device: self.context.device,
            buffer: wanted,
            num_buffers: self.num_buffers,
        })
    }

    fn find_victim(&self, disposable_only: bool) -> Option<BufferId> {
        self.stacks.iter().flatten().copied().find(|id| {
            !self.in_use.contains(id) && (!disposable_only || self.no_copy_back.contains(id))
        })
    }

    fn write_back(
        &mut self,
        arena: &mut HostArena,
        id: BufferId,
        slot: SlotHandle,
    ) -> Result<(), SchedulerError> {
        let host = arena.data_mut(id)?;
        self.registry
            .driver()
            .download(self.context.stream, slot, host)?;
        self.stats.downloads += 1;
        Ok(())
    }

    fn map(
        &mut self,
        arena: &HostArena,
        id: BufferId,
        slot: SlotHandle,
    ) -> Result<(), SchedulerError> {
        let level = arena.descriptor(id)?.priority;
        self.driver()
            .upload(self.context.stream, slot, arena.data(id)?)?;
        self.stats.uploads += 1;

        self.host_to_slot.insert(id, slot);
        self.slot_to_host.insert(slot, id);
        if self.stacks.len() <= level {
            self.stacks.resize_with(level + 1, VecDeque::new);
        }
        self.stacks[level].push_back(id);
        self.level_of.insert(id, level);
        self.stats.peak_mapped = self.stats.peak_mapped.max(self.host_to_slot.len());
        Ok(())
    }

    fn touch(&mut self, id: BufferId) {
        if let Some(&level) = self.level_of.get(&id) {
            let stack = &mut self.stacks[level];
            if let Some(pos) = stack.iter().position(|&b| b == id) {
                stack.remove(pos);
            }
            stack.push_back(id);
        }
    }

    /// Drops a mapping from every table and returns its slot (not to the pool).
    fn unmap(&mut self, id: BufferId) -> Option<SlotHandle> {
        let slot = self.host_to_slot.remove(&id)?;
        self.slot_to_host.remove(&slot);
        if let Some(level) = self.level_of.remove(&id) {
            let stack = &mut self.stacks[level];
            if let Some(pos) = stack.iter().position(|&b| b == id) {
                stack.remove(pos);
            }
        }
        Some(slot)
    }

    /// Removes buffers from the in-use set. They stay mapped until evicted.
    pub fn retire(&mut self, ids: &[BufferId]) {
        for id in ids {
            self.in_use.remove(id);
        }
    }

    /// Clears the in-use set.
    pub fn retire_all(&mut self) {
        self.in_use.clear();
    }

    /// Writes a mapped buffer back to the host and waits for the transfer.
    ///
    /// The mapping is kept. An unmapped buffer is already current on the host
    /// and is left alone.
    pub fn flush(&mut self, arena: &mut HostArena, id: BufferId) -> Result<(), SchedulerError> {
        let Some(&slot) = self.host_to_slot.get(&id) else {
            return Ok(());
        };
        self.write_back(arena, id, slot)?;
        self.driver().synchronize(self.context.stream)?;
        Ok(())
    }

    /// Unmaps a buffer without writing it back. No-op if it is not mapped.
    pub fn discard(&mut self, id: BufferId) {
        self.in_use.remove(&id);
        if let Some(slot) = self.unmap(id) {
            self.free_slots.push(slot);
            self.stats.discards += 1;
        }
    }

    /// Unmaps a buffer for good: writes it back unless it is no-copy-back,
    /// returns its slot to the pool, and forgets it.
    pub fn release(&mut self, arena: &mut HostArena, id: BufferId) -> Result<(), SchedulerError> {
        if let Some(&slot) = self.host_to_slot.get(&id) {
            if !self.no_copy_back.contains(&id) {
                self.write_back(arena, id, slot)?;
            }
            self.unmap(id);
            self.free_slots.push(slot);
        }
        self.in_use.remove(&id);
        self.no_copy_back.remove(&id);
        Ok(())
    }

    /// Synchronizes the stream, writes back the listed leaf labels that are
    /// still mapped, then frees every slot and clears every table.
    ///
    /// Other mapped buffers are dropped without write-back. Calling it twice
    /// is a no-op.
    pub fn teardown(
        &mut self,
        arena: &mut HostArena,
        leaf_labels: &[BufferId],
    ) -> Result<(), SchedulerError> {
        if self.torn_down {
            return Ok(());
        }
        self.driver().synchronize(self.context.stream)?;
        for &id in leaf_labels {
            if let Some(&slot) = self.host_to_slot.get(&id) {
                self.write_back(arena, id, slot)?;
            }
        }
        self.free_all()
    }

    fn free_all(&mut self) -> Result<(), SchedulerError> {
        self.torn_down = true;
        self.host_to_slot.clear();
        self.slot_to_host.clear();
        self.stacks.clear();
        self.level_of.clear();
        self.in_use.clear();
        self.no_copy_back.clear();
        self.free_slots.clear();
        let mut first_err = None;
        for block in self.blocks.drain(..) {
            if let Err(e) = self.registry.driver().free_block(&block) {
                first_err.get_or_insert(e);
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "scheduler_teardown: {} freed {} slot(s)",
            self.context.device,
            self.num_buffers
        );
        first_err.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Checks the residency invariants.
    ///
    /// The tables are exact inverses, no more buffers are mapped than slots
    /// exist, mapped plus free slots account for the pool, and a buffer sits
    /// in exactly one stack iff it is mapped.
    pub fn is_consistent(&self) -> bool {
        let inverse = self.host_to_slot.len() == self.slot_to_host.len()
            && self
                .host_to_slot
                .iter()
                .all(|(id, slot)| self.slot_to_host.get(slot) == Some(id));
        let bounded = self.host_to_slot.len() <= self.num_buffers
            && (self.torn_down
                || self.host_to_slot.len() + self.free_slots.len() == self.num_buffers);
        let stacked: usize = self.stacks.iter().map(VecDeque::len).sum();
        let stacks_match = stacked == self.host_to_slot.len()
            && self.level_of.len() == self.host_to_slot.len()
            && self.level_of.iter().all(|(id, &level)| {
                self.host_to_slot.contains_key(id)
                    && self.stacks[level].iter().filter(|&b| b == id).count() == 1
            });
        inverse && bounded && stacks_match
    }

    /// Buffers of one stack, least recently used first.
    pub fn stack(&self, level: usize) -> Vec<BufferId> {
        self.stacks
            .get(level)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Drop for BufferScheduler {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        if let Err(_e) = self.free_all() {
            #[cfg(feature = "tracing")]
            tracing::warn!("scheduler_drop: {_e}");
        }
    }
}

impl core::fmt::Debug for BufferScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BufferScheduler")
            .field("context", &self.context)
            .field("num_buffers", &self.num_buffers)
            .field("mapped", &self.host_to_slot.len())
            .field("in_use", &self.in_use.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{BufferDescriptor, BufferField};
    use crate::driver::HostDriver;
    use crate::hierarchy::NodeId;

    const LEN: usize = 8;
    const SLOT_BYTES: usize = LEN * 4;

    struct Fixture {
        driver: Arc<HostDriver>,
        scheduler: BufferScheduler,
        arena: HostArena,
    }

    fn fixture(slots: usize) -> Fixture {
        fixture_with(HostDriver::uniform(1, slots * SLOT_BYTES), slots)
    }

    fn fixture_with(driver: HostDriver, slots_wanted: usize) -> Fixture {
        let driver = Arc::new(driver);
        let registry = Arc::new(DeviceRegistry::new(driver.clone()));
        let owner = registry.register_owner();
        registry.acquire_device(owner, DeviceId(0)).unwrap();
        let stream = registry.acquire_stream(owner, DeviceId(0), None).unwrap();
        let context = registry.reserve_current_device(stream).unwrap();
        let plan = SchedulerPlan {
            slot_len: LEN,
            slots_wanted,
            memory_fraction: 1.0,
        };
        let scheduler = BufferScheduler::new(registry, context, plan).unwrap();
        Fixture {
            driver,
            scheduler,
            arena: HostArena::new(LEN),
        }
    }

    fn buffer(arena: &mut HostArena, priority: usize, value: f32) -> BufferId {
        arena.allocate(
            BufferDescriptor {
                node: NodeId::new(0),
                field: BufferField::Label,
                priority,
            },
            value,
        )
    }

    #[test]
    fn probing_collects_fragmented_slots() {
        use crate::driver::DeviceSpec;
        let driver = HostDriver::new(vec![
            DeviceSpec::new("frag", 100 * SLOT_BYTES).with_max_slots_per_allocation(3),
        ]);
        let f = fixture_with(driver, 10);
        assert_eq!(f.scheduler.num_buffers(), 10);
    }

    #[test]
    fn probing_respects_memory_fraction() {
        let driver = Arc::new(HostDriver::uniform(1, 10 * SLOT_BYTES));
        let registry = Arc::new(DeviceRegistry::new(driver));
        let owner = registry.register_owner();
        let stream = registry.acquire_stream(owner, DeviceId(0), None).unwrap();
        let context = registry.reserve_current_device(stream).unwrap();
        let plan = SchedulerPlan {
            slot_len: LEN,
            slots_wanted: 100,
            memory_fraction: 0.5,
        };
        let scheduler = BufferScheduler::new(registry, context, plan).unwrap();
        assert_eq!(scheduler.num_buffers(), 5);
    }

    #[test]
    fn capacity_two_third_required_buffer_is_exhausted() {
        let Fixture {
            mut scheduler,
            mut arena,
            ..
        } = fixture(2);
        let (a, b, c) = (
            buffer(&mut arena, 0, 1.0),
            buffer(&mut arena, 0, 2.0),
            buffer(&mut arena, 0, 3.0),
        );
        scheduler.ensure_resident(&mut arena, &[a]).unwrap();
        scheduler.ensure_resident(&mut arena, &[a, b]).unwrap();
        let err = scheduler.ensure_resident(&mut arena, &[a, b, c]).unwrap_err();
        assert_eq!(
            err,
            SchedulerError::ResourceExhausted {
                device: DeviceId(0),
                buffer: c,
                num_buffers: 2
            }
        );
        assert!(scheduler.is_mapped(a) && scheduler.is_mapped(b));
        assert!(scheduler.is_consistent());
    }

    #[test]
    fn capacity_two_evicts_retired_buffer() {
        let Fixture {
            mut scheduler,
            mut arena,
            ..
        } = fixture(2);
        let (a, b, c) = (
            buffer(&mut arena, 0, 1.0),
            buffer(&mut arena, 0, 2.0),
            buffer(&mut arena, 0, 3.0),
        );
        scheduler.ensure_resident(&mut arena, &[a, b]).unwrap();
        scheduler.retire(&[a]);
        scheduler.ensure_resident(&mut arena, &[b, c]).unwrap();
        assert!(!scheduler.is_mapped(a));
        assert!(scheduler.is_mapped(c));
        assert_eq!(scheduler.stats().evictions, 1);
        assert_eq!(scheduler.stats().downloads, 1);
    }

    #[test]
    fn repeat_call_transfers_nothing() {
        let Fixture {
            mut scheduler,
            mut arena,
            ..
        } = fixture(4);
        let ids: Vec<_> = (0..3).map(|i| buffer(&mut arena, 0, i as f32)).collect();
        scheduler.ensure_resident(&mut arena, &ids).unwrap();
        let before = scheduler.stats();
        scheduler.ensure_resident(&mut arena, &ids).unwrap();
        assert_eq!(scheduler.stats(), before);
    }

    #[test]
    fn lower_priority_is_evicted_first() {
        let Fixture {
            mut scheduler,
            mut arena,
            ..
        } = fixture(2);
        let high = buffer(&mut arena, 3, 0.0);
        let low = buffer(&mut arena, 1, 0.0);
        let next = buffer(&mut arena, 2, 0.0);
        scheduler.ensure_resident(&mut arena, &[high, low]).unwrap();
        scheduler.retire_all();
        scheduler.ensure_resident(&mut arena, &[next]).unwrap();
        assert!(scheduler.is_mapped(high));
        assert!(!scheduler.is_mapped(low));
    }

    #[test]
    fn least_recently_used_within_a_level() {
        let Fixture {
            mut scheduler,
            mut arena,
            ..
        } = fixture(3);
        let ids: Vec<_> = (0..4).map(|_| buffer(&mut arena, 0, 0.0)).collect();
        scheduler.ensure_resident(&mut arena, &ids[..3]).unwrap();
        scheduler.retire_all();
        // touching ids[0] makes ids[1] the least recently used
        scheduler.ensure_resident(&mut arena, &[ids[0]]).unwrap();
        scheduler.retire_all();
        assert_eq!(scheduler.stack(0), vec![ids[1], ids[2], ids[0]]);
        scheduler.ensure_resident(&mut arena, &[ids[3]]).unwrap();
        assert!(!scheduler.is_mapped(ids[1]));
        assert!(scheduler.is_mapped(ids[0]));
    }

    #[test]
    fn no_copy_back_is_discarded_before_eviction() {
        let Fixture {
            mut scheduler,
            mut arena,
            ..
        } = fixture(2);
        let keep = buffer(&mut arena, 0, 1.0);
        let scratch = buffer(&mut arena, 5, 2.0);
        let next = buffer(&mut arena, 0, 3.0);
        scheduler.mark_no_copy_back(scratch);
        scheduler.ensure_resident(&mut arena, &[keep, scratch]).unwrap();
        scheduler.retire_all();
        scheduler.ensure_resident(&mut arena, &[next]).unwrap();
        assert!(scheduler.is_mapped(keep));
        assert!(!scheduler.is_mapped(scratch));
        let stats = scheduler.stats();
        assert_eq!((stats.discards, stats.evictions, stats.downloads), (1, 0, 0));
    }

    #[test]
    fn eviction_writes_device_contents_back() {
        let Fixture {
            driver,
            mut scheduler,
            mut arena,
        } = fixture(1);
        let a = buffer(&mut arena, 0, 1.0);
        let b = buffer(&mut arena, 0, 0.0);
        scheduler.ensure_resident(&mut arena, &[a]).unwrap();
        let slot = scheduler.slot(a).unwrap();
        let stream = scheduler.context().stream;
        driver
            .launch(stream, &crate::driver::Kernel::Fill { dst: slot, value: 7.0 })
            .unwrap();
        scheduler.retire_all();
        scheduler.ensure_resident(&mut arena, &[b]).unwrap();
        assert_eq!(arena.data(a).unwrap(), &[7.0; LEN]);
    }

    #[test]
    fn zero_slots_fail_on_first_request() {
        let Fixture {
            mut scheduler,
            mut arena,
            ..
        } = fixture_with(HostDriver::uniform(1, SLOT_BYTES / 2), 4);
        assert_eq!(scheduler.num_buffers(), 0);
        let a = buffer(&mut arena, 0, 0.0);
        assert!(matches!(
            scheduler.ensure_resident(&mut arena, &[a]),
            Err(SchedulerError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn stale_id_is_rejected_before_any_change() {
        let Fixture {
            mut scheduler,
            mut arena,
            ..
        } = fixture(2);
        let a = buffer(&mut arena, 0, 0.0);
        let gone = buffer(&mut arena, 0, 0.0);
        arena.remove(gone).unwrap();
        assert_eq!(
            scheduler.ensure_resident(&mut arena, &[a, gone]),
            Err(SchedulerError::UnknownBuffer(gone))
        );
        assert_eq!(scheduler.mapped(), 0);
        assert!(!scheduler.is_in_use(a));
    }

    #[test]
    fn release_and_teardown() {
        let Fixture {
            driver,
            mut scheduler,
            mut arena,
        } = fixture(3);
        let label = buffer(&mut arena, 0, 0.0);
        let other = buffer(&mut arena, 0, 0.0);
        scheduler.ensure_resident(&mut arena, &[label, other]).unwrap();
        let stream = scheduler.context().stream;
        for id in [label, other] {
            let slot = scheduler.slot(id).unwrap();
            driver
                .launch(stream, &crate::driver::Kernel::Fill { dst: slot, value: 0.5 })
                .unwrap();
        }
        scheduler.release(&mut arena, other).unwrap();
        assert_eq!(arena.data(other).unwrap(), &[0.5; LEN]);
        assert_eq!(scheduler.mapped(), 1);

        scheduler.teardown(&mut arena, &[label]).unwrap();
        assert_eq!(arena.data(label).unwrap(), &[0.5; LEN]);
        assert_eq!(scheduler.mapped(), 0);
        assert_eq!(
            driver.device_info(DeviceId(0)).unwrap().free_bytes,
            3 * SLOT_BYTES
        );
        scheduler.teardown(&mut arena, &[label]).unwrap();
    }

    #[test]
    fn drop_returns_slots() {
        let f = fixture(3);
        let driver = Arc::clone(&f.driver);
        assert_eq!(driver.device_info(DeviceId(0)).unwrap().free_bytes, 0);
        drop(f);
        assert_eq!(
            driver.device_info(DeviceId(0)).unwrap().free_bytes,
            3 * SLOT_BYTES
        );
    }
}
