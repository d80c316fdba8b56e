//! Device Registry: arbitration of devices and streams between owners.
//!
//! Every component that uses an accelerator goes through one registry rather
//! than the driver. The registry records two relations:
//!
//! ```text
//! stakes:   (owner, device)          one row per stakeholder
//! streams:  stream → (device, {owners})
//! ```
//!
//! A device is reset (all of its memory released) only when its last
//! stakeholder leaves, and a stream is destroyed only when its last owner
//! releases it. All tables sit behind one [`parking_lot::Mutex`], held across
//! the driver calls that change device state.
//!
//! The registry is not a process global: callers share it as
//! `Arc<DeviceRegistry>` and pass it to the components that need devices.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::driver::{DeviceContext, DeviceId, DeviceInfo, Driver, StreamId};
use crate::error::{DeviceError, RegistryError};

/// Opaque identity of a registry client (a solver worker, a renderer, ...).
///
/// Minted by [`DeviceRegistry::register_owner`]; never reused within a registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl core::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "owner{}", self.0)
    }
}

struct StreamBinding {
    device: DeviceId,
    owners: BTreeSet<OwnerId>,
}

#[derive(Default)]
struct Tables {
    stakes: BTreeSet<(OwnerId, DeviceId)>,
    streams: BTreeMap<StreamId, StreamBinding>,
}

impl Tables {
    fn has_stakeholders(&self, device: DeviceId) -> bool {
        self.stakes.iter().any(|&(_, d)| d == device)
    }
}

/// Shared arbiter of devices and streams.
pub struct DeviceRegistry {
    driver: Arc<dyn Driver>,
    tables: Mutex<Tables>,
    next_owner: AtomicU64,
}

impl DeviceRegistry {
    /// Creates a registry over `driver`.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            tables: Mutex::new(Tables::default()),
            next_owner: AtomicU64::new(1),
        }
    }

    /// The driver this registry arbitrates.
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Number of devices the driver exposes.
    pub fn device_count(&self) -> usize {
        self.driver.device_count()
    }

    /// Description of every device.
    pub fn devices(&self) -> Result<Vec<DeviceInfo>, RegistryError> {
        (0..self.device_count() as u32)
            .map(|i| self.driver.device_info(DeviceId(i)).map_err(Into::into))
            .collect()
    }

    /// Mints a fresh owner identity.
    pub fn register_owner(&self) -> OwnerId {
        OwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    fn check_device(&self, device: DeviceId) -> Result<(), RegistryError> {
        let count = self.device_count();
        if device.index() >= count {
            return Err(RegistryError::InvalidDevice { device, count });
        }
        Ok(())
    }

    /// Registers `owner` as a stakeholder of `device`. Idempotent.
    pub fn acquire_device(&self, owner: OwnerId, device: DeviceId) -> Result<(), RegistryError> {
        self.check_device(device)?;
        let inserted = self.tables.lock().stakes.insert((owner, device));
        if inserted {
            #[cfg(feature = "tracing")]
            tracing::debug!("registry_acquire: {owner} staked {device}");
        }
        Ok(())
    }

    /// Removes `owner`'s stake in `device`.
    ///
    /// Streams the owner holds on the device are released first. When no
    /// stakeholders remain, every stream still bound to the device is
    /// synchronized and destroyed, then the device is reset.
    ///
    /// The tables are updated and every teardown step is attempted even when
    /// a driver call fails; the first failure is returned afterwards.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NoMapping`] if the stake does not exist;
    /// [`RegistryError::Device`] if a driver call fails.
    pub fn release_device(&self, owner: OwnerId, device: DeviceId) -> Result<(), RegistryError> {
        self.check_device(device)?;
        let mut tables = self.tables.lock();
        if !tables.stakes.remove(&(owner, device)) {
            return Err(RegistryError::NoMapping(format!(
                "{owner} holds no stake in {device}"
            )));
        }

        let mut first_err = None;
        let owned: Vec<StreamId> = tables
            .streams
            .iter()
            .filter(|(_, b)| b.device == device && b.owners.contains(&owner))
            .map(|(&s, _)| s)
            .collect();
        for stream in owned {
            if let Err(e) = self.unbind(&mut tables, owner, stream) {
                first_err.get_or_insert(e);
            }
        }

        if !tables.has_stakeholders(device) {
            let orphaned: Vec<StreamId> = tables
                .streams
                .iter()
                .filter(|(_, b)| b.device == device)
                .map(|(&s, _)| s)
                .collect();
            for stream in orphaned {
                tables.streams.remove(&stream);
                if let Err(e) = self.teardown_stream(stream) {
                    first_err.get_or_insert(e.into());
                }
            }
            if let Err(e) = self.driver.reset_device(device) {
                first_err.get_or_insert(e.into());
            }
            #[cfg(feature = "tracing")]
            tracing::debug!("registry_release: last stake in {device} gone, device reset");
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Synchronizes and destroys a stream, attempting both steps.
    fn teardown_stream(&self, stream: StreamId) -> Result<(), DeviceError> {
        let synced = self.driver.synchronize(stream);
        let destroyed = self.driver.destroy_stream(stream);
        synced.and(destroyed)
    }

    /// Removes `owner` from a stream; destroys the stream if no owner remains.
    ///
    /// The binding is dropped from the tables before the driver is asked to
    /// destroy the stream.
    fn unbind(
        &self,
        tables: &mut Tables,
        owner: OwnerId,
        stream: StreamId,
    ) -> Result<(), RegistryError> {
        let Some(binding) = tables.streams.get_mut(&stream) else {
            return Err(RegistryError::UnknownStream(stream));
        };
        binding.owners.remove(&owner);
        if binding.owners.is_empty() {
            tables.streams.remove(&stream);
            self.teardown_stream(stream)?;
            #[cfg(feature = "tracing")]
            tracing::debug!("registry_stream: {stream} destroyed");
        }
        Ok(())
    }

    /// Binds `owner` to a stream on `device`.
    ///
    /// With `stream = None` a new stream is created. With an existing stream
    /// the binding is validated and `owner` is added to it; repeating the call
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// [`RegistryError::InvalidDevice`], [`RegistryError::UnknownStream`], or
    /// [`RegistryError::StreamDeviceMismatch`] if the stream belongs to
    /// another device.
    pub fn acquire_stream(
        &self,
        owner: OwnerId,
        device: DeviceId,
        stream: Option<StreamId>,
    ) -> Result<StreamId, RegistryError> {
        self.check_device(device)?;
        let mut tables = self.tables.lock();
        match stream {
            Some(stream) => {
                let binding = tables
                    .streams
                    .get_mut(&stream)
                    .ok_or(RegistryError::UnknownStream(stream))?;
                if binding.device != device {
                    return Err(RegistryError::StreamDeviceMismatch {
                        stream,
                        bound: binding.device,
                        requested: device,
                    });
                }
                binding.owners.insert(owner);
                Ok(stream)
            }
            None => {
                let stream = self.driver.create_stream(device)?;
                tables.streams.insert(
                    stream,
                    StreamBinding {
                        device,
                        owners: BTreeSet::from([owner]),
                    },
                );
                #[cfg(feature = "tracing")]
                tracing::debug!("registry_stream: {stream} created on {device} for {owner}");
                Ok(stream)
            }
        }
    }

    /// Removes `owner`'s binding to `stream`; destroys the stream when no
    /// owners remain.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownStream`] for an unregistered stream,
    /// [`RegistryError::NoMapping`] if `owner` is not bound to it on `device`.
    pub fn release_stream(
        &self,
        owner: OwnerId,
        stream: StreamId,
        device: DeviceId,
    ) -> Result<(), RegistryError> {
        let mut tables = self.tables.lock();
        let binding = tables
            .streams
            .get(&stream)
            .ok_or(RegistryError::UnknownStream(stream))?;
        if binding.device != device || !binding.owners.contains(&owner) {
            return Err(RegistryError::NoMapping(format!(
                "{owner} is not bound to {stream} on {device}"
            )));
        }
        self.unbind(&mut tables, owner, stream)
    }

    /// Blocks until the stream's queued work has completed.
    pub fn synchronize_stream(&self, stream: StreamId) -> Result<(), RegistryError> {
        self.query_device_for_stream(stream)?;
        self.driver.synchronize(stream)?;
        Ok(())
    }

    /// Returns the explicit context that subsequent calls on `stream` carry.
    pub fn reserve_current_device(&self, stream: StreamId) -> Result<DeviceContext, RegistryError> {
        let device = self.query_device_for_stream(stream)?;
        Ok(DeviceContext { device, stream })
    }

    /// The single device `owner` holds a stake in.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NoMapping`] if the owner holds no stake or several.
    pub fn query_device_for_owner(&self, owner: OwnerId) -> Result<DeviceId, RegistryError> {
        let tables = self.tables.lock();
        let mut devices = tables
            .stakes
            .iter()
            .filter(|&&(o, _)| o == owner)
            .map(|&(_, d)| d);
        match (devices.next(), devices.next()) {
            (Some(device), None) => Ok(device),
            _ => Err(RegistryError::no_owner_device(owner)),
        }
    }

    /// Device a registered stream is bound to.
    pub fn query_device_for_stream(&self, stream: StreamId) -> Result<DeviceId, RegistryError> {
        self.tables
            .lock()
            .streams
            .get(&stream)
            .map(|b| b.device)
            .ok_or(RegistryError::UnknownStream(stream))
    }

    /// Number of owners holding a stake in `device`.
    pub fn stakeholders(&self, device: DeviceId) -> usize {
        self.tables
            .lock()
            .stakes
            .iter()
            .filter(|&&(_, d)| d == device)
            .count()
    }

    /// Number of registered streams.
    pub fn stream_count(&self) -> usize {
        self.tables.lock().streams.len()
    }

    /// Destroys every stream and resets every staked device.
    ///
    /// Runs to the end even when a driver call fails and returns the first
    /// failure. Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<(), RegistryError> {
        let mut tables = self.tables.lock();
        let mut first_err = None;
        for (&stream, _) in &tables.streams {
            let result = self
                .driver
                .synchronize(stream)
                .and_then(|()| self.driver.destroy_stream(stream));
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        let devices: BTreeSet<DeviceId> = tables.stakes.iter().map(|&(_, d)| d).collect();
        for device in devices {
            if let Err(e) = self.driver.reset_device(device) {
                first_err.get_or_insert(e);
            }
        }
        tables.streams.clear();
        tables.stakes.clear();
        first_err.map_or(Ok(()), |e| Err(e.into()))
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        if let Err(_e) = self.shutdown() {
            #[cfg(feature = "tracing")]
            tracing::warn!("registry_shutdown: {_e}");
        }
    }
}

impl core::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.device_count())
            .field("stakes", &tables.stakes.len())
            .field("streams", &tables.streams.len())
            .finish()
    }
}
