// ── Polling thread pool ──
//
// Devices are spread over a bounded set of polling threads. The pool
// configuration lists, per thread, the comma-joined names of the devices
// it polls; it is persisted on the server's admin device. Commands reach a
// thread through its single-slot hand-off; the pool lock is never held
// while waiting on one.

mod handoff;
mod ring;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use devbus_api::{DbDatum, Reason};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

pub use handoff::{Ack, Envelope, Handoff, HandoffError, handoff};
pub use ring::{PollOutcome, PollRecord, PollRing};
pub(crate) use worker::PollCommand;

use crate::database::PropertyStore;
use crate::device::Device;
use crate::error::CoreError;

/// Admin-device property holding the pool configuration.
pub const POOL_CONF_PROPERTY: &str = "polling_threads_pool_conf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum PollKind {
    Attribute,
    Command,
}

#[derive(Debug, Clone)]
pub struct PollingOptions {
    pub pool_size: usize,
    pub handoff_timeout: Duration,
    /// Initial pool configuration, one comma-joined device list per thread.
    pub pool_conf: Vec<String>,
    /// `dserver/<instance>`; receives the persisted pool configuration.
    pub admin_device: String,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            pool_size: 1,
            handoff_timeout: Duration::from_millis(3200),
            pool_conf: Vec::new(),
            admin_device: "dserver/devbus/default".into(),
        }
    }
}

pub(crate) struct PollThread {
    id: usize,
    handoff: Handoff<PollCommand>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PollThread {
    fn spawn(id: usize, timeout: Duration) -> Result<Arc<Self>, CoreError> {
        let (tx, rx) = handoff(timeout);
        let join = thread::Builder::new()
            .name(format!("PollThread{id}"))
            .spawn(move || worker::run(&rx))
            .map_err(|e| CoreError::Internal(format!("failed to spawn polling thread: {e}")))?;
        debug!(id, "polling thread started");
        Ok(Arc::new(Self {
            id,
            handoff: tx,
            join: Mutex::new(Some(join)),
        }))
    }

    fn send(&self, command: PollCommand) -> Result<(), CoreError> {
        self.handoff.send(command).map_err(|e| match e {
            HandoffError::TimedOut => CoreError::timed_out("Polling thread blocked !!"),
            HandoffError::Disconnected => CoreError::Polling {
                reason: Reason::PollingThreadNotFound,
                message: format!("Polling thread {} is gone", self.id),
            },
        })
    }

    /// Ask the thread to exit and wait for it. Called from the thread
    /// itself, it only detaches: the loop ends once the hand-off is dropped.
    fn shutdown(&self) {
        let join = self.join.lock().take();
        if join
            .as_ref()
            .is_some_and(|j| j.thread().id() == thread::current().id())
        {
            return;
        }
        if let Err(e) = self.send(PollCommand::Exit) {
            warn!(id = self.id, error = %e, "polling thread did not take the exit request");
        }
        if join.is_some_and(|j| j.join().is_err()) {
            warn!(id = self.id, "polling thread panicked");
        }
    }
}

struct PollGroup {
    devices: Vec<String>,
    thread: Option<Arc<PollThread>>,
}

impl PollGroup {
    fn contains(&self, device: &str) -> bool {
        self.devices.iter().any(|d| d.eq_ignore_ascii_case(device))
    }
}

pub struct PollingCoordinator {
    groups: Mutex<Vec<PollGroup>>,
    options: PollingOptions,
    db: Option<Arc<PropertyStore>>,
    next_id: AtomicUsize,
}

impl std::fmt::Debug for PollingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingCoordinator")
            .field("pool_conf", &self.polling_threads_pool_conf())
            .finish_non_exhaustive()
    }
}

impl PollingCoordinator {
    pub fn new(options: PollingOptions, db: Option<Arc<PropertyStore>>) -> Self {
        let groups = options
            .pool_conf
            .iter()
            .map(|entry| PollGroup {
                devices: entry
                    .split(',')
                    .map(|d| d.trim().to_ascii_lowercase())
                    .filter(|d| !d.is_empty())
                    .collect(),
                thread: None,
            })
            .filter(|g| !g.devices.is_empty())
            .collect();
        Self {
            groups: Mutex::new(groups),
            options,
            db,
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn handoff_timeout(&self) -> Duration {
        self.options.handoff_timeout
    }

    /// One comma-joined device list per thread group.
    pub fn polling_threads_pool_conf(&self) -> Vec<String> {
        self.groups
            .lock()
            .iter()
            .map(|g| g.devices.join(","))
            .collect()
    }

    /// Number of running polling threads.
    pub fn thread_count(&self) -> usize {
        self.groups
            .lock()
            .iter()
            .filter(|g| g.thread.is_some())
            .count()
    }

    /// Id of the thread polling `device`, if one is running.
    pub fn thread_of(&self, device: &str) -> Option<usize> {
        self.groups
            .lock()
            .iter()
            .find(|g| g.contains(device))
            .and_then(|g| g.thread.as_ref().map(|t| t.id))
    }

    /// Thread for `device`, assigning a group and spawning as needed.
    fn thread_for(&self, device: &str) -> Result<Arc<PollThread>, CoreError> {
        let mut groups = self.groups.lock();
        let idx = if let Some(idx) = groups.iter().position(|g| g.contains(device)) {
            idx
        } else if groups.len() < self.options.pool_size.max(1) {
            groups.push(PollGroup {
                devices: vec![device.to_ascii_lowercase()],
                thread: None,
            });
            groups.len() - 1
        } else {
            let idx = groups
                .iter()
                .enumerate()
                .min_by_key(|(_, g)| g.devices.len())
                .map_or(0, |(i, _)| i);
            groups[idx].devices.push(device.to_ascii_lowercase());
            idx
        };

        if let Some(thread) = &groups[idx].thread {
            return Ok(Arc::clone(thread));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = PollThread::spawn(id, self.options.handoff_timeout)?;
        groups[idx].thread = Some(Arc::clone(&thread));
        Ok(thread)
    }

    fn existing_thread(&self, device: &str) -> Result<Arc<PollThread>, CoreError> {
        let groups = self.groups.lock();
        let group = groups.iter().find(|g| g.contains(device)).ok_or_else(|| CoreError::Polling {
            reason: Reason::PolledDeviceNotInPoolConf,
            message: format!("Device {device} not found in the polling threads pool configuration"),
        })?;
        group.thread.clone().ok_or_else(|| CoreError::Polling {
            reason: Reason::PollingThreadNotFound,
            message: format!("Can't find a polling thread for device {device}"),
        })
    }

    pub(crate) fn add_object(
        &self,
        device: &Device,
        kind: PollKind,
        name: &str,
        period: Duration,
    ) -> Result<(), CoreError> {
        let thread = self.thread_for(device.name())?;
        thread.send(PollCommand::AddObject {
            device: device.weak(),
            device_name: device.name().to_owned(),
            kind,
            name: name.to_owned(),
            period,
        })
    }

    pub(crate) fn rem_object(&self, device: &str, kind: PollKind, name: &str) -> Result<(), CoreError> {
        self.existing_thread(device)?.send(PollCommand::RemObject {
            device_name: device.to_owned(),
            kind,
            name: name.to_owned(),
        })
    }

    /// Pause or resume every polling thread.
    pub fn set_running(&self, running: bool) -> Result<(), CoreError> {
        let threads: Vec<_> = self
            .groups
            .lock()
            .iter()
            .filter_map(|g| g.thread.clone())
            .collect();
        for thread in threads {
            thread.send(if running { PollCommand::Start } else { PollCommand::Stop })?;
        }
        Ok(())
    }

    /// Stop polling everything of `device`. The last device leaving a
    /// thread shuts that thread down.
    pub fn stop_polling(&self, device: &str, with_db_update: bool) -> Result<(), CoreError> {
        let thread = self.existing_thread(device)?;
        thread.send(PollCommand::RemDevice {
            device_name: device.to_owned(),
        })?;

        let exiting = {
            let mut groups = self.groups.lock();
            match groups.iter().position(|g| g.contains(device)) {
                Some(idx) => {
                    groups[idx].devices.retain(|d| !d.eq_ignore_ascii_case(device));
                    if groups[idx].devices.is_empty() {
                        groups.remove(idx).thread
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(thread) = exiting {
            info!(id = thread.id, device, "last polled device gone, stopping polling thread");
            thread.shutdown();
        }

        if with_db_update {
            self.store_pool_conf();
        }
        Ok(())
    }

    fn store_pool_conf(&self) {
        let Some(db) = &self.db else {
            return;
        };
        let conf = self.polling_threads_pool_conf();
        let admin = &self.options.admin_device;
        let result = if conf.is_empty() {
            db.delete_device_property(admin, &[POOL_CONF_PROPERTY])
        } else {
            db.put_device_property(admin, &[DbDatum::with_values(POOL_CONF_PROPERTY, conf)])
        };
        if let Err(e) = result {
            warn!(device = %admin, error = %e, "failed to store polling pool configuration");
        }
    }
}

impl Drop for PollingCoordinator {
    fn drop(&mut self) {
        let threads: Vec<_> = self
            .groups
            .get_mut()
            .iter_mut()
            .filter_map(|g| g.thread.take())
            .collect();
        for thread in threads {
            thread.shutdown();
        }
    }
}
