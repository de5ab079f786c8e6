// ── Interface-change notification ──
//
// Adding or removing attributes and commands changes a device's public
// interface. Mutations report the interface they started from; a single
// background thread waits for a quiet period per device, then publishes the
// new interface if it differs from the reported one. Bursts of mutations
// therefore produce one event.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capabilities::ProtocolCapabilities;
use crate::device::{ArgType, Device};
use crate::error::CoreError;
use crate::model::{AttrDataFormat, AttrWriteType, DataType};
use crate::polling::{Envelope, Handoff, HandoffError, handoff};

// ── Interface snapshot ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
    pub name: String,
    pub in_type: ArgType,
    pub out_type: ArgType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeInfo {
    pub name: String,
    pub data_type: DataType,
    pub format: AttrDataFormat,
    pub write_type: AttrWriteType,
    pub memorized: bool,
}

/// Commands and attributes of a device, each sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInterface {
    pub commands: Vec<CommandInfo>,
    pub attributes: Vec<AttributeInfo>,
}

// ── Event supplier seam ─────────────────────────────────────────────

/// Where interface-change events go.
pub trait EventSupplier: Send + Sync {
    fn push_interface_change(&self, device: &str, interface: &DeviceInterface) -> Result<(), CoreError>;

    /// Whether anyone listens for `device`. Mutations skip the interface
    /// snapshot when nobody does.
    fn has_interface_change_subscribers(&self, _device: &str) -> bool {
        true
    }
}

/// Supplier for servers without an event system.
#[derive(Debug, Default)]
pub struct NoEventSupplier;

impl EventSupplier for NoEventSupplier {
    fn push_interface_change(&self, _device: &str, _interface: &DeviceInterface) -> Result<(), CoreError> {
        Ok(())
    }

    fn has_interface_change_subscribers(&self, _device: &str) -> bool {
        false
    }
}

// ── Notifier ────────────────────────────────────────────────────────

enum NotifyCommand {
    Changed {
        device: Weak<Device>,
        name: String,
        before: DeviceInterface,
    },
    Exit,
}

struct NotifierThread {
    handoff: Handoff<NotifyCommand>,
    join: Mutex<Option<JoinHandle<()>>>,
}

pub struct InterfaceNotifier {
    supplier: Arc<dyn EventSupplier>,
    quiet_period: Duration,
    handoff_timeout: Duration,
    thread: Mutex<Option<Arc<NotifierThread>>>,
}

impl std::fmt::Debug for InterfaceNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceNotifier")
            .field("quiet_period", &self.quiet_period)
            .field("running", &self.thread.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl InterfaceNotifier {
    pub fn new(supplier: Arc<dyn EventSupplier>, quiet_period: Duration, handoff_timeout: Duration) -> Self {
        Self {
            supplier,
            quiet_period,
            handoff_timeout,
            thread: Mutex::new(None),
        }
    }

    pub fn supplier(&self) -> &Arc<dyn EventSupplier> {
        &self.supplier
    }

    /// Whether a mutation of `device` should be reported at all.
    pub fn should_notify(&self, capabilities: ProtocolCapabilities, device: &str) -> bool {
        capabilities.supports_interface_change_events && self.supplier.has_interface_change_subscribers(device)
    }

    /// Report that `device` changed, starting from `before`.
    pub fn signal(&self, device: &Device, before: DeviceInterface) -> Result<(), CoreError> {
        let thread = self.thread()?;
        thread
            .handoff
            .send(NotifyCommand::Changed {
                device: device.weak(),
                name: device.name().to_owned(),
                before,
            })
            .map_err(|e| match e {
                HandoffError::TimedOut => {
                    CoreError::timed_out("Device interface change event thread blocked !!!")
                }
                HandoffError::Disconnected => {
                    CoreError::Internal("device interface change event thread is gone".into())
                }
            })
    }

    fn thread(&self) -> Result<Arc<NotifierThread>, CoreError> {
        let mut slot = self.thread.lock();
        if let Some(thread) = slot.as_ref() {
            return Ok(Arc::clone(thread));
        }

        let (tx, rx) = handoff(self.handoff_timeout);
        let supplier = Arc::clone(&self.supplier);
        let quiet = self.quiet_period;
        let join = thread::Builder::new()
            .name("DevIntrThread".into())
            .spawn(move || run(&rx, supplier.as_ref(), quiet))
            .map_err(|e| CoreError::Internal(format!("failed to spawn interface change thread: {e}")))?;
        debug!("interface change thread started");

        let thread = Arc::new(NotifierThread {
            handoff: tx,
            join: Mutex::new(Some(join)),
        });
        *slot = Some(Arc::clone(&thread));
        Ok(thread)
    }
}

impl Drop for InterfaceNotifier {
    fn drop(&mut self) {
        let Some(thread) = self.thread.get_mut().take() else {
            return;
        };
        let join = thread.join.lock().take();
        if join
            .as_ref()
            .is_some_and(|j| j.thread().id() == thread::current().id())
        {
            return;
        }
        if let Err(e) = thread.handoff.send(NotifyCommand::Exit) {
            warn!(error = %e, "interface change thread did not take the exit request");
        }
        if join.is_some_and(|j| j.join().is_err()) {
            warn!("interface change thread panicked");
        }
    }
}

struct Pending {
    device: Weak<Device>,
    before: DeviceInterface,
    due: Instant,
}

fn run(rx: &Receiver<Envelope<NotifyCommand>>, supplier: &dyn EventSupplier, quiet: Duration) {
    let mut pending: IndexMap<String, Pending> = IndexMap::new();
    loop {
        let now = Instant::now();
        let received = match pending.values().map(|p| p.due).min() {
            Some(due) => rx.recv_timeout(due.saturating_duration_since(now)),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Envelope { command, ack }) => {
                let exit = match command {
                    NotifyCommand::Changed { device, name, before } => {
                        let due = Instant::now() + quiet;
                        pending
                            .entry(name.to_ascii_lowercase())
                            .and_modify(|p| p.due = due)
                            .or_insert(Pending { device, before, due });
                        false
                    }
                    NotifyCommand::Exit => true,
                };
                ack.done();
                if exit {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.due <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in due {
            let Some(p) = pending.shift_remove(&name) else {
                continue;
            };
            let Some(device) = p.device.upgrade() else {
                continue;
            };
            let after = device.interface();
            if after == p.before {
                debug!(device = %device.name(), "interface unchanged after quiet period");
                continue;
            }
            match supplier.push_interface_change(device.name(), &after) {
                Ok(()) => info!(device = %device.name(), "interface change published"),
                Err(e) => warn!(device = %device.name(), error = %e, "failed to push interface change event"),
            }
        }
    }
    debug!("interface change thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Listening;

    impl EventSupplier for Listening {
        fn push_interface_change(&self, _: &str, _: &DeviceInterface) -> Result<(), CoreError> {
            Ok(())
        }
    }

    #[test]
    fn notification_needs_capability_and_listener() {
        let modern = ProtocolCapabilities::LATEST;
        let old = ProtocolCapabilities::for_idl(4);
        let t = Duration::from_millis(100);

        let n = InterfaceNotifier::new(Arc::new(Listening), t, t);
        assert!(n.should_notify(modern, "a/b/c"));
        assert!(!n.should_notify(old, "a/b/c"));

        let quiet = InterfaceNotifier::new(Arc::new(NoEventSupplier), t, t);
        assert!(!quiet.should_notify(modern, "a/b/c"));
    }

    #[test]
    fn thread_is_spawned_lazily_and_stopped_on_drop() {
        let t = Duration::from_millis(100);
        let n = InterfaceNotifier::new(Arc::new(Listening), t, Duration::from_secs(2));
        assert!(n.thread.lock().is_none());
        n.thread().ok();
        assert!(n.thread.lock().is_some());
        drop(n);
    }
}
