// ── Device lock ──
//
// Advisory single-owner lock with a validity period. Expired locks are
// cleared lazily, the next time anything looks at them. A forced unlock
// remembers the evicted owner so that owner's next call reports it once.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CoreError;
use crate::model::ClientIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub locked: bool,
    pub owner: Option<ClientIdentity>,
    pub ctr: u32,
    pub validity: Duration,
    pub since: Option<DateTime<Utc>>,
    pub summary: String,
}

#[derive(Debug, Default)]
pub(crate) struct LockState {
    owner: Option<ClientIdentity>,
    previous_owner: Option<ClientIdentity>,
    locked_at: Option<Instant>,
    locked_since: Option<DateTime<Utc>>,
    validity: Duration,
    ctr: u32,
}

impl LockState {
    pub(crate) fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub(crate) fn owner(&self) -> Option<&ClientIdentity> {
        self.owner.as_ref()
    }

    /// Locked and not yet expired at `now`.
    pub(crate) fn valid_lock(&self, now: Instant) -> bool {
        match self.locked_at {
            Some(at) if self.owner.is_some() => now.saturating_duration_since(at) <= self.validity,
            _ => false,
        }
    }

    /// Returns `true` when this call took a previously free lock.
    pub(crate) fn acquire(
        &mut self,
        device: &str,
        who: &ClientIdentity,
        validity: Duration,
        now: Instant,
    ) -> Result<bool, CoreError> {
        if let Some(owner) = &self.owner {
            if !self.valid_lock(now) {
                self.basic_unlock(false);
            } else if owner != who {
                return Err(CoreError::DeviceLocked {
                    message: format!("Device {device} is already locked by another client"),
                });
            }
        }

        let first = self.owner.is_none();
        self.owner = Some(who.clone());
        self.previous_owner = None;
        self.locked_at = Some(now);
        self.locked_since = Some(Utc::now());
        self.validity = validity;
        self.ctr += 1;
        Ok(first)
    }

    pub(crate) fn relock(&mut self, device: &str, who: &ClientIdentity, now: Instant) -> Result<(), CoreError> {
        let not_locked = || CoreError::DeviceNotLocked {
            message: format!("Device {device} is not locked. Can't re-lock it"),
        };
        let Some(owner) = &self.owner else {
            return Err(not_locked());
        };
        if !self.valid_lock(now) {
            self.basic_unlock(false);
            return Err(not_locked());
        }
        if owner != who {
            return Err(CoreError::DeviceLocked {
                message: format!("Device {device} is locked by another client. Can't re-lock it"),
            });
        }
        self.locked_at = Some(now);
        self.locked_since = Some(Utc::now());
        Ok(())
    }

    /// Drop one reference. Returns the remaining count; zero means the
    /// lock is free.
    pub(crate) fn release(
        &mut self,
        device: &str,
        who: &ClientIdentity,
        forced: bool,
        now: Instant,
    ) -> Result<u32, CoreError> {
        if forced {
            if self.is_locked() {
                self.basic_unlock(true);
            }
            return Ok(0);
        }

        let Some(owner) = &self.owner else {
            return Err(CoreError::DeviceNotLocked {
                message: format!("Device {device} is not locked"),
            });
        };
        if !self.valid_lock(now) {
            self.basic_unlock(false);
            return Ok(0);
        }
        if owner != who {
            return Err(CoreError::DeviceLocked {
                message: format!("Device {device} is locked by another client, can't unlock it"),
            });
        }

        self.ctr = self.ctr.saturating_sub(1);
        if self.ctr == 0 {
            self.basic_unlock(false);
        }
        Ok(self.ctr)
    }

    pub(crate) fn basic_unlock(&mut self, forced: bool) {
        let owner = self.owner.take();
        if forced {
            self.previous_owner = owner;
        }
        self.locked_at = None;
        self.locked_since = None;
        self.ctr = 0;
    }

    /// Gate an operation by `caller`. `allowed` says whether a command may
    /// run on a device locked by someone else. Returns `true` when an
    /// expired lock was cleared on the way.
    pub(crate) fn check(
        &mut self,
        device: &str,
        method: &str,
        command: Option<&str>,
        caller: &ClientIdentity,
        allowed: impl FnOnce(&str) -> bool,
        now: Instant,
    ) -> Result<bool, CoreError> {
        if let Some(owner) = &self.owner {
            if !self.valid_lock(now) {
                self.basic_unlock(false);
                return Ok(true);
            }
            if owner == caller || command.is_some_and(allowed) {
                return Ok(false);
            }
            let what = command.map_or_else(|| format!("method {method}"), |c| format!("command {c}"));
            return Err(CoreError::DeviceLocked {
                message: format!(
                    "Device {device} is locked by another client, it is not possible to execute {what}"
                ),
            });
        }

        if self.previous_owner.as_ref() == Some(caller) {
            self.previous_owner = None;
            return Err(CoreError::DeviceUnlocked {
                message: format!("Device {device} has been unlocked by an administrative client!!!"),
            });
        }
        Ok(false)
    }

    pub(crate) fn status(&mut self, device: &str, now: Instant) -> LockInfo {
        if self.is_locked() && !self.valid_lock(now) {
            self.basic_unlock(false);
        }
        let summary = match &self.owner {
            Some(owner) => format!("Device {device} is locked by {owner}"),
            None => format!("Device {device} is not locked"),
        };
        LockInfo {
            locked: self.owner.is_some(),
            owner: self.owner.clone(),
            ctr: self.ctr,
            validity: self.validity,
            since: self.locked_since,
            summary,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use devbus_api::Reason;

    use super::*;

    const DEV: &str = "sys/tg/1";

    fn a() -> ClientIdentity {
        ClientIdentity::new("host-a", 100)
    }

    fn b() -> ClientIdentity {
        ClientIdentity::new("host-b", 200)
    }

    fn anything(_: &str) -> bool {
        false
    }

    #[test]
    fn other_client_cannot_lock_a_valid_lock() {
        let now = Instant::now();
        let mut lock = LockState::default();
        assert!(lock.acquire(DEV, &a(), Duration::from_secs(10), now).unwrap());
        let err = lock.acquire(DEV, &b(), Duration::from_secs(10), now).unwrap_err();
        assert_eq!(err.reason(), Reason::DeviceLocked);
    }

    #[test]
    fn expired_lock_is_taken_over() {
        let now = Instant::now();
        let mut lock = LockState::default();
        lock.acquire(DEV, &a(), Duration::from_secs(1), now).unwrap();
        let later = now + Duration::from_millis(1100);
        assert!(lock.acquire(DEV, &b(), Duration::from_secs(1), later).unwrap());
        assert_eq!(lock.status(DEV, later).owner, Some(b()));
    }

    #[test]
    fn relock_counts_and_unlock_unwinds() {
        let now = Instant::now();
        let mut lock = LockState::default();
        lock.acquire(DEV, &a(), Duration::from_secs(10), now).unwrap();
        assert!(!lock.acquire(DEV, &a(), Duration::from_secs(10), now).unwrap());
        assert_eq!(lock.status(DEV, now).ctr, 2);
        assert_eq!(lock.release(DEV, &a(), false, now).unwrap(), 1);
        assert_eq!(lock.release(DEV, &a(), false, now).unwrap(), 0);
        assert!(!lock.is_locked());
    }

    #[test]
    fn relock_requires_a_valid_lock() {
        let now = Instant::now();
        let mut lock = LockState::default();
        assert_eq!(lock.relock(DEV, &a(), now).unwrap_err().reason(), Reason::DeviceNotLocked);
        lock.acquire(DEV, &a(), Duration::from_secs(1), now).unwrap();
        assert_eq!(lock.relock(DEV, &b(), now).unwrap_err().reason(), Reason::DeviceLocked);
        lock.relock(DEV, &a(), now + Duration::from_millis(900)).unwrap();
        assert!(lock.valid_lock(now + Duration::from_millis(1800)));
    }

    #[test]
    fn other_client_cannot_unlock() {
        let now = Instant::now();
        let mut lock = LockState::default();
        lock.acquire(DEV, &a(), Duration::from_secs(10), now).unwrap();
        let err = lock.release(DEV, &b(), false, now).unwrap_err();
        assert!(err.to_string().contains("can't unlock it"));
    }

    #[test]
    fn check_blocks_other_clients_except_allowed_commands() {
        let now = Instant::now();
        let mut lock = LockState::default();
        lock.acquire(DEV, &a(), Duration::from_secs(10), now).unwrap();
        assert!(lock.check(DEV, "command_inout", Some("On"), &a(), anything, now).is_ok());
        assert!(lock.check(DEV, "command_inout", Some("On"), &b(), anything, now).is_err());
        assert!(
            lock.check(DEV, "command_inout", Some("Status"), &b(), |c| c == "Status", now)
                .is_ok()
        );
        let err = lock.check(DEV, "write_attributes", None, &b(), anything, now).unwrap_err();
        assert!(err.to_string().contains("method write_attributes"));
    }

    #[test]
    fn forced_unlock_is_reported_once_to_the_evicted_owner() {
        let now = Instant::now();
        let mut lock = LockState::default();
        lock.acquire(DEV, &a(), Duration::from_secs(10), now).unwrap();
        lock.release(DEV, &b(), true, now).unwrap();

        assert!(lock.check(DEV, "command_inout", None, &b(), anything, now).is_ok());
        let err = lock.check(DEV, "command_inout", None, &a(), anything, now).unwrap_err();
        assert_eq!(err.reason(), Reason::DeviceUnlocked);
        assert!(lock.check(DEV, "command_inout", None, &a(), anything, now).is_ok());
    }

    #[test]
    fn status_summary() {
        let now = Instant::now();
        let mut lock = LockState::default();
        assert_eq!(lock.status(DEV, now).summary, "Device sys/tg/1 is not locked");
        lock.acquire(DEV, &a(), Duration::from_secs(10), now).unwrap();
        assert_eq!(
            lock.status(DEV, now).summary,
            "Device sys/tg/1 is locked by client with PID 100 from host host-a"
        );
    }
}
