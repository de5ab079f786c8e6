// ── Server-process context ──
//
// Everything devices of one server process share: the property store, the
// class registry, the polling pool, the interface notifier and the
// collaborator used to lock forwarded-attribute root devices. Built once at
// startup and handed to each device as an `Arc`.

use std::sync::Arc;
use std::time::Duration;

use crate::database::PropertyStore;
use crate::device::ClassRegistry;
use crate::error::CoreError;
use crate::model::ClientIdentity;
use crate::notify::{EventSupplier, InterfaceNotifier, NoEventSupplier};
use crate::polling::{PollingCoordinator, PollingOptions};

#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// `ServerName/instance`.
    pub server_instance: String,
    pub host_name: String,
    pub polling: PollingOptions,
    pub interface_quiet_period: Duration,
    pub interface_handoff_timeout: Duration,
    pub default_lock_validity: Duration,
    /// How long a poll waits for a busy device before recording a failure.
    pub poll_monitor_timeout: Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            server_instance: "devbus/default".into(),
            host_name: "localhost".into(),
            polling: PollingOptions::default(),
            interface_quiet_period: Duration::from_millis(50),
            interface_handoff_timeout: Duration::from_millis(3200),
            default_lock_validity: Duration::from_secs(10),
            poll_monitor_timeout: Duration::from_millis(500),
        }
    }
}

impl ContextOptions {
    pub fn admin_device(&self) -> String {
        format!("dserver/{}", self.server_instance)
    }
}

/// Locks the root devices of forwarded attributes on behalf of a client.
pub trait RootLocker: Send + Sync {
    fn lock_root(&self, device: &str, who: &ClientIdentity, validity: Duration) -> Result<(), CoreError>;
    fn unlock_root(&self, device: &str, who: &ClientIdentity) -> Result<(), CoreError>;
}

#[derive(Debug, Default)]
pub struct NoRootLocker;

impl RootLocker for NoRootLocker {
    fn lock_root(&self, _device: &str, _who: &ClientIdentity, _validity: Duration) -> Result<(), CoreError> {
        Ok(())
    }

    fn unlock_root(&self, _device: &str, _who: &ClientIdentity) -> Result<(), CoreError> {
        Ok(())
    }
}

pub struct AppContext {
    options: ContextOptions,
    db: Option<Arc<PropertyStore>>,
    classes: ClassRegistry,
    polling: PollingCoordinator,
    notifier: InterfaceNotifier,
    root_locker: Arc<dyn RootLocker>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("server_instance", &self.options.server_instance)
            .field("database", &self.db.as_ref().map(|db| db.location()))
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::default()
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn db(&self) -> Option<&Arc<PropertyStore>> {
        self.db.as_ref()
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    pub fn polling(&self) -> &PollingCoordinator {
        &self.polling
    }

    pub fn notifier(&self) -> &InterfaceNotifier {
        &self.notifier
    }

    pub fn root_locker(&self) -> &dyn RootLocker {
        self.root_locker.as_ref()
    }

    /// Prefetch this server's configuration in one call.
    pub fn fill_server_cache(&self) -> bool {
        self.db.as_ref().is_some_and(|db| {
            db.fill_server_cache(&self.options.server_instance, &self.options.host_name)
        })
    }
}

pub struct AppContextBuilder {
    options: ContextOptions,
    db: Option<Arc<PropertyStore>>,
    events: Arc<dyn EventSupplier>,
    root_locker: Arc<dyn RootLocker>,
}

impl Default for AppContextBuilder {
    fn default() -> Self {
        Self {
            options: ContextOptions::default(),
            db: None,
            events: Arc::new(NoEventSupplier),
            root_locker: Arc::new(NoRootLocker),
        }
    }
}

impl AppContextBuilder {
    #[must_use]
    pub fn options(mut self, options: ContextOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn database(mut self, db: Arc<PropertyStore>) -> Self {
        self.db = Some(db);
        self
    }

    #[must_use]
    pub fn event_supplier(mut self, events: Arc<dyn EventSupplier>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn root_locker(mut self, locker: Arc<dyn RootLocker>) -> Self {
        self.root_locker = locker;
        self
    }

    pub fn build(self) -> Arc<AppContext> {
        let mut options = self.options;
        options.polling.admin_device = options.admin_device();
        let polling = PollingCoordinator::new(options.polling.clone(), self.db.clone());
        let notifier = InterfaceNotifier::new(
            self.events,
            options.interface_quiet_period,
            options.interface_handoff_timeout,
        );
        Arc::new(AppContext {
            options,
            db: self.db,
            classes: ClassRegistry::default(),
            polling,
            notifier,
            root_locker: self.root_locker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_device_follows_instance() {
        let ctx = AppContext::builder()
            .options(ContextOptions {
                server_instance: "Motors/lab".into(),
                ..ContextOptions::default()
            })
            .build();
        assert_eq!(ctx.options().admin_device(), "dserver/Motors/lab");
        assert_eq!(ctx.options().polling.admin_device, "dserver/Motors/lab");
        assert!(ctx.db().is_none());
        assert!(!ctx.fill_server_cache());
    }
}
