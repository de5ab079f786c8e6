// ── Device runtime ──
//
// A `Device` is one named instance of a `DeviceClass`. Every externally
// visible operation runs under the device's reentrant monitor, so user
// behaviour may call back into its own device. Internal tables sit behind
// short-lived locks that are never held across behaviour calls.
//
// Built-in `State` and `Status` are both commands and virtual attributes.
// In ON or ALARM state, reading the state evaluates alarm thresholds of the
// attributes that have them and moves the device between the two states.

mod attribute;
mod blackbox;
mod class;
mod command;
mod lock;
mod resource;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use devbus_api::{AttributeProperties, DbDatum, ErrorFrame, Reason, RemoteError};
use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use strum::Display;
use tracing::{debug, info, warn};

pub use attribute::{
    AlarmKind, AttrDescriptor, AttrDescriptorBuilder, AttrLimits, AttrRequest, AttrSlot,
    AttributeBehavior, AttributeValue, LIMIT_PROPERTIES, MEMORIZED_VALUE_PROP, ReadFn,
    StoredValue, read_fn,
};
pub use blackbox::{BlackBox, BlackBoxEntry};
pub use class::{AttrId, ClassRegistry, CmdId, DeviceClass, DeviceClassBuilder};
pub use command::{
    ArgType, CmdDescriptor, CommandBehavior, CommandFn, INIT_COMMAND, STATE_COMMAND,
    STATUS_COMMAND, command_fn,
};
pub use lock::LockInfo;
pub use resource::{
    DEFAULT_BLACKBOX_DEPTH, DEFAULT_POLL_OLD_FACTOR, DEFAULT_POLL_RING_DEPTH, SYSTEM_PROPERTIES,
    SystemResources,
};

use lock::LockState;

use crate::context::AppContext;
use crate::error::{CoreError, ItemFailure};
use crate::model::{AttrDataFormat, AttrQuality, AttrWriteType, ClientIdentity, DataType, DevState, Value};
use crate::notify::{AttributeInfo, CommandInfo, DeviceInterface};
use crate::polling::{PollKind, PollOutcome, PollRecord, PollRing};

/// Name of the virtual state attribute.
pub const STATE_ATTR: &str = "State";
/// Name of the virtual status attribute.
pub const STATUS_ATTR: &str = "Status";
/// Single-name read request standing for every attribute of the device.
pub const ALL_ATTRIBUTES: &str = "All attributes";

// ── User hooks ──────────────────────────────────────────────────────

/// Device-wide behaviour supplied by the server author.
pub trait DeviceBehavior: Send + Sync {
    fn init_device(&self, _device: &Device) -> Result<(), CoreError> {
        Ok(())
    }

    fn delete_device(&self, _device: &Device) {}

    /// Runs before every command and attribute access.
    fn always_executed_hook(&self, _device: &Device) {}

    /// Called once per read request with every attribute about to be read.
    fn read_attr_hardware(&self, _device: &Device, _attrs: &[String]) -> Result<(), CoreError> {
        Ok(())
    }

    /// Called once per write request after the individual writes.
    fn write_attr_hardware(&self, _device: &Device, _attrs: &[String]) -> Result<(), CoreError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DefaultBehavior;

impl DeviceBehavior for DefaultBehavior {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum Lifecycle {
    Constructing,
    Ready,
    TearingDown,
    Destroyed,
}

/// Where a read takes its values from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadSource {
    #[default]
    Device,
    /// Last polled value; fails for objects that are not polled.
    Cache,
    /// Polled value when polled, device otherwise.
    CacheDevice,
}

/// Summary of one polled object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolledObject {
    pub kind: PollKind,
    pub name: String,
    pub period_ms: u64,
    pub depth: usize,
    pub records: usize,
}

// ── Internal tables ─────────────────────────────────────────────────

struct CoreState {
    state: DevState,
    status: Option<String>,
    alarm_by_kernel: bool,
    lifecycle: Lifecycle,
    version_info: BTreeMap<String, String>,
    att_wrong_db_conf: Vec<String>,
    att_mem_failed: Vec<String>,
    fwd_att_wrong_conf: Vec<String>,
}

impl CoreState {
    fn new() -> Self {
        Self {
            state: DevState::Unknown,
            status: None,
            alarm_by_kernel: false,
            lifecycle: Lifecycle::Constructing,
            version_info: BTreeMap::new(),
            att_wrong_db_conf: Vec::new(),
            att_mem_failed: Vec::new(),
            fwd_att_wrong_conf: Vec::new(),
        }
    }

    /// Startup problems force ALARM until fixed.
    fn forced_alarm(&self) -> bool {
        !self.att_wrong_db_conf.is_empty()
            || !self.att_mem_failed.is_empty()
            || !self.fwd_att_wrong_conf.is_empty()
    }

    fn forced_alarm_status(&self) -> String {
        let mut status = String::from("The device is in ALARM state.");
        if !self.att_wrong_db_conf.is_empty() {
            status.push_str(&format!(
                "\n{} wrong configuration\nTry accessing the faulty attribute(s) to get more information",
                listing("Attribute", &self.att_wrong_db_conf, "has", "have")
            ));
        }
        if !self.att_mem_failed.is_empty() {
            status.push_str(&format!(
                "\n{} during device startup sequence",
                listing("Memorized attribute", &self.att_mem_failed, "failed", "failed")
            ));
        }
        if !self.fwd_att_wrong_conf.is_empty() {
            status.push_str(&format!(
                "\n{} not correctly configured",
                listing("Forwarded attribute", &self.fwd_att_wrong_conf, "is", "are")
            ));
        }
        status
    }

    fn forget_attribute(&mut self, name: &str) {
        for list in [
            &mut self.att_wrong_db_conf,
            &mut self.att_mem_failed,
            &mut self.fwd_att_wrong_conf,
        ] {
            list.retain(|a| !a.eq_ignore_ascii_case(name));
        }
    }
}

/// `Attribute x has` / `Attributes x, y have`.
fn listing(noun: &str, names: &[String], one: &str, many: &str) -> String {
    if names.len() == 1 {
        format!("{noun} {} {one}", names[0])
    } else {
        format!("{noun}s {} {many}", names.join(", "))
    }
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|n| n.eq_ignore_ascii_case(name)) {
        list.push(name.to_owned());
    }
}

struct AttrEntry {
    id: AttrId,
    descriptor: Arc<AttrDescriptor>,
    limits: AttrLimits,
    slot: AttrSlot,
    alarm: Option<AlarmKind>,
}

impl AttrEntry {
    fn new(id: AttrId, descriptor: Arc<AttrDescriptor>) -> Self {
        Self {
            id,
            limits: descriptor.limits,
            slot: AttrSlot::new(&descriptor),
            descriptor,
            alarm: None,
        }
    }
}

struct CmdEntry {
    id: CmdId,
    descriptor: Arc<CmdDescriptor>,
    /// Added to this device only, not to the whole class.
    local: bool,
}

struct PollEntry {
    period_ms: u64,
    ring: PollRing,
}

fn is_virtual(name: &str) -> bool {
    name.eq_ignore_ascii_case(STATE_ATTR) || name.eq_ignore_ascii_case(STATUS_ATTR)
}

fn virtual_name(name: &str) -> &'static str {
    if name.eq_ignore_ascii_case(STATE_ATTR) {
        STATE_ATTR
    } else {
        STATUS_ATTR
    }
}

fn is_builtin_command(name: &str) -> bool {
    [STATE_COMMAND, STATUS_COMMAND, INIT_COMMAND]
        .iter()
        .any(|b| b.eq_ignore_ascii_case(name))
}

fn not_polled(kind: PollKind, name: &str) -> CoreError {
    CoreError::Polling {
        reason: match kind {
            PollKind::Attribute => Reason::AttrNotPolled,
            PollKind::Command => Reason::CmdNotPolled,
        },
        message: format!("{kind} {name} is not polled"),
    }
}

// ── Device ──────────────────────────────────────────────────────────

pub struct Device {
    name: String,
    class: Arc<DeviceClass>,
    ctx: Arc<AppContext>,
    behavior: Arc<dyn DeviceBehavior>,
    me: Weak<Device>,
    monitor: ReentrantMutex<()>,
    core: Mutex<CoreState>,
    attrs: RwLock<IndexMap<String, AttrEntry>>,
    commands: RwLock<IndexMap<String, CmdEntry>>,
    lock: Mutex<LockState>,
    resources: RwLock<SystemResources>,
    polled: Mutex<IndexMap<(PollKind, String), PollEntry>>,
    blackbox: Mutex<BlackBox>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("class", &self.class.name())
            .field("state", &self.core.lock().state)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Create and initialise a device of `class`. The class is registered
    /// with the context if it is not already.
    pub fn create(
        ctx: &Arc<AppContext>,
        class: &Arc<DeviceClass>,
        name: &str,
        behavior: Arc<dyn DeviceBehavior>,
    ) -> Result<Arc<Self>, CoreError> {
        if ctx.classes().get(class.name()).is_none() {
            ctx.classes().register(Arc::clone(class));
        }

        let attrs = class
            .initial_attributes()
            .into_iter()
            .map(|(id, desc)| (desc.name.to_ascii_lowercase(), AttrEntry::new(id, desc)))
            .collect();
        let commands = class
            .initial_commands()
            .into_iter()
            .map(|(id, descriptor)| {
                let entry = CmdEntry {
                    id,
                    descriptor,
                    local: false,
                };
                (entry.descriptor.name.to_ascii_lowercase(), entry)
            })
            .collect();

        let device = Arc::new_cyclic(|me| Self {
            name: name.to_owned(),
            class: Arc::clone(class),
            ctx: Arc::clone(ctx),
            behavior,
            me: me.clone(),
            monitor: ReentrantMutex::new(()),
            core: Mutex::new(CoreState::new()),
            attrs: RwLock::new(attrs),
            commands: RwLock::new(commands),
            lock: Mutex::new(LockState::default()),
            resources: RwLock::new(SystemResources::default()),
            polled: Mutex::new(IndexMap::new()),
            blackbox: Mutex::new(BlackBox::new(DEFAULT_BLACKBOX_DEPTH)),
        });
        class.register(Arc::downgrade(&device));

        if let Err(e) = device.init() {
            class.unregister(&device);
            return Err(e);
        }
        info!(device = %device.name, class = %class.name(), "device created");
        Ok(device)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &Arc<DeviceClass> {
        &self.class
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lock().lifecycle
    }

    pub(crate) fn weak(&self) -> Weak<Device> {
        self.me.clone()
    }

    fn ensure_alive(&self, operation: &str) -> Result<(), CoreError> {
        match self.core.lock().lifecycle {
            Lifecycle::TearingDown | Lifecycle::Destroyed => Err(CoreError::CommandNotAllowed {
                message: format!("Device {} is being deleted, {operation} refused", self.name),
            }),
            Lifecycle::Constructing | Lifecycle::Ready => Ok(()),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    fn init(&self) -> Result<(), CoreError> {
        {
            let _monitor = self.monitor.lock();
            self.get_dev_system_resource()?;

            let names: Vec<String> = self
                .attrs
                .read()
                .values()
                .map(|e| e.descriptor.name.clone())
                .collect();
            let props = self.load_attribute_config(&names);
            self.restore_memorized(&props);
            self.check_forwarded();

            self.behavior.init_device(self)?;
            self.core.lock().lifecycle = Lifecycle::Ready;
        }
        self.start_configured_polling();
        Ok(())
    }

    /// Re-run initialisation, as the `Init` command does.
    pub fn reinit(&self) -> Result<(), CoreError> {
        let _monitor = self.monitor.lock();
        self.behavior.delete_device(self);
        {
            let mut core = self.core.lock();
            core.state = DevState::Unknown;
            core.status = None;
            core.alarm_by_kernel = false;
            core.att_wrong_db_conf.clear();
            core.att_mem_failed.clear();
            core.fwd_att_wrong_conf.clear();
            core.lifecycle = Lifecycle::Constructing;
        }
        self.init()
    }

    /// Tear the device down: stop its polling, release its lock, run the
    /// user hook and leave the class.
    pub fn delete(&self) {
        let _monitor = self.monitor.lock();
        self.core.lock().lifecycle = Lifecycle::TearingDown;

        if let Err(e) = self.stop_polling(false) {
            warn!(device = %self.name, error = %e, "failed to stop polling during delete");
        }
        let owner = {
            let mut lock = self.lock.lock();
            let owner = lock.owner().cloned();
            lock.basic_unlock(false);
            owner
        };
        if let Some(owner) = owner {
            self.unlock_roots(&owner);
        }

        self.behavior.delete_device(self);
        self.class.unregister(self);
        self.core.lock().lifecycle = Lifecycle::Destroyed;
        info!(device = %self.name, "device deleted");
    }

    /// Fetch the system properties. Nothing is applied when any of them
    /// is malformed: the current resources and black box stay as they are.
    pub fn get_dev_system_resource(&self) -> Result<(), CoreError> {
        let Some(db) = self.ctx.db() else {
            return Ok(());
        };
        let data = db.get_device_property(&self.name, &SYSTEM_PROPERTIES[..])?;
        let (resources, errors) = SystemResources::from_properties(&self.name, &data);
        if let Some(err) = errors.into_iter().next() {
            return Err(err);
        }
        self.blackbox.lock().resize(resources.blackbox_depth);
        *self.resources.write() = resources;
        Ok(())
    }

    pub fn system_resources(&self) -> SystemResources {
        self.resources.read().clone()
    }

    pub fn description(&self) -> String {
        self.resources.read().description.clone()
    }

    /// Apply database attribute properties (limits) to the named
    /// attributes. Returns what was fetched for the memorized pass.
    fn load_attribute_config(&self, names: &[String]) -> Vec<AttributeProperties> {
        let Some(db) = self.ctx.db() else {
            return Vec::new();
        };
        if names.is_empty() {
            return Vec::new();
        }
        let props = match db.get_device_attribute_property(&self.name, names) {
            Ok(props) => props,
            Err(e) => {
                warn!(device = %self.name, error = %e, "failed to fetch attribute configuration");
                return Vec::new();
            }
        };

        let mut wrong = Vec::new();
        {
            let mut attrs = self.attrs.write();
            for ap in &props {
                let Some(entry) = attrs.get_mut(&ap.attribute.to_ascii_lowercase()) else {
                    continue;
                };
                let mut limits = entry.descriptor.limits;
                match limits.apply(&ap.properties) {
                    Ok(()) => entry.limits = limits,
                    Err(property) => {
                        warn!(device = %self.name, attribute = %entry.descriptor.name, %property, "wrong attribute configuration");
                        wrong.push(entry.descriptor.name.clone());
                    }
                }
            }
        }
        let mut core = self.core.lock();
        for name in &wrong {
            push_unique(&mut core.att_wrong_db_conf, name);
        }
        props
    }

    /// Restore memorized set-points, writing them to hardware when the
    /// attribute asks for it.
    fn restore_memorized(&self, props: &[AttributeProperties]) {
        let mut failed = Vec::new();
        for ap in props {
            let Some(datum) = ap
                .properties
                .iter()
                .find(|d| d.name.eq_ignore_ascii_case(MEMORIZED_VALUE_PROP) && !d.is_empty())
            else {
                continue;
            };
            let lower = ap.attribute.to_ascii_lowercase();
            let Some((desc, mut slot)) = self
                .attrs
                .read()
                .get(&lower)
                .filter(|e| e.descriptor.memorized)
                .map(|e| (Arc::clone(&e.descriptor), e.slot.clone()))
            else {
                continue;
            };

            let value = match Value::from_strings(desc.data_type, desc.format, &datum.values) {
                Ok(value) => value,
                Err(e) => {
                    warn!(device = %self.name, attribute = %desc.name, error = %e, "unreadable memorized value");
                    failed.push(desc.name.clone());
                    continue;
                }
            };
            slot.set_write_value(Some(value));
            if desc.write_memorized_at_init {
                if let Err(e) = desc.behavior.write(self, &slot) {
                    warn!(device = %self.name, attribute = %desc.name, error = %e, "memorized value write failed");
                    failed.push(desc.name.clone());
                    continue;
                }
            }
            if let Some(entry) = self.attrs.write().get_mut(&lower) {
                entry.slot.set_write_value(slot.write_value().cloned());
            }
        }

        let mut core = self.core.lock();
        for name in &failed {
            push_unique(&mut core.att_mem_failed, name);
        }
    }

    fn check_forwarded(&self) {
        let supported = self.class.capabilities().supports_forwarded_attrs;
        let wrong: Vec<String> = self
            .attrs
            .read()
            .values()
            .filter(|e| {
                e.descriptor
                    .forwarded
                    .as_deref()
                    .is_some_and(|root| !supported || root.matches('/').count() != 3)
            })
            .map(|e| e.descriptor.name.clone())
            .collect();
        let mut core = self.core.lock();
        for name in &wrong {
            push_unique(&mut core.fwd_att_wrong_conf, name);
        }
    }

    fn start_configured_polling(&self) {
        let resources = self.resources.read().clone();
        let mut wanted: Vec<(PollKind, String, u64)> = resources
            .polled_attributes()
            .into_iter()
            .map(|(name, period)| (PollKind::Attribute, name, period))
            .chain(
                resources
                    .polled_commands()
                    .into_iter()
                    .map(|(name, period)| (PollKind::Command, name, period)),
            )
            .collect();

        let listed = |wanted: &[(PollKind, String, u64)], kind: PollKind, name: &str| {
            wanted
                .iter()
                .any(|(k, n, _)| *k == kind && n.eq_ignore_ascii_case(name))
        };
        let by_definition: Vec<(PollKind, String, u64)> = self
            .attrs
            .read()
            .values()
            .filter_map(|e| {
                let period = e.descriptor.polling_period_ms?;
                let name = &e.descriptor.name;
                let manual = resources
                    .non_auto_polled_attr
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(name));
                (!manual).then(|| (PollKind::Attribute, name.clone(), period))
            })
            .chain(self.commands.read().values().filter_map(|e| {
                let period = e.descriptor.polling_period_ms?;
                let name = &e.descriptor.name;
                let manual = resources
                    .non_auto_polled_cmd
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(name));
                (!manual).then(|| (PollKind::Command, name.clone(), period))
            }))
            .collect();
        for item in by_definition {
            if !listed(&wanted, item.0, &item.1) {
                wanted.push(item);
            }
        }

        for (kind, name, period) in wanted {
            if period == 0 || self.is_polled(kind, &name) {
                continue;
            }
            if let Err(e) = self.add_polling(kind, &name, period) {
                warn!(device = %self.name, %kind, object = %name, error = %e, "failed to start polling");
            }
        }
    }

    // ── State and status ────────────────────────────────────────────

    /// The state as last set, without alarm evaluation.
    pub fn get_state(&self) -> DevState {
        self.core.lock().state
    }

    pub fn set_state(&self, state: DevState) {
        let mut core = self.core.lock();
        core.state = state;
        core.alarm_by_kernel = false;
    }

    pub fn set_status(&self, status: impl Into<String>) {
        self.core.lock().status = Some(status.into());
    }

    pub fn append_status(&self, text: &str, new_line: bool) {
        let mut core = self.core.lock();
        let status = core.status.get_or_insert_with(String::new);
        if new_line && !status.is_empty() {
            status.push('\n');
        }
        status.push_str(text);
    }

    /// Current state, with alarm evaluation in ON or ALARM state.
    pub fn dev_state(&self) -> DevState {
        self.dev_state_excluding(&[])
    }

    /// `already_read` attributes were read by the current request and
    /// are not read again.
    fn dev_state_excluding(&self, already_read: &[String]) -> DevState {
        let _monitor = self.monitor.lock();
        let (state, forced) = {
            let core = self.core.lock();
            (core.state, core.forced_alarm())
        };
        if forced && state != DevState::Fault {
            return DevState::Alarm;
        }
        if !state.evaluates_alarms() {
            return state;
        }

        let polled: Vec<String> = self
            .polled
            .lock()
            .keys()
            .filter(|(kind, _)| *kind == PollKind::Attribute)
            .map(|(_, name)| name.clone())
            .collect();
        let targets: Vec<Arc<AttrDescriptor>> = self
            .attrs
            .read()
            .iter()
            .filter(|(key, e)| {
                e.limits.has_alarm()
                    && e.descriptor.write_type.is_readable()
                    && !polled.contains(*key)
                    && !already_read.iter().any(|r| r.eq_ignore_ascii_case(key))
            })
            .map(|(_, e)| Arc::clone(&e.descriptor))
            .collect();

        if !targets.is_empty() {
            let names: Vec<String> = targets.iter().map(|d| d.name.clone()).collect();
            if let Err(e) = self.behavior.read_attr_hardware(self, &names) {
                warn!(device = %self.name, error = %e, "read_attr_hardware failed while evaluating state");
            }
            for desc in &targets {
                if let Err(e) = self.read_attribute_value(desc) {
                    debug!(device = %self.name, attribute = %desc.name, error = %e, "alarm check read failed");
                }
            }
        }

        let alarmed = self
            .attrs
            .read()
            .values()
            .any(|e| e.alarm.is_some());

        let mut core = self.core.lock();
        if alarmed {
            if core.state == DevState::On {
                core.state = DevState::Alarm;
                core.alarm_by_kernel = true;
            }
        } else if core.state == DevState::Alarm && core.alarm_by_kernel {
            core.state = DevState::On;
            core.alarm_by_kernel = false;
        }
        core.state
    }

    /// Status text. In ALARM state, one line per attribute out of range.
    pub fn dev_status(&self) -> String {
        let _monitor = self.monitor.lock();
        {
            let core = self.core.lock();
            if core.forced_alarm() && core.state != DevState::Fault {
                return core.forced_alarm_status();
            }
        }

        let state = self.dev_state();
        let base = self
            .core
            .lock()
            .status
            .clone()
            .unwrap_or_else(|| format!("The device is in {state} state."));
        if state != DevState::Alarm {
            return base;
        }
        let lines: Vec<String> = self
            .attrs
            .read()
            .values()
            .filter_map(|e| e.alarm.map(|kind| kind.describe(&e.descriptor.name)))
            .collect();
        if lines.is_empty() {
            base
        } else {
            format!("{base}\n{}", lines.join("\n"))
        }
    }

    pub fn add_version_info(&self, key: impl Into<String>, value: impl Into<String>) {
        self.core.lock().version_info.insert(key.into(), value.into());
    }

    pub fn version_info(&self) -> BTreeMap<String, String> {
        self.core.lock().version_info.clone()
    }

    // ── Attributes ──────────────────────────────────────────────────

    pub fn attribute_names(&self) -> Vec<String> {
        self.attrs
            .read()
            .values()
            .map(|e| e.descriptor.name.clone())
            .collect()
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attrs.read().contains_key(&name.to_ascii_lowercase())
    }

    /// Limits in effect for `name`, after database overrides.
    pub fn attribute_limits(&self, name: &str) -> Option<AttrLimits> {
        self.attrs
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|e| e.limits)
    }

    /// Outcome of the last read of `name`, without reading it again.
    pub fn last_attribute_value(&self, name: &str) -> Option<AttributeValue> {
        self.attrs
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|e| e.slot.to_attribute_value())
    }

    pub(crate) fn attribute_id(&self, name: &str) -> Option<AttrId> {
        self.attrs.read().get(&name.to_ascii_lowercase()).map(|e| e.id)
    }

    pub fn read_attributes(
        &self,
        caller: Option<&ClientIdentity>,
        names: &[&str],
    ) -> Result<Vec<AttributeValue>, CoreError> {
        self.read_attributes_from(caller, names, ReadSource::Device)
    }

    /// Read the named attributes. Attributes are read before the virtual
    /// `State`, so state evaluation sees the fresh values. A request made
    /// of [`ALL_ATTRIBUTES`] alone reads every attribute, `State` and
    /// `Status` included.
    pub fn read_attributes_from(
        &self,
        caller: Option<&ClientIdentity>,
        names: &[&str],
        source: ReadSource,
    ) -> Result<Vec<AttributeValue>, CoreError> {
        self.ensure_alive("read_attributes")?;
        self.blackbox.lock().record("read_attributes", caller);
        let _monitor = self.monitor.lock();
        self.behavior.always_executed_hook(self);

        let expanded: Vec<String>;
        let every: Vec<&str>;
        let names = if matches!(names, [only] if *only == ALL_ATTRIBUTES) {
            expanded = self.attribute_names();
            every = expanded
                .iter()
                .map(String::as_str)
                .chain([STATE_ATTR, STATUS_ATTR])
                .collect();
            every.as_slice()
        } else {
            names
        };

        let mut plan = Vec::with_capacity(names.len());
        for name in names {
            if is_virtual(name) {
                plan.push(None);
                continue;
            }
            let desc = self
                .attrs
                .read()
                .get(&name.to_ascii_lowercase())
                .map(|e| Arc::clone(&e.descriptor))
                .ok_or_else(|| {
                    CoreError::attr_not_found(format!("Attribute {name} not found for device {}", self.name))
                })?;
            let cached = match source {
                ReadSource::Device => false,
                ReadSource::Cache => true,
                ReadSource::CacheDevice => self.is_polled(PollKind::Attribute, &desc.name),
            };
            plan.push(Some((desc, cached)));
        }

        let hardware: Vec<String> = plan
            .iter()
            .flatten()
            .filter(|(d, cached)| !cached && d.write_type.is_readable())
            .map(|(d, _)| d.name.clone())
            .collect();
        if !hardware.is_empty() {
            self.behavior.read_attr_hardware(self, &hardware)?;
        }

        let mut values = Vec::with_capacity(plan.len());
        for item in &plan {
            values.push(match item {
                Some((desc, true)) => Some(self.cached_attribute(&desc.name)?),
                Some((desc, false)) => Some(self.read_attribute_value(desc)?),
                None => None,
            });
        }

        names
            .iter()
            .zip(values)
            .map(|(name, value)| match value {
                Some(value) => Ok(value),
                None => Ok(self.virtual_attribute(name, &hardware)),
            })
            .collect()
    }

    fn virtual_attribute(&self, name: &str, already_read: &[String]) -> AttributeValue {
        let value = if name.eq_ignore_ascii_case(STATE_ATTR) {
            Value::State(self.dev_state_excluding(already_read))
        } else {
            Value::Str(self.dev_status())
        };
        AttributeValue {
            name: virtual_name(name).to_owned(),
            value: Some(value),
            write_value: None,
            quality: AttrQuality::Valid,
            time: chrono::Utc::now(),
        }
    }

    fn cached_attribute(&self, name: &str) -> Result<AttributeValue, CoreError> {
        let polled = self.polled.lock();
        let entry = polled
            .get(&(PollKind::Attribute, name.to_ascii_lowercase()))
            .ok_or_else(|| not_polled(PollKind::Attribute, name))?;
        let record = entry.ring.last().ok_or_else(|| CoreError::Polling {
            reason: Reason::NoDataYet,
            message: format!("No data available in cache for attribute {name}"),
        })?;
        match &record.outcome {
            PollOutcome::Attribute(value) => Ok(value.clone()),
            PollOutcome::Failed(frames) => Err(CoreError::Remote(RemoteError {
                frames: frames.clone(),
            })),
            PollOutcome::Command(_) => Err(CoreError::Internal(format!(
                "command result stored in the ring of attribute {name}"
            ))),
        }
    }

    /// Read one attribute through its behaviour, evaluate its limits and
    /// store the result. A failed read leaves the attribute INVALID.
    fn read_attribute_value(&self, desc: &Arc<AttrDescriptor>) -> Result<AttributeValue, CoreError> {
        let lower = desc.name.to_ascii_lowercase();
        if !desc.behavior.is_allowed(self, AttrRequest::Read) {
            return Err(CoreError::AttrNotAllowed {
                message: format!("It is currently not allowed to read attribute {}", desc.name),
            });
        }
        let (mut slot, limits) = {
            let attrs = self.attrs.read();
            let entry = attrs.get(&lower).ok_or_else(|| {
                CoreError::attr_not_found(format!("Attribute {} not found for device {}", desc.name, self.name))
            })?;
            (entry.slot.fresh(), entry.limits)
        };

        let outcome = if desc.write_type.is_readable() {
            desc.behavior.read(self, &mut slot)
        } else {
            match slot.write_value().cloned() {
                Some(set_point) => slot.set_value(set_point),
                None => Ok(()),
            }
        }
        .and_then(|()| {
            if slot.value().is_none() && slot.quality() != AttrQuality::Invalid {
                Err(CoreError::AttrValueNotSet {
                    message: format!("Value for attribute {} has not been updated", desc.name),
                })
            } else {
                Ok(())
            }
        });

        let alarm = match &outcome {
            Ok(()) => slot.value().and_then(|v| limits.evaluate(v)),
            Err(_) => {
                slot.invalidate();
                None
            }
        };
        if let Some(kind) = alarm {
            if slot.quality() == AttrQuality::Valid {
                slot.set_quality(kind.quality());
            }
        }

        let value = slot.to_attribute_value();
        if let Some(entry) = self.attrs.write().get_mut(&lower) {
            entry.slot = slot;
            entry.alarm = alarm;
        }
        outcome.map(|()| value)
    }

    /// Write a batch. Every value is validated first; if any is rejected
    /// nothing is written. Writes that then fail are reported together,
    /// the others stay applied.
    pub fn write_attributes(
        &self,
        caller: Option<&ClientIdentity>,
        values: &[(&str, Value)],
    ) -> Result<(), CoreError> {
        self.ensure_alive("write_attributes")?;
        if let Some(caller) = caller {
            self.check_lock("write_attributes", None, caller)?;
        }
        self.blackbox.lock().record("write_attributes", caller);
        let _monitor = self.monitor.lock();
        self.behavior.always_executed_hook(self);

        let mut staged = Vec::with_capacity(values.len());
        let mut failures: Vec<ItemFailure> = Vec::new();
        for (name, value) in values {
            match self.stage_write(name, value) {
                Ok(item) => staged.push(item),
                Err(e) => failures.push(e.to_item_failure(name)),
            }
        }
        if !failures.is_empty() {
            return Err(CoreError::WriteFailed { failures });
        }

        let mut written = Vec::new();
        let mut memorized = Vec::new();
        for (desc, slot) in &staged {
            if let Err(e) = desc.behavior.write(self, slot) {
                failures.push(e.to_item_failure(&desc.name));
                continue;
            }
            if let Some(entry) = self.attrs.write().get_mut(&desc.name.to_ascii_lowercase()) {
                entry.slot.set_write_value(slot.write_value().cloned());
            }
            if desc.memorized {
                if let Some(value) = slot.write_value() {
                    memorized.push(AttributeProperties::new(
                        desc.name.clone(),
                        vec![DbDatum::with_values(MEMORIZED_VALUE_PROP, value.to_strings())],
                    ));
                }
            }
            written.push(desc.name.clone());
        }

        if !written.is_empty() {
            if let Err(e) = self.behavior.write_attr_hardware(self, &written) {
                failures.extend(written.iter().map(|name| e.to_item_failure(name)));
            }
        }
        if let (Some(db), false) = (self.ctx.db(), memorized.is_empty()) {
            if let Err(e) = db.put_device_attribute_property(&self.name, &memorized) {
                warn!(device = %self.name, error = %e, "failed to store memorized values");
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::WriteFailed { failures })
        }
    }

    fn stage_write(&self, name: &str, value: &Value) -> Result<(Arc<AttrDescriptor>, AttrSlot), CoreError> {
        let (desc, mut slot, limits) = self
            .attrs
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|e| (Arc::clone(&e.descriptor), e.slot.clone(), e.limits))
            .ok_or_else(|| CoreError::attr_not_found(format!("Attribute {name} not found for device {}", self.name)))?;
        if !desc.write_type.is_writable() {
            return Err(CoreError::AttrNotWritable {
                message: format!("Attribute {} is not writable", desc.name),
            });
        }
        if !desc.behavior.is_allowed(self, AttrRequest::Write) {
            return Err(CoreError::AttrNotAllowed {
                message: format!("It is currently not allowed to write attribute {}", desc.name),
            });
        }
        slot.check_shape(value)?;
        limits.check_write(&desc.name, value)?;
        slot.set_write_value(Some(value.clone()));
        Ok((desc, slot))
    }

    /// Add an attribute to this device. Adding an identical definition is
    /// a no-op; a different definition under a name the class already
    /// uses is refused while any device still has the old one.
    pub fn add_attribute(&self, attr: AttrDescriptor) -> Result<(), CoreError> {
        let _monitor = self.monitor.lock();
        let lower = attr.name.to_ascii_lowercase();
        let mismatch = || {
            CoreError::attr_not_found(format!(
                "Device {} -> Attribute {} already exists for your device class but with other definition\n(data type, data format or data write type)",
                self.name, attr.name
            ))
        };
        if is_virtual(&attr.name) {
            return Err(mismatch());
        }
        if let Some(existing) = self.attrs.read().get(&lower).map(|e| Arc::clone(&e.descriptor)) {
            return if existing.same_definition(&attr) {
                Ok(())
            } else {
                Err(mismatch())
            };
        }

        let before = self.interface_if_notifying();
        let desc = {
            let mut arena = self.class.attrs.write();
            let found = arena
                .find(|a| a.name.eq_ignore_ascii_case(&attr.name))
                .map(|(idx, existing)| (idx, Arc::clone(existing)));
            let (id, desc) = match found {
                Some((idx, existing)) if existing.same_definition(&attr) => (AttrId(idx), existing),
                Some((idx, _)) => {
                    let id = AttrId(idx);
                    let in_use = self
                        .class
                        .siblings(self)
                        .iter()
                        .any(|d| d.attribute_id(&attr.name) == Some(id));
                    if in_use {
                        return Err(mismatch());
                    }
                    arena.remove(idx);
                    let desc = Arc::new(attr);
                    (AttrId(arena.insert(Arc::clone(&desc))), desc)
                }
                None => {
                    let desc = Arc::new(attr);
                    (AttrId(arena.insert(Arc::clone(&desc))), desc)
                }
            };
            self.attrs
                .write()
                .insert(lower, AttrEntry::new(id, Arc::clone(&desc)));
            desc
        };
        debug!(device = %self.name, attribute = %desc.name, "attribute added");

        let props = self.load_attribute_config(&[desc.name.clone()]);
        self.restore_memorized(&props);
        if desc.forwarded.is_some() {
            self.check_forwarded();
        }
        if let Some(period) = desc.polling_period_ms {
            if let Err(e) = self.add_polling(PollKind::Attribute, &desc.name, period) {
                warn!(device = %self.name, attribute = %desc.name, error = %e, "failed to start polling");
            }
        }
        self.publish_interface_change(before)
    }

    /// Remove an attribute from this device. The class definition is
    /// released once no device of the class uses it.
    pub fn remove_attribute(&self, name: &str, clean_db: bool) -> Result<(), CoreError> {
        let _monitor = self.monitor.lock();
        let lower = name.to_ascii_lowercase();
        let missing = || {
            CoreError::attr_not_found(format!(
                "Attribute {name} is not defined as attribute for your device.\nCan't remove it"
            ))
        };
        if !self.attrs.read().contains_key(&lower) {
            return Err(missing());
        }

        let before = self.interface_if_notifying();
        if self.is_polled(PollKind::Attribute, name) {
            self.rem_polling(PollKind::Attribute, name)?;
        }
        let entry = self.attrs.write().shift_remove(&lower).ok_or_else(missing)?;
        self.core.lock().forget_attribute(&entry.descriptor.name);
        self.release_attribute(entry.id);

        if clean_db {
            if let Some(db) = self.ctx.db() {
                if let Err(e) = db.delete_all_device_attribute_property(&self.name, &[entry.descriptor.name.as_str()]) {
                    warn!(device = %self.name, attribute = %entry.descriptor.name, error = %e, "failed to clean attribute properties");
                }
            }
        }
        debug!(device = %self.name, attribute = %entry.descriptor.name, "attribute removed");
        self.publish_interface_change(before)
    }

    fn release_attribute(&self, id: AttrId) {
        let mut arena = self.class.attrs.write();
        if self.class.class_attrs.read().contains(&id) {
            return;
        }
        let in_use = self
            .class
            .siblings(self)
            .iter()
            .any(|d| d.attrs.read().values().any(|e| e.id == id));
        if !in_use {
            arena.remove(id.0);
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    pub fn command_names(&self) -> Vec<String> {
        self.commands
            .read()
            .values()
            .map(|e| e.descriptor.name.clone())
            .collect()
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.read().contains_key(&name.to_ascii_lowercase())
    }

    pub fn command_inout(
        &self,
        caller: Option<&ClientIdentity>,
        name: &str,
        arg: Value,
    ) -> Result<Value, CoreError> {
        self.ensure_alive("command_inout")?;
        if let Some(caller) = caller {
            self.check_lock("command_inout", Some(name), caller)?;
        }
        self.blackbox
            .lock()
            .record(format!("command_inout (cmd = {name})"), caller);

        let desc = self
            .commands
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|e| Arc::clone(&e.descriptor))
            .ok_or_else(|| CoreError::command_not_found(format!("Command {name} not found")))?;
        desc.check_argument(&arg)?;

        let _monitor = self.monitor.lock();
        self.behavior.always_executed_hook(self);
        if !desc.behavior.is_allowed(self) {
            return Err(CoreError::CommandNotAllowed {
                message: format!(
                    "Command {} not allowed when the device is in {} state",
                    desc.name,
                    self.get_state()
                ),
            });
        }
        desc.behavior.execute(self, arg)
    }

    /// Add a command, to this device only or to every device of the class.
    pub fn add_command(&self, cmd: CmdDescriptor, device_level: bool) -> Result<(), CoreError> {
        let _monitor = self.monitor.lock();
        let lower = cmd.name.to_ascii_lowercase();
        let mismatch = || {
            CoreError::command_not_found(format!(
                "Device {} -> Command {} already exists for your device but with other definition\n(command input data type or command output data type)",
                self.name, cmd.name
            ))
        };
        if let Some(existing) = self.commands.read().get(&lower).map(|e| Arc::clone(&e.descriptor)) {
            return if existing.same_definition(&cmd) {
                Ok(())
            } else {
                Err(mismatch())
            };
        }
        if !device_level {
            let clash = self.class.siblings(self).iter().any(|device| {
                device
                    .commands
                    .read()
                    .get(&lower)
                    .is_some_and(|e| !e.descriptor.same_definition(&cmd))
            });
            if clash {
                return Err(mismatch());
            }
        }

        let before = self.interface_if_notifying();
        let desc = Arc::new(cmd);
        {
            let mut arena = self.class.commands.write();
            let id = CmdId(arena.insert(Arc::clone(&desc)));
            if device_level {
                self.commands.write().insert(
                    lower,
                    CmdEntry {
                        id,
                        descriptor: Arc::clone(&desc),
                        local: true,
                    },
                );
            } else {
                self.class.class_cmds.write().push(id);
                for device in self.class.devices() {
                    device
                        .commands
                        .write()
                        .entry(lower.clone())
                        .or_insert_with(|| CmdEntry {
                            id,
                            descriptor: Arc::clone(&desc),
                            local: false,
                        });
                }
            }
        }
        debug!(device = %self.name, command = %desc.name, device_level, "command added");

        if let Some(period) = desc.polling_period_ms {
            if let Err(e) = self.add_polling(PollKind::Command, &desc.name, period) {
                warn!(device = %self.name, command = %desc.name, error = %e, "failed to start polling");
            }
        }
        self.publish_interface_change(before)
    }

    /// Remove a command. A class-wide command disappears from every
    /// device of the class.
    pub fn remove_command(&self, name: &str) -> Result<(), CoreError> {
        let _monitor = self.monitor.lock();
        let lower = name.to_ascii_lowercase();
        let (id, local) = self
            .commands
            .read()
            .get(&lower)
            .map(|e| (e.id, e.local))
            .ok_or_else(|| {
                CoreError::command_not_found(format!(
                    "Command {name} is not defined as command for your device.\nCan't remove it"
                ))
            })?;
        if is_builtin_command(name) {
            return Err(CoreError::CommandNotAllowed {
                message: format!("Command {name} is a built-in command and can't be removed"),
            });
        }

        let before = self.interface_if_notifying();
        if self.is_polled(PollKind::Command, name) {
            self.rem_polling(PollKind::Command, name)?;
        }
        {
            let mut arena = self.class.commands.write();
            if local {
                self.commands.write().shift_remove(&lower);
            } else {
                self.class.class_cmds.write().retain(|c| *c != id);
                for device in self.class.devices() {
                    device.commands.write().retain(|_, e| e.id != id);
                }
            }
            let in_use = self
                .class
                .devices()
                .iter()
                .any(|d| d.commands.read().values().any(|e| e.id == id));
            if !in_use {
                arena.remove(id.0);
            }
        }
        debug!(device = %self.name, command = name, "command removed");
        self.publish_interface_change(before)
    }

    // ── Interface ───────────────────────────────────────────────────

    /// Public interface snapshot, sorted by name.
    pub fn interface(&self) -> DeviceInterface {
        let mut commands: Vec<CommandInfo> = self
            .commands
            .read()
            .values()
            .map(|e| CommandInfo {
                name: e.descriptor.name.clone(),
                in_type: e.descriptor.in_type,
                out_type: e.descriptor.out_type,
            })
            .collect();
        commands.sort_by_key(|c| c.name.to_ascii_lowercase());

        let mut attributes: Vec<AttributeInfo> = self
            .attrs
            .read()
            .values()
            .map(|e| AttributeInfo {
                name: e.descriptor.name.clone(),
                data_type: e.descriptor.data_type,
                format: e.descriptor.format,
                write_type: e.descriptor.write_type,
                memorized: e.descriptor.memorized,
            })
            .collect();
        for (name, data_type) in [(STATE_ATTR, DataType::State), (STATUS_ATTR, DataType::String)] {
            attributes.push(AttributeInfo {
                name: name.to_owned(),
                data_type,
                format: AttrDataFormat::Scalar,
                write_type: AttrWriteType::Read,
                memorized: false,
            });
        }
        attributes.sort_by_key(|a| a.name.to_ascii_lowercase());

        DeviceInterface { commands, attributes }
    }

    fn interface_if_notifying(&self) -> Option<DeviceInterface> {
        self.ctx
            .notifier()
            .should_notify(self.class.capabilities(), &self.name)
            .then(|| self.interface())
    }

    fn publish_interface_change(&self, before: Option<DeviceInterface>) -> Result<(), CoreError> {
        match before {
            Some(before) => self.ctx.notifier().signal(self, before),
            None => Ok(()),
        }
    }

    // ── Locking ─────────────────────────────────────────────────────

    /// Lock the device for `who`. A first lock also locks the root devices
    /// of forwarded attributes; if one of those fails, nothing stays locked.
    pub fn lock(&self, who: &ClientIdentity, validity: Option<Duration>) -> Result<(), CoreError> {
        let validity = validity.unwrap_or(self.ctx.options().default_lock_validity);
        let _monitor = self.monitor.lock();
        self.blackbox.lock().record("lock_device", Some(who));

        let first = self.lock.lock().acquire(&self.name, who, validity, Instant::now())?;
        if !first {
            return Ok(());
        }
        let mut locked: Vec<String> = Vec::new();
        for root in self.root_devices() {
            if let Err(e) = self.ctx.root_locker().lock_root(&root, who, validity) {
                for done in &locked {
                    if let Err(e) = self.ctx.root_locker().unlock_root(done, who) {
                        warn!(device = %self.name, root = %done, error = %e, "failed to undo root lock");
                    }
                }
                self.lock.lock().basic_unlock(false);
                return Err(e);
            }
            locked.push(root);
        }
        debug!(device = %self.name, client = %who, "device locked");
        Ok(())
    }

    pub fn relock(&self, who: &ClientIdentity) -> Result<(), CoreError> {
        let _monitor = self.monitor.lock();
        self.blackbox.lock().record("relock_device", Some(who));
        self.lock.lock().relock(&self.name, who, Instant::now())
    }

    /// Release one lock reference, or every reference when `forced`.
    /// Returns the remaining count.
    pub fn unlock(&self, who: &ClientIdentity, forced: bool) -> Result<u32, CoreError> {
        let _monitor = self.monitor.lock();
        self.blackbox.lock().record("unlock_device", Some(who));
        let (owner, remaining) = {
            let mut lock = self.lock.lock();
            let owner = lock.owner().cloned();
            (owner, lock.release(&self.name, who, forced, Instant::now())?)
        };
        if remaining == 0 {
            debug!(device = %self.name, client = %who, forced, "device unlocked");
            if let Some(owner) = owner {
                self.unlock_roots(&owner);
            }
        }
        Ok(remaining)
    }

    /// Refuse `method` (or `command`) to a caller that does not hold a
    /// valid lock on this device.
    pub fn check_lock(
        &self,
        method: &str,
        command: Option<&str>,
        caller: &ClientIdentity,
    ) -> Result<(), CoreError> {
        let allowed = match command {
            Some(cmd) if self.lock.lock().is_locked() => self.is_allowed_while_locked(cmd),
            _ => false,
        };
        let (owner, cleared) = {
            let mut lock = self.lock.lock();
            let owner = lock.owner().cloned();
            let cleared = lock.check(&self.name, method, command, caller, |_| allowed, Instant::now())?;
            (owner, cleared)
        };
        if cleared {
            if let Some(owner) = owner {
                self.unlock_roots(&owner);
            }
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.lock.lock().valid_lock(Instant::now())
    }

    pub fn lock_status(&self) -> LockInfo {
        self.lock.lock().status(&self.name, Instant::now())
    }

    fn is_allowed_while_locked(&self, command: &str) -> bool {
        command.eq_ignore_ascii_case(STATE_COMMAND)
            || command.eq_ignore_ascii_case(STATUS_COMMAND)
            || self
                .class
                .allowed_commands(self.ctx.db().map(Arc::as_ref))
                .iter()
                .any(|c| c.eq_ignore_ascii_case(command))
    }

    /// Devices hosting the root attributes of forwarded attributes.
    fn root_devices(&self) -> Vec<String> {
        let mut roots: Vec<String> = self
            .attrs
            .read()
            .values()
            .filter_map(|e| e.descriptor.root_device().map(str::to_ascii_lowercase))
            .collect();
        roots.sort();
        roots.dedup();
        roots
    }

    fn unlock_roots(&self, who: &ClientIdentity) {
        for root in self.root_devices() {
            if let Err(e) = self.ctx.root_locker().unlock_root(&root, who) {
                warn!(device = %self.name, %root, error = %e, "failed to unlock root device");
            }
        }
    }

    // ── Polling ─────────────────────────────────────────────────────

    pub fn is_polled(&self, kind: PollKind, name: &str) -> bool {
        self.polled
            .lock()
            .contains_key(&(kind, name.to_ascii_lowercase()))
    }

    /// Start polling an attribute or a no-argument command.
    pub fn add_polling(&self, kind: PollKind, name: &str, period_ms: u64) -> Result<(), CoreError> {
        let canonical = match kind {
            PollKind::Attribute if is_virtual(name) => virtual_name(name).to_owned(),
            PollKind::Attribute => self
                .attrs
                .read()
                .get(&name.to_ascii_lowercase())
                .map(|e| e.descriptor.name.clone())
                .ok_or_else(|| CoreError::attr_not_found(format!("Attribute {name} not found for device {}", self.name)))?,
            PollKind::Command => {
                let desc = self
                    .commands
                    .read()
                    .get(&name.to_ascii_lowercase())
                    .map(|e| Arc::clone(&e.descriptor))
                    .ok_or_else(|| CoreError::command_not_found(format!("Command {name} not found")))?;
                if desc.in_type != ArgType::Void {
                    return Err(CoreError::InvalidValue {
                        reason: Reason::IncompatibleCmdArgumentType,
                        message: format!("Command {} needs an argument and can't be polled", desc.name),
                    });
                }
                desc.name.clone()
            }
        };

        let resources = self.resources.read().clone();
        let (min, depth) = match kind {
            PollKind::Attribute => (
                resources.attr_min_poll_period(&canonical),
                resources.attr_poll_ring_depth(&canonical),
            ),
            PollKind::Command => (
                resources.cmd_min_poll_period(&canonical),
                resources.cmd_poll_ring_depth(&canonical),
            ),
        };
        if period_ms == 0 || period_ms < min {
            return Err(CoreError::Polling {
                reason: Reason::BadConfigurationProperty,
                message: format!(
                    "Polling period {period_ms} ms for {kind} {canonical} is below the minimum allowed ({} ms)",
                    min.max(1)
                ),
            });
        }

        let key = (kind, canonical.to_ascii_lowercase());
        {
            let mut polled = self.polled.lock();
            if polled.contains_key(&key) {
                return Err(CoreError::Polling {
                    reason: Reason::AlreadyPolled,
                    message: format!("{kind} {canonical} is already polled for device {}", self.name),
                });
            }
            polled.insert(
                key.clone(),
                PollEntry {
                    period_ms,
                    ring: PollRing::new(depth),
                },
            );
        }

        if let Err(e) = self
            .ctx
            .polling()
            .add_object(self, kind, &canonical, Duration::from_millis(period_ms))
        {
            self.polled.lock().shift_remove(&key);
            return Err(e);
        }
        debug!(device = %self.name, %kind, object = %canonical, period_ms, "polling started");
        Ok(())
    }

    pub fn rem_polling(&self, kind: PollKind, name: &str) -> Result<(), CoreError> {
        let key = (kind, name.to_ascii_lowercase());
        if !self.polled.lock().contains_key(&key) {
            return Err(not_polled(kind, name));
        }
        self.ctx.polling().rem_object(&self.name, kind, name)?;
        self.polled.lock().shift_remove(&key);
        debug!(device = %self.name, %kind, object = name, "polling stopped");
        Ok(())
    }

    /// Stop polling everything on this device.
    pub fn stop_polling(&self, with_db_update: bool) -> Result<(), CoreError> {
        if self.polled.lock().is_empty() {
            return Ok(());
        }
        self.ctx.polling().stop_polling(&self.name, with_db_update)?;
        self.polled.lock().clear();
        Ok(())
    }

    pub fn polled_objects(&self) -> Vec<PolledObject> {
        self.polled
            .lock()
            .iter()
            .map(|((kind, name), entry)| PolledObject {
                kind: *kind,
                name: name.clone(),
                period_ms: entry.period_ms,
                depth: entry.ring.depth(),
                records: entry.ring.len(),
            })
            .collect()
    }

    /// Up to `n` poll records, most recent first.
    pub fn poll_history(&self, kind: PollKind, name: &str, n: usize) -> Result<Vec<PollRecord>, CoreError> {
        self.polled
            .lock()
            .get(&(kind, name.to_ascii_lowercase()))
            .map(|entry| entry.ring.history(n))
            .ok_or_else(|| not_polled(kind, name))
    }

    /// One poll of one object, run by a polling thread.
    pub(crate) fn poll_object(&self, kind: PollKind, name: &str) {
        let key = (kind, name.to_ascii_lowercase());
        if !self.polled.lock().contains_key(&key) {
            return;
        }

        let outcome = match self.monitor.try_lock_for(self.ctx.options().poll_monitor_timeout) {
            None => PollOutcome::Failed(vec![ErrorFrame::new(
                Reason::CommandTimedOut,
                format!("Not able to acquire serialization monitor for device {}", self.name),
                "Device::poll_object",
            )]),
            Some(_monitor) => match kind {
                PollKind::Attribute => match self.poll_attribute(name) {
                    Ok(value) => PollOutcome::Attribute(value),
                    Err(e) => PollOutcome::Failed(e.frames()),
                },
                PollKind::Command => match self.poll_command(name) {
                    Ok(value) => PollOutcome::Command(value),
                    Err(e) => PollOutcome::Failed(e.frames()),
                },
            },
        };

        if let Some(entry) = self.polled.lock().get_mut(&key) {
            entry.ring.push(outcome);
        }
    }

    fn poll_attribute(&self, name: &str) -> Result<AttributeValue, CoreError> {
        if is_virtual(name) {
            return Ok(self.virtual_attribute(name, &[]));
        }
        let desc = self
            .attrs
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|e| Arc::clone(&e.descriptor))
            .ok_or_else(|| CoreError::attr_not_found(format!("Attribute {name} not found for device {}", self.name)))?;
        self.behavior.read_attr_hardware(self, &[desc.name.clone()])?;
        self.read_attribute_value(&desc)
    }

    fn poll_command(&self, name: &str) -> Result<Value, CoreError> {
        let desc = self
            .commands
            .read()
            .get(&name.to_ascii_lowercase())
            .map(|e| Arc::clone(&e.descriptor))
            .ok_or_else(|| CoreError::command_not_found(format!("Command {name} not found")))?;
        desc.behavior.execute(self, Value::Void)
    }

    // ── Black box ───────────────────────────────────────────────────

    /// Up to `n` recorded requests, most recent first.
    pub fn black_box(&self, n: usize) -> Result<Vec<BlackBoxEntry>, CoreError> {
        self.blackbox.lock().read(&self.name, n)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::AppContext;

    fn plain_device(name: &str) -> Arc<Device> {
        let ctx = AppContext::builder().build();
        let class = DeviceClass::builder("Plain").build();
        Device::create(&ctx, &class, name, Arc::new(DefaultBehavior)).unwrap()
    }

    #[test]
    fn new_device_is_ready_and_unknown() {
        let dev = plain_device("test/plain/1");
        assert_eq!(dev.lifecycle(), Lifecycle::Ready);
        assert_eq!(dev.dev_state(), DevState::Unknown);
        assert_eq!(dev.dev_status(), "The device is in UNKNOWN state.");
        assert_eq!(dev.class().devices().len(), 1);
    }

    #[test]
    fn status_can_be_set_and_appended() {
        let dev = plain_device("test/plain/2");
        dev.set_status("Ready");
        dev.append_status("to go", true);
        assert_eq!(dev.dev_status(), "Ready\nto go");
    }

    #[test]
    fn builtin_commands_answer() {
        let dev = plain_device("test/plain/3");
        dev.set_state(DevState::Standby);
        assert_eq!(
            dev.command_inout(None, "state", Value::Void).unwrap(),
            Value::State(DevState::Standby)
        );
        assert_eq!(
            dev.command_inout(None, "Status", Value::Void).unwrap(),
            Value::Str("The device is in STANDBY state.".into())
        );
        let err = dev.command_inout(None, "Nope", Value::Void).unwrap_err();
        assert!(err.is_not_found());
        assert!(dev.remove_command("Init").is_err());
    }

    #[test]
    fn virtual_attributes_are_listed_and_read() {
        let dev = plain_device("test/plain/4");
        let names: Vec<_> = dev.interface().attributes.into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["State", "Status"]);
        let values = dev.read_attributes(None, &["status", "State"]).unwrap();
        assert_eq!(values[0].name, "Status");
        assert_eq!(values[1].value, Some(Value::State(DevState::Unknown)));
    }

    #[test]
    fn deleted_device_refuses_work() {
        let dev = plain_device("test/plain/5");
        dev.delete();
        assert_eq!(dev.lifecycle(), Lifecycle::Destroyed);
        assert!(dev.class().devices().is_empty());
        assert!(dev.command_inout(None, "State", Value::Void).is_err());
    }

    #[test]
    fn black_box_records_requests() {
        let dev = plain_device("test/plain/6");
        dev.command_inout(None, "State", Value::Void).unwrap();
        let entries = dev.black_box(5).unwrap();
        assert_eq!(entries[0].operation, "command_inout (cmd = State)");
    }

    #[test]
    fn forced_alarm_listing() {
        let mut core = CoreState::new();
        core.att_wrong_db_conf = vec!["a".into(), "b".into()];
        core.att_mem_failed = vec!["m".into()];
        assert!(core.forced_alarm());
        assert_eq!(
            core.forced_alarm_status(),
            "The device is in ALARM state.\n\
             Attributes a, b have wrong configuration\n\
             Try accessing the faulty attribute(s) to get more information\n\
             Memorized attribute m failed during device startup sequence"
        );
        core.forget_attribute("A");
        core.forget_attribute("b");
        core.forget_attribute("m");
        assert!(!core.forced_alarm());
    }
}
