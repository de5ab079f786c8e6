// ── Device classes ──
//
// A class owns attribute and command descriptors in slot arenas. Devices
// hold `AttrId`/`CmdId` handles plus a clone of the descriptor `Arc`; a
// slot is freed only after a scan of every live device of the class
// finds no remaining handle to it.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::Device;
use super::attribute::AttrDescriptor;
use super::command::{CmdDescriptor, builtin_commands};
use crate::capabilities::ProtocolCapabilities;
use crate::database::PropertyStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttrId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdId(pub(crate) usize);

/// Slot arena. Freed slots are reused by later inserts.
#[derive(Debug)]
pub(crate) struct Arena<T> {
    slots: Vec<Option<Arc<T>>>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> Arena<T> {
    pub(crate) fn insert(&mut self, item: Arc<T>) -> usize {
        if let Some(idx) = self.slots.iter().position(Option::is_none) {
            self.slots[idx] = Some(item);
            idx
        } else {
            self.slots.push(Some(item));
            self.slots.len() - 1
        }
    }

    pub(crate) fn get(&self, idx: usize) -> Option<&Arc<T>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    pub(crate) fn remove(&mut self, idx: usize) -> Option<Arc<T>> {
        self.slots.get_mut(idx).and_then(Option::take)
    }

    pub(crate) fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<(usize, &Arc<T>)> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(i, slot)| slot.as_ref().filter(|item| pred(item)).map(|item| (i, item)))
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

pub struct DeviceClass {
    name: String,
    capabilities: ProtocolCapabilities,
    pub(crate) attrs: RwLock<Arena<AttrDescriptor>>,
    pub(crate) commands: RwLock<Arena<CmdDescriptor>>,
    /// Attributes every new device of the class starts with.
    pub(crate) class_attrs: RwLock<Vec<AttrId>>,
    /// Commands shared by every device of the class.
    pub(crate) class_cmds: RwLock<Vec<CmdId>>,
    devices: RwLock<Vec<Weak<Device>>>,
    allowed_commands: RwLock<Option<Vec<String>>>,
}

impl std::fmt::Debug for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClass")
            .field("name", &self.name)
            .field("attributes", &self.attrs.read().len())
            .field("commands", &self.commands.read().len())
            .finish_non_exhaustive()
    }
}

impl DeviceClass {
    pub fn builder(name: impl Into<String>) -> DeviceClassBuilder {
        DeviceClassBuilder {
            name: name.into(),
            capabilities: ProtocolCapabilities::default(),
            attrs: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> ProtocolCapabilities {
        self.capabilities
    }

    /// Live devices of this class. Dead handles are pruned.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut devices = self.devices.write();
        devices.retain(|w| w.strong_count() > 0);
        devices.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn register(&self, device: Weak<Device>) {
        self.devices.write().push(device);
    }

    pub(crate) fn unregister(&self, device: &Device) {
        self.devices
            .write()
            .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), device));
    }

    /// Devices of this class other than `me`.
    pub(crate) fn siblings(&self, me: &Device) -> Vec<Arc<Device>> {
        self.devices()
            .into_iter()
            .filter(|d| !std::ptr::eq(Arc::as_ptr(d), me))
            .collect()
    }

    pub fn attribute_count(&self) -> usize {
        self.attrs.read().len()
    }

    pub fn command_count(&self) -> usize {
        self.commands.read().len()
    }

    pub fn find_attribute(&self, name: &str) -> Option<(AttrId, Arc<AttrDescriptor>)> {
        self.attrs
            .read()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|(i, a)| (AttrId(i), Arc::clone(a)))
    }

    pub fn find_command(&self, name: &str) -> Option<(CmdId, Arc<CmdDescriptor>)> {
        self.commands
            .read()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|(i, c)| (CmdId(i), Arc::clone(c)))
    }

    pub(crate) fn initial_attributes(&self) -> Vec<(AttrId, Arc<AttrDescriptor>)> {
        let arena = self.attrs.read();
        self.class_attrs
            .read()
            .iter()
            .filter_map(|id| arena.get(id.0).map(|d| (*id, Arc::clone(d))))
            .collect()
    }

    pub(crate) fn initial_commands(&self) -> Vec<(CmdId, Arc<CmdDescriptor>)> {
        let arena = self.commands.read();
        self.class_cmds
            .read()
            .iter()
            .filter_map(|id| arena.get(id.0).map(|d| (*id, Arc::clone(d))))
            .collect()
    }

    /// Commands that stay callable for read-only clients. Fetched once.
    pub fn allowed_commands(&self, db: Option<&PropertyStore>) -> Vec<String> {
        if let Some(cached) = self.allowed_commands.read().as_ref() {
            return cached.clone();
        }
        let fetched = db.map(|db| db.allowed_commands(&self.name)).unwrap_or_default();
        self.allowed_commands
            .write()
            .get_or_insert(fetched)
            .clone()
    }
}

pub struct DeviceClassBuilder {
    name: String,
    capabilities: ProtocolCapabilities,
    attrs: Vec<AttrDescriptor>,
    commands: Vec<CmdDescriptor>,
}

impl DeviceClassBuilder {
    #[must_use]
    pub fn capabilities(mut self, capabilities: ProtocolCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn attribute(mut self, attr: AttrDescriptor) -> Self {
        self.attrs.push(attr);
        self
    }

    #[must_use]
    pub fn command(mut self, cmd: CmdDescriptor) -> Self {
        self.commands.push(cmd);
        self
    }

    pub fn build(self) -> Arc<DeviceClass> {
        let mut attrs = Arena::default();
        let class_attrs = self
            .attrs
            .into_iter()
            .map(|a| AttrId(attrs.insert(Arc::new(a))))
            .collect();

        let mut commands = Arena::default();
        let class_cmds = builtin_commands()
            .into_iter()
            .chain(self.commands)
            .map(|c| CmdId(commands.insert(Arc::new(c))))
            .collect();

        Arc::new(DeviceClass {
            name: self.name,
            capabilities: self.capabilities,
            attrs: RwLock::new(attrs),
            commands: RwLock::new(commands),
            class_attrs: RwLock::new(class_attrs),
            class_cmds: RwLock::new(class_cmds),
            devices: RwLock::new(Vec::new()),
            allowed_commands: RwLock::new(None),
        })
    }
}

/// All classes known to one server process, by case-insensitive name.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: RwLock<IndexMap<String, Arc<DeviceClass>>>,
}

impl ClassRegistry {
    pub fn register(&self, class: Arc<DeviceClass>) {
        self.classes
            .write()
            .insert(class.name().to_ascii_lowercase(), class);
    }

    pub fn get(&self, name: &str) -> Option<Arc<DeviceClass>> {
        self.classes.read().get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn classes(&self) -> Vec<Arc<DeviceClass>> {
        self.classes.read().values().cloned().collect()
    }

    /// Every live device of every class.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.classes().iter().flat_map(|c| c.devices()).collect()
    }

    pub fn find_device(&self, name: &str) -> Option<Arc<Device>> {
        self.devices()
            .into_iter()
            .find(|d| d.name().eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::DataType;

    #[test]
    fn arena_reuses_freed_slots() {
        let mut arena = Arena::default();
        let a = arena.insert(Arc::new(1));
        let b = arena.insert(Arc::new(2));
        assert_eq!((a, b), (0, 1));
        assert_eq!(arena.remove(a).as_deref(), Some(&1));
        assert!(arena.get(a).is_none());
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.insert(Arc::new(3)), 0);
        assert_eq!(arena.find(|v| *v == 2).map(|(i, _)| i), Some(1));
    }

    #[test]
    fn builder_seeds_builtins_and_attributes() {
        let class = DeviceClass::builder("Motor")
            .attribute(AttrDescriptor::builder("position", DataType::Double).build())
            .build();
        assert_eq!(class.command_count(), 3);
        assert_eq!(class.attribute_count(), 1);
        assert!(class.find_command("status").is_some());
        assert!(class.find_attribute("Position").is_some());
        assert!(class.devices().is_empty());
    }

    #[test]
    fn registry_is_case_insensitive() {
        let registry = ClassRegistry::default();
        registry.register(DeviceClass::builder("Motor").build());
        assert!(registry.get("MOTOR").is_some());
        assert_eq!(registry.classes().len(), 1);
    }
}
