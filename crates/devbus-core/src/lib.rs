//! Device-server runtime kernel.
//!
//! This crate owns everything a device server needs between the wire
//! transport in `devbus-api` and the user's device code:
//!
//! - **[`PropertyStore`]**: Database client. Resolves names and performs
//!   property CRUD against the remote database device or a local resource
//!   file, consulting an optional startup [`ServerCache`] first.
//!
//! - **[`Device`]**: Runtime of one device: state machine with alarm
//!   evaluation, attribute and command dispatch, dynamic interface
//!   mutation, advisory client locking and the request black box.
//!
//! - **[`PollingCoordinator`]**: Bounded pool of polling threads fed
//!   through single-slot hand-offs, with the pool layout persisted on the
//!   server's admin device.
//!
//! - **[`InterfaceNotifier`]**: Debounced interface-change events.
//!
//! - **[`AppContext`]**: The process-wide handle tying these together;
//!   built once at startup and shared by every device.

pub mod capabilities;
pub mod context;
pub mod database;
pub mod device;
pub mod error;
pub mod model;
pub mod notify;
pub mod polling;

// ── Primary re-exports ──────────────────────────────────────────────
pub use capabilities::ProtocolCapabilities;
pub use context::{AppContext, AppContextBuilder, ContextOptions, NoRootLocker, RootLocker};
pub use database::{FileStore, PropertyStore, ServerCache, StoreOptions};
pub use device::{
    AttrDescriptor, AttrLimits, AttrSlot, AttributeBehavior, AttributeValue, CmdDescriptor,
    CommandBehavior, DefaultBehavior, Device, DeviceBehavior, DeviceClass, Lifecycle, LockInfo,
    ReadSource,
};
pub use error::{CoreError, ItemFailure};
pub use notify::{DeviceInterface, EventSupplier, InterfaceNotifier};
pub use polling::{PollKind, PollingCoordinator, PollingOptions};

pub use model::{AttrDataFormat, AttrQuality, AttrWriteType, ClientIdentity, DataType, DevState, Value};
