// ── Domain model ──
//
// Plain data shared by the database client and the device runtime.

mod identity;
mod state;
mod value;

pub use identity::ClientIdentity;
pub use state::{AttrQuality, DevState};
pub use value::{AttrDataFormat, AttrWriteType, DataType, Value};
