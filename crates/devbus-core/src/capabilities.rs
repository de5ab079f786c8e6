//! Protocol capability flags.
//!
//! A device exposes one runtime regardless of the protocol generation it
//! speaks; features that only exist from some generation on are switched
//! by the flags in [`ProtocolCapabilities`].

use serde::{Deserialize, Serialize};

/// First protocol generation with interface-change events, pipes, enum
/// attributes and forwarded attributes.
pub const MIN_IDL_DEV_INTR: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolCapabilities {
    pub idl_version: u32,
    pub supports_pipes: bool,
    pub supports_enum_attrs: bool,
    pub supports_interface_change_events: bool,
    pub supports_forwarded_attrs: bool,
}

impl ProtocolCapabilities {
    pub const LATEST: Self = Self::for_idl(MIN_IDL_DEV_INTR);

    pub const fn for_idl(idl_version: u32) -> Self {
        let modern = idl_version >= MIN_IDL_DEV_INTR;
        Self {
            idl_version,
            supports_pipes: modern,
            supports_enum_attrs: modern,
            supports_interface_change_events: modern,
            supports_forwarded_attrs: modern,
        }
    }
}

impl Default for ProtocolCapabilities {
    fn default() -> Self {
        Self::LATEST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_generations_lack_interface_events() {
        let caps = ProtocolCapabilities::for_idl(4);
        assert!(!caps.supports_interface_change_events);
        assert!(!caps.supports_pipes);
        assert!(ProtocolCapabilities::LATEST.supports_interface_change_events);
    }
}
