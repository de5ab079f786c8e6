// ── Device state and attribute quality ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Operational state of a device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum DevState {
    On,
    Off,
    Close,
    Open,
    Insert,
    Extract,
    Moving,
    Standby,
    Fault,
    Init,
    Running,
    Alarm,
    Disable,
    #[default]
    Unknown,
}

impl DevState {
    /// States in which alarm-enabled attributes are evaluated.
    pub fn evaluates_alarms(self) -> bool {
        matches!(self, Self::On | Self::Alarm)
    }
}

/// Quality attached to every attribute value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
pub enum AttrQuality {
    #[default]
    #[strum(serialize = "ATTR_VALID")]
    Valid,
    #[strum(serialize = "ATTR_INVALID")]
    Invalid,
    #[strum(serialize = "ATTR_ALARM")]
    Alarm,
    #[strum(serialize = "ATTR_CHANGING")]
    Changing,
    #[strum(serialize = "ATTR_WARNING")]
    Warning,
}

impl AttrQuality {
    pub fn is_alarming(self) -> bool {
        matches!(self, Self::Alarm | Self::Warning)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn state_names_are_upper_case() {
        assert_eq!(DevState::Moving.to_string(), "MOVING");
        assert_eq!("alarm".parse::<DevState>().unwrap(), DevState::Alarm);
    }

    #[test]
    fn quality_wire_names() {
        assert_eq!(AttrQuality::Invalid.to_string(), "ATTR_INVALID");
        assert!(AttrQuality::Warning.is_alarming());
        assert!(!AttrQuality::Changing.is_alarming());
    }
}
