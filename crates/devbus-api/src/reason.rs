// ── Reason codes ──
//
// Machine-matchable failure codes carried by every remote error. Clients
// branch on these, never on description text. The string forms are the
// ones existing servers put on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use strum::{EnumString, IntoStaticStr};

#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString, IntoStaticStr)]
pub enum Reason {
    // ── Configuration ────────────────────────────────────────────────
    #[strum(serialize = "API_TangoHostNotSet")]
    TangoHostNotSet,
    #[strum(serialize = "API_BadConfigurationProperty")]
    BadConfigurationProperty,
    #[strum(serialize = "API_DatabaseFileError")]
    DatabaseFileError,

    // ── Database ─────────────────────────────────────────────────────
    #[strum(serialize = "API_DatabaseAccess")]
    DatabaseAccess,
    #[strum(serialize = "API_IncoherentDbData")]
    IncoherentDbData,
    #[strum(serialize = "API_AliasNotDefined")]
    AliasNotDefined,
    #[strum(serialize = "DB_DeviceNotFoundInCache")]
    DeviceNotFoundInCache,
    #[strum(serialize = "DB_ClassNotFoundInCache")]
    ClassNotFoundInCache,
    #[strum(serialize = "DB_DeviceNotDefined")]
    DeviceNotDefined,
    #[strum(serialize = "DB_SQLError")]
    SqlError,

    // ── Transport ────────────────────────────────────────────────────
    #[strum(serialize = "API_CommunicationFailed")]
    CommunicationFailed,
    #[strum(serialize = "API_DeviceTimedOut")]
    DeviceTimedOut,
    #[strum(serialize = "API_DeviceNotExported")]
    DeviceNotExported,
    #[strum(serialize = "API_CantConnectToDevice")]
    CantConnectToDevice,

    // ── Device runtime ───────────────────────────────────────────────
    #[strum(serialize = "API_AttrNotFound")]
    AttrNotFound,
    #[strum(serialize = "API_AttrNotAllowed")]
    AttrNotAllowed,
    #[strum(serialize = "API_AttrNotWritable")]
    AttrNotWritable,
    #[strum(serialize = "API_AttrValueNotSet")]
    AttrValueNotSet,
    #[strum(serialize = "API_WAttrOutsideLimit")]
    WAttrOutsideLimit,
    #[strum(serialize = "API_IncompatibleAttrDataType")]
    IncompatibleAttrDataType,
    #[strum(serialize = "API_CommandNotFound")]
    CommandNotFound,
    #[strum(serialize = "API_CommandNotAllowed")]
    CommandNotAllowed,
    #[strum(serialize = "API_IncompatibleCmdArgumentType")]
    IncompatibleCmdArgumentType,
    #[strum(serialize = "API_ReadOnlyMode")]
    ReadOnlyMode,

    // ── Locking ──────────────────────────────────────────────────────
    #[strum(serialize = "API_DeviceLocked")]
    DeviceLocked,
    #[strum(serialize = "API_DeviceNotLocked")]
    DeviceNotLocked,
    #[strum(serialize = "API_DeviceUnlocked")]
    DeviceUnlocked,

    // ── Polling / threads ────────────────────────────────────────────
    #[strum(serialize = "API_CommandTimedOut")]
    CommandTimedOut,
    #[strum(serialize = "API_PollingThreadNotFound")]
    PollingThreadNotFound,
    #[strum(serialize = "API_PolledDeviceNotInPoolConf")]
    PolledDeviceNotInPoolConf,
    #[strum(serialize = "API_AlreadyPolled")]
    AlreadyPolled,
    #[strum(serialize = "API_PollObjNotFound")]
    PollObjNotFound,
    #[strum(serialize = "API_AttrNotPolled")]
    AttrNotPolled,
    #[strum(serialize = "API_CmdNotPolled")]
    CmdNotPolled,
    #[strum(serialize = "API_NoDataYet")]
    NoDataYet,
    #[strum(serialize = "API_BlackBoxEmpty")]
    BlackBoxEmpty,

    // ── Catch-all ────────────────────────────────────────────────────
    #[strum(serialize = "API_NotSupported")]
    NotSupported,
    #[strum(serialize = "API_InternalError")]
    InternalError,

    /// A code this build does not know about, kept verbatim.
    #[strum(default)]
    Other(String),
}

impl Reason {
    /// The wire string for this reason code.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Other(code) => code.as_str(),
            known => {
                let code: &'static str = known.into();
                code
            }
        }
    }

    /// Parse a wire reason code. Never fails: unknown codes become [`Reason::Other`].
    pub fn parse(code: &str) -> Self {
        Self::from_str(code).unwrap_or_else(|_| Self::Other(code.to_owned()))
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Reason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip_through_wire_strings() {
        assert_eq!(Reason::parse("API_DeviceLocked"), Reason::DeviceLocked);
        assert_eq!(Reason::DeviceNotFoundInCache.as_str(), "DB_DeviceNotFoundInCache");
        assert_eq!(Reason::CommandTimedOut.to_string(), "API_CommandTimedOut");
    }

    #[test]
    fn unknown_codes_are_preserved() {
        let reason = Reason::parse("API_SomethingNew");
        assert_eq!(reason, Reason::Other("API_SomethingNew".into()));
        assert_eq!(reason.as_str(), "API_SomethingNew");
    }
}
