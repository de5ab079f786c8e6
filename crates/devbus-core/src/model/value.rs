// ── Attribute and command values ──
//
// Scalars, spectra and images of bool/long/double/string, plus the device
// state type. Images are stored flattened; dimensions are not tracked.

use serde::{Deserialize, Serialize};
use strum::Display;

use devbus_api::Reason;

use super::state::DevState;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum DataType {
    Void,
    Bool,
    Long,
    Double,
    String,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
pub enum AttrDataFormat {
    #[default]
    Scalar,
    Spectrum,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
pub enum AttrWriteType {
    #[default]
    Read,
    ReadWrite,
    ReadWithWrite,
    Write,
}

impl AttrWriteType {
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }

    /// Whether the value comes from hardware on read.
    pub fn is_readable(self) -> bool {
        !matches!(self, Self::Write)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Void,
    Bool(bool),
    Long(i64),
    Double(f64),
    Str(String),
    State(DevState),
    BoolArray(Vec<bool>),
    LongArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    StrArray(Vec<String>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Void => DataType::Void,
            Self::Bool(_) | Self::BoolArray(_) => DataType::Bool,
            Self::Long(_) | Self::LongArray(_) => DataType::Long,
            Self::Double(_) | Self::DoubleArray(_) => DataType::Double,
            Self::Str(_) | Self::StrArray(_) => DataType::String,
            Self::State(_) => DataType::State,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            Self::BoolArray(_) | Self::LongArray(_) | Self::DoubleArray(_) | Self::StrArray(_)
        )
    }

    /// Whether this value can be stored in an attribute of the given shape.
    pub fn fits(&self, data_type: DataType, format: AttrDataFormat) -> bool {
        self.data_type() == data_type && (self.is_array() == (format != AttrDataFormat::Scalar))
    }

    /// Numeric view used by alarm and limit checks. Non-numeric values
    /// yield nothing.
    #[allow(clippy::cast_precision_loss)]
    pub fn numeric(&self) -> Vec<f64> {
        match self {
            Self::Long(v) => vec![*v as f64],
            Self::Double(v) => vec![*v],
            Self::LongArray(v) => v.iter().map(|x| *x as f64).collect(),
            Self::DoubleArray(v) => v.clone(),
            _ => Vec::new(),
        }
    }

    /// String form used when a value is persisted as a property.
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            Self::Void => Vec::new(),
            Self::Bool(v) => vec![v.to_string()],
            Self::Long(v) => vec![v.to_string()],
            Self::Double(v) => vec![v.to_string()],
            Self::Str(v) => vec![v.clone()],
            Self::State(v) => vec![v.to_string()],
            Self::BoolArray(v) => v.iter().map(ToString::to_string).collect(),
            Self::LongArray(v) => v.iter().map(ToString::to_string).collect(),
            Self::DoubleArray(v) => v.iter().map(ToString::to_string).collect(),
            Self::StrArray(v) => v.clone(),
        }
    }

    /// Inverse of [`to_strings`](Self::to_strings).
    pub fn from_strings(
        data_type: DataType,
        format: AttrDataFormat,
        values: &[String],
    ) -> Result<Self, CoreError> {
        let scalar = format == AttrDataFormat::Scalar;
        if scalar && values.len() != 1 {
            return Err(bad_strings(data_type, values));
        }
        let parsed = match (data_type, scalar) {
            (DataType::Void, _) => Self::Void,
            (DataType::Bool, true) => Self::Bool(parse_one(data_type, &values[0])?),
            (DataType::Long, true) => Self::Long(parse_one(data_type, &values[0])?),
            (DataType::Double, true) => Self::Double(parse_one(data_type, &values[0])?),
            (DataType::String, true) => Self::Str(values[0].clone()),
            (DataType::State, true) => Self::State(parse_one(data_type, &values[0])?),
            (DataType::State, false) => return Err(bad_strings(data_type, values)),
            (DataType::Bool, false) => Self::BoolArray(parse_all(data_type, values)?),
            (DataType::Long, false) => Self::LongArray(parse_all(data_type, values)?),
            (DataType::Double, false) => Self::DoubleArray(parse_all(data_type, values)?),
            (DataType::String, false) => Self::StrArray(values.to_vec()),
        };
        Ok(parsed)
    }
}

fn parse_one<T: std::str::FromStr>(data_type: DataType, raw: &str) -> Result<T, CoreError> {
    raw.trim()
        .parse()
        .map_err(|_| bad_strings(data_type, &[raw.to_owned()]))
}

fn parse_all<T: std::str::FromStr>(data_type: DataType, raw: &[String]) -> Result<Vec<T>, CoreError> {
    raw.iter().map(|r| parse_one(data_type, r)).collect()
}

fn bad_strings(data_type: DataType, values: &[String]) -> CoreError {
    CoreError::InvalidValue {
        reason: Reason::IncompatibleAttrDataType,
        message: format!("Cannot convert {values:?} to a {data_type} value"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn shape_check() {
        assert!(Value::Double(1.0).fits(DataType::Double, AttrDataFormat::Scalar));
        assert!(!Value::Double(1.0).fits(DataType::Double, AttrDataFormat::Spectrum));
        assert!(Value::LongArray(vec![1]).fits(DataType::Long, AttrDataFormat::Image));
        assert!(!Value::Long(1).fits(DataType::Double, AttrDataFormat::Scalar));
    }

    #[test]
    fn persisted_form_parses_back() {
        let v = Value::DoubleArray(vec![1.5, -2.0]);
        let back =
            Value::from_strings(DataType::Double, AttrDataFormat::Spectrum, &v.to_strings()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = Value::from_strings(DataType::Long, AttrDataFormat::Scalar, &["x".into()]).unwrap_err();
        assert_eq!(err.reason(), Reason::IncompatibleAttrDataType);
        assert!(Value::from_strings(DataType::Long, AttrDataFormat::Scalar, &[]).is_err());
    }
}
