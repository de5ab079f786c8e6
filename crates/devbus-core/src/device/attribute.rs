// ── Attributes ──
//
// An `AttrDescriptor` is the class-wide definition, owned by the class
// arena and shared by every device that has the attribute. Per-device
// runtime data (last value, quality, limits overridden from the database)
// lives in the device's own table.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use devbus_api::Reason;
use serde::Serialize;

use super::Device;
use crate::error::CoreError;
use crate::model::{AttrDataFormat, AttrQuality, AttrWriteType, DataType, Value};

/// Property under which a memorized attribute's set-point is stored.
pub const MEMORIZED_VALUE_PROP: &str = "__value";

/// Attribute properties that override [`AttrLimits`] at init time.
pub const LIMIT_PROPERTIES: [&str; 6] = [
    "min_alarm",
    "max_alarm",
    "min_warning",
    "max_warning",
    "min_value",
    "max_value",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrRequest {
    Read,
    Write,
}

/// User-supplied attribute behaviour.
pub trait AttributeBehavior: Send + Sync {
    fn read(&self, device: &Device, attr: &mut AttrSlot) -> Result<(), CoreError>;

    fn write(&self, _device: &Device, attr: &AttrSlot) -> Result<(), CoreError> {
        Err(CoreError::AttrNotWritable {
            message: format!("Attribute {} has no write method", attr.name()),
        })
    }

    fn is_allowed(&self, _device: &Device, _request: AttrRequest) -> bool {
        true
    }
}

/// Reads back the last written set-point. Default behaviour for
/// attributes built without one.
#[derive(Debug, Default)]
pub struct StoredValue;

impl AttributeBehavior for StoredValue {
    fn read(&self, _device: &Device, attr: &mut AttrSlot) -> Result<(), CoreError> {
        if let Some(value) = attr.write_value().cloned() {
            attr.set_value(value)?;
        }
        Ok(())
    }

    fn write(&self, _device: &Device, _attr: &AttrSlot) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Read-only behaviour from a closure.
pub struct ReadFn<F>(F);

/// Wrap a closure as a shared read-only attribute behaviour.
pub fn read_fn<F>(f: F) -> Arc<dyn AttributeBehavior>
where
    F: Fn(&Device, &mut AttrSlot) -> Result<(), CoreError> + Send + Sync + 'static,
{
    Arc::new(ReadFn(f))
}

impl<F> AttributeBehavior for ReadFn<F>
where
    F: Fn(&Device, &mut AttrSlot) -> Result<(), CoreError> + Send + Sync,
{
    fn read(&self, device: &Device, attr: &mut AttrSlot) -> Result<(), CoreError> {
        (self.0)(device, attr)
    }
}

// ── Value slot ──────────────────────────────────────────────────────

/// The value container a behaviour reads into or writes from.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrSlot {
    name: String,
    data_type: DataType,
    format: AttrDataFormat,
    value: Option<Value>,
    quality: AttrQuality,
    write_value: Option<Value>,
    date: Option<DateTime<Utc>>,
}

impl AttrSlot {
    pub(crate) fn new(descriptor: &AttrDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            data_type: descriptor.data_type,
            format: descriptor.format,
            value: None,
            quality: AttrQuality::Valid,
            write_value: None,
            date: None,
        }
    }

    /// A clean slot for a new read, carrying the current set-point.
    pub(crate) fn fresh(&self) -> Self {
        Self {
            value: None,
            quality: AttrQuality::Valid,
            date: None,
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn format(&self) -> AttrDataFormat {
        self.format
    }

    pub fn set_value(&mut self, value: Value) -> Result<(), CoreError> {
        self.check_shape(&value)?;
        self.value = Some(value);
        self.date = Some(Utc::now());
        Ok(())
    }

    pub fn set_value_with_quality(&mut self, value: Value, quality: AttrQuality) -> Result<(), CoreError> {
        self.set_value(value)?;
        self.quality = quality;
        Ok(())
    }

    pub fn set_quality(&mut self, quality: AttrQuality) {
        self.quality = quality;
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn quality(&self) -> AttrQuality {
        self.quality
    }

    pub fn write_value(&self) -> Option<&Value> {
        self.write_value.as_ref()
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date
    }

    pub(crate) fn set_write_value(&mut self, value: Option<Value>) {
        self.write_value = value;
    }

    pub(crate) fn invalidate(&mut self) {
        self.value = None;
        self.quality = AttrQuality::Invalid;
        self.date = Some(Utc::now());
    }

    pub(crate) fn check_shape(&self, value: &Value) -> Result<(), CoreError> {
        if value.fits(self.data_type, self.format) {
            Ok(())
        } else {
            Err(CoreError::InvalidValue {
                reason: Reason::IncompatibleAttrDataType,
                message: format!(
                    "Incompatible data type for attribute {}: expected {} {}, got {:?}",
                    self.name, self.format, self.data_type, value
                ),
            })
        }
    }

    pub(crate) fn to_attribute_value(&self) -> AttributeValue {
        AttributeValue {
            name: self.name.clone(),
            value: self.value.clone(),
            write_value: self.write_value.clone(),
            quality: self.quality,
            time: self.date.unwrap_or_else(Utc::now),
        }
    }
}

/// What a read returns to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeValue {
    pub name: String,
    pub value: Option<Value>,
    pub write_value: Option<Value>,
    pub quality: AttrQuality,
    pub time: DateTime<Utc>,
}

// ── Limits ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmKind {
    MinAlarm,
    MaxAlarm,
    MinWarning,
    MaxWarning,
}

impl AlarmKind {
    pub fn quality(self) -> AttrQuality {
        match self {
            Self::MinAlarm | Self::MaxAlarm => AttrQuality::Alarm,
            Self::MinWarning | Self::MaxWarning => AttrQuality::Warning,
        }
    }

    /// Status line, e.g. `Alarm : Value too low for temp`.
    pub fn describe(self, attr: &str) -> String {
        match self {
            Self::MinAlarm => format!("Alarm : Value too low for {attr}"),
            Self::MaxAlarm => format!("Alarm : Value too high for {attr}"),
            Self::MinWarning => format!("Warning : Value too low for {attr}"),
            Self::MaxWarning => format!("Warning : Value too high for {attr}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AttrLimits {
    pub min_alarm: Option<f64>,
    pub max_alarm: Option<f64>,
    pub min_warning: Option<f64>,
    pub max_warning: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl AttrLimits {
    /// Whether any alarm or warning threshold is configured.
    pub fn has_alarm(&self) -> bool {
        self.min_alarm.is_some()
            || self.max_alarm.is_some()
            || self.min_warning.is_some()
            || self.max_warning.is_some()
    }

    /// Alarm thresholds win over warning thresholds.
    pub fn evaluate(&self, value: &Value) -> Option<AlarmKind> {
        let numbers = value.numeric();
        let below = |limit: Option<f64>| limit.is_some_and(|l| numbers.iter().any(|v| *v < l));
        let above = |limit: Option<f64>| limit.is_some_and(|l| numbers.iter().any(|v| *v > l));

        if below(self.min_alarm) {
            Some(AlarmKind::MinAlarm)
        } else if above(self.max_alarm) {
            Some(AlarmKind::MaxAlarm)
        } else if below(self.min_warning) {
            Some(AlarmKind::MinWarning)
        } else if above(self.max_warning) {
            Some(AlarmKind::MaxWarning)
        } else {
            None
        }
    }

    /// Reject a set-point outside `[min_value, max_value]`.
    pub fn check_write(&self, attr: &str, value: &Value) -> Result<(), CoreError> {
        let out = value.numeric().into_iter().find(|v| {
            self.min_value.is_some_and(|min| *v < min) || self.max_value.is_some_and(|max| *v > max)
        });
        match out {
            Some(v) => Err(CoreError::InvalidValue {
                reason: Reason::WAttrOutsideLimit,
                message: format!("Set value {v} for attribute {attr} is outside its limits"),
            }),
            None => Ok(()),
        }
    }

    /// Override from database attribute properties. Returns the name of
    /// the first property that does not parse or contradicts its pair.
    pub(crate) fn apply(&mut self, props: &[devbus_api::DbDatum]) -> Result<(), String> {
        for datum in props.iter().filter(|d| !d.is_empty()) {
            let name = datum.name.to_ascii_lowercase();
            let slot = match name.as_str() {
                "min_alarm" => &mut self.min_alarm,
                "max_alarm" => &mut self.max_alarm,
                "min_warning" => &mut self.min_warning,
                "max_warning" => &mut self.max_warning,
                "min_value" => &mut self.min_value,
                "max_value" => &mut self.max_value,
                _ => continue,
            };
            let raw = datum.first().unwrap_or_default().trim();
            if raw.eq_ignore_ascii_case("not specified") {
                *slot = None;
                continue;
            }
            *slot = Some(raw.parse().map_err(|_| name.clone())?);
        }

        let ordered = |lo: Option<f64>, hi: Option<f64>, what: &str| match (lo, hi) {
            (Some(lo), Some(hi)) if lo >= hi => Err(what.to_owned()),
            _ => Ok(()),
        };
        ordered(self.min_alarm, self.max_alarm, "min_alarm")?;
        ordered(self.min_warning, self.max_warning, "min_warning")?;
        ordered(self.min_value, self.max_value, "min_value")
    }
}

// ── Descriptor ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AttrDescriptor {
    pub name: String,
    pub data_type: DataType,
    pub format: AttrDataFormat,
    pub write_type: AttrWriteType,
    pub limits: AttrLimits,
    pub memorized: bool,
    /// Apply the memorized set-point to hardware during init.
    pub write_memorized_at_init: bool,
    /// Polling period set at definition time.
    pub polling_period_ms: Option<u64>,
    /// Full name (`domain/family/member/attr`) of the root attribute.
    pub forwarded: Option<String>,
    pub behavior: Arc<dyn AttributeBehavior>,
}

impl fmt::Debug for AttrDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttrDescriptor")
            .field("name", &self.name)
            .field("data_type", &self.data_type)
            .field("format", &self.format)
            .field("write_type", &self.write_type)
            .field("memorized", &self.memorized)
            .field("forwarded", &self.forwarded)
            .finish_non_exhaustive()
    }
}

impl AttrDescriptor {
    pub fn builder(name: impl Into<String>, data_type: DataType) -> AttrDescriptorBuilder {
        AttrDescriptorBuilder {
            desc: Self {
                name: name.into(),
                data_type,
                format: AttrDataFormat::Scalar,
                write_type: AttrWriteType::Read,
                limits: AttrLimits::default(),
                memorized: false,
                write_memorized_at_init: true,
                polling_period_ms: None,
                forwarded: None,
                behavior: Arc::new(StoredValue),
            },
        }
    }

    /// Same shape: data type, format and write type.
    pub fn same_definition(&self, other: &Self) -> bool {
        self.data_type == other.data_type
            && self.format == other.format
            && self.write_type == other.write_type
    }

    /// Device part of the forwarded root attribute name.
    pub fn root_device(&self) -> Option<&str> {
        self.forwarded
            .as_deref()
            .and_then(|full| full.rsplit_once('/'))
            .map(|(device, _)| device)
    }
}

pub struct AttrDescriptorBuilder {
    desc: AttrDescriptor,
}

impl AttrDescriptorBuilder {
    #[must_use]
    pub fn format(mut self, format: AttrDataFormat) -> Self {
        self.desc.format = format;
        self
    }

    #[must_use]
    pub fn write_type(mut self, write_type: AttrWriteType) -> Self {
        self.desc.write_type = write_type;
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: AttrLimits) -> Self {
        self.desc.limits = limits;
        self
    }

    #[must_use]
    pub fn alarm_range(mut self, min: f64, max: f64) -> Self {
        self.desc.limits.min_alarm = Some(min);
        self.desc.limits.max_alarm = Some(max);
        self
    }

    #[must_use]
    pub fn warning_range(mut self, min: f64, max: f64) -> Self {
        self.desc.limits.min_warning = Some(min);
        self.desc.limits.max_warning = Some(max);
        self
    }

    #[must_use]
    pub fn memorized(mut self, write_at_init: bool) -> Self {
        self.desc.memorized = true;
        self.desc.write_memorized_at_init = write_at_init;
        self
    }

    #[must_use]
    pub fn polling_period_ms(mut self, period: u64) -> Self {
        self.desc.polling_period_ms = Some(period);
        self
    }

    #[must_use]
    pub fn forwarded(mut self, root: impl Into<String>) -> Self {
        self.desc.forwarded = Some(root.into());
        self
    }

    #[must_use]
    pub fn behavior(mut self, behavior: Arc<dyn AttributeBehavior>) -> Self {
        self.desc.behavior = behavior;
        self
    }

    pub fn build(self) -> AttrDescriptor {
        self.desc
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use devbus_api::DbDatum;

    use super::*;

    #[test]
    fn alarm_beats_warning() {
        let limits = AttrLimits {
            min_alarm: Some(0.0),
            max_alarm: Some(100.0),
            max_warning: Some(80.0),
            ..AttrLimits::default()
        };
        assert_eq!(limits.evaluate(&Value::Double(50.0)), None);
        assert_eq!(limits.evaluate(&Value::Double(90.0)), Some(AlarmKind::MaxWarning));
        assert_eq!(limits.evaluate(&Value::Double(120.0)), Some(AlarmKind::MaxAlarm));
        assert_eq!(limits.evaluate(&Value::LongArray(vec![5, -1])), Some(AlarmKind::MinAlarm));
        assert_eq!(limits.evaluate(&Value::Str("x".into())), None);
    }

    #[test]
    fn write_limits() {
        let limits = AttrLimits {
            min_value: Some(0.0),
            max_value: Some(10.0),
            ..AttrLimits::default()
        };
        assert!(limits.check_write("speed", &Value::Long(5)).is_ok());
        let err = limits.check_write("speed", &Value::Long(11)).unwrap_err();
        assert_eq!(err.reason(), Reason::WAttrOutsideLimit);
    }

    #[test]
    fn database_overrides() {
        let mut limits = AttrLimits::default();
        limits
            .apply(&[
                DbDatum::with_values("Max_Alarm", ["40"]),
                DbDatum::with_values("unit", ["degC"]),
            ])
            .unwrap();
        assert_eq!(limits.max_alarm, Some(40.0));
        assert!(limits.has_alarm());

        assert_eq!(
            limits.apply(&[DbDatum::with_values("min_alarm", ["cold"])]),
            Err("min_alarm".to_owned())
        );
        assert_eq!(
            limits.apply(&[DbDatum::with_values("min_alarm", ["50"])]),
            Err("min_alarm".to_owned())
        );
    }

    #[test]
    fn slot_rejects_wrong_shape() {
        let desc = AttrDescriptor::builder("temp", DataType::Double).build();
        let mut slot = AttrSlot::new(&desc);
        assert!(slot.set_value(Value::Double(1.0)).is_ok());
        let err = slot.set_value(Value::Long(1)).unwrap_err();
        assert_eq!(err.reason(), Reason::IncompatibleAttrDataType);
    }

    #[test]
    fn definition_and_root() {
        let a = AttrDescriptor::builder("x", DataType::Long).build();
        let b = AttrDescriptor::builder("x", DataType::Long)
            .write_type(AttrWriteType::ReadWrite)
            .build();
        assert!(a.same_definition(&a.clone()));
        assert!(!a.same_definition(&b));

        let fwd = AttrDescriptor::builder("f", DataType::Double)
            .forwarded("sys/motor/1/position")
            .build();
        assert_eq!(fwd.root_device(), Some("sys/motor/1"));
    }
}
