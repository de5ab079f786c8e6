// ── Property wire codec ──
//
// Batched property calls travel as flat string arrays:
//
//   query:  [object, name_1, name_2, ...]
//   block:  [object, count, (name, value_count, value_1..value_n)*]
//
// A property with zero values is still followed by one placeholder entry,
// which decoders skip. Attribute and pipe properties nest one more level
// (`[object, n_attr, (attr, n_props, <prop>*)*]`) and come in two layouts:
// the single-value layout of old servers and the multi-value one.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Filler emitted after a zero value count.
pub const EMPTY_PLACEHOLDER: &str = " ";

/// A named, multi-valued string property.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DbDatum {
    pub name: String,
    pub values: Vec<String>,
}

impl DbDatum {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
        }
    }

    pub fn with_values<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First value, if any.
    pub fn first(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }
}

/// Properties of one attribute (or pipe) of an object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttributeProperties {
    pub attribute: String,
    pub properties: Vec<DbDatum>,
}

impl AttributeProperties {
    pub fn new(attribute: impl Into<String>, properties: Vec<DbDatum>) -> Self {
        Self {
            attribute: attribute.into(),
            properties,
        }
    }
}

/// Nested attribute-property layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttrWireFormat {
    /// `(prop, value)` pairs; one value per property.
    SingleValue,
    /// `(prop, value_count, values*)` blocks.
    MultiValue,
}

// ── Encoding ────────────────────────────────────────────────────────

/// `[object, name_1, name_2, ...]`
pub fn encode_query<S: AsRef<str>>(object: &str, names: &[S]) -> Vec<String> {
    let mut out = Vec::with_capacity(names.len() + 1);
    out.push(object.to_owned());
    out.extend(names.iter().map(|n| n.as_ref().to_owned()));
    out
}

/// `[object, count, (name, value_count, values*)*]`
pub fn encode_properties(object: &str, data: &[DbDatum]) -> Vec<String> {
    let mut out = vec![object.to_owned(), data.len().to_string()];
    for datum in data {
        push_datum(&mut out, datum);
    }
    out
}

fn push_datum(out: &mut Vec<String>, datum: &DbDatum) {
    out.push(datum.name.clone());
    out.push(datum.values.len().to_string());
    if datum.values.is_empty() {
        out.push(EMPTY_PLACEHOLDER.to_owned());
    } else {
        out.extend(datum.values.iter().cloned());
    }
}

/// `[object, n_attr, (attr, n_props, <prop>*)*]` in the requested layout.
pub fn encode_attribute_properties(
    object: &str,
    attrs: &[AttributeProperties],
    format: AttrWireFormat,
) -> Vec<String> {
    let mut out = vec![object.to_owned(), attrs.len().to_string()];
    for attr in attrs {
        out.push(attr.attribute.clone());
        out.push(attr.properties.len().to_string());
        for prop in &attr.properties {
            match format {
                AttrWireFormat::MultiValue => push_datum(&mut out, prop),
                AttrWireFormat::SingleValue => {
                    out.push(prop.name.clone());
                    out.push(prop.first().unwrap_or_default().to_owned());
                }
            }
        }
    }
    out
}

// ── Decoding ────────────────────────────────────────────────────────

/// Sequential reader over a flat reply that reports truncation as a
/// decode error naming the operation.
pub struct WireReader<'a> {
    items: &'a [String],
    pos: usize,
    operation: &'a str,
}

impl<'a> WireReader<'a> {
    pub fn new(operation: &'a str, items: &'a [String]) -> Self {
        Self {
            items,
            pos: 0,
            operation,
        }
    }

    pub fn next_str(&mut self) -> Result<&'a str, Error> {
        let item = self.items.get(self.pos).ok_or_else(|| {
            Error::decode(
                self.operation,
                format!("reply truncated at entry {}", self.pos),
            )
        })?;
        self.pos += 1;
        Ok(item.as_str())
    }

    pub fn next_count(&mut self) -> Result<usize, Error> {
        let raw = self.next_str()?;
        raw.trim().parse().map_err(|_| {
            Error::decode(
                self.operation,
                format!("expected a count at entry {}, got '{raw}'", self.pos - 1),
            )
        })
    }

    pub fn skip(&mut self) -> Result<(), Error> {
        self.next_str().map(|_| ())
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.items.len()
    }

    pub fn remaining(&self) -> usize {
        self.items.len().saturating_sub(self.pos)
    }

    /// One `(name, value_count, values*)` block, skipping the placeholder
    /// that follows an empty one.
    pub fn next_datum(&mut self) -> Result<DbDatum, Error> {
        let name = self.next_str()?.to_owned();
        let count = self.next_count()?;
        if count == 0 {
            self.skip()?;
            return Ok(DbDatum::new(name));
        }
        if count > self.remaining() {
            return Err(Error::decode(
                self.operation,
                format!("property '{name}' announces {count} values but only {} remain", self.remaining()),
            ));
        }
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.next_str()?.to_owned());
        }
        Ok(DbDatum { name, values })
    }
}

/// Decoded `[object, count, <datum>*]` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyBlock {
    pub object: String,
    pub data: Vec<DbDatum>,
}

pub fn decode_properties(operation: &str, wire: &[String]) -> Result<PropertyBlock, Error> {
    let mut reader = WireReader::new(operation, wire);
    let object = reader.next_str()?.to_owned();
    let count = reader.next_count()?;
    let mut data = Vec::with_capacity(count.min(wire.len()));
    for _ in 0..count {
        data.push(reader.next_datum()?);
    }
    Ok(PropertyBlock { object, data })
}

/// Decoded `[object, n_attr, (attr, n_props, <prop>*)*]` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeBlock {
    pub object: String,
    pub attributes: Vec<AttributeProperties>,
}

pub fn decode_attribute_properties(
    operation: &str,
    wire: &[String],
    format: AttrWireFormat,
) -> Result<AttributeBlock, Error> {
    let mut reader = WireReader::new(operation, wire);
    let object = reader.next_str()?.to_owned();
    let n_attr = reader.next_count()?;
    let mut attributes = Vec::with_capacity(n_attr.min(wire.len()));
    for _ in 0..n_attr {
        let attribute = reader.next_str()?.to_owned();
        let n_props = reader.next_count()?;
        let mut properties = Vec::with_capacity(n_props.min(wire.len()));
        for _ in 0..n_props {
            let datum = match format {
                AttrWireFormat::MultiValue => reader.next_datum()?,
                AttrWireFormat::SingleValue => {
                    let name = reader.next_str()?;
                    let value = reader.next_str()?;
                    DbDatum::with_values(name, [value])
                }
            };
            properties.push(datum);
        }
        attributes.push(AttributeProperties {
            attribute,
            properties,
        });
    }
    Ok(AttributeBlock { object, attributes })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn wire(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn zero_value_property_does_not_misalign_the_batch() {
        let reply = wire(&["a/b/c", "3", "empty", "0", " ", "speed", "2", "1", "2", "mode", "1", "auto"]);
        let block = decode_properties("DbGetDeviceProperty", &reply).unwrap();
        assert_eq!(block.object, "a/b/c");
        assert_eq!(
            block.data,
            vec![
                DbDatum::new("empty"),
                DbDatum::with_values("speed", ["1", "2"]),
                DbDatum::with_values("mode", ["auto"]),
            ]
        );
    }

    #[test]
    fn encoder_emits_placeholder_for_empty_values() {
        let out = encode_properties("dev", &[DbDatum::new("p"), DbDatum::with_values("q", ["v"])]);
        assert_eq!(out, wire(&["dev", "2", "p", "0", EMPTY_PLACEHOLDER, "q", "1", "v"]));
    }

    #[test]
    fn truncated_reply_is_a_decode_error() {
        let reply = wire(&["dev", "1", "p", "3", "only-one"]);
        let err = decode_properties("DbGetDeviceProperty", &reply).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn single_value_attribute_layout() {
        let reply = wire(&["dev", "1", "temp", "2", "unit", "C", "format", "%6.2f"]);
        let block =
            decode_attribute_properties("DbGetDeviceAttributeProperty", &reply, AttrWireFormat::SingleValue)
                .unwrap();
        assert_eq!(block.attributes[0].attribute, "temp");
        assert_eq!(block.attributes[0].properties[1], DbDatum::with_values("format", ["%6.2f"]));
    }

    #[test]
    fn multi_value_attribute_layout_with_empty_property() {
        let attrs = vec![AttributeProperties::new(
            "temp",
            vec![DbDatum::new("label"), DbDatum::with_values("values", ["1", "2"])],
        )];
        let encoded = encode_attribute_properties("dev", &attrs, AttrWireFormat::MultiValue);
        let decoded =
            decode_attribute_properties("DbGetDeviceAttributeProperty2", &encoded, AttrWireFormat::MultiValue)
                .unwrap();
        assert_eq!(decoded.attributes, attrs);
    }
}
