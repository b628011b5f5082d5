//! Source-side record model: a dynamically discovered property bag where every
//! value carries its own type tag.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

static DECIMAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?[0-9]+(\.[0-9]+)?$").expect("decimal pattern compiles"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("not an exact decimal literal: {0:?}")]
pub struct InvalidDecimal(pub String);

/// Decimal value kept as its exact source text. Scale is significant, so
/// `1.240` and `1.24` are different values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExactDecimal(String);

impl ExactDecimal {
    pub fn parse(text: impl Into<String>) -> Result<Self, InvalidDecimal> {
        let text = text.into();
        if DECIMAL_RE.is_match(&text) {
            Ok(Self(text))
        } else {
            Err(InvalidDecimal(text))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ExactDecimal {
    type Error = InvalidDecimal;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ExactDecimal> for String {
    fn from(value: ExactDecimal) -> Self {
        value.0
    }
}

impl fmt::Display for ExactDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type tag recorded next to every mapped field so readers never have to guess
/// between 32/64-bit integers or single/double precision floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeTag {
    String,
    Int32,
    Int64,
    Double,
    Single,
    Decimal,
    Boolean,
    Binary,
    DateTime,
    Guid,
    Enum,
    /// A string column that held an encoded array or object.
    Json,
}

impl TypeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::String => "String",
            TypeTag::Int32 => "Int32",
            TypeTag::Int64 => "Int64",
            TypeTag::Double => "Double",
            TypeTag::Single => "Single",
            TypeTag::Decimal => "Decimal",
            TypeTag::Boolean => "Boolean",
            TypeTag::Binary => "Binary",
            TypeTag::DateTime => "DateTime",
            TypeTag::Guid => "Guid",
            TypeTag::Enum => "Enum",
            TypeTag::Json => "Json",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single property value as read from the table store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum PropertyValue {
    String(String),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Single(f32),
    Decimal(ExactDecimal),
    Boolean(bool),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
    DateTime(DateTime<FixedOffset>),
    Guid(Uuid),
    Enum(String),
}

impl PropertyValue {
    pub fn tag(&self) -> TypeTag {
        match self {
            PropertyValue::String(_) => TypeTag::String,
            PropertyValue::Int32(_) => TypeTag::Int32,
            PropertyValue::Int64(_) => TypeTag::Int64,
            PropertyValue::Double(_) => TypeTag::Double,
            PropertyValue::Single(_) => TypeTag::Single,
            PropertyValue::Decimal(_) => TypeTag::Decimal,
            PropertyValue::Boolean(_) => TypeTag::Boolean,
            PropertyValue::Binary(_) => TypeTag::Binary,
            PropertyValue::DateTime(_) => TypeTag::DateTime,
            PropertyValue::Guid(_) => TypeTag::Guid,
            PropertyValue::Enum(_) => TypeTag::Enum,
        }
    }

    /// Canonical text of a value usable as a business key, or `None` for types
    /// that never act as correlation keys.
    pub fn key_text(&self) -> Option<String> {
        match self {
            PropertyValue::String(value) => Some(value.clone()),
            PropertyValue::Guid(value) => Some(value.hyphenated().to_string()),
            PropertyValue::Int32(value) => Some(value.to_string()),
            PropertyValue::Int64(value) => Some(value.to_string()),
            _ => None,
        }
    }
}

/// Columns maintained by the table store itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetadata {
    pub partition_key: String,
    pub row_key: String,
    pub etag: String,
    pub timestamp: DateTime<Utc>,
}

/// One row of a saga table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    pub table: String,
    pub metadata: SystemMetadata,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl SourceRecord {
    pub fn new(
        table: impl Into<String>,
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            metadata: SystemMetadata {
                partition_key: partition_key.into(),
                row_key: row_key.into(),
                etag: String::new(),
                timestamp: Utc::now(),
            },
            properties: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Identity of the row inside its table.
    pub fn row_identity(&self) -> (String, String) {
        (
            self.metadata.partition_key.clone(),
            self.metadata.row_key.clone(),
        )
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_keeps_exact_text_and_rejects_garbage() {
        assert_eq!(ExactDecimal::parse("1.240").unwrap().as_str(), "1.240");
        assert_eq!(ExactDecimal::parse("-17").unwrap().as_str(), "-17");
        assert!(ExactDecimal::parse("1e5").is_err());
        assert!(ExactDecimal::parse("1.").is_err());
        assert!(ExactDecimal::parse("NaN").is_err());
    }

    #[test]
    fn key_text_covers_key_capable_types_only() {
        let guid = Uuid::parse_str("6f9619ff-8b86-d011-b42d-00c04fc964ff").unwrap();
        assert_eq!(
            PropertyValue::Guid(guid).key_text().as_deref(),
            Some("6f9619ff-8b86-d011-b42d-00c04fc964ff")
        );
        assert_eq!(PropertyValue::Int64(-5).key_text().as_deref(), Some("-5"));
        assert_eq!(PropertyValue::Boolean(true).key_text(), None);
        assert_eq!(PropertyValue::Binary(vec![1]).key_text(), None);
    }

    #[test]
    fn stored_property_json_is_tagged() {
        let value = PropertyValue::Binary(b"Hello World".to_vec());
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["type"], "Binary");
        assert_eq!(json["value"], "SGVsbG8gV29ybGQ=");
        let back: PropertyValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn single_precision_survives_storage_encoding() {
        let value = PropertyValue::Single(1.24);
        let text = serde_json::to_string(&value).unwrap();
        let back: PropertyValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);
    }
}
