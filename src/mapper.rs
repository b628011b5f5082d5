//! Field-by-field conversion of table rows into target documents.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Number, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::document::TargetDocument;
use crate::record::{ExactDecimal, PropertyValue, SourceRecord, TypeTag};
use crate::time::{format_full_precision, parse_full_precision};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("field {field}: {value} has no JSON representation")]
    NonFinite { field: String, value: String },
    #[error("field {field}: ordinal {ordinal} is not defined for this enum")]
    UnknownEnumOrdinal { field: String, ordinal: i64 },
    #[error("field {field}: {name:?} is not a member of this enum")]
    UnknownEnumName { field: String, name: String },
    #[error("field {field}: {tag} values cannot carry an enum")]
    EnumSourceType { field: String, tag: TypeTag },
    #[error("field {field}: stored {tag} value does not decode: {reason}")]
    Decode {
        field: String,
        tag: TypeTag,
        reason: String,
    },
    #[error("field {field}: value changed after mapping")]
    RoundTrip { field: String },
}

impl MappingError {
    pub fn field(&self) -> &str {
        match self {
            MappingError::NonFinite { field, .. }
            | MappingError::UnknownEnumOrdinal { field, .. }
            | MappingError::UnknownEnumName { field, .. }
            | MappingError::EnumSourceType { field, .. }
            | MappingError::Decode { field, .. }
            | MappingError::RoundTrip { field } => field,
        }
    }
}

/// What the exporter does with a record that has field-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorPolicy {
    /// Drop the offending field, keep the record, report a warning.
    #[default]
    SkipField,
    /// Fail the whole record.
    FailRecord,
}

/// Symbolic names of an enum, indexed by ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnumDefinition {
    names: Vec<String>,
}

impl EnumDefinition {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name_of(&self, ordinal: i64) -> Option<&str> {
        usize::try_from(ordinal)
            .ok()
            .and_then(|idx| self.names.get(idx))
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|candidate| candidate == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MappingOptions {
    /// Bookkeeping columns that are not business state.
    pub excluded_properties: BTreeSet<String>,
    pub enum_definitions: BTreeMap<String, EnumDefinition>,
    pub field_error_policy: FieldErrorPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedDocument {
    pub document: TargetDocument,
    pub field_errors: Vec<MappingError>,
}

#[derive(Debug, Clone, Default)]
pub struct TypeMapper {
    options: MappingOptions,
}

impl TypeMapper {
    pub fn new(options: MappingOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MappingOptions {
        &self.options
    }

    /// Maps every business field of `record`. Fields that cannot be represented
    /// are left out of the document and returned as `field_errors`.
    pub fn map(&self, type_name: &str, id: &str, record: &SourceRecord) -> MappedDocument {
        let mut data = Map::new();
        let mut types = BTreeMap::new();
        let mut field_errors = Vec::new();

        for (name, value) in &record.properties {
            if self.options.excluded_properties.contains(name) {
                continue;
            }
            match self.map_value(name, value) {
                Ok((json, tag)) => {
                    data.insert(name.clone(), json);
                    types.insert(name.clone(), tag);
                }
                Err(err) => field_errors.push(err),
            }
        }

        MappedDocument {
            document: TargetDocument {
                id: id.to_string(),
                partition_key: id.to_string(),
                type_name: type_name.to_string(),
                data,
                types,
            },
            field_errors,
        }
    }

    /// Decodes every mapped scalar back out of `document` and compares it with
    /// the source value. Composite strings are compared by their exact decoded
    /// content.
    pub fn verify(&self, record: &SourceRecord, document: &TargetDocument) -> Vec<MappingError> {
        let mut mismatches = Vec::new();
        for (name, tag) in &document.types {
            let Some(original) = record.properties.get(name) else {
                mismatches.push(MappingError::RoundTrip {
                    field: name.clone(),
                });
                continue;
            };
            let matches = match (tag, document.decode_field(name)) {
                (TypeTag::Json, Ok(PropertyValue::String(text))) => match original {
                    PropertyValue::String(source) => match decode_composite(source) {
                        Some(decoded) => {
                            document.data.get(name) == Some(&decoded)
                                && decode_composite(&text) == Some(decoded)
                        }
                        None => false,
                    },
                    _ => false,
                },
                (TypeTag::Enum, Ok(PropertyValue::Enum(name_text))) => match original {
                    PropertyValue::Enum(source) | PropertyValue::String(source) => {
                        *source == name_text
                    }
                    PropertyValue::Int32(ordinal) => {
                        self.enum_name(name, i64::from(*ordinal)) == Some(name_text.as_str())
                    }
                    PropertyValue::Int64(ordinal) => {
                        self.enum_name(name, *ordinal) == Some(name_text.as_str())
                    }
                    _ => false,
                },
                (_, Ok(decoded)) => same_value(&decoded, original),
                (_, Err(err)) => {
                    mismatches.push(err);
                    continue;
                }
            };
            if !matches {
                mismatches.push(MappingError::RoundTrip {
                    field: name.clone(),
                });
            }
        }
        mismatches
    }

    fn enum_name(&self, field: &str, ordinal: i64) -> Option<&str> {
        self.options
            .enum_definitions
            .get(field)
            .and_then(|def| def.name_of(ordinal))
    }

    fn map_value(&self, field: &str, value: &PropertyValue) -> Result<(Value, TypeTag), MappingError> {
        if let Some(definition) = self.options.enum_definitions.get(field) {
            return map_enum(field, definition, value);
        }

        let mapped = match value {
            PropertyValue::String(text) => match decode_composite(text) {
                Some(composite) => (composite, TypeTag::Json),
                None => (Value::String(text.clone()), TypeTag::String),
            },
            PropertyValue::Int32(v) => (Value::from(*v), TypeTag::Int32),
            PropertyValue::Int64(v) => (Value::from(*v), TypeTag::Int64),
            PropertyValue::Double(v) => {
                let number = Number::from_f64(*v).ok_or_else(|| MappingError::NonFinite {
                    field: field.to_string(),
                    value: v.to_string(),
                })?;
                (Value::Number(number), TypeTag::Double)
            }
            PropertyValue::Single(v) => (Value::Number(single_number(field, *v)?), TypeTag::Single),
            PropertyValue::Decimal(v) => (Value::String(v.as_str().to_string()), TypeTag::Decimal),
            PropertyValue::Boolean(v) => (Value::Bool(*v), TypeTag::Boolean),
            PropertyValue::Binary(bytes) => (Value::String(STANDARD.encode(bytes)), TypeTag::Binary),
            PropertyValue::DateTime(v) => {
                (Value::String(format_full_precision(v)), TypeTag::DateTime)
            }
            PropertyValue::Guid(v) => (Value::String(v.hyphenated().to_string()), TypeTag::Guid),
            PropertyValue::Enum(name) => (Value::String(name.clone()), TypeTag::Enum),
        };
        Ok(mapped)
    }
}

/// Decodes a string column that holds an encoded array or object.
///
/// Only a lossless parse into an array or object counts. Text that merely looks
/// bracketed stays a plain string, and so does a composite with a repeated
/// object key or a number that would not write back as the same digits.
pub fn decode_composite(text: &str) -> Option<Value> {
    let raw: &RawValue = serde_json::from_str(text).ok()?;
    match raw.get().as_bytes().first().copied() {
        Some(b'[' | b'{') => exact_value(raw),
        _ => None,
    }
}

fn exact_value(raw: &RawValue) -> Option<Value> {
    let text = raw.get();
    match text.as_bytes().first().copied()? {
        b'{' => {
            let ObjectEntries(entries) = serde_json::from_str(text).ok()?;
            let mut object = Map::new();
            for (key, item) in entries {
                let value = exact_value(item)?;
                if object.insert(key, value).is_some() {
                    return None;
                }
            }
            Some(Value::Object(object))
        }
        b'[' => {
            let items: Vec<&RawValue> = serde_json::from_str(text).ok()?;
            items
                .into_iter()
                .map(exact_value)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array)
        }
        b'-' | b'0'..=b'9' => {
            let number: Value = serde_json::from_str(text).ok()?;
            (number.to_string() == text).then_some(number)
        }
        _ => serde_json::from_str(text).ok(),
    }
}

/// Object members in source order, repeats included.
struct ObjectEntries<'a>(Vec<(String, &'a RawValue)>);

impl<'de> Deserialize<'de> for ObjectEntries<'de> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor<'a>(PhantomData<&'a ()>);

        impl<'de> Visitor<'de> for EntriesVisitor<'de> {
            type Value = ObjectEntries<'de>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, &'de RawValue>()? {
                    entries.push(entry);
                }
                Ok(ObjectEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

fn map_enum(
    field: &str,
    definition: &EnumDefinition,
    value: &PropertyValue,
) -> Result<(Value, TypeTag), MappingError> {
    let name = match value {
        PropertyValue::Int32(ordinal) => lookup_ordinal(field, definition, i64::from(*ordinal))?,
        PropertyValue::Int64(ordinal) => lookup_ordinal(field, definition, *ordinal)?,
        PropertyValue::String(name) | PropertyValue::Enum(name) => {
            if !definition.contains(name) {
                return Err(MappingError::UnknownEnumName {
                    field: field.to_string(),
                    name: name.clone(),
                });
            }
            name.clone()
        }
        other => {
            return Err(MappingError::EnumSourceType {
                field: field.to_string(),
                tag: other.tag(),
            })
        }
    };
    Ok((Value::String(name), TypeTag::Enum))
}

fn lookup_ordinal(
    field: &str,
    definition: &EnumDefinition,
    ordinal: i64,
) -> Result<String, MappingError> {
    definition
        .name_of(ordinal)
        .map(str::to_string)
        .ok_or_else(|| MappingError::UnknownEnumOrdinal {
            field: field.to_string(),
            ordinal,
        })
}

/// Writes an `f32` as the shortest decimal that reads back as the same `f32`
/// instead of the widened `f64` expansion.
fn single_number(field: &str, value: f32) -> Result<Number, MappingError> {
    let non_finite = || MappingError::NonFinite {
        field: field.to_string(),
        value: value.to_string(),
    };
    if !value.is_finite() {
        return Err(non_finite());
    }
    let shortest: f64 = value.to_string().parse().map_err(|_| non_finite())?;
    Number::from_f64(shortest).ok_or_else(non_finite)
}

fn same_value(decoded: &PropertyValue, original: &PropertyValue) -> bool {
    match (decoded, original) {
        // NaN never reaches a document, so bitwise equality is exact here.
        (PropertyValue::Double(a), PropertyValue::Double(b)) => a.to_bits() == b.to_bits(),
        (PropertyValue::Single(a), PropertyValue::Single(b)) => a.to_bits() == b.to_bits(),
        (PropertyValue::DateTime(a), PropertyValue::DateTime(b)) => {
            a == b && a.offset() == b.offset()
        }
        (a, b) => a == b,
    }
}

impl TargetDocument {
    /// Reads one field back into the typed value it was mapped from. Composite
    /// fields come back as their compact JSON text.
    pub fn decode_field(&self, name: &str) -> Result<PropertyValue, MappingError> {
        let tag = self.types.get(name).copied().unwrap_or(TypeTag::String);
        let value = self.data.get(name).ok_or_else(|| MappingError::Decode {
            field: name.to_string(),
            tag,
            reason: "field missing".to_string(),
        })?;
        decode_value(name, tag, value)
    }
}

/// Reads a stored JSON value as the typed value its `tag` says it holds.
pub fn decode_value(field: &str, tag: TypeTag, value: &Value) -> Result<PropertyValue, MappingError> {
    let fail = |reason: &str| MappingError::Decode {
        field: field.to_string(),
        tag,
        reason: reason.to_string(),
    };
    let text = || value.as_str().ok_or_else(|| fail("expected a string"));

    let decoded = match tag {
        TypeTag::String => PropertyValue::String(text()?.to_string()),
        TypeTag::Enum => PropertyValue::Enum(text()?.to_string()),
        TypeTag::Int32 => {
            let raw = value.as_i64().ok_or_else(|| fail("expected an integer"))?;
            PropertyValue::Int32(i32::try_from(raw).map_err(|_| fail("out of int32 range"))?)
        }
        TypeTag::Int64 => {
            PropertyValue::Int64(value.as_i64().ok_or_else(|| fail("expected an integer"))?)
        }
        TypeTag::Double => {
            PropertyValue::Double(value.as_f64().ok_or_else(|| fail("expected a number"))?)
        }
        TypeTag::Single => {
            let raw = value.as_f64().ok_or_else(|| fail("expected a number"))?;
            PropertyValue::Single(raw as f32)
        }
        TypeTag::Decimal => PropertyValue::Decimal(
            ExactDecimal::parse(text()?).map_err(|err| fail(&err.to_string()))?,
        ),
        TypeTag::Boolean => {
            PropertyValue::Boolean(value.as_bool().ok_or_else(|| fail("expected a boolean"))?)
        }
        TypeTag::Binary => PropertyValue::Binary(
            STANDARD
                .decode(text()?)
                .map_err(|err| fail(&err.to_string()))?,
        ),
        TypeTag::DateTime => PropertyValue::DateTime(
            parse_full_precision(text()?).map_err(|err| fail(&err.to_string()))?,
        ),
        TypeTag::Guid => PropertyValue::Guid(
            Uuid::try_parse(text()?).map_err(|err| fail(&err.to_string()))?,
        ),
        TypeTag::Json => {
            if !(value.is_array() || value.is_object()) {
                return Err(fail("expected an array or object"));
            }
            PropertyValue::String(
                serde_json::to_string(value).map_err(|err| fail(&err.to_string()))?,
            )
        }
    };
    Ok(decoded)
}
