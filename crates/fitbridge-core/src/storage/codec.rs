//! Tagged-string codec
//!
//! Persisted objects cross process boundaries as `$<module>,<class>~<json>`.
//! The class is resolved through the fixed [`Record`] registry, so decoding
//! always reconstructs the exact entity type.

use serde_json::Value;
use tracing::warn;

use crate::errors::{CodecError, FitError, Result};
use crate::model::{Device, Entity, HrDeviceOutput, KeiserM3iOutput, Label, Session, User, View};

/// Module part of every tag
pub const MODULE: &str = "fitbridge_core.model";

// ----------------------------------------------------------------------------
// Record Registry
// ----------------------------------------------------------------------------

/// Any entity that can travel as a tagged string
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    User(User),
    Device(Device),
    Session(Session),
    View(View),
    Label(Label),
    HrDeviceOutput(HrDeviceOutput),
    KeiserM3iOutput(KeiserM3iOutput),
}

macro_rules! record_conversions {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Record {
                fn from(value: $variant) -> Self {
                    Record::$variant(value)
                }
            }

            impl TryFrom<Record> for $variant {
                type Error = Record;

                fn try_from(record: Record) -> std::result::Result<Self, Record> {
                    match record {
                        Record::$variant(value) => Ok(value),
                        other => Err(other),
                    }
                }
            }
        )*

        impl Record {
            /// Class name carried in the tag
            pub fn class(&self) -> &'static str {
                match self {
                    $(Record::$variant(_) => <$variant as Entity>::CLASS,)*
                }
            }

            fn encode(&self) -> Result<String> {
                match self {
                    $(Record::$variant(value) => encode(value),)*
                }
            }

            fn decode_class(class: &str, payload: &str) -> Result<Self> {
                $(
                    if class == <$variant as Entity>::CLASS {
                        let value: $variant = serde_json::from_str(payload)
                            .map_err(CodecError::Payload)?;
                        return Ok(Record::$variant(value));
                    }
                )*
                Err(CodecError::UnknownClass {
                    module: MODULE.to_string(),
                    class: class.to_string(),
                }
                .into())
            }
        }
    };
}

record_conversions!(User, Device, Session, View, Label, HrDeviceOutput, KeiserM3iOutput);

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

/// Whether a wire string carries a tagged object
pub fn is_tagged(s: &str) -> bool {
    s.starts_with('$') && s.contains('~') && s.contains(',')
}

/// Encode one entity
pub fn encode<E: Entity>(entity: &E) -> Result<String> {
    Ok(format!(
        "${},{}~{}",
        MODULE,
        E::CLASS,
        serde_json::to_string(entity)?
    ))
}

/// Encode any registered record
pub fn serialize(record: &Record) -> Result<String> {
    record.encode()
}

fn split(s: &str) -> Result<(&str, &str, &str)> {
    let missing = || FitError::from(CodecError::MissingTag(truncate(s)));
    let body = s.strip_prefix('$').ok_or_else(missing)?;
    let (tag, payload) = body.split_once('~').ok_or_else(missing)?;
    let (module, class) = tag.split_once(',').ok_or_else(missing)?;
    Ok((module, class, payload))
}

fn truncate(s: &str) -> String {
    s.chars().take(48).collect()
}

/// Decode a tagged string into whichever record it names
pub fn deserialize(s: &str) -> Result<Record> {
    let (module, class, payload) = split(s)?;
    if module != MODULE {
        return Err(CodecError::UnknownClass {
            module: module.to_string(),
            class: class.to_string(),
        }
        .into());
    }
    Record::decode_class(class, payload)
}

/// Decode, returning `fallback` on any failure
pub fn deserialize_or(s: &str, fallback: Record) -> Record {
    deserialize(s).unwrap_or_else(|e| {
        warn!("Failed to decode tagged object: {}", e);
        fallback
    })
}

/// Decode a tagged string that must hold a specific entity
pub fn decode<E: Entity>(s: &str) -> Result<E> {
    let (module, class, payload) = split(s)?;
    if module != MODULE || class != E::CLASS {
        return Err(CodecError::UnknownClass {
            module: module.to_string(),
            class: class.to_string(),
        }
        .into());
    }
    Ok(serde_json::from_str(payload).map_err(CodecError::Payload)?)
}

// ----------------------------------------------------------------------------
// Child Lists
// ----------------------------------------------------------------------------

/// Serde adapter writing child collections as arrays of tagged strings
///
/// Reading accepts tagged strings or plain objects.
pub mod tagged_list {
    use super::*;
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, E>(items: &Vec<E>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
        E: Entity,
    {
        let encoded = items
            .iter()
            .map(encode)
            .collect::<Result<Vec<String>>>()
            .map_err(S::Error::custom)?;
        serializer.collect_seq(encoded)
    }

    pub fn deserialize<'de, D, E>(deserializer: D) -> std::result::Result<Vec<E>, D::Error>
    where
        D: Deserializer<'de>,
        E: Entity,
    {
        let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
        raw.into_iter()
            .map(|item| match item {
                Value::String(s) => decode::<E>(&s).map_err(D::Error::custom),
                other => serde_json::from_value(other).map_err(D::Error::custom),
            })
            .collect()
    }
}
