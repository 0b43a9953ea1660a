//! Decoded stream rows.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use crate::codec::{Value, ValueCodec, TIMESTAMP};
use crate::{Error, Result};

/// Server format for timestamps when no timezone was requested.
const UTC_PATTERN: &str = "%Y-%m-%dT%H:%M:%S%.fZ";
/// Wall-clock format left after stripping the offset of a zoned timestamp.
const LOCAL_PATTERN: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// The server-assigned time of a row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Timestamp {
    /// Instant in UTC, from a query without a timezone.
    Utc(DateTime<Utc>),
    /// Wall-clock time in the zone the query asked for.
    Local(NaiveDateTime),
    /// Unparsed server text, when timestamp conversion was turned off.
    Raw(String),
}

impl Timestamp {
    /// Parse the server's timestamp text.
    ///
    /// With `zoned` set the trailing UTC offset (`-05:00`, `+0100` or `Z`)
    /// is dropped and the remaining local fields parsed.
    pub fn parse(text: &str, zoned: bool) -> Result<Self> {
        if zoned {
            let local = strip_offset(text);
            NaiveDateTime::parse_from_str(local, LOCAL_PATTERN)
                .map(Timestamp::Local)
                .map_err(|e| Error::Decode(format!("invalid timestamp '{}': {}", text, e)))
        } else {
            NaiveDateTime::parse_from_str(text, UTC_PATTERN)
                .map(|naive| Timestamp::Utc(Utc.from_utc_datetime(&naive)))
                .map_err(|e| Error::Decode(format!("invalid timestamp '{}': {}", text, e)))
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Utc(dt) => write!(f, "{}", dt.to_rfc3339()),
            Timestamp::Local(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.f")),
            Timestamp::Raw(s) => f.write_str(s),
        }
    }
}

fn strip_offset(text: &str) -> &str {
    if let Some(stripped) = text.strip_suffix('Z') {
        return stripped;
    }
    let bytes = text.as_bytes();
    for len in [6, 5] {
        if bytes.len() > len {
            let sign = bytes[bytes.len() - len];
            if (sign == b'+' || sign == b'-') && text.is_char_boundary(bytes.len() - len) {
                let tail = &text[bytes.len() - len + 1..];
                if tail.chars().all(|c| c.is_ascii_digit() || c == ':') {
                    return &text[..bytes.len() - len];
                }
            }
        }
    }
    text
}

/// One decoded row of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: Timestamp,
    pub values: HashMap<String, Value>,
}

impl Record {
    /// Decode a raw row object from the output endpoint.
    pub fn decode(
        row: serde_json::Map<String, serde_json::Value>,
        codec: &dyn ValueCodec,
        convert_timestamp: bool,
        zoned: bool,
    ) -> Result<Self> {
        let mut timestamp = None;
        let mut values = HashMap::with_capacity(row.len());

        for (name, raw) in row {
            if name == TIMESTAMP {
                let text = raw
                    .as_str()
                    .ok_or_else(|| Error::Decode(format!("timestamp is not text: {}", raw)))?;
                timestamp = Some(if convert_timestamp {
                    Timestamp::parse(text, zoned)?
                } else {
                    Timestamp::Raw(text.to_string())
                });
                continue;
            }
            let value = match raw {
                serde_json::Value::String(ref wire) => codec.decode(&name, wire)?,
                other => Value::Json(other),
            };
            values.insert(name, value);
        }

        let timestamp = timestamp.ok_or_else(|| Error::Decode("row has no timestamp".to_string()))?;
        Ok(Self { timestamp, values })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Order two records by `field`; rows missing the field sort last.
    pub fn cmp_by(&self, other: &Record, field: &str) -> Ordering {
        if field == TIMESTAMP {
            return self.timestamp.cmp(&other.timestamp);
        }
        match (self.get(field), other.get(field)) {
            (Some(a), Some(b)) => a.sort_cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    /// JSON rendering with the timestamp as text.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::with_capacity(self.values.len() + 1);
        for (name, value) in &self.values {
            obj.insert(name.clone(), value.to_json());
        }
        obj.insert(TIMESTAMP.to_string(), json!(self.timestamp.to_string()));
        serde_json::Value::Object(obj)
    }
}

/// Stable sort of `records` by `field`.
pub fn sort_records(records: &mut [Record], field: &str) {
    records.sort_by(|a, b| a.cmp_by(b, field));
}
