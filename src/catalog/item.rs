//! Canonical post representation and the normalizer that builds it from a
//! raw catalog record.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// A raw record that cannot be turned into an [`Item`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedRecord {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing or non-numeric id")]
    MissingId,
    #[error("post {id}: missing created_at")]
    MissingCreatedAt { id: u64 },
    #[error("post {id}: unparseable created_at {value:?}")]
    BadCreatedAt { id: u64, value: String },
}

/// One catalog post, normalized.
///
/// `md5` (not `id`) determines where the post lives on disk; two posts with
/// the same hash share one content file.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: u64,
    /// Lowercase hex MD5 of the content, empty if the catalog withholds it.
    pub md5: String,
    /// Lowercase file extension without the dot, possibly empty.
    pub extension: String,
    pub content_url: String,
    /// `file_size` as declared by the catalog.
    pub declared_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    /// Never earlier than `created_at`.
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub is_pending: bool,
    /// Every attribute of the record exactly as received.
    pub raw: Map<String, Value>,
}

impl Item {
    /// Parse a raw record. Pure: no I/O, no logging.
    pub fn from_record(record: Value) -> Result<Self, MalformedRecord> {
        let Value::Object(raw) = record else {
            return Err(MalformedRecord::NotAnObject);
        };

        let id = raw.get("id").and_then(as_u64).ok_or(MalformedRecord::MissingId)?;

        let created_raw = raw
            .get("created_at")
            .and_then(Value::as_str)
            .ok_or(MalformedRecord::MissingCreatedAt { id })?;
        let created_at = parse_timestamp(created_raw).ok_or_else(|| MalformedRecord::BadCreatedAt {
            id,
            value: created_raw.to_string(),
        })?;

        let updated_at = raw
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or(created_at)
            .max(created_at);

        Ok(Self {
            id,
            md5: string_field(&raw, "md5").to_ascii_lowercase(),
            extension: string_field(&raw, "file_ext").to_ascii_lowercase(),
            content_url: string_field(&raw, "file_url"),
            declared_size: raw.get("file_size").and_then(as_u64),
            created_at,
            updated_at,
            is_deleted: bool_field(&raw, "is_deleted"),
            is_pending: bool_field(&raw, "is_pending"),
            raw,
        })
    }

    /// Whether the post can be content-addressed and downloaded at all.
    pub fn is_addressable(&self) -> bool {
        !self.md5.is_empty() && !self.content_url.is_empty()
    }

    /// Full record as the JSON object that goes into the sidecar and the
    /// structured store.
    pub fn raw_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_field(raw: &Map<String, Value>, key: &str) -> String {
    match raw.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn bool_field(raw: &Map<String, Value>, key: &str) -> bool {
    match raw.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

/// Parse an RFC 3339 timestamp, falling back to a naive
/// `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s.trim()) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s.trim(), fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn post() -> Value {
        json!({
            "id": 1234,
            "md5": "D41D8CD98F00B204E9800998ECF8427E",
            "file_ext": "PNG",
            "file_url": "https://cdn.example.com/d4/1d/d41d8cd98f00b204e9800998ecf8427e.png",
            "file_size": 2048,
            "created_at": "2020-01-02T03:04:05.000-05:00",
            "updated_at": "2021-06-07T08:09:10.123-05:00",
            "is_deleted": false,
            "is_pending": true,
            "tag_string": "1girl solo"
        })
    }

    #[test]
    fn test_normalizes_full_record() {
        let item = Item::from_record(post()).unwrap();
        assert_eq!(item.id, 1234);
        assert_eq!(item.md5, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(item.extension, "png");
        assert_eq!(item.declared_size, Some(2048));
        assert_eq!(
            item.created_at,
            Utc.with_ymd_and_hms(2020, 1, 2, 8, 4, 5).unwrap()
        );
        assert!(item.updated_at > item.created_at);
        assert!(!item.is_deleted);
        assert!(item.is_pending);
        assert_eq!(item.raw["tag_string"], "1girl solo");
    }

    #[test]
    fn test_id_as_string() {
        let mut record = post();
        record["id"] = json!("77");
        assert_eq!(Item::from_record(record).unwrap().id, 77);
    }

    #[test]
    fn test_missing_optional_fields_default_empty() {
        let item = Item::from_record(json!({
            "id": 5,
            "created_at": "2020-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(item.md5.is_empty());
        assert!(item.extension.is_empty());
        assert!(item.content_url.is_empty());
        assert!(!item.is_deleted);
        assert!(!item.is_pending);
        assert_eq!(item.updated_at, item.created_at);
        assert!(!item.is_addressable());
    }

    #[test]
    fn test_updated_at_clamped_to_created_at() {
        let mut record = post();
        record["updated_at"] = json!("2001-01-01T00:00:00Z");
        let item = Item::from_record(record).unwrap();
        assert_eq!(item.updated_at, item.created_at);
    }

    #[test]
    fn test_unparseable_updated_at_falls_back() {
        let mut record = post();
        record["updated_at"] = json!("yesterday");
        let item = Item::from_record(record).unwrap();
        assert_eq!(item.updated_at, item.created_at);
    }

    #[test]
    fn test_bad_created_at_rejects_record() {
        let mut record = post();
        record["created_at"] = json!("not a date");
        assert_eq!(
            Item::from_record(record),
            Err(MalformedRecord::BadCreatedAt {
                id: 1234,
                value: "not a date".into()
            })
        );
    }

    #[test]
    fn test_missing_created_at_rejects_record() {
        let mut record = post();
        record.as_object_mut().unwrap().remove("created_at");
        assert_eq!(
            Item::from_record(record),
            Err(MalformedRecord::MissingCreatedAt { id: 1234 })
        );
    }

    #[test]
    fn test_missing_id_rejects_record() {
        let mut record = post();
        record.as_object_mut().unwrap().remove("id");
        assert_eq!(Item::from_record(record), Err(MalformedRecord::MissingId));
    }

    #[test]
    fn test_non_object_rejected() {
        assert_eq!(
            Item::from_record(json!([1, 2])),
            Err(MalformedRecord::NotAnObject)
        );
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        assert_eq!(
            parse_timestamp("2022-03-04 05:06:07"),
            Some(Utc.with_ymd_and_hms(2022, 3, 4, 5, 6, 7).unwrap())
        );
    }

    #[test]
    fn test_null_md5_is_empty() {
        let mut record = post();
        record["md5"] = Value::Null;
        assert!(Item::from_record(record).unwrap().md5.is_empty());
    }
}
