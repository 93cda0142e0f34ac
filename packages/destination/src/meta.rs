//! Reconciliation metadata attached to every syndicated product.
//!
//! The destination's own metadata is the record of what the pipeline has
//! syndicated: cleanup and stale reconciliation find products by these
//! keys rather than through local tracking tables.

use chrono::{DateTime, Utc};
use elementa_feed_models::{ConnectionId, DestinationPayload, value_text};
use serde_json::{Value, json};

/// RFC 3339 timestamp of the last syndication.
pub const LAST_SEEN: &str = "elementa_last_seen_timestamp";

/// Connection that syndicated the product.
pub const CONNECTION_ID: &str = "elementa_feed_connection_id";

/// Identifier of the source record (its SKU).
pub const SOURCE_IDENTIFIER: &str = "elementa_source_identifier";

/// Appends a `{key, value}` entry to the payload's `meta_data` array,
/// replacing any existing entry with the same key.
pub fn set(payload: &mut DestinationPayload, key: &str, value: Value) {
    let entry = json!({ "key": key, "value": value });
    match payload.get_mut("meta_data") {
        Some(Value::Array(entries)) => {
            entries.retain(|e| e.get("key").and_then(Value::as_str) != Some(key));
            entries.push(entry);
        }
        _ => {
            payload.insert("meta_data".to_string(), Value::Array(vec![entry]));
        }
    }
}

/// Drops the `meta_data` entry named `key`, if present.
pub fn remove(payload: &mut DestinationPayload, key: &str) {
    if let Some(Value::Array(entries)) = payload.get_mut("meta_data") {
        entries.retain(|e| e.get("key").and_then(Value::as_str) != Some(key));
    }
}

/// Returns the value of the `meta_data` entry named `key`.
#[must_use]
pub fn get<'a>(payload: &'a DestinationPayload, key: &str) -> Option<&'a Value> {
    payload
        .get("meta_data")?
        .as_array()?
        .iter()
        .find(|e| e.get("key").and_then(Value::as_str) == Some(key))?
        .get("value")
}

/// Whether `payload` was syndicated by `connection_id`.
#[must_use]
pub fn belongs_to(payload: &DestinationPayload, connection_id: ConnectionId) -> bool {
    get(payload, CONNECTION_ID)
        .and_then(value_text)
        .is_some_and(|id| id == connection_id.to_string())
}

/// Parses the payload's last-seen timestamp.
#[must_use]
pub fn last_seen(payload: &DestinationPayload) -> Option<DateTime<Utc>> {
    get(payload, LAST_SEEN)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_existing_key() {
        let mut payload = DestinationPayload::new();
        set(&mut payload, CONNECTION_ID, json!(7));
        set(&mut payload, SOURCE_IDENTIFIER, json!("S1"));
        set(&mut payload, CONNECTION_ID, json!(8));

        let entries = payload["meta_data"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(get(&payload, CONNECTION_ID), Some(&json!(8)));
        assert!(belongs_to(&payload, ConnectionId(8)));
        assert!(!belongs_to(&payload, ConnectionId(7)));

        remove(&mut payload, CONNECTION_ID);
        assert_eq!(get(&payload, CONNECTION_ID), None);
        assert_eq!(get(&payload, SOURCE_IDENTIFIER), Some(&json!("S1")));
    }

    #[test]
    fn connection_id_matches_string_or_number() {
        let mut payload = DestinationPayload::new();
        set(&mut payload, CONNECTION_ID, json!("12"));
        assert!(belongs_to(&payload, ConnectionId(12)));
    }

    #[test]
    fn parses_last_seen() {
        let mut payload = DestinationPayload::new();
        set(&mut payload, LAST_SEEN, json!("2024-05-01T12:00:00+00:00"));
        assert_eq!(
            last_seen(&payload).unwrap().to_rfc3339(),
            "2024-05-01T12:00:00+00:00"
        );
    }
}
