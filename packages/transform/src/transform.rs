//! Raw record to destination payload mapping.
//!
//! [`transform`] either yields a complete payload or a [`SkipReason`]; a
//! skipped record is never an error for the chunk it belongs to.

use elementa_feed_models::{CategoryMap, DestinationPayload, FieldMappings, RawRecord, value_text};
use serde_json::{Value, json};

/// Default call-to-action label on externally-linked listings.
pub const DEFAULT_BUTTON_TEXT: &str = "View Product";

/// Payload fields consulted, in order, when `external_url` is unset.
pub const EXTERNAL_URL_FALLBACKS: &[&str] = &["external_url", "product_url", "url", "link"];

/// Fields every syndicated product must carry.
pub const REQUIRED_FIELDS: &[&str] = &["external_url", "regular_price", "name"];

const PRICE_FIELDS: &[&str] = &["regular_price", "sale_price"];

/// Why a record produced no payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    /// One or more required fields were empty after mapping
    #[error("missing required fields: {}", .0.join(", "))]
    MissingRequiredFields(Vec<&'static str>),
    /// No destination category could be resolved
    #[error("no category match for {token:?}")]
    NoCategory {
        /// The raw category token, if the record had one.
        token: Option<String>,
    },
    /// The payload has no `sku`, so the destination cannot upsert it
    #[error("missing sku")]
    MissingSku,
    /// The record was excluded by the connection's filter rules
    #[error("excluded by filter rules")]
    Filtered,
}

/// Category information the caller gathered for one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryInput<'a> {
    /// Id already resolved upstream by [`crate::category::normalize`].
    pub resolved: Option<u64>,
    /// The raw category token, used for legacy matching when `resolved`
    /// is absent.
    pub token: Option<&'a str>,
}

impl<'a> CategoryInput<'a> {
    /// Input with a pre-resolved id.
    #[must_use]
    pub const fn resolved(id: u64) -> Self {
        Self {
            resolved: Some(id),
            token: None,
        }
    }

    /// Input carrying only a raw token.
    #[must_use]
    pub const fn token(token: &'a str) -> Self {
        Self {
            resolved: None,
            token: Some(token),
        }
    }

    /// Attaches the raw token alongside an optional resolved id.
    #[must_use]
    pub const fn with_token(mut self, token: Option<&'a str>) -> Self {
        self.token = token;
        self
    }
}

/// Maps `record` into a destination payload.
///
/// # Errors
///
/// * [`SkipReason::MissingRequiredFields`] if any of [`REQUIRED_FIELDS`] is
///   empty after mapping and fallbacks
/// * [`SkipReason::NoCategory`] if no destination category resolves
pub fn transform(
    record: &RawRecord,
    field_mappings: &FieldMappings,
    category_mappings: &CategoryMap,
    category: CategoryInput<'_>,
) -> Result<DestinationPayload, SkipReason> {
    let mut payload = apply_mappings(record, field_mappings);

    if !has_text(&payload, "external_url")
        && let Some(url) = EXTERNAL_URL_FALLBACKS
            .iter()
            .find_map(|field| text_of(&payload, field))
    {
        payload.insert("external_url".to_string(), Value::String(url));
    }

    for field in PRICE_FIELDS {
        if let Some(price) = text_of(&payload, field) {
            payload.insert((*field).to_string(), Value::String(sanitize_price(&price)));
        }
    }

    normalize_images(&mut payload);

    payload.insert("type".to_string(), json!("external"));
    payload.insert("status".to_string(), json!("draft"));

    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| !has_text(&payload, field))
        .collect();
    if !missing.is_empty() {
        let reason = SkipReason::MissingRequiredFields(missing);
        log::debug!("Skipping record: {reason}");
        return Err(reason);
    }

    let Some(category_id) = category.resolved.or_else(|| {
        category
            .token
            .and_then(|token| legacy_category_match(token, category_mappings))
    }) else {
        let reason = SkipReason::NoCategory {
            token: category.token.map(str::to_string),
        };
        log::debug!("Skipping record {:?}: {reason}", text_of(&payload, "name"));
        return Err(reason);
    };
    payload.insert("categories".to_string(), json!([{ "id": category_id }]));

    if !has_text(&payload, "button_text") {
        payload.insert("button_text".to_string(), json!(DEFAULT_BUTTON_TEXT));
    }

    Ok(payload)
}

/// Copies `record[source]` into `payload[destination]` for every mapping
/// whose source column is present and non-null.
#[must_use]
pub fn apply_mappings(record: &RawRecord, field_mappings: &FieldMappings) -> DestinationPayload {
    field_mappings
        .iter()
        .filter_map(|(destination, source)| {
            record
                .get(source)
                .filter(|value| !value.is_null())
                .map(|value| (destination.clone(), value.clone()))
        })
        .collect()
}

/// Keeps only ASCII digits and `.`. Idempotent.
#[must_use]
pub fn sanitize_price(price: &str) -> String {
    price
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect()
}

/// Replaces a comma-separated `images` string with `[{ "src": url }, ...]`.
/// Anything that is already an array is left alone.
pub fn normalize_images(payload: &mut DestinationPayload) {
    let Some(Value::String(images)) = payload.get("images") else {
        return;
    };

    let entries: Vec<Value> = images
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| json!({ "src": url }))
        .collect();

    payload.insert("images".to_string(), Value::Array(entries));
}

/// Matches a raw category token directly against the category map: exact
/// key first, then case-insensitive containment in either direction.
#[must_use]
pub fn legacy_category_match(token: &str, category_mappings: &CategoryMap) -> Option<u64> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    if let Some(id) = category_mappings.get(token) {
        return Some(*id);
    }

    let token_lower = token.to_lowercase();
    category_mappings.iter().find_map(|(key, id)| {
        let key_lower = key.trim().to_lowercase();
        (!key_lower.is_empty()
            && (token_lower.contains(&key_lower) || key_lower.contains(&token_lower)))
        .then_some(*id)
    })
}

fn text_of(payload: &DestinationPayload, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(value_text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn has_text(payload: &DestinationPayload, field: &str) -> bool {
    text_of(payload, field).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::normalize;

    fn record(value: Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    fn mappings(entries: &[(&str, &str)]) -> FieldMappings {
        entries
            .iter()
            .map(|(d, s)| ((*d).to_string(), (*s).to_string()))
            .collect()
    }

    fn categories(entries: &[(&str, u64)]) -> CategoryMap {
        entries.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    fn shoe() -> RawRecord {
        record(json!({
            "Title": "Shoe",
            "Price": "$19.99",
            "SKU": "S1",
            "Cat": "Shoes > Running",
            "Link": "https://merchant.example.com/s1",
        }))
    }

    fn shoe_mappings() -> FieldMappings {
        mappings(&[
            ("name", "Title"),
            ("regular_price", "Price"),
            ("sku", "SKU"),
            ("external_url", "Link"),
        ])
    }

    #[test]
    fn maps_sanitizes_and_categorizes() {
        let map = categories(&[("Running", 42)]);
        let resolved = normalize("Shoes > Running", None, &map).unwrap();

        let payload =
            transform(&shoe(), &shoe_mappings(), &map, CategoryInput::resolved(resolved)).unwrap();

        assert_eq!(payload["regular_price"], json!("19.99"));
        assert_eq!(payload["categories"], json!([{ "id": 42 }]));
        assert_eq!(payload["type"], json!("external"));
        assert_eq!(payload["status"], json!("draft"));
        assert_eq!(payload["sku"], json!("S1"));
        assert_eq!(payload["button_text"], json!(DEFAULT_BUTTON_TEXT));
    }

    #[test]
    fn unmatched_category_skips_record() {
        let map = categories(&[("Hiking", 7)]);
        assert_eq!(normalize("Shoes > Running", None, &map), None);

        let result = transform(
            &shoe(),
            &shoe_mappings(),
            &map,
            CategoryInput::default().with_token(Some("Shoes > Running")),
        );

        assert_eq!(
            result,
            Err(SkipReason::NoCategory {
                token: Some("Shoes > Running".to_string())
            })
        );
    }

    #[test]
    fn missing_required_fields_skip_record() {
        let map = categories(&[("Running", 42)]);
        let no_url = mappings(&[("name", "Title"), ("regular_price", "Price")]);

        let result = transform(&shoe(), &no_url, &map, CategoryInput::resolved(42));
        assert_eq!(result, Err(SkipReason::MissingRequiredFields(vec!["external_url"])));

        let junk_price = record(json!({"Title": "Shoe", "Price": "call", "Link": "https://x"}));
        let result = transform(&junk_price, &shoe_mappings(), &map, CategoryInput::resolved(42));
        assert_eq!(result, Err(SkipReason::MissingRequiredFields(vec!["regular_price"])));
    }

    #[test]
    fn external_url_falls_back_to_product_url() {
        let map = categories(&[("Running", 42)]);
        let fm = mappings(&[
            ("name", "Title"),
            ("regular_price", "Price"),
            ("product_url", "Link"),
        ]);

        let payload = transform(&shoe(), &fm, &map, CategoryInput::resolved(42)).unwrap();
        assert_eq!(payload["external_url"], json!("https://merchant.example.com/s1"));
    }

    #[test]
    fn forced_fields_override_mapped_values() {
        let rec = record(json!({
            "Title": "Shoe", "Price": "10", "Link": "https://x", "Kind": "simple", "State": "publish",
        }));
        let fm = mappings(&[
            ("name", "Title"),
            ("regular_price", "Price"),
            ("external_url", "Link"),
            ("type", "Kind"),
            ("status", "State"),
        ]);

        let payload = transform(&rec, &fm, &CategoryMap::new(), CategoryInput::resolved(1)).unwrap();
        assert_eq!(payload["type"], json!("external"));
        assert_eq!(payload["status"], json!("draft"));
    }

    #[test]
    fn legacy_token_matching() {
        let map = categories(&[("Running", 42), ("shoes", 3)]);
        assert_eq!(legacy_category_match("Running", &map), Some(42));
        assert_eq!(legacy_category_match("Trail RUNNING gear", &map), Some(42));
        assert_eq!(legacy_category_match("Shoe", &map), Some(3));
        assert_eq!(legacy_category_match("Hats", &map), None);
        assert_eq!(legacy_category_match("  ", &map), None);
    }

    #[test]
    fn images_string_becomes_src_objects() {
        let mut payload = DestinationPayload::new();
        payload.insert("images".to_string(), json!("https://a/1.jpg, https://a/2.jpg,"));
        normalize_images(&mut payload);
        assert_eq!(
            payload["images"],
            json!([{ "src": "https://a/1.jpg" }, { "src": "https://a/2.jpg" }])
        );

        normalize_images(&mut payload);
        assert_eq!(payload["images"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn price_sanitization_is_idempotent() {
        for raw in ["$1,299.00", "USD 5", "19.99", "", "€ 3,50"] {
            let once = sanitize_price(raw);
            assert_eq!(sanitize_price(&once), once);
        }
        assert_eq!(sanitize_price("$1,299.00"), "1299.00");
    }

    #[test]
    fn keeps_mapped_button_text() {
        let rec = record(json!({"Title": "Shoe", "Price": "10", "Link": "https://x", "Cta": "Buy"}));
        let mut fm = shoe_mappings();
        fm.insert("button_text".to_string(), "Cta".to_string());

        let payload = transform(&rec, &fm, &CategoryMap::new(), CategoryInput::resolved(1)).unwrap();
        assert_eq!(payload["button_text"], json!("Buy"));
    }
}
