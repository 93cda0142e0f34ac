#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Raw feed record, destination payload, and connection configuration types.
//!
//! A [`Connection`] pairs one product feed with one destination storefront
//! and carries everything the pipeline needs to turn a [`RawRecord`] into a
//! [`DestinationPayload`]: field mappings, category mappings, and filter
//! rules. Connections are read-only input to the pipeline.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// One row of a delimited feed, keyed by column header.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// A product payload in the destination's REST API shape.
pub type DestinationPayload = serde_json::Map<String, serde_json::Value>;

/// Destination field name -> source column name.
pub type FieldMappings = BTreeMap<String, String>;

/// Source category token -> destination category id.
pub type CategoryMap = BTreeMap<String, u64>;

/// Fields consulted for the category token when a connection does not name
/// one explicitly.
pub const DEFAULT_CATEGORY_FIELDS: &[&str] =
    &["category", "Category", "categories", "product_category"];

/// Identifier of a feed-to-destination connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a product feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedId(pub u64);

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a destination site (e.g. `"shop.example.com"`).
///
/// Shared throttle state is keyed by this value, so every worker talking to
/// the same site must derive the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DestinationKey(String);

impl DestinationKey {
    /// Creates a key from a site identifier, lowercased and with any URL
    /// scheme and trailing slashes removed.
    #[must_use]
    pub fn new(site: &str) -> Self {
        let trimmed = site.trim();
        let without_scheme = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        Self(without_scheme.trim_end_matches('/').to_lowercase())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DestinationKey {
    fn from(site: String) -> Self {
        Self::new(&site)
    }
}

impl From<DestinationKey> for String {
    fn from(key: DestinationKey) -> Self {
        key.0
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Comparison applied by a [`FilterRule`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FilterOperator {
    /// Case-insensitive string equality.
    Equals,
    /// Case-insensitive string inequality.
    NotEquals,
    /// Case-insensitive substring match.
    Contains,
    /// Negated case-insensitive substring match.
    NotContains,
    /// Numeric `>` comparison.
    GreaterThan,
    /// Numeric `<` comparison.
    LessThan,
    /// Field value is empty after trimming.
    IsEmpty,
    /// Field value is not empty after trimming.
    IsNotEmpty,
}

/// A single inclusion rule as configured on a connection.
///
/// Fields are kept optional because incomplete rules are legal in stored
/// configuration; they are skipped at evaluation time rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Source column the rule inspects.
    #[serde(default)]
    pub field: Option<String>,
    /// Operator name, e.g. `"contains"`.
    #[serde(default)]
    pub operator: Option<String>,
    /// Comparison operand. Strings and numbers are both accepted.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl FilterRule {
    /// Creates a fully specified rule.
    #[must_use]
    pub fn new(field: &str, operator: FilterOperator, value: &str) -> Self {
        Self {
            field: Some(field.to_string()),
            operator: Some(operator.to_string()),
            value: Some(serde_json::Value::String(value.to_string())),
        }
    }

    /// Returns the operand rendered as text (empty when absent).
    #[must_use]
    pub fn value_text(&self) -> Cow<'_, str> {
        self.value
            .as_ref()
            .and_then(value_text)
            .unwrap_or(Cow::Borrowed(""))
    }
}

/// Configured pairing of one feed with one destination site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Feed this connection reads from.
    pub feed_id: FeedId,
    /// Destination site this connection writes to.
    pub destination: DestinationKey,
    /// Destination field -> source column.
    #[serde(default)]
    pub field_mappings: FieldMappings,
    /// Source category token -> destination category id.
    #[serde(default)]
    pub category_mappings: CategoryMap,
    /// Source column holding the category path. See
    /// [`Connection::category_token`] for the fallback order.
    #[serde(default)]
    pub category_field: Option<String>,
    /// Preferred delimiter for hierarchical category paths.
    #[serde(default)]
    pub category_delimiter: Option<String>,
    /// Inclusion rules (OR semantics).
    #[serde(default)]
    pub filter_rules: Vec<FilterRule>,
    /// Cron-style schedule consumed by the external scheduler.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Inactive connections are never imported.
    #[serde(default = "default_active")]
    pub is_active: bool,
}

const fn default_active() -> bool {
    true
}

impl Connection {
    /// Returns the raw category string for `record`.
    ///
    /// Looks at the explicit `category_field`, then the source column mapped
    /// to the `categories` destination field, then [`DEFAULT_CATEGORY_FIELDS`].
    #[must_use]
    pub fn category_token<'a>(&self, record: &'a RawRecord) -> Option<Cow<'a, str>> {
        if let Some(field) = &self.category_field {
            return field_text(record, field).filter(|s| !s.trim().is_empty());
        }

        if let Some(field) = self.field_mappings.get("categories")
            && let Some(token) = field_text(record, field).filter(|s| !s.trim().is_empty())
        {
            return Some(token);
        }

        DEFAULT_CATEGORY_FIELDS
            .iter()
            .find_map(|field| field_text(record, field).filter(|s| !s.trim().is_empty()))
    }
}

/// Renders a scalar JSON value as text. Arrays, objects, and nulls yield
/// `None`.
#[must_use]
pub fn value_text(value: &serde_json::Value) -> Option<Cow<'_, str>> {
    match value {
        serde_json::Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        serde_json::Value::Number(n) => Some(Cow::Owned(n.to_string())),
        serde_json::Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        serde_json::Value::Null | serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            None
        }
    }
}

/// Returns `record[field]` rendered as text, if present and scalar.
#[must_use]
pub fn field_text<'a>(record: &'a RawRecord, field: &str) -> Option<Cow<'a, str>> {
    record.get(field).and_then(value_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: serde_json::Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn destination_key_strips_scheme_and_case() {
        let key = DestinationKey::new("https://Shop.Example.com/");
        assert_eq!(key.as_str(), "shop.example.com");
        assert_eq!(key, DestinationKey::new("shop.example.com"));
    }

    #[test]
    fn operator_parses_snake_case() {
        assert_eq!(
            "not_contains".parse::<FilterOperator>().unwrap(),
            FilterOperator::NotContains
        );
        assert!("between".parse::<FilterOperator>().is_err());
        assert_eq!(FilterOperator::GreaterThan.to_string(), "greater_than");
    }

    #[test]
    fn category_token_prefers_explicit_field() {
        let rec = record(serde_json::json!({"Cat": "Shoes > Running", "category": "Other"}));
        let conn = Connection {
            category_field: Some("Cat".to_string()),
            ..connection()
        };
        assert_eq!(conn.category_token(&rec).unwrap(), "Shoes > Running");
    }

    #[test]
    fn category_token_falls_back_to_mapping_then_defaults() {
        let rec = record(serde_json::json!({"Dept": "Garden", "category": "Other"}));
        let mut conn = connection();
        assert_eq!(conn.category_token(&rec).unwrap(), "Other");

        conn.field_mappings
            .insert("categories".to_string(), "Dept".to_string());
        assert_eq!(conn.category_token(&rec).unwrap(), "Garden");
    }

    #[test]
    fn numeric_fields_render_as_text() {
        let rec = record(serde_json::json!({"price": 12.5, "stock": null}));
        assert_eq!(field_text(&rec, "price").unwrap(), "12.5");
        assert!(field_text(&rec, "stock").is_none());
    }

    #[test]
    fn connection_deserializes_with_defaults() {
        let conn: Connection = toml::from_str(
            r#"
            id = 7
            feed_id = 3
            destination = "shop.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(conn.id, ConnectionId(7));
        assert!(conn.is_active);
        assert!(conn.filter_rules.is_empty());
    }

    fn connection() -> Connection {
        Connection {
            id: ConnectionId(1),
            feed_id: FeedId(1),
            destination: DestinationKey::new("shop.example.com"),
            field_mappings: FieldMappings::new(),
            category_mappings: CategoryMap::new(),
            category_field: None,
            category_delimiter: None,
            filter_rules: Vec::new(),
            schedule: None,
            is_active: true,
        }
    }
}
