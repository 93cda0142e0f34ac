//! Connection definitions loaded from TOML.
//!
//! ```toml
//! id = 12
//! feed_id = 4
//! destination = "https://shop.example.com"
//! category_field = "Cat"
//! category_delimiter = " > "
//!
//! [field_mappings]
//! name = "Title"
//! regular_price = "Price"
//! sku = "SKU"
//!
//! [category_mappings]
//! Running = 42
//!
//! [[filter_rules]]
//! field = "Brand"
//! operator = "equals"
//! value = "Acme"
//! ```

use std::path::Path;

use elementa_feed_models::{Connection, FilterOperator};

use crate::FeedError;

/// Parses and validates a [`Connection`] from a TOML string.
///
/// # Errors
///
/// Returns [`FeedError::InvalidConnection`] if the TOML is malformed or the
/// definition fails [`validate_connection`].
pub fn parse_connection_toml(toml_str: &str) -> Result<Connection, FeedError> {
    let connection: Connection =
        toml::from_str(toml_str).map_err(|e| FeedError::InvalidConnection {
            message: e.to_string(),
        })?;
    validate_connection(&connection)?;
    Ok(connection)
}

/// Reads a connection definition from disk.
///
/// # Errors
///
/// Returns [`FeedError::Io`] if the file cannot be read, or
/// [`FeedError::InvalidConnection`] if it does not parse or validate.
pub fn load_connection(path: &Path) -> Result<Connection, FeedError> {
    let contents = std::fs::read_to_string(path)?;
    parse_connection_toml(&contents).map_err(|e| match e {
        FeedError::InvalidConnection { message } => FeedError::InvalidConnection {
            message: format!("{}: {message}", path.display()),
        },
        other => other,
    })
}

/// Checks a connection for configuration mistakes.
///
/// Unknown filter operators are rejected here so they never reach the
/// pipeline. Rules with a missing field or operator are legal and skipped
/// during evaluation.
///
/// # Errors
///
/// Returns [`FeedError::InvalidConnection`] describing the first problem.
pub fn validate_connection(connection: &Connection) -> Result<(), FeedError> {
    let invalid = |message: String| FeedError::InvalidConnection {
        message: format!("connection {}: {message}", connection.id),
    };

    if connection.destination.as_str().is_empty() {
        return Err(invalid("destination is empty".to_string()));
    }

    for (index, rule) in connection.filter_rules.iter().enumerate() {
        if let Some(operator) = &rule.operator
            && operator.parse::<FilterOperator>().is_err()
        {
            return Err(invalid(format!(
                "filter rule {index} has unknown operator {operator:?}"
            )));
        }
    }

    for (destination_field, source_field) in &connection.field_mappings {
        if destination_field.trim().is_empty() || source_field.trim().is_empty() {
            return Err(invalid(format!(
                "field mapping {destination_field:?} -> {source_field:?} has an empty side"
            )));
        }
    }

    if let Some(delimiter) = &connection.category_delimiter
        && delimiter.is_empty()
    {
        return Err(invalid("category_delimiter is empty".to_string()));
    }

    Ok(())
}
