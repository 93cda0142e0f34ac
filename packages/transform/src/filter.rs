//! Inclusion rules for feed records.
//!
//! Rules are OR-ed: a record is kept as soon as any single rule matches,
//! and rejected when none does. An empty rule set keeps everything.
//! Incomplete rules (no field or operator) and rules whose field is absent
//! from the record are skipped without counting as a match.

use elementa_feed_models::{FilterOperator, FilterRule, RawRecord, value_text};

/// Returns `true` if `record` should be syndicated under `rules`.
#[must_use]
pub fn passes(record: &RawRecord, rules: &[FilterRule]) -> bool {
    if rules.is_empty() {
        return true;
    }

    rules.iter().any(|rule| evaluate(record, rule) == Some(true))
}

/// Evaluates a single rule. `None` means the rule was skipped.
#[must_use]
pub fn evaluate(record: &RawRecord, rule: &FilterRule) -> Option<bool> {
    let field = rule.field.as_deref()?;
    let operator = rule.operator.as_deref()?;
    let raw = record.get(field)?;

    let Ok(operator) = operator.parse::<FilterOperator>() else {
        log::warn!("Filter rule on {field:?} has unknown operator {operator:?}, treating as no match");
        return Some(false);
    };

    let actual = value_text(raw).unwrap_or_default();
    let expected = rule.value_text();

    Some(apply(operator, &actual, &expected))
}

fn apply(operator: FilterOperator, actual: &str, expected: &str) -> bool {
    match operator {
        FilterOperator::Equals => actual.to_lowercase() == expected.to_lowercase(),
        FilterOperator::NotEquals => actual.to_lowercase() != expected.to_lowercase(),
        FilterOperator::Contains => actual.to_lowercase().contains(&expected.to_lowercase()),
        FilterOperator::NotContains => !actual.to_lowercase().contains(&expected.to_lowercase()),
        FilterOperator::GreaterThan => {
            compare_numbers(actual, expected).is_some_and(|(a, b)| a > b)
        }
        FilterOperator::LessThan => compare_numbers(actual, expected).is_some_and(|(a, b)| a < b),
        FilterOperator::IsEmpty => actual.trim().is_empty(),
        FilterOperator::IsNotEmpty => !actual.trim().is_empty(),
    }
}

fn compare_numbers(actual: &str, expected: &str) -> Option<(f64, f64)> {
    Some((parse_number(actual)?, parse_number(expected)?))
}

/// Parses a feed number, tolerating currency symbols and thousands
/// separators (`"$1,299.00"` -> `1299.0`).
fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    let negative = trimmed
        .chars()
        .take_while(|c| !c.is_ascii_digit() && *c != '.')
        .any(|c| c == '-');
    let digits: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() {
        return None;
    }
    let value = digits.parse::<f64>().ok()?;
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: serde_json::Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    fn rule(field: &str, operator: FilterOperator, value: &str) -> FilterRule {
        FilterRule::new(field, operator, value)
    }

    #[test]
    fn empty_rules_pass_everything() {
        assert!(passes(&record(json!({})), &[]));
        assert!(passes(&record(json!({"Brand": "Acme"})), &[]));
    }

    #[test]
    fn any_matching_rule_passes() {
        let rec = record(json!({"Brand": "Acme", "Price": "5.00"}));
        let rules = [
            rule("Brand", FilterOperator::Equals, "Globex"),
            rule("Price", FilterOperator::LessThan, "10"),
        ];
        assert!(passes(&rec, &rules));
    }

    #[test]
    fn does_not_require_all_rules() {
        let rec = record(json!({"Brand": "acme", "Price": "50"}));
        let rules = [
            rule("Brand", FilterOperator::Equals, "ACME"),
            rule("Price", FilterOperator::LessThan, "10"),
        ];
        assert!(passes(&rec, &rules));
    }

    #[test]
    fn rejects_when_no_rule_matches() {
        let rec = record(json!({"Brand": "Initech"}));
        let rules = [
            rule("Brand", FilterOperator::Equals, "Acme"),
            rule("Brand", FilterOperator::Contains, "globe"),
        ];
        assert!(!passes(&rec, &rules));
    }

    #[test]
    fn skipped_rules_never_match() {
        let rec = record(json!({"Brand": "Acme"}));
        let incomplete = FilterRule {
            field: Some("Brand".to_string()),
            operator: None,
            value: None,
        };
        let missing_field = rule("Color", FilterOperator::IsEmpty, "");
        assert_eq!(evaluate(&rec, &incomplete), None);
        assert_eq!(evaluate(&rec, &missing_field), None);
        assert!(!passes(&rec, &[incomplete, missing_field]));
    }

    #[test]
    fn unknown_operator_evaluates_false() {
        let rec = record(json!({"Brand": "Acme"}));
        let bogus = FilterRule {
            field: Some("Brand".to_string()),
            operator: Some("sounds_like".to_string()),
            value: Some(json!("Acme")),
        };
        assert_eq!(evaluate(&rec, &bogus), Some(false));
    }

    #[test]
    fn string_operators_ignore_case() {
        let rec = record(json!({"Title": "Trail Running Shoe"}));
        assert!(passes(&rec, &[rule("Title", FilterOperator::Contains, "RUNNING")]));
        assert!(!passes(&rec, &[rule("Title", FilterOperator::NotContains, "running")]));
        assert!(passes(&rec, &[rule("Title", FilterOperator::NotEquals, "sock")]));
    }

    #[test]
    fn numeric_operators_parse_prices() {
        let rec = record(json!({"Price": "$1,299.00"}));
        assert!(passes(&rec, &[rule("Price", FilterOperator::GreaterThan, "1000")]));
        assert!(!passes(&rec, &[rule("Price", FilterOperator::LessThan, "1000")]));
        let numeric = FilterRule {
            field: Some("Price".to_string()),
            operator: Some("less_than".to_string()),
            value: Some(json!(1500)),
        };
        assert!(passes(&rec, &[numeric]));
    }

    #[test]
    fn minus_after_currency_symbol_is_negative() {
        assert_eq!(parse_number("$-5"), Some(-5.0));
        assert_eq!(parse_number("- 2.50"), Some(-2.5));
        assert_eq!(parse_number("-$1,000"), Some(-1000.0));
        assert_eq!(parse_number("5-7"), Some(57.0));
        let rec = record(json!({"Price": "$-5"}));
        assert!(passes(&rec, &[rule("Price", FilterOperator::LessThan, "0")]));
    }

    #[test]
    fn non_numeric_values_never_compare() {
        let rec = record(json!({"Price": "call us"}));
        assert!(!passes(&rec, &[rule("Price", FilterOperator::GreaterThan, "0")]));
        assert!(!passes(&rec, &[rule("Price", FilterOperator::LessThan, "0")]));
    }

    #[test]
    fn emptiness_operators_trim() {
        let rec = record(json!({"Sale": "  ", "Stock": null}));
        assert!(passes(&rec, &[rule("Sale", FilterOperator::IsEmpty, "")]));
        assert!(!passes(&rec, &[rule("Sale", FilterOperator::IsNotEmpty, "")]));
        assert!(passes(&rec, &[rule("Stock", FilterOperator::IsEmpty, "")]));
    }
}
