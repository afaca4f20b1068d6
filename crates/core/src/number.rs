//! Lenient numeric coercion for provider payloads.
//!
//! Provider records mix real numbers, numeric strings (`"1500"`, `"$1,500"`)
//! and sentinel strings such as `"Other"` or `"Unknown"`. Sentinels must map
//! to an absent value, never to zero, so downstream filters do not treat an
//! unknown valuation as a free house.

use serde_json::Value;

/// Coerce a JSON value into a finite `f64`.
///
/// Returns `None` for `null`, booleans, arrays, objects, empty strings and
/// any string that does not parse as a number after stripping currency
/// symbols, thousands separators and a trailing percent sign.
pub fn safe_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => parse_numeric_str(s),
        _ => None,
    }
}

/// Like [`safe_number`], for fields that are whole numbers (beds, year built).
///
/// Fractional inputs are rounded to the nearest integer.
pub fn safe_integer(value: &Value) -> Option<i64> {
    let n = safe_number(value)?;
    if n < i64::MIN as f64 || n > i64::MAX as f64 {
        return None;
    }
    Some(n.round() as i64)
}

/// Coerce provider flag values (`1`/`0`, `"Yes"`/`"No"`, `true`/`false`).
pub fn safe_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "y" | "yes" | "true" => Some(true),
            "0" | "n" | "no" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Trimmed, non-empty string value. Numbers are rendered as text.
pub fn safe_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_numeric_str(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_end_matches('%')
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();

    if cleaned.is_empty() {
        return None;
    }

    cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn sentinel_strings_are_absent() {
        assert_eq!(safe_number(&json!("Other")), None);
        assert_eq!(safe_number(&json!("Unknown")), None);
        assert_eq!(safe_number(&json!("")), None);
        assert_eq!(safe_number(&json!("   ")), None);
    }

    #[test]
    fn numeric_strings_parse() {
        assert_eq!(safe_number(&json!("1500")), Some(1500.0));
        assert_eq!(safe_number(&json!("$1,500")), Some(1500.0));
        assert_eq!(safe_number(&json!(" 3.25 ")), Some(3.25));
        assert_eq!(safe_number(&json!("42.5%")), Some(42.5));
    }

    #[test]
    fn null_and_non_scalars_are_absent() {
        assert_eq!(safe_number(&Value::Null), None);
        assert_eq!(safe_number(&json!(true)), None);
        assert_eq!(safe_number(&json!([1])), None);
        assert_eq!(safe_number(&json!({"v": 1})), None);
    }

    #[test]
    fn real_numbers_pass_through() {
        assert_eq!(safe_number(&json!(1500)), Some(1500.0));
        assert_eq!(safe_number(&json!(0)), Some(0.0));
        assert_eq!(safe_number(&json!(-12.5)), Some(-12.5));
    }

    #[test]
    fn non_finite_strings_are_rejected() {
        assert_eq!(safe_number(&json!("NaN")), None);
        assert_eq!(safe_number(&json!("inf")), None);
    }

    #[test]
    fn integers_round() {
        assert_eq!(safe_integer(&json!("3")), Some(3));
        assert_eq!(safe_integer(&json!(2.5)), Some(3));
        assert_eq!(safe_integer(&json!("Unknown")), None);
    }

    #[test]
    fn flags() {
        assert_eq!(safe_flag(&json!(1)), Some(true));
        assert_eq!(safe_flag(&json!("No")), Some(false));
        assert_eq!(safe_flag(&json!("maybe")), None);
        assert_eq!(safe_flag(&Value::Null), None);
    }

    #[test]
    fn text_is_trimmed() {
        assert_eq!(safe_text(&json!("  Main St ")), Some("Main St".to_string()));
        assert_eq!(safe_text(&json!("")), None);
        assert_eq!(safe_text(&json!(12345)), Some("12345".to_string()));
    }

    proptest! {
        #[test]
        fn integer_strings_round_trip(n in any::<i32>()) {
            prop_assert_eq!(safe_number(&json!(n.to_string())), Some(n as f64));
        }

        #[test]
        fn alphabetic_strings_never_become_numbers(s in "[A-Za-z]{1,12}") {
            // "inf"/"infinity"/"nan" parse as non-finite floats and are filtered.
            prop_assert_eq!(safe_number(&json!(s)), None);
        }
    }
}
