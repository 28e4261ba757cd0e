//! Field-level cleaning rules.
//!
//! Each rule targets one field; a record missing the field skips the
//! rule. Rule failures (bad pattern, unparseable date/number, invalid
//! email/phone) abort processing for the whole batch.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;

use crate::config::{CleaningRule, RuleType};
use crate::error::{ProcessError, ProcessResult};
use crate::record::{value_to_string, Record};

const DEFAULT_DATE_PATTERN: &str = "%Y-%m-%d";

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%d/%m/%Y"];

/// Apply every rule to every record, in order.
pub fn clean(records: Vec<Record>, rules: &[CleaningRule]) -> ProcessResult<Vec<Record>> {
    let mut cleaned = Vec::with_capacity(records.len());
    for mut record in records {
        for rule in rules {
            apply_rule(&mut record, rule)?;
        }
        cleaned.push(record);
    }
    Ok(cleaned)
}

fn apply_rule(record: &mut Record, rule: &CleaningRule) -> ProcessResult<()> {
    let Some(value) = record.get(&rule.field) else {
        return Ok(());
    };
    let input = value_to_string(value);

    let output = match rule.rule_type {
        RuleType::Trim => Value::String(input.trim().to_string()),
        RuleType::RemoveHtml => Value::String(remove_html(&input)),
        RuleType::Regex => Value::String(regex_replace(&input, rule)?),
        RuleType::Lowercase => Value::String(input.to_lowercase()),
        RuleType::Uppercase => Value::String(input.to_uppercase()),
        RuleType::NormalizeWhitespace => Value::String(normalize_whitespace(&input)),
        RuleType::RemoveSpecialChars => Value::String(remove_special_chars(&input)),
        RuleType::DateFormat => Value::String(format_date(&input, &rule.pattern)?),
        RuleType::NumberFormat => Value::from(parse_number(&input)?),
        RuleType::EmailValidate => Value::String(validate_email(&input)?),
        RuleType::PhoneFormat => Value::String(format_phone(&input)?),
        RuleType::UrlNormalize => Value::String(normalize_url(&input)),
    };

    record.insert(rule.field.clone(), output);
    Ok(())
}

fn remove_html(value: &str) -> String {
    // Pattern is a literal; compilation cannot fail.
    let tags = Regex::new(r"<[^>]*>").expect("static pattern");
    tags.replace_all(value, "").into_owned()
}

fn regex_replace(value: &str, rule: &CleaningRule) -> ProcessResult<String> {
    if rule.pattern.is_empty() {
        return Ok(value.to_string());
    }
    let pattern = Regex::new(&rule.pattern).map_err(|source| ProcessError::Pattern {
        rule: rule.name.clone(),
        source,
    })?;
    Ok(pattern.replace_all(value, rule.replacement.as_str()).into_owned())
}

fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn remove_special_chars(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect()
}

/// Parse with a priority list of common formats, emit in the target
/// pattern (default ISO date).
fn format_date(value: &str, pattern: &str) -> ProcessResult<String> {
    let parsed = parse_date(value).ok_or_else(|| ProcessError::UnparseableDate {
        value: value.to_string(),
    })?;

    let pattern = if pattern.is_empty() {
        DEFAULT_DATE_PATTERN
    } else {
        pattern
    };
    Ok(parsed.format(pattern).to_string())
}

fn parse_date(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Strip thousands separators and parse as a float.
fn parse_number(value: &str) -> ProcessResult<f64> {
    let cleaned: String = value.chars().filter(|c| *c != ',' && *c != ' ').collect();
    cleaned
        .trim()
        .parse::<f64>()
        .map_err(|_| ProcessError::UnparseableNumber {
            value: value.to_string(),
        })
}

fn validate_email(value: &str) -> ProcessResult<String> {
    let pattern =
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("static pattern");
    let cleaned = value.trim().to_lowercase();
    if !pattern.is_match(&cleaned) {
        return Err(ProcessError::InvalidEmail {
            value: value.to_string(),
        });
    }
    Ok(cleaned)
}

/// Digits-only, exactly 11 of them, emitted as xxx-xxxx-xxxx.
fn format_phone(value: &str) -> ProcessResult<String> {
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    if digits.len() != 11 {
        return Err(ProcessError::InvalidPhone {
            value: value.to_string(),
        });
    }
    Ok(format!("{}-{}-{}", &digits[0..3], &digits[3..7], &digits[7..11]))
}

fn normalize_url(value: &str) -> String {
    let mut cleaned = value.trim().to_string();
    if !cleaned.starts_with("http://") && !cleaned.starts_with("https://") {
        cleaned = format!("https://{cleaned}");
    }
    cleaned.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::record_from;
    use serde_json::json;

    fn rule(field: &str, rule_type: RuleType) -> CleaningRule {
        CleaningRule {
            name: String::new(),
            field: field.to_string(),
            rule_type,
            pattern: String::new(),
            replacement: String::new(),
        }
    }

    #[test]
    fn test_trim_is_idempotent() {
        let records = vec![record_from([("name", json!("  Alice  "))])];
        let once = clean(records, &[rule("name", RuleType::Trim)]).unwrap();
        assert_eq!(once[0].get("name").unwrap(), "Alice");

        let twice = clean(once, &[rule("name", RuleType::Trim)]).unwrap();
        assert_eq!(twice[0].get("name").unwrap(), "Alice");
    }

    #[test]
    fn test_missing_field_is_skipped() {
        let records = vec![record_from([("other", json!("x"))])];
        let cleaned = clean(records, &[rule("name", RuleType::Trim)]).unwrap();
        assert_eq!(cleaned[0].get("other").unwrap(), "x");
    }

    #[test]
    fn test_remove_html() {
        let records = vec![record_from([("body", json!("<p>Hello <b>world</b></p>"))])];
        let cleaned = clean(records, &[rule("body", RuleType::RemoveHtml)]).unwrap();
        assert_eq!(cleaned[0].get("body").unwrap(), "Hello world");
    }

    #[test]
    fn test_regex_replace() {
        let mut r = rule("code", RuleType::Regex);
        r.pattern = r"\d+".to_string();
        r.replacement = "#".to_string();

        let records = vec![record_from([("code", json!("a1b22c333"))])];
        let cleaned = clean(records, &[r]).unwrap();
        assert_eq!(cleaned[0].get("code").unwrap(), "a#b#c#");
    }

    #[test]
    fn test_regex_invalid_pattern_fails() {
        let mut r = rule("code", RuleType::Regex);
        r.pattern = "[".to_string();

        let records = vec![record_from([("code", json!("x"))])];
        assert!(matches!(
            clean(records, &[r]),
            Err(ProcessError::Pattern { .. })
        ));
    }

    #[test]
    fn test_normalize_whitespace() {
        let records = vec![record_from([("text", json!("  a \t b\n\nc "))])];
        let cleaned = clean(records, &[rule("text", RuleType::NormalizeWhitespace)]).unwrap();
        assert_eq!(cleaned[0].get("text").unwrap(), "a b c");
    }

    #[test]
    fn test_remove_special_chars_keeps_unicode_letters() {
        let records = vec![record_from([("text", json!("héllo, wörld! 42"))])];
        let cleaned = clean(records, &[rule("text", RuleType::RemoveSpecialChars)]).unwrap();
        assert_eq!(cleaned[0].get("text").unwrap(), "héllo wörld 42");
    }

    #[test]
    fn test_date_format_priority_list() {
        for input in ["2024-03-09", "2024/03/09", "09-03-2024", "09/03/2024"] {
            let records = vec![record_from([("day", json!(input))])];
            let cleaned = clean(records, &[rule("day", RuleType::DateFormat)]).unwrap();
            assert_eq!(cleaned[0].get("day").unwrap(), "2024-03-09", "input {input}");
        }
    }

    #[test]
    fn test_date_format_custom_pattern_and_rfc3339() {
        let mut r = rule("ts", RuleType::DateFormat);
        r.pattern = "%d/%m/%Y".to_string();

        let records = vec![record_from([("ts", json!("2024-03-09T10:30:00Z"))])];
        let cleaned = clean(records, &[r]).unwrap();
        assert_eq!(cleaned[0].get("ts").unwrap(), "09/03/2024");
    }

    #[test]
    fn test_date_format_unparseable_fails() {
        let records = vec![record_from([("day", json!("not a date"))])];
        assert!(matches!(
            clean(records, &[rule("day", RuleType::DateFormat)]),
            Err(ProcessError::UnparseableDate { .. })
        ));
    }

    #[test]
    fn test_number_format_strips_separators() {
        let records = vec![record_from([("amount", json!("1,234.56"))])];
        let cleaned = clean(records, &[rule("amount", RuleType::NumberFormat)]).unwrap();
        assert_eq!(cleaned[0].get("amount").unwrap(), &json!(1234.56));
    }

    #[test]
    fn test_number_format_rejects_garbage() {
        let records = vec![record_from([("amount", json!("12abc"))])];
        assert!(matches!(
            clean(records, &[rule("amount", RuleType::NumberFormat)]),
            Err(ProcessError::UnparseableNumber { .. })
        ));
    }

    #[test]
    fn test_email_validate_lowercases() {
        let records = vec![record_from([("email", json!("  Alice@Example.COM "))])];
        let cleaned = clean(records, &[rule("email", RuleType::EmailValidate)]).unwrap();
        assert_eq!(cleaned[0].get("email").unwrap(), "alice@example.com");
    }

    #[test]
    fn test_email_validate_rejects_short_tld() {
        let records = vec![record_from([("email", json!("a@b"))])];
        assert!(matches!(
            clean(records, &[rule("email", RuleType::EmailValidate)]),
            Err(ProcessError::InvalidEmail { .. })
        ));
    }

    #[test]
    fn test_phone_format() {
        let records = vec![record_from([("phone", json!("(138) 0013 8000"))])];
        let cleaned = clean(records, &[rule("phone", RuleType::PhoneFormat)]).unwrap();
        assert_eq!(cleaned[0].get("phone").unwrap(), "138-0013-8000");
    }

    #[test]
    fn test_phone_format_rejects_wrong_length() {
        let records = vec![record_from([("phone", json!("12345"))])];
        assert!(matches!(
            clean(records, &[rule("phone", RuleType::PhoneFormat)]),
            Err(ProcessError::InvalidPhone { .. })
        ));
    }

    #[test]
    fn test_url_normalize() {
        let records = vec![record_from([("url", json!(" example.com/path/ "))])];
        let cleaned = clean(records, &[rule("url", RuleType::UrlNormalize)]).unwrap();
        assert_eq!(cleaned[0].get("url").unwrap(), "https://example.com/path");

        let records = vec![record_from([("url", json!("http://example.com"))])];
        let cleaned = clean(records, &[rule("url", RuleType::UrlNormalize)]).unwrap();
        assert_eq!(cleaned[0].get("url").unwrap(), "http://example.com");
    }
}
