//! Cron expression handling.
//!
//! The control plane stores 5-field (minute..weekday) and 6-field
//! (second..weekday) expressions, and tolerates Quartz-style `?`. The
//! `cron` crate wants a seconds field, so 5-field expressions gain a
//! leading `0` and `?` becomes `*` before parsing.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Next fire time strictly after `after`.
pub fn next_run_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let normalized = normalize(expression)?;
    let schedule = cron::Schedule::from_str(&normalized)
        .with_context(|| format!("unparseable cron expression {expression:?}"))?;

    schedule
        .after(&after)
        .next()
        .with_context(|| format!("cron expression {expression:?} has no upcoming fire time"))
}

fn normalize(expression: &str) -> Result<String> {
    let cleaned = expression.trim().replace('?', "*");
    match cleaned.split_whitespace().count() {
        5 => Ok(format!("0 {cleaned}")),
        6 | 7 => Ok(cleaned),
        n => bail!("cron expression {expression:?} has {n} fields (expected 5 or 6)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_expression() {
        let after = Utc.with_ymd_and_hms(2024, 3, 9, 10, 2, 30).unwrap();
        let next = next_run_after("*/5 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 9, 10, 5, 0).unwrap());
    }

    #[test]
    fn test_six_field_expression() {
        let after = Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap();
        let next = next_run_after("30 * * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 30).unwrap());
    }

    #[test]
    fn test_quartz_question_mark_is_tolerated() {
        let after = Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap();
        let next = next_run_after("0 12 * * ?", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_next_is_strictly_in_the_future() {
        let after = Utc.with_ymd_and_hms(2024, 3, 9, 10, 5, 0).unwrap();
        let next = next_run_after("*/5 * * * *", after).unwrap();
        assert!(next > after);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(next_run_after("not a cron", Utc::now()).is_err());
        assert!(next_run_after("* *", Utc::now()).is_err());
        assert!(next_run_after("99 99 * * *", Utc::now()).is_err());
    }
}
