use chrono::{DateTime, TimeDelta, Utc};
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy)]
enum RuleOffset {
    Days(i64),
    CapturedDays { multiplier: i64 },
}

struct TimingRule {
    pattern: Regex,
    offset: RuleOffset,
}

impl TimingRule {
    fn new(pattern: &str, offset: RuleOffset) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("hardcoded regex"),
            offset,
        }
    }

    fn days(&self, caps: &Captures<'_>) -> Option<i64> {
        match self.offset {
            RuleOffset::Days(days) => Some(days),
            RuleOffset::CapturedDays { multiplier } => caps
                .get(1)?
                .as_str()
                .parse::<i64>()
                .ok()?
                .checked_mul(multiplier),
        }
    }
}

// First match wins. The exact `day 1` rule sits ahead of the general
// `day N` rule and requires a word boundary, so `day 10` falls through to it.
static TIMING_RULES: LazyLock<Vec<TimingRule>> = LazyLock::new(|| {
    vec![
        TimingRule::new(r"(?:immediately|right away|now|day\s*0)", RuleOffset::Days(0)),
        TimingRule::new(r"day\s*1\b", RuleOffset::Days(1)),
        TimingRule::new(
            r"day\s*(\d+)(?:\s*-\s*\d+)?",
            RuleOffset::CapturedDays { multiplier: 1 },
        ),
        TimingRule::new(
            r"(?:after\s+)?(\d+)\s*(?:day|d)s?\s*(?:later)?",
            RuleOffset::CapturedDays { multiplier: 1 },
        ),
        TimingRule::new(
            r"(?:after\s+)?(\d+)\s*(?:week|w)s?\s*(?:later)?",
            RuleOffset::CapturedDays { multiplier: 7 },
        ),
        TimingRule::new(
            r"(?:after\s+)?(\d+)\s*(?:month|mo)s?\s*(?:later)?",
            RuleOffset::CapturedDays { multiplier: 30 },
        ),
    ]
});

/// Offset described by a human timing phrase such as "Day 3-5" or "2 weeks later".
pub fn parse_timing_offset(timing: &str) -> Option<TimeDelta> {
    let normalized = timing.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    TIMING_RULES.iter().find_map(|rule| {
        let caps = rule.pattern.captures(&normalized)?;
        TimeDelta::try_days(rule.days(&caps)?)
    })
}

fn delay_days(step: &Map<String, Value>) -> Option<i64> {
    match step.get("delay_days")? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.is_finite()).map(|v| v.trunc() as i64)),
        Value::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Due date of plan step `step_index` (0-based), relative to `base`.
///
/// Tried in order: an integer `delay_days` field, then the `timing` phrase,
/// then `(step_index + 1) * default_spacing_days`.
pub fn parse_step_due_date(
    step: &Map<String, Value>,
    base: DateTime<Utc>,
    step_index: usize,
    default_spacing_days: i64,
) -> DateTime<Utc> {
    let explicit = delay_days(step).and_then(TimeDelta::try_days);
    let phrased = || {
        step.get("timing")
            .and_then(Value::as_str)
            .and_then(parse_timing_offset)
    };

    if let Some(due) = explicit
        .or_else(phrased)
        .and_then(|offset| base.checked_add_signed(offset))
    {
        return due;
    }

    let spacing = (step_index as i64)
        .saturating_add(1)
        .saturating_mul(default_spacing_days);
    TimeDelta::try_days(spacing)
        .and_then(|offset| base.checked_add_signed(offset))
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid base date")
    }

    fn step(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object step")
    }

    fn due_in_days(step_value: Value, index: usize) -> i64 {
        (parse_step_due_date(&step(step_value), base(), index, 3) - base()).num_days()
    }

    #[test]
    fn timing_phrases_map_to_day_offsets() {
        assert_eq!(due_in_days(json!({"timing": "Day 1"}), 0), 1);
        assert_eq!(due_in_days(json!({"timing": "3 days later"}), 0), 3);
        assert_eq!(due_in_days(json!({"timing": "2 weeks later"}), 0), 14);
        assert_eq!(due_in_days(json!({"timing": "after 1 month"}), 0), 30);
        assert_eq!(due_in_days(json!({"timing": "Immediately"}), 4), 0);
        assert_eq!(due_in_days(json!({"timing": "Day 3-5"}), 0), 3);
    }

    #[test]
    fn day_ten_is_not_read_as_day_one() {
        assert_eq!(due_in_days(json!({"timing": "Day 10"}), 0), 10);
    }

    #[test]
    fn explicit_delay_days_wins_over_timing_text() {
        assert_eq!(due_in_days(json!({"delay_days": 5, "timing": "Day 1"}), 0), 5);
        assert_eq!(due_in_days(json!({"delay_days": "2"}), 0), 2);
    }

    #[test]
    fn unusable_inputs_fall_back_to_position_spacing() {
        assert_eq!(due_in_days(json!({}), 2), 9);
        assert_eq!(due_in_days(json!({"timing": "when it feels right"}), 0), 3);
        assert_eq!(due_in_days(json!({"delay_days": "soon"}), 1), 6);
    }
}
