//! Normalizes the document store's heterogeneous timestamp shapes into one
//! comparable instant.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Converts any value the store may hand back for a timestamp field into an
/// instant. Accepts an RFC 3339 string, a `{seconds, nanoseconds}` pair, or
/// epoch milliseconds; `null`, the unresolved server-timestamp sentinel, and
/// anything else map to `None`. Pure and total.
pub fn to_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(raw) => raw.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::Object(fields) => {
            let seconds = fields.get("seconds")?.as_i64()?;
            let nanoseconds = fields.get("nanoseconds")?.as_i64()?;
            DateTime::from_timestamp_millis(
                seconds
                    .checked_mul(1000)?
                    .checked_add(nanoseconds / 1_000_000)?,
            )
        }
        _ => None,
    }
}

/// Ordering key that sorts unset timestamps first.
pub fn instant_or_epoch(value: Option<DateTime<Utc>>) -> DateTime<Utc> {
    value.unwrap_or(DateTime::UNIX_EPOCH)
}

/// Human-readable age of `then` relative to `now`, for roster subtitles.
pub fn format_relative_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(then);
    if elapsed.num_seconds() < 60 {
        return "just now".to_string();
    }
    if elapsed.num_minutes() < 60 {
        return format!("{}m ago", elapsed.num_minutes());
    }
    if elapsed.num_hours() < 24 {
        return format!("{}h ago", elapsed.num_hours());
    }
    if elapsed.num_days() < 7 {
        return format!("{}d ago", elapsed.num_days());
    }
    then.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn converts_seconds_nanoseconds_pairs() {
        let instant = to_instant(&json!({ "seconds": 1_700_000_000, "nanoseconds": 987_654_321 }))
            .expect("instant");
        assert_eq!(instant.timestamp_millis(), 1_700_000_000_987);
    }

    #[test]
    fn converts_rfc3339_and_millis() {
        let from_text = to_instant(&json!("2024-03-01T12:00:00Z")).expect("instant");
        let from_millis = to_instant(&json!(from_text.timestamp_millis())).expect("instant");
        assert_eq!(from_text, from_millis);
    }

    #[test]
    fn is_total_over_junk_input() {
        assert_eq!(to_instant(&Value::Null), None);
        assert_eq!(to_instant(&json!(true)), None);
        assert_eq!(to_instant(&json!("not a date")), None);
        assert_eq!(to_instant(&json!({ "seconds": "soon" })), None);
        assert_eq!(to_instant(&json!([1, 2])), None);
    }

    #[test]
    fn extreme_pairs_map_to_none_instead_of_overflowing() {
        assert_eq!(
            to_instant(&json!({ "seconds": i64::MAX / 1000, "nanoseconds": 999_999_999 })),
            None
        );
        assert_eq!(
            to_instant(&json!({ "seconds": i64::MAX, "nanoseconds": 0 })),
            None
        );
        assert_eq!(
            to_instant(&json!({ "seconds": i64::MIN, "nanoseconds": 0 })),
            None
        );
    }

    #[test]
    fn unset_timestamps_sort_first() {
        let set = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(instant_or_epoch(None) < instant_or_epoch(Some(set)));
    }

    #[test]
    fn renders_minutes_and_days() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(
            format_relative_time(now - chrono::Duration::minutes(2), now),
            "2m ago"
        );
        assert_eq!(
            format_relative_time(now - chrono::Duration::days(3), now),
            "3d ago"
        );
        assert_eq!(
            format_relative_time(now - chrono::Duration::seconds(5), now),
            "just now"
        );
    }
}
