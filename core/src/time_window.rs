use crate::error::McodaError;
use chrono::{DateTime, Duration, Utc};

/// Parses `since`/`until` values per spec.md §4.1: either an RFC-3339
/// timestamp or a duration shorthand `N{s,m,h,d,w}` measured back from now.
pub fn parse_time_bound(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, McodaError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(McodaError::BadTimeRange("empty time value".into()));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    parse_shorthand(trimmed, now)
}

fn parse_shorthand(raw: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, McodaError> {
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let amount: i64 = digits.parse().map_err(|_| {
        McodaError::BadTimeRange(format!("'{raw}' is neither RFC-3339 nor N{{s,m,h,d,w}}"))
    })?;
    if amount < 0 {
        return Err(McodaError::BadTimeRange(format!(
            "'{raw}' duration must be non-negative"
        )));
    }
    let delta = match unit {
        "s" => Duration::seconds(amount),
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        "w" => Duration::weeks(amount),
        other => {
            return Err(McodaError::BadTimeRange(format!(
                "unknown duration unit '{other}' in '{raw}'"
            )))
        }
    };
    Ok(now - delta)
}

/// Validates that `since <= until` once both bounds are resolved; spec.md
/// doesn't name the error for an inverted range explicitly but `BadTimeRange`
/// is the closed taxonomy member for all time-window problems.
pub fn validate_range(
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> Result<(), McodaError> {
    if let (Some(s), Some(u)) = (since, until) {
        if s > u {
            return Err(McodaError::BadTimeRange(format!(
                "since ({s}) must not be after until ({u})"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_rfc3339() {
        let parsed = parse_time_bound("2025-06-01T00:00:00Z", fixed_now()).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-06-01T00:00:00+00:00");
    }

    #[test]
    fn parses_shorthand_durations() {
        let now = fixed_now();
        assert_eq!(parse_time_bound("1h", now).unwrap(), now - Duration::hours(1));
        assert_eq!(parse_time_bound("7d", now).unwrap(), now - Duration::days(7));
        assert_eq!(parse_time_bound("2w", now).unwrap(), now - Duration::weeks(2));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_time_bound("not-a-time", fixed_now()).is_err());
        assert!(parse_time_bound("5x", fixed_now()).is_err());
        assert!(parse_time_bound("", fixed_now()).is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        let now = fixed_now();
        let since = now;
        let until = now - Duration::hours(1);
        assert!(validate_range(Some(since), Some(until)).is_err());
    }
}
