//! Text rendering for deployment health reports.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde_json::Value;

/// Parse a provider timestamp.
///
/// The CLI reports RFC 3339 strings; epoch seconds are accepted too.
pub fn parse_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            Utc.timestamp_opt(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
                .single()
        }
        _ => None,
    }
}

/// `Mar 12, 2018 02:22:33 UTC` in the given offset, or `N/A`.
pub fn format_time(time: Option<DateTime<Utc>>, utc_offset: i32) -> String {
    let Some(time) = time else {
        return "N/A".to_string();
    };
    let Some(zone) = FixedOffset::east_opt(utc_offset) else {
        return time.format("%b %d, %Y %I:%M:%S UTC").to_string();
    };

    let local = time.with_timezone(&zone).format("%b %d, %Y %I:%M:%S");
    if utc_offset == 0 {
        format!("{local} UTC")
    } else {
        format!("{local} {zone}")
    }
}

/// Elapsed time between two instants, empty when either is unknown.
pub fn format_duration(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> String {
    match (start, end) {
        (Some(start), Some(end)) => duration_bucket((end - start).num_seconds().max(0)),
        _ => String::new(),
    }
}

/// Seconds under a minute, minutes and seconds under an hour, else hours and minutes.
pub fn duration_bucket(total: i64) -> String {
    if total < 60 {
        format!("{total} sec")
    } else if total < 3600 {
        format!("{} min, {} sec", total / 60, total % 60)
    } else {
        format!("{} hr, {} min", total / 3600, (total % 3600) / 60)
    }
}

/// Render rows as `|`-separated columns padded to `widths`.
///
/// Cells longer than their column are not truncated.
pub fn render_table(rows: &[Vec<String>], widths: &[usize]) -> String {
    rows.iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, cell)| {
                    let width = widths.get(i).copied().unwrap_or(0);
                    format!("{cell:<width$}")
                })
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Header row followed by a row of dashes matching each column width.
pub fn header_rows(headers: &[&str], widths: &[usize]) -> Vec<Vec<String>> {
    vec![
        headers.iter().map(|h| h.to_string()).collect(),
        widths.iter().map(|w| "-".repeat(*w)).collect(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duration_buckets() {
        assert_eq!(duration_bucket(45), "45 sec");
        assert_eq!(duration_bucket(59), "59 sec");
        assert_eq!(duration_bucket(60), "1 min, 0 sec");
        assert_eq!(duration_bucket(3599), "59 min, 59 sec");
        assert_eq!(duration_bucket(3600), "1 hr, 0 min");
        assert_eq!(duration_bucket(125), "2 min, 5 sec");
        assert_eq!(duration_bucket(7500), "2 hr, 5 min");
    }

    #[test]
    fn test_duration_needs_both_ends() {
        let start = parse_time(Some(&json!("2018-03-12T14:00:00Z")));
        let end = parse_time(Some(&json!("2018-03-12T14:02:05Z")));
        assert_eq!(format_duration(start, end), "2 min, 5 sec");
        assert_eq!(format_duration(start, None), "");
        assert_eq!(format_duration(None, end), "");
    }

    #[test]
    fn test_parse_epoch_and_rfc3339() {
        let a = parse_time(Some(&json!(1520863353.5))).unwrap();
        let b = parse_time(Some(&json!("2018-03-12T10:02:33.5-04:00"))).unwrap();
        assert_eq!(a.timestamp(), b.timestamp());
        assert_eq!(parse_time(Some(&json!(null))), None);
        assert_eq!(parse_time(None), None);
    }

    #[test]
    fn test_format_time() {
        let time = parse_time(Some(&json!("2018-03-12T14:22:33Z")));
        assert_eq!(format_time(time, 0), "Mar 12, 2018 02:22:33 UTC");
        assert_eq!(format_time(time, -5 * 3600), "Mar 12, 2018 09:22:33 -05:00");
        assert_eq!(format_time(None, 0), "N/A");
    }

    #[test]
    fn test_render_table_pads_columns() {
        let mut rows = header_rows(&["Name", "Status"], &[6, 4]);
        rows.push(vec!["Install".to_string(), "Ok".to_string()]);
        assert_eq!(
            render_table(&rows, &[6, 4]),
            "Name   | Status\n------ | ----\nInstall | Ok  "
        );
    }
}
