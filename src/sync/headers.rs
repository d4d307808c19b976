//! Header lookup and permissive `Date` parsing.

use chrono::{DateTime, TimeZone, Utc};

/// First header named `name`, compared case-insensitively.
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Parse a `Date` header value.
///
/// Tries RFC 2822 first, then the more forgiving RFC 822 parser from
/// `mail-parser` (obsolete zones, missing weekday, two-digit years), then
/// RFC 3339. Returns `None` when nothing matches.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = strip_trailing_comment(value.trim());
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Some(dt) = mail_parser::DateTime::parse_rfc822(trimmed)
        && let Some(utc) = Utc.timestamp_opt(dt.to_timestamp(), 0).single()
    {
        return Some(utc);
    }

    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Drop a trailing `(comment)` such as `(UTC)` or `(Pacific Standard Time)`.
fn strip_trailing_comment(value: &str) -> &str {
    if value.ends_with(')')
        && let Some(open) = value.rfind('(')
    {
        return value[..open].trim_end();
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> Vec<(String, String)> {
        vec![
            ("From".into(), "Ada <ada@example.com>".into()),
            ("subject".into(), "Quarterly report".into()),
            ("Subject".into(), "ignored duplicate".into()),
        ]
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let h = headers();
        assert_eq!(find_header(&h, "Subject"), Some("Quarterly report"));
        assert_eq!(find_header(&h, "FROM"), Some("Ada <ada@example.com>"));
        assert_eq!(find_header(&h, "Date"), None);
    }

    #[test]
    fn parses_rfc2822() {
        let dt = parse_date("Tue, 1 Jul 2025 10:52:37 +0200").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-07-01T08:52:37+00:00");
    }

    #[test]
    fn parses_with_trailing_comment() {
        let dt = parse_date("Wed, 02 Oct 2024 15:00:00 +0000 (UTC)").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-10-02T15:00:00+00:00");
    }

    #[test]
    fn parses_rfc3339() {
        let dt = parse_date("2024-10-02T15:00:00Z").unwrap();
        assert_eq!(dt.timestamp(), 1_727_881_200);
    }

    #[test]
    fn garbage_is_none() {
        assert!(parse_date("").is_none());
        assert!(parse_date("not a date").is_none());
    }
}
