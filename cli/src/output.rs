//! Table and value formatting for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Byte count in binary units with one decimal, e.g. `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Age of `dt` in its largest whole unit, e.g. `3 hours ago`.
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    const STEPS: [(i64, &str); 5] = [
        (60, "seconds"),
        (60, "minutes"),
        (24, "hours"),
        (30, "days"),
        (12, "months"),
    ];
    let mut amount = chrono::Utc::now().signed_duration_since(*dt).num_seconds();
    if amount < 0 {
        return "just now".to_string();
    }
    for (limit, unit) in STEPS {
        if amount < limit {
            return format!("{amount} {unit} ago");
        }
        amount /= limit;
    }
    format!("{} years ago", amount)
}

/// Shorten a digest to its algorithm plus 12 hex characters.
pub fn short_digest(digest: &str) -> String {
    match digest.split_once(':') {
        Some((algorithm, hex)) => format!("{}:{}", algorithm, truncate(hex, 12)),
        None => truncate(digest, 12).to_string(),
    }
}

fn truncate(s: &str, len: usize) -> &str {
    match s.char_indices().nth(len) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576 + 524288), "1.5 MB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024), "2.0 GB");
    }

    #[test]
    fn test_new_table_with_rows() {
        let mut table = new_table(&["REPOSITORY", "TAG"]);
        table.add_row(["docker.io/library/merged", "latest"]);
        let rendered = table.to_string();
        assert!(rendered.contains("REPOSITORY"));
        assert!(rendered.contains("docker.io/library/merged"));
    }

    #[test]
    fn test_format_ago() {
        assert!(format_ago(&(Utc::now() - Duration::seconds(5))).ends_with("seconds ago"));
        assert_eq!(format_ago(&(Utc::now() - Duration::minutes(5))), "5 minutes ago");
        assert_eq!(format_ago(&(Utc::now() - Duration::hours(3))), "3 hours ago");
        assert_eq!(format_ago(&(Utc::now() - Duration::days(2))), "2 days ago");
        assert_eq!(format_ago(&(Utc::now() - Duration::days(90))), "3 months ago");
        assert_eq!(format_ago(&(Utc::now() - Duration::days(800))), "2 years ago");
    }

    #[test]
    fn test_format_ago_future() {
        assert_eq!(format_ago(&(Utc::now() + Duration::hours(1))), "just now");
    }

    #[test]
    fn test_short_digest() {
        assert_eq!(
            short_digest("sha256:0123456789abcdef0123456789abcdef"),
            "sha256:0123456789ab"
        );
        assert_eq!(short_digest("sha256:abc"), "sha256:abc");
        assert_eq!(short_digest("0123456789abcdef"), "0123456789ab");
    }
}
