use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{DateRange, week_bucket};

pub const LESSONS: &str = "lessons";
pub const SLOTS: &str = "slots";

/// Key for a list query over `range`, e.g.
/// `slots:week:2024-W12:2024-03-24..2024-03-24:all`.
///
/// Ranges inside one ISO week live under that week's bucket; wider ranges live
/// under `all`, so invalidating a date's week bucket plus `all` reaches every
/// key whose range can contain that date.
pub fn scope_key(resource: &str, range: DateRange, teacher_id: Option<Ulid>) -> String {
    let window = match range.single_week() {
        Some(bucket) => format!("week:{bucket}"),
        None => "all".to_string(),
    };
    let teacher = teacher_id.map_or_else(|| "all".to_string(), |t| t.to_string());
    format!("{resource}:{window}:{}..{}:{teacher}", range.from, range.to)
}

/// Patterns that drop every cached slot list which may include `date`.
pub fn slot_invalidations(date: NaiveDate) -> [String; 2] {
    [
        format!("{SLOTS}:week:{}:*", week_bucket(date)),
        format!("{SLOTS}:all:*"),
    ]
}

pub fn lesson_invalidation() -> String {
    format!("{LESSONS}:*")
}

/// Exact key, or a prefix when the pattern ends in `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    Exact(String),
    Prefix(String),
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => KeyPattern::Prefix(prefix.to_string()),
            None => KeyPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(k) => k == key,
            KeyPattern::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_date;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn single_week_ranges_use_bucket() {
        let key = scope_key(SLOTS, DateRange::day(d("2024-03-24")), None);
        assert_eq!(key, "slots:week:2024-W12:2024-03-24..2024-03-24:all");
    }

    #[test]
    fn multi_week_ranges_use_all() {
        let teacher = Ulid::new();
        let key = scope_key(LESSONS, DateRange::new(d("2024-03-24"), d("2024-03-31")), Some(teacher));
        assert_eq!(key, format!("lessons:all:2024-03-24..2024-03-31:{teacher}"));
    }

    #[test]
    fn slot_invalidation_reaches_every_range_containing_date() {
        let date = d("2024-03-20");
        let patterns: Vec<KeyPattern> = slot_invalidations(date).iter().map(|p| KeyPattern::parse(p)).collect();
        let hit = |key: String| patterns.iter().any(|p| p.matches(&key));

        assert!(hit(scope_key(SLOTS, DateRange::day(date), None)));
        assert!(hit(scope_key(SLOTS, DateRange::week_of(date), Some(Ulid::new()))));
        assert!(hit(scope_key(SLOTS, DateRange::new(d("2024-03-01"), d("2024-03-31")), None)));
        // A different week is left alone
        assert!(!hit(scope_key(SLOTS, DateRange::day(d("2024-03-27")), None)));
        assert!(!hit(scope_key(LESSONS, DateRange::day(date), None)));
    }

    #[test]
    fn pattern_parsing() {
        assert_eq!(KeyPattern::parse("lessons:*"), KeyPattern::Prefix("lessons:".into()));
        assert!(KeyPattern::parse("lessons:*").matches("lessons:week:2024-W12:x:all"));
        assert!(!KeyPattern::parse("lessons:*").matches("slots:all:x"));
        assert!(KeyPattern::parse("slots:all:a").matches("slots:all:a"));
        assert!(!KeyPattern::parse("slots:all:a").matches("slots:all:ab"));
    }
}
