use std::fmt;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds of a naive wall-clock instant; the only comparable time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted intervals.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

/// Two half-open intervals intersect iff each starts before the other ends.
/// Touching endpoints do not overlap.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && a_end > b_start
}

/// Combine a calendar date and a wall-clock time into one comparable instant.
///
/// The pair is anchored at UTC regardless of the process time zone, so two
/// callers in different locales always agree on the ordering.
pub fn instant(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

/// Parse the store's `"HH:MM"` time format.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

pub fn format_hhmm(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// ISO week bucket used to key slot inventory, e.g. `2024-W12`.
pub fn week_bucket(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// Inclusive calendar-day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        debug_assert!(from <= to, "DateRange from must not be after to");
        Self { from, to }
    }

    pub fn day(date: NaiveDate) -> Self {
        Self { from: date, to: date }
    }

    /// Monday..Sunday of the ISO week containing `date`.
    pub fn week_of(date: NaiveDate) -> Self {
        let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
        Self {
            from: monday,
            to: monday + Duration::days(6),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }

    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }

    /// The ISO week bucket when the whole range falls inside one week.
    pub fn single_week(&self) -> Option<String> {
        let bucket = week_bucket(self.from);
        (week_bucket(self.to) == bucket).then_some(bucket)
    }
}

// ── Statuses and kinds ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonStatus {
    Scheduled,
    Completed,
    Cancelled,
    PendingCancel,
}

impl LessonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::Scheduled => "scheduled",
            LessonStatus::Completed => "completed",
            LessonStatus::Cancelled => "cancelled",
            LessonStatus::PendingCancel => "pending_cancel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "scheduled" => Some(LessonStatus::Scheduled),
            "completed" => Some(LessonStatus::Completed),
            "cancelled" | "canceled" => Some(LessonStatus::Cancelled),
            "pending_cancel" | "pendingcancel" => Some(LessonStatus::PendingCancel),
            _ => None,
        }
    }

    /// Cancelled and pending-cancel lessons never occupy time.
    pub fn occupies_time(&self) -> bool {
        matches!(self, LessonStatus::Scheduled | LessonStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonKind {
    Private,
    Pair,
    Group,
    RecurringInstance,
}

impl LessonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonKind::Private => "private",
            LessonKind::Pair => "pair",
            LessonKind::Group => "group",
            LessonKind::RecurringInstance => "recurring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "private" => Some(LessonKind::Private),
            "pair" => Some(LessonKind::Pair),
            "group" => Some(LessonKind::Group),
            "recurring" | "recurring_instance" => Some(LessonKind::RecurringInstance),
            _ => None,
        }
    }

    /// Kind implied by the number of students sharing a slot.
    pub fn for_students(count: usize) -> Self {
        match count {
            0 | 1 => LessonKind::Private,
            2 => LessonKind::Pair,
            _ => LessonKind::Group,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Open,
    Closed,
    Blocked,
    Cancelled,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Open => "open",
            SlotStatus::Closed => "closed",
            SlotStatus::Blocked => "blocked",
            SlotStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "open" => Some(SlotStatus::Open),
            "closed" => Some(SlotStatus::Closed),
            "blocked" => Some(SlotStatus::Blocked),
            "cancelled" | "canceled" => Some(SlotStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for LessonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Ulid,
    pub student_ids: Vec<Ulid>,
    pub teacher_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub duration_min: u32,
    pub status: LessonStatus,
    pub kind: LessonKind,
    pub price_cents: Option<u64>,
}

impl Lesson {
    /// `[start, start + duration)`; `None` for a zero-length lesson.
    pub fn span(&self) -> Option<Span> {
        let start = instant(self.date, self.start);
        Span::try_new(start, start + self.duration_min as Ms * MINUTE_MS)
    }

    pub fn is_active(&self) -> bool {
        self.status.occupies_time()
    }

    pub fn end_time(&self) -> NaiveTime {
        self.start + Duration::minutes(self.duration_min as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub teacher_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub status: SlotStatus,
    pub lesson_ids: Vec<Ulid>,
    pub student_ids: Vec<Ulid>,
    pub kind: Option<LessonKind>,
}

impl Slot {
    pub fn span(&self) -> Option<Span> {
        Span::try_new(instant(self.date, self.start), instant(self.date, self.end))
    }

    /// Minutes between start and end; zero or negative for malformed slots.
    pub fn duration_min(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    /// An Open slot that still links lessons is contradictory and never offered.
    pub fn is_open_and_unlinked(&self) -> bool {
        self.status == SlotStatus::Open && self.lesson_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: Ulid,
    pub name: String,
    pub phone: Option<String>,
}

/// Fields for a lesson the store has not yet assigned an id to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLesson {
    pub student_ids: Vec<Ulid>,
    pub teacher_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub duration_min: u32,
    pub status: LessonStatus,
    pub kind: LessonKind,
    pub price_cents: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSlot {
    pub id: Ulid,
    pub teacher_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub kind: Option<LessonKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LessonPatch {
    pub status: Option<LessonStatus>,
    pub date: Option<NaiveDate>,
    pub start: Option<NaiveTime>,
    pub duration_min: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPatch {
    pub status: Option<SlotStatus>,
    pub lesson_ids: Option<Vec<Ulid>>,
    pub student_ids: Option<Vec<Ulid>>,
}

impl SlotPatch {
    pub fn status(status: SlotStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl LessonPatch {
    pub fn status(status: LessonStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}
