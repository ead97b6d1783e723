use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

/// Overlapping records found by an authoritative check. The two lists are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSet {
    pub lessons: Vec<Lesson>,
    pub open_slots: Vec<Slot>,
}

impl ConflictSet {
    pub fn can_proceed(&self) -> bool {
        self.lessons.is_empty() && self.open_slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lessons.len() + self.open_slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.can_proceed()
    }

    pub fn record_ids(&self) -> Vec<Ulid> {
        self.lessons
            .iter()
            .map(|l| l.id)
            .chain(self.open_slots.iter().map(|s| s.id))
            .collect()
    }
}

/// A lesson or slot someone intends to place on the calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub teacher_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: Option<NaiveTime>,
    pub duration_min: Option<u32>,
    /// The record being edited, so it never conflicts with itself.
    pub exclude_id: Option<Ulid>,
    /// Whether an identical open slot of the same teacher counts as the
    /// proposal's own slot rather than a conflict.
    pub host_slot_allowed: bool,
}

impl Proposal {
    pub fn new(teacher_id: Option<Ulid>, date: NaiveDate, start: NaiveTime, duration_min: u32) -> Self {
        Self {
            teacher_id,
            date,
            start: Some(start),
            duration_min: Some(duration_min),
            exclude_id: None,
            host_slot_allowed: true,
        }
    }

    /// Proposal covering an existing slot's own interval.
    pub fn for_slot(slot: &Slot) -> Self {
        Self {
            teacher_id: slot.teacher_id,
            date: slot.date,
            start: Some(slot.start),
            duration_min: u32::try_from(slot.duration_min()).ok(),
            exclude_id: Some(slot.id),
            host_slot_allowed: true,
        }
    }

    pub fn excluding(mut self, id: Ulid) -> Self {
        self.exclude_id = Some(id);
        self
    }

    /// Treat identical open slots as duplicates, e.g. when opening a new slot.
    pub fn without_host_slot(mut self) -> Self {
        self.host_slot_allowed = false;
        self
    }

    /// `None` when start is missing or duration is zero.
    pub fn span(&self) -> Option<Span> {
        let start = instant(self.date, self.start?);
        let minutes = self.duration_min.filter(|m| *m > 0)?;
        Span::try_new(start, start + minutes as Ms * MINUTE_MS)
    }

    fn end_time(&self) -> Option<NaiveTime> {
        Some(self.start? + chrono::Duration::minutes(self.duration_min? as i64))
    }
}

/// Teachers only need to match when both sides name one.
pub fn teachers_compatible(a: Option<Ulid>, b: Option<Ulid>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Compute every active lesson and bookable open slot overlapping `proposal`.
///
/// `lessons` and `slots` are the records of the proposal's calendar date;
/// records of other dates are ignored. An open slot of the proposal's own
/// teacher with exactly the proposal's date and times is the slot being booked
/// into and is not reported.
pub fn find_conflicts(proposal: &Proposal, lessons: &[Lesson], slots: &[Slot]) -> ConflictSet {
    let Some(span) = proposal.span() else {
        return ConflictSet::default();
    };
    let excluded = |id: Ulid| proposal.exclude_id == Some(id);

    let lessons = lessons
        .iter()
        .filter(|l| l.date == proposal.date && l.is_active() && !excluded(l.id))
        .filter(|l| teachers_compatible(proposal.teacher_id, l.teacher_id))
        .filter(|l| l.span().is_some_and(|s| s.overlaps(&span)))
        .cloned()
        .collect();

    let open_slots = slots
        .iter()
        .filter(|s| s.date == proposal.date && s.is_open_and_unlinked() && !excluded(s.id))
        .filter(|s| teachers_compatible(proposal.teacher_id, s.teacher_id))
        .filter(|s| !is_host_slot(proposal, s))
        .filter(|s| s.span().is_some_and(|ss| ss.overlaps(&span)))
        .cloned()
        .collect();

    ConflictSet { lessons, open_slots }
}

fn is_host_slot(proposal: &Proposal, slot: &Slot) -> bool {
    proposal.host_slot_allowed
        && proposal.teacher_id.is_some()
        && slot.teacher_id == proposal.teacher_id
        && slot.date == proposal.date
        && proposal.start == Some(slot.start)
        && proposal.end_time() == Some(slot.end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        parse_hhmm(s).unwrap()
    }

    fn lesson(teacher: Option<Ulid>, date: &str, start: &str, minutes: u32, status: LessonStatus) -> Lesson {
        Lesson {
            id: Ulid::new(),
            student_ids: vec![Ulid::new()],
            teacher_id: teacher,
            date: d(date),
            start: t(start),
            duration_min: minutes,
            status,
            kind: LessonKind::Private,
            price_cents: None,
        }
    }

    fn slot(teacher: Option<Ulid>, date: &str, start: &str, end: &str) -> Slot {
        Slot {
            id: Ulid::new(),
            teacher_id: teacher,
            date: d(date),
            start: t(start),
            end: t(end),
            status: SlotStatus::Open,
            lesson_ids: vec![],
            student_ids: vec![],
            kind: None,
        }
    }

    #[test]
    fn overlapping_active_lesson_conflicts() {
        let teacher = Some(Ulid::new());
        let existing = lesson(teacher, "2024-03-24", "10:00", 60, LessonStatus::Scheduled);
        let proposal = Proposal::new(teacher, d("2024-03-24"), t("10:30"), 60);
        let set = find_conflicts(&proposal, std::slice::from_ref(&existing), &[]);
        assert_eq!(set.lessons, vec![existing]);
        assert!(!set.can_proceed());
    }

    #[test]
    fn touching_lesson_does_not_conflict() {
        let existing = lesson(None, "2024-03-24", "10:00", 60, LessonStatus::Scheduled);
        let proposal = Proposal::new(None, d("2024-03-24"), t("11:00"), 60);
        assert!(find_conflicts(&proposal, &[existing], &[]).can_proceed());
    }

    #[test]
    fn cancelled_and_pending_lessons_are_ignored() {
        let lessons = vec![
            lesson(None, "2024-03-24", "10:00", 60, LessonStatus::Cancelled),
            lesson(None, "2024-03-24", "10:00", 60, LessonStatus::PendingCancel),
        ];
        let proposal = Proposal::new(None, d("2024-03-24"), t("10:00"), 60);
        assert!(find_conflicts(&proposal, &lessons, &[]).lessons.is_empty());
    }

    #[test]
    fn teacher_rule_applies_only_when_both_known() {
        let (a, b) = (Some(Ulid::new()), Some(Ulid::new()));
        let other_teacher = lesson(b, "2024-03-24", "10:00", 60, LessonStatus::Scheduled);
        let unassigned = lesson(None, "2024-03-24", "10:00", 60, LessonStatus::Scheduled);
        let lessons = vec![other_teacher, unassigned.clone()];

        let set = find_conflicts(&Proposal::new(a, d("2024-03-24"), t("10:15"), 30), &lessons, &[]);
        assert_eq!(set.lessons, vec![unassigned]);

        let set = find_conflicts(&Proposal::new(None, d("2024-03-24"), t("10:15"), 30), &lessons, &[]);
        assert_eq!(set.lessons.len(), 2);
    }

    #[test]
    fn other_dates_are_out_of_scope() {
        let existing = lesson(None, "2024-03-25", "10:00", 60, LessonStatus::Scheduled);
        let proposal = Proposal::new(None, d("2024-03-24"), t("10:00"), 60);
        assert!(find_conflicts(&proposal, &[existing], &[]).can_proceed());
    }

    #[test]
    fn excluded_record_never_conflicts_with_itself() {
        let existing = lesson(None, "2024-03-24", "10:00", 60, LessonStatus::Scheduled);
        let proposal = Proposal::new(None, d("2024-03-24"), t("10:30"), 60).excluding(existing.id);
        assert!(find_conflicts(&proposal, &[existing], &[]).can_proceed());
    }

    #[test]
    fn only_open_unlinked_slots_conflict() {
        let mut closed = slot(None, "2024-03-24", "10:00", "11:00");
        closed.status = SlotStatus::Closed;
        let mut linked = slot(None, "2024-03-24", "10:00", "11:00");
        linked.lesson_ids.push(Ulid::new());
        let open = slot(None, "2024-03-24", "10:30", "11:30");

        let proposal = Proposal::new(None, d("2024-03-24"), t("10:00"), 60);
        let set = find_conflicts(&proposal, &[], &[closed, linked, open.clone()]);
        assert_eq!(set.open_slots, vec![open]);
        assert!(set.lessons.is_empty());
    }

    #[test]
    fn host_slot_is_not_a_conflict() {
        let teacher = Some(Ulid::new());
        let host = slot(teacher, "2024-03-24", "16:00", "17:00");
        let proposal = Proposal::new(teacher, d("2024-03-24"), t("16:00"), 60);
        assert!(find_conflicts(&proposal, &[], std::slice::from_ref(&host)).can_proceed());

        // Same times without a teacher on the proposal still conflict.
        let proposal = Proposal::new(None, d("2024-03-24"), t("16:00"), 60);
        assert_eq!(find_conflicts(&proposal, &[], std::slice::from_ref(&host)).open_slots.len(), 1);

        // Opening a duplicate slot is a conflict.
        let proposal = Proposal::new(teacher, d("2024-03-24"), t("16:00"), 60).without_host_slot();
        assert_eq!(find_conflicts(&proposal, &[], &[host]).open_slots.len(), 1);
    }

    #[test]
    fn incomplete_proposal_has_no_conflicts() {
        let existing = lesson(None, "2024-03-24", "10:00", 60, LessonStatus::Scheduled);
        let mut proposal = Proposal::new(None, d("2024-03-24"), t("10:00"), 0);
        assert!(find_conflicts(&proposal, std::slice::from_ref(&existing), &[]).can_proceed());
        proposal.duration_min = Some(60);
        proposal.start = None;
        assert!(find_conflicts(&proposal, &[existing], &[]).can_proceed());
    }

    #[test]
    fn proposal_crossing_midnight_checks_its_own_day() {
        let late = lesson(None, "2024-03-24", "23:30", 30, LessonStatus::Scheduled);
        let proposal = Proposal::new(None, d("2024-03-24"), t("23:00"), 120);
        assert_eq!(find_conflicts(&proposal, &[late], &[]).lessons.len(), 1);
    }

    #[test]
    fn slot_proposal_excludes_itself() {
        let s = slot(None, "2024-03-24", "09:00", "10:00");
        let proposal = Proposal::for_slot(&s);
        assert_eq!(proposal.duration_min, Some(60));
        assert!(find_conflicts(&proposal, &[], &[s]).can_proceed());
    }
}
