//! JSON shapes of the conflict-check endpoint.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{BookingEngine, BookingError, ConflictSet, Proposal};
use crate::model::{format_hhmm, parse_date, parse_hhmm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Lesson,
    Slot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCheckRequest {
    pub entity: Entity,
    /// Set when editing an existing record.
    #[serde(default)]
    pub record_id: Option<Ulid>,
    #[serde(default)]
    pub teacher_id: Option<Ulid>,
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM`; a missing time yields no conflicts.
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

impl ConflictCheckRequest {
    pub fn to_proposal(&self) -> Result<Proposal, BookingError> {
        let date = parse_date(&self.date).ok_or_else(|| BookingError::validation(format!("bad date {:?}", self.date)))?;
        let start = self.start.as_deref().map(parse_time).transpose()?;
        let end = self.end.as_deref().map(parse_time).transpose()?;
        let duration_min = match (start, end) {
            (Some(start), Some(end)) => Some(minutes_between(start, end)),
            _ => None,
        };

        let mut proposal = Proposal {
            teacher_id: self.teacher_id,
            date,
            start,
            duration_min,
            exclude_id: self.record_id,
            host_slot_allowed: true,
        };
        if self.entity == Entity::Slot {
            proposal = proposal.without_host_slot();
        }
        Ok(proposal)
    }
}

/// An end at or before the start falls on the next day; equal times are a
/// zero-length proposal.
fn minutes_between(start: NaiveTime, end: NaiveTime) -> u32 {
    let mut minutes = (end - start).num_minutes();
    if minutes < 0 {
        minutes += 24 * 60;
    }
    u32::try_from(minutes).unwrap_or(0)
}

fn parse_time(s: &str) -> Result<NaiveTime, BookingError> {
    parse_hhmm(s).ok_or_else(|| BookingError::validation(format!("bad time {s:?}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    Lesson,
    Slot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictItem {
    pub kind: ConflictKind,
    pub id: Ulid,
    pub label: String,
    /// `HH:MM-HH:MM`
    pub time_range: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCheckResponse {
    pub has_conflicts: bool,
    pub conflicts: Vec<ConflictItem>,
}

impl ConflictCheckResponse {
    pub fn from_set(set: &ConflictSet) -> Self {
        let lessons = set.lessons.iter().map(|l| ConflictItem {
            kind: ConflictKind::Lesson,
            id: l.id,
            label: format!("{} lesson ({})", l.kind, l.status),
            time_range: format!("{}-{}", format_hhmm(l.start), format_hhmm(l.end_time())),
        });
        let slots = set.open_slots.iter().map(|s| ConflictItem {
            kind: ConflictKind::Slot,
            id: s.id,
            label: "open slot".to_string(),
            time_range: format!("{}-{}", format_hhmm(s.start), format_hhmm(s.end)),
        });
        Self {
            has_conflicts: !set.can_proceed(),
            conflicts: lessons.chain(slots).collect(),
        }
    }
}

impl BookingEngine {
    pub async fn check_request(&self, req: &ConflictCheckRequest) -> Result<ConflictCheckResponse, BookingError> {
        let proposal = req.to_proposal()?;
        let set = self.check_conflicts(&proposal).await?;
        Ok(ConflictCheckResponse::from_set(&set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    #[test]
    fn request_reads_camel_case() {
        let teacher = Ulid::new();
        let json = format!(
            r#"{{"entity":"lesson","teacherId":"{teacher}","date":"2024-03-24","start":"16:00","end":"17:30"}}"#
        );
        let req: ConflictCheckRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req.record_id, None);

        let proposal = req.to_proposal().unwrap();
        assert_eq!(proposal.teacher_id, Some(teacher));
        assert_eq!(proposal.duration_min, Some(90));
        assert!(proposal.host_slot_allowed);
    }

    #[test]
    fn slot_requests_treat_identical_slots_as_duplicates() {
        let req = ConflictCheckRequest {
            entity: Entity::Slot,
            record_id: Some(Ulid::new()),
            teacher_id: None,
            date: "2024-03-24".into(),
            start: Some("09:00".into()),
            end: Some("10:00".into()),
        };
        let proposal = req.to_proposal().unwrap();
        assert!(!proposal.host_slot_allowed);
        assert_eq!(proposal.exclude_id, req.record_id);
    }

    #[test]
    fn end_before_start_runs_past_midnight() {
        let req = ConflictCheckRequest {
            entity: Entity::Lesson,
            record_id: None,
            teacher_id: None,
            date: "2024-03-24".into(),
            start: Some("23:00".into()),
            end: Some("01:00".into()),
        };
        let proposal = req.to_proposal().unwrap();
        assert_eq!(proposal.duration_min, Some(120));
        assert_eq!(proposal.span().unwrap().duration_ms(), 120 * 60_000);
    }

    #[test]
    fn empty_or_missing_times_yield_no_span() {
        let mut req = ConflictCheckRequest {
            entity: Entity::Lesson,
            record_id: None,
            teacher_id: None,
            date: "2024-03-24".into(),
            start: Some("10:00".into()),
            end: Some("10:00".into()),
        };
        assert!(req.to_proposal().unwrap().span().is_none());
        req.end = None;
        assert!(req.to_proposal().unwrap().span().is_none());
        req.date = "24/03/2024".into();
        assert!(matches!(req.to_proposal(), Err(BookingError::Validation(_))));
    }

    #[test]
    fn response_lists_both_kinds() {
        let date = parse_date("2024-03-24").unwrap();
        let set = ConflictSet {
            lessons: vec![Lesson {
                id: Ulid::new(),
                student_ids: vec![Ulid::new()],
                teacher_id: None,
                date,
                start: parse_hhmm("10:00").unwrap(),
                duration_min: 45,
                status: LessonStatus::Scheduled,
                kind: LessonKind::Pair,
                price_cents: None,
            }],
            open_slots: vec![Slot {
                id: Ulid::new(),
                teacher_id: None,
                date,
                start: parse_hhmm("10:30").unwrap(),
                end: parse_hhmm("11:30").unwrap(),
                status: SlotStatus::Open,
                lesson_ids: vec![],
                student_ids: vec![],
                kind: None,
            }],
        };
        let response = ConflictCheckResponse::from_set(&set);
        assert!(response.has_conflicts);
        assert_eq!(response.conflicts[0].time_range, "10:00-10:45");
        assert_eq!(response.conflicts[1].kind, ConflictKind::Slot);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["hasConflicts"], true);
        assert_eq!(json["conflicts"][0]["kind"], "lesson");
        assert_eq!(json["conflicts"][1]["timeRange"], "10:30-11:30");
    }

    #[test]
    fn empty_set_has_no_conflicts() {
        let response = ConflictCheckResponse::from_set(&ConflictSet::default());
        assert!(!response.has_conflicts);
        assert!(response.conflicts.is_empty());
    }
}
