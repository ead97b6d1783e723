use chrono::{NaiveDate, NaiveTime};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::MAX_LESSON_MINUTES;
use crate::model::*;
use crate::notify::NotificationKind;

use super::audit::Override;
use super::conflict::Proposal;
use super::lifecycle::{check_lesson_transition, check_slot_transition};
use super::reservation::check_students;
use super::{BookingEngine, BookingError};

/// A lesson placed directly on the calendar, outside any slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonRequest {
    pub student_ids: Vec<Ulid>,
    pub teacher_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub duration_min: u32,
    /// Derived from the number of students when absent.
    pub kind: Option<LessonKind>,
    /// Derived from the pricing table when absent.
    pub price_cents: Option<u64>,
}

/// Availability a teacher opens up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequest {
    pub id: Option<Ulid>,
    pub teacher_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub kind: Option<LessonKind>,
}

fn check_duration(minutes: i64) -> Result<u32, BookingError> {
    if minutes <= 0 {
        return Err(BookingError::validation("duration must be positive"));
    }
    if minutes > MAX_LESSON_MINUTES as i64 {
        return Err(BookingError::LimitExceeded("duration too long"));
    }
    Ok(minutes as u32)
}

impl BookingEngine {
    pub async fn create_lesson(&self, req: LessonRequest, by: Option<&Override>) -> Result<Lesson, BookingError> {
        check_students(&req.student_ids)?;
        let duration_min = check_duration(req.duration_min as i64)?;

        let proposal = Proposal::new(req.teacher_id, req.date, req.start, duration_min);
        let conflicts = self.check_conflicts(&proposal).await?;
        self.authorize("create_lesson", conflicts, by)?;

        let kind = req.kind.unwrap_or_else(|| LessonKind::for_students(req.student_ids.len()));
        let price = req
            .price_cents
            .unwrap_or_else(|| self.config.pricing.price(kind, duration_min));
        let lesson = self
            .store
            .create_lesson(NewLesson {
                student_ids: req.student_ids,
                teacher_id: req.teacher_id,
                date: req.date,
                start: req.start,
                duration_min,
                status: LessonStatus::Scheduled,
                kind,
                price_cents: Some(price),
            })
            .await?;
        self.invalidate_lessons();

        info!("lesson {} created on {} at {}", lesson.id, lesson.date, format_hhmm(lesson.start));
        self.notify_students(NotificationKind::Booked, &lesson.student_ids, lesson.date).await;
        Ok(lesson)
    }

    /// Move a scheduled lesson. The lesson never conflicts with itself; slots
    /// it was linked to are released as if it had been cancelled.
    pub async fn reschedule_lesson(
        &self,
        id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        duration_min: u32,
        by: Option<&Override>,
    ) -> Result<Lesson, BookingError> {
        let duration_min = check_duration(duration_min as i64)?;
        let current = self.store.get_lesson(id).await?;
        if current.status != LessonStatus::Scheduled {
            return Err(BookingError::validation(format!(
                "lesson {id} is {}, only scheduled lessons can move",
                current.status
            )));
        }

        let proposal = Proposal::new(current.teacher_id, date, start, duration_min).excluding(id);
        let conflicts = self.check_conflicts(&proposal).await?;
        self.authorize("reschedule_lesson", conflicts, by)?;

        let patch = LessonPatch {
            status: None,
            date: Some(date),
            start: Some(start),
            duration_min: Some(duration_min),
        };
        let moved = self.store.update_lesson(id, patch).await?;
        self.invalidate_lessons();
        if moved.date != current.date || moved.start != current.start || moved.duration_min != current.duration_min {
            self.reopen_slots_for(&current).await;
        }
        info!("lesson {id} moved to {} at {}", moved.date, format_hhmm(moved.start));
        Ok(moved)
    }

    /// Apply a lesson status change. Cancelling releases the lesson's slots and
    /// tells its students.
    pub async fn update_lesson_status(&self, id: Ulid, status: LessonStatus) -> Result<Lesson, BookingError> {
        let current = self.store.get_lesson(id).await?;
        check_lesson_transition(current.status, status)?;

        let lesson = self.store.update_lesson(id, LessonPatch::status(status)).await?;
        self.invalidate_lessons();
        info!("lesson {id}: {} -> {status}", current.status);

        if status == LessonStatus::Cancelled {
            let reopened = self.reopen_slots_for(&lesson).await;
            if !reopened.is_empty() {
                info!("cancelling lesson {id} reopened {} slot(s)", reopened.len());
            }
            self.notify_students(NotificationKind::Cancelled, &lesson.student_ids, lesson.date).await;
        }
        Ok(lesson)
    }

    pub async fn cancel_lesson(&self, id: Ulid) -> Result<Lesson, BookingError> {
        self.update_lesson_status(id, LessonStatus::Cancelled).await
    }

    /// Open availability. An identical open slot of the same teacher counts as
    /// a duplicate here, not as a host.
    pub async fn create_slot(&self, req: SlotRequest, by: Option<&Override>) -> Result<Slot, BookingError> {
        let duration_min = check_duration((req.end - req.start).num_minutes())?;

        let mut proposal = Proposal::new(req.teacher_id, req.date, req.start, duration_min).without_host_slot();
        if let Some(id) = req.id {
            proposal = proposal.excluding(id);
        }
        let conflicts = self.check_conflicts(&proposal).await?;
        self.authorize("create_slot", conflicts, by)?;

        let slot = self
            .store
            .create_slot(NewSlot {
                id: req.id.unwrap_or_else(Ulid::new),
                teacher_id: req.teacher_id,
                date: req.date,
                start: req.start,
                end: req.end,
                kind: req.kind,
            })
            .await?;
        self.invalidate_slots(slot.date);
        info!(
            "slot {} opened on {} {}-{}",
            slot.id,
            slot.date,
            format_hhmm(slot.start),
            format_hhmm(slot.end)
        );
        Ok(slot)
    }

    /// Move a slot through its lifecycle. Reopening a closed slot requires
    /// every linked lesson to be inactive and clears the links.
    pub async fn transition_slot(&self, id: Ulid, to: SlotStatus) -> Result<Slot, BookingError> {
        let slot = self.store.get_slot(id).await?;
        check_slot_transition(slot.status, to)?;

        let patch = if to == SlotStatus::Open {
            for lesson_id in &slot.lesson_ids {
                let lesson = self.store.get_lesson(*lesson_id).await?;
                if lesson.is_active() {
                    return Err(BookingError::validation(format!(
                        "slot {id} still holds {} lesson {lesson_id}",
                        lesson.status
                    )));
                }
            }
            SlotPatch {
                status: Some(SlotStatus::Open),
                lesson_ids: Some(Vec::new()),
                student_ids: Some(Vec::new()),
            }
        } else {
            if to == SlotStatus::Cancelled && !slot.lesson_ids.is_empty() {
                warn!("slot {id} cancelled with {} linked lesson(s)", slot.lesson_ids.len());
            }
            SlotPatch::status(to)
        };

        let updated = self.store.update_slot(id, patch).await?;
        self.invalidate_slots(updated.date);
        info!("slot {id}: {} -> {to}", slot.status);
        Ok(updated)
    }
}
