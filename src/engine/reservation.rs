use std::collections::HashSet;

use dashmap::DashSet;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::limits::{MAX_LESSON_MINUTES, MAX_STUDENTS_PER_RESERVATION};
use crate::model::*;
use crate::notify::NotificationKind;
use crate::observability::{RESERVATIONS_TOTAL, RESERVATION_STUDENT_FAILURES_TOTAL};
use crate::store::StoreError;

use super::audit::Override;
use super::conflict::Proposal;
use super::error::DegradedReport;
use super::lifecycle::slot_transition_allowed;
use super::{BookingEngine, BookingError};

/// How the slot update at the end of a reservation landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotUpdate {
    /// Closed with lessons and students linked.
    Linked,
    /// The combined update failed; the slot was closed without links.
    StatusOnly,
    /// Neither update landed; the slot is still Open although lessons exist.
    Failed(String),
}

impl SlotUpdate {
    fn label(&self) -> &'static str {
        match self {
            SlotUpdate::Linked => "linked",
            SlotUpdate::StatusOnly => "status_only",
            SlotUpdate::Failed(_) => "slot_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub lessons: Vec<Lesson>,
    /// Students whose lesson could not be created, with the store's reason.
    pub failures: Vec<(Ulid, String)>,
    pub slot_update: SlotUpdate,
    /// The slot as re-read after the write.
    pub slot: Slot,
}

impl Reservation {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.slot_update == SlotUpdate::Linked
    }
}

/// Marks a slot as having a reservation in flight until dropped.
pub(super) struct SlotClaim<'a> {
    claims: &'a DashSet<Ulid>,
    slot_id: Ulid,
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.slot_id);
    }
}

pub(super) fn check_students(student_ids: &[Ulid]) -> Result<(), BookingError> {
    if student_ids.is_empty() {
        return Err(BookingError::validation("at least one student is required"));
    }
    if student_ids.len() > MAX_STUDENTS_PER_RESERVATION {
        return Err(BookingError::LimitExceeded("too many students"));
    }
    let mut seen = HashSet::with_capacity(student_ids.len());
    if let Some(dup) = student_ids.iter().find(|id| !seen.insert(**id)) {
        return Err(BookingError::validation(format!("student {dup} listed twice")));
    }
    Ok(())
}

impl BookingEngine {
    pub(super) fn claim_slot(&self, slot_id: Ulid) -> Result<SlotClaim<'_>, BookingError> {
        if !self.reserving.insert(slot_id) {
            return Err(BookingError::validation(format!(
                "a reservation for slot {slot_id} is already in progress"
            )));
        }
        Ok(SlotClaim {
            claims: &self.reserving,
            slot_id,
        })
    }

    /// Teacher of the slot, or the configured default when it has none.
    fn slot_teacher(&self, slot: &Slot) -> Result<Ulid, BookingError> {
        if let Some(teacher) = slot.teacher_id {
            return Ok(teacher);
        }
        match self.config.default_teacher {
            Some(teacher) => {
                warn!("slot {} has no teacher, booking it under default teacher {teacher}", slot.id);
                Ok(teacher)
            }
            None => Err(BookingError::validation(format!("slot {} has no teacher", slot.id))),
        }
    }

    /// Check the slot's interval against everything else on its day, then
    /// reserve it. Conflicts need an override, which is audited.
    pub async fn book(
        &self,
        slot_id: Ulid,
        student_ids: &[Ulid],
        by: Option<&Override>,
    ) -> Result<Reservation, BookingError> {
        check_students(student_ids)?;
        let slot = self.store.get_slot(slot_id).await?;
        let mut proposal = Proposal::for_slot(&slot);
        proposal.teacher_id = Some(self.slot_teacher(&slot)?);
        let conflicts = self.check_conflicts(&proposal).await?;
        self.authorize("book", conflicts, by)?;
        self.reserve(slot_id, student_ids).await
    }

    /// Create one lesson per student in the slot, then close the slot and link
    /// them. Lesson creation is not rolled back: a partial result reports each
    /// failure, and a failed slot update falls back to a status-only close.
    pub async fn reserve(&self, slot_id: Ulid, student_ids: &[Ulid]) -> Result<Reservation, BookingError> {
        check_students(student_ids)?;
        let _claim = self.claim_slot(slot_id)?;

        let slot = self.store.get_slot(slot_id).await?;
        let teacher_id = self.slot_teacher(&slot)?;
        let duration = slot.duration_min();
        if duration <= 0 {
            return Err(BookingError::validation(format!("slot {slot_id} has no duration")));
        }
        if duration > MAX_LESSON_MINUTES as i64 {
            return Err(BookingError::LimitExceeded("slot too long"));
        }
        if !slot.is_open_and_unlinked() || !slot_transition_allowed(slot.status, SlotStatus::Closed) {
            metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "rejected").increment(1);
            return Err(BookingError::validation(format!(
                "slot {slot_id} is {} with {} linked lesson(s), not bookable",
                slot.status,
                slot.lesson_ids.len()
            )));
        }

        let duration_min = duration as u32;
        let kind = slot.kind.unwrap_or_else(|| LessonKind::for_students(student_ids.len()));
        let price = self.config.pricing.price(kind, duration_min);

        let mut lessons = Vec::with_capacity(student_ids.len());
        let mut rejected: Vec<(Ulid, StoreError)> = Vec::new();
        for student_id in student_ids {
            let fields = NewLesson {
                student_ids: vec![*student_id],
                teacher_id: Some(teacher_id),
                date: slot.date,
                start: slot.start,
                duration_min,
                status: LessonStatus::Scheduled,
                kind,
                price_cents: Some(price),
            };
            match self.store.create_lesson(fields).await {
                Ok(lesson) => lessons.push(lesson),
                Err(e) => {
                    warn!("slot {slot_id}: lesson for student {student_id} not created: {e}");
                    metrics::counter!(RESERVATION_STUDENT_FAILURES_TOTAL).increment(1);
                    rejected.push((*student_id, e));
                }
            }
        }

        if lessons.is_empty() {
            metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "rejected").increment(1);
            let all_unavailable = rejected.iter().all(|(_, e)| matches!(e, StoreError::Unavailable(_)));
            let detail = rejected
                .iter()
                .map(|(id, e)| format!("{id}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(if all_unavailable {
                BookingError::StoreUnavailable(detail)
            } else {
                BookingError::validation(format!("no lesson could be created: {detail}"))
            });
        }
        let failures: Vec<(Ulid, String)> = rejected.into_iter().map(|(id, e)| (id, e.to_string())).collect();
        self.invalidate_lessons();

        let lesson_ids: Vec<Ulid> = lessons.iter().map(|l| l.id).collect();
        let linked = SlotPatch {
            status: Some(SlotStatus::Closed),
            lesson_ids: Some(lesson_ids.clone()),
            student_ids: Some(student_ids.to_vec()),
        };
        let slot_update = match self.store.update_slot(slot_id, linked).await {
            Ok(_) => SlotUpdate::Linked,
            Err(e) => {
                warn!("slot {slot_id}: closing with links failed ({e}), retrying status-only");
                match self.store.update_slot(slot_id, SlotPatch::status(SlotStatus::Closed)).await {
                    Ok(_) => {
                        error!("slot {slot_id} closed without links to lessons {lesson_ids:?}");
                        SlotUpdate::StatusOnly
                    }
                    Err(e) => {
                        error!("slot {slot_id} left open although lessons {lesson_ids:?} exist: {e}");
                        SlotUpdate::Failed(e.to_string())
                    }
                }
            }
        };
        self.invalidate_slots(slot.date);
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => slot_update.label()).increment(1);

        let slot = match self.store.get_slot(slot_id).await {
            Ok(slot) => slot,
            Err(e) => {
                error!("slot {slot_id} could not be re-read after reservation: {e}");
                return Err(BookingError::DegradedWrite(DegradedReport {
                    slot_id: Some(slot_id),
                    created_lessons: lesson_ids,
                    failed_students: failures,
                    slot_closed: !matches!(slot_update, SlotUpdate::Failed(_)),
                    slot_linked: slot_update == SlotUpdate::Linked,
                    detail: format!("re-read of slot failed: {e}"),
                }));
            }
        };

        info!(
            "reserved slot {slot_id} on {}: {} lesson(s), {} failure(s), slot {}",
            slot.date,
            lessons.len(),
            failures.len(),
            slot_update.label()
        );
        let booked: Vec<Ulid> = lessons.iter().flat_map(|l| l.student_ids.iter().copied()).collect();
        self.notify_students(NotificationKind::Booked, &booked, slot.date).await;

        Ok(Reservation {
            lessons,
            failures,
            slot_update,
            slot,
        })
    }
}
