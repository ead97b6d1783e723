use std::collections::HashSet;

use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::REOPEN_FAILURES_TOTAL;

use super::BookingEngine;

impl BookingEngine {
    /// Unlink a cancelled lesson from the slots of its day, reopening any
    /// closed slot left without an active lesson. Never fails the caller.
    ///
    /// Returns the ids of slots that were reopened.
    pub(super) async fn reopen_slots_for(&self, lesson: &Lesson) -> Vec<Ulid> {
        let slots = match self.store.list_slots(DateRange::day(lesson.date), None).await {
            Ok(slots) => slots,
            Err(e) => {
                warn!("lesson {} cancelled, slots of {} not reconciled: {e}", lesson.id, lesson.date);
                metrics::counter!(REOPEN_FAILURES_TOTAL).increment(1);
                return Vec::new();
            }
        };

        let mut reopened = Vec::new();
        for slot in slots.into_iter().filter(|s| s.lesson_ids.contains(&lesson.id)) {
            let remaining: Vec<Ulid> = slot.lesson_ids.iter().copied().filter(|id| *id != lesson.id).collect();
            let mut active = 0usize;
            let mut unreadable = false;
            let mut active_students = HashSet::new();
            for id in &remaining {
                match self.store.get_lesson(*id).await {
                    Ok(l) if l.is_active() => {
                        active += 1;
                        active_students.extend(l.student_ids);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // unknown state keeps the slot held
                        warn!("slot {}: linked lesson {id} unreadable: {e}", slot.id);
                        unreadable = true;
                    }
                }
            }

            let patch = if active == 0 && !unreadable && slot.status == SlotStatus::Closed {
                SlotPatch {
                    status: Some(SlotStatus::Open),
                    lesson_ids: Some(Vec::new()),
                    student_ids: Some(Vec::new()),
                }
            } else {
                let students: Vec<Ulid> = slot
                    .student_ids
                    .iter()
                    .copied()
                    .filter(|s| unreadable || active_students.contains(s))
                    .collect();
                SlotPatch {
                    status: None,
                    lesson_ids: Some(remaining),
                    student_ids: Some(students),
                }
            };
            let reopens = patch.status == Some(SlotStatus::Open);

            match self.store.update_slot(slot.id, patch).await {
                Ok(_) if reopens => {
                    info!("slot {} reopened after lesson {} was cancelled", slot.id, lesson.id);
                    reopened.push(slot.id);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("slot {} not updated after lesson {} was cancelled: {e}", slot.id, lesson.id);
                    metrics::counter!(REOPEN_FAILURES_TOTAL).increment(1);
                }
            }
        }
        self.invalidate_slots(lesson.date);
        reopened
    }
}
