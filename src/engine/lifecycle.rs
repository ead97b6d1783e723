use crate::model::{LessonStatus, SlotStatus};

use super::error::{BookingError, Transition};

/// Open→{Closed, Blocked, Cancelled}, Closed→{Open, Cancelled}.
/// Blocked and Cancelled are terminal.
pub fn slot_transition_allowed(from: SlotStatus, to: SlotStatus) -> bool {
    use SlotStatus::*;
    matches!(
        (from, to),
        (Open, Closed) | (Open, Blocked) | (Open, Cancelled) | (Closed, Cancelled) | (Closed, Open)
    )
}

/// Scheduled→{Completed, Cancelled, PendingCancel}, PendingCancel→{Cancelled, Scheduled}.
/// Completed and Cancelled are terminal.
pub fn lesson_transition_allowed(from: LessonStatus, to: LessonStatus) -> bool {
    use LessonStatus::*;
    matches!(
        (from, to),
        (Scheduled, Completed)
            | (Scheduled, Cancelled)
            | (Scheduled, PendingCancel)
            | (PendingCancel, Cancelled)
            | (PendingCancel, Scheduled)
    )
}

pub fn check_slot_transition(from: SlotStatus, to: SlotStatus) -> Result<(), BookingError> {
    if slot_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(BookingError::InvalidTransition(Transition::Slot { from, to }))
    }
}

pub fn check_lesson_transition(from: LessonStatus, to: LessonStatus) -> Result<(), BookingError> {
    if lesson_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(BookingError::InvalidTransition(Transition::Lesson { from, to }))
    }
}
