use thiserror::Error;
use ulid::Ulid;

use crate::model::{LessonStatus, SlotStatus};
use crate::store::StoreError;

use super::conflict::ConflictSet;

#[derive(Debug, Clone, Error)]
pub enum BookingError {
    /// Missing or malformed required field. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The authoritative check found overlaps; the caller may override.
    #[error("booking conflicts with {} lesson(s) and {} open slot(s)", .0.lessons.len(), .0.open_slots.len())]
    Conflict(ConflictSet),

    #[error("booking store unavailable: {0}")]
    StoreUnavailable(String),

    /// A multi-step write partially succeeded.
    #[error("degraded write: {0}")]
    DegradedWrite(DegradedReport),

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("illegal transition: {0}")]
    InvalidTransition(Transition),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl BookingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        BookingError::Validation(msg.into())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, BookingError::StoreUnavailable(_))
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BookingError::NotFound(id),
            StoreError::Invalid(msg) => BookingError::Validation(msg),
            StoreError::Unavailable(msg) => BookingError::StoreUnavailable(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Slot { from: SlotStatus, to: SlotStatus },
    Lesson { from: LessonStatus, to: LessonStatus },
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Slot { from, to } => write!(f, "slot {from} -> {to}"),
            Transition::Lesson { from, to } => write!(f, "lesson {from} -> {to}"),
        }
    }
}

/// Which sub-steps of a multi-record write landed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DegradedReport {
    pub slot_id: Option<Ulid>,
    pub created_lessons: Vec<Ulid>,
    pub failed_students: Vec<(Ulid, String)>,
    pub slot_closed: bool,
    pub slot_linked: bool,
    pub detail: String,
}

impl std::fmt::Display for DegradedReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (lessons created: {}, students failed: {}, slot closed: {}, slot linked: {})",
            self.detail,
            self.created_lessons.len(),
            self.failed_students.len(),
            self.slot_closed,
            self.slot_linked
        )
    }
}
