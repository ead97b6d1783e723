//! Booking Store contract: the externally-owned source of truth for lessons,
//! slots and students. The engine only ever sees the typed records from
//! [`crate::model`]; implementations do their own field mapping.

mod memory;
mod wal_store;

pub use memory::{MemoryStore, StoreEvent};
pub use wal_store::WalStore;

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(Ulid),
    #[error("rejected by store: {0}")]
    Invalid(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Lessons dated inside `range`, optionally restricted to one teacher.
    async fn list_lessons(&self, range: DateRange, teacher_id: Option<Ulid>) -> StoreResult<Vec<Lesson>>;

    /// Slots dated inside `range`, optionally restricted to one teacher.
    async fn list_slots(&self, range: DateRange, teacher_id: Option<Ulid>) -> StoreResult<Vec<Slot>>;

    async fn get_lesson(&self, id: Ulid) -> StoreResult<Lesson>;

    async fn get_slot(&self, id: Ulid) -> StoreResult<Slot>;

    /// Create a lesson; the store assigns the id.
    async fn create_lesson(&self, fields: NewLesson) -> StoreResult<Lesson>;

    async fn update_lesson(&self, id: Ulid, patch: LessonPatch) -> StoreResult<Lesson>;

    async fn create_slot(&self, fields: NewSlot) -> StoreResult<Slot>;

    async fn update_slot(&self, id: Ulid, patch: SlotPatch) -> StoreResult<Slot>;

    async fn register_student(&self, student: Student) -> StoreResult<()>;

    async fn get_student(&self, id: Ulid) -> StoreResult<Student>;
}
