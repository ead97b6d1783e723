mod advisory;
mod audit;
mod calendar;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod reopen;
mod reservation;

pub use advisory::{AdvisoryChecker, AdvisoryResult};
pub use audit::{AuditLog, Override, OverrideRecord};
pub use calendar::{CalendarView, is_bookable};
pub use conflict::{ConflictSet, Proposal, find_conflicts, teachers_compatible};
pub use error::{BookingError, DegradedReport, Transition};
pub use lifecycle::{check_lesson_transition, check_slot_transition, lesson_transition_allowed, slot_transition_allowed};
pub use mutations::{LessonRequest, SlotRequest};
pub use reservation::{Reservation, SlotUpdate};

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashSet;
use tracing::debug;
use ulid::Ulid;

use crate::cache::{CacheLayer, keys};
use crate::config::EngineConfig;
use crate::limits::{MAX_NAME_LEN, MAX_PHONE_LEN};
use crate::model::*;
use crate::notify::{Notification, NotificationKind, Outbox};
use crate::store::BookingStore;

/// Composition point for booking operations: reads go through the caches,
/// writes go straight to the store and invalidate the caches afterwards.
pub struct BookingEngine {
    store: Arc<dyn BookingStore>,
    lessons: CacheLayer<Vec<Lesson>>,
    slots: CacheLayer<Vec<Slot>>,
    config: EngineConfig,
    audit: AuditLog,
    outbox: Outbox,
    /// Slots with a reservation in flight in this process.
    reserving: DashSet<Ulid>,
}

impl BookingEngine {
    /// Engine with in-memory caches, an in-memory audit log and no notifications.
    pub fn new(store: Arc<dyn BookingStore>, config: EngineConfig) -> Self {
        Self {
            store,
            lessons: CacheLayer::in_memory(keys::LESSONS),
            slots: CacheLayer::in_memory(keys::SLOTS),
            config,
            audit: AuditLog::in_memory(),
            outbox: Outbox::disabled(),
            reserving: DashSet::new(),
        }
    }

    pub fn with_caches(mut self, lessons: CacheLayer<Vec<Lesson>>, slots: CacheLayer<Vec<Slot>>) -> Self {
        self.lessons = lessons;
        self.slots = slots;
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_outbox(mut self, outbox: Outbox) -> Self {
        self.outbox = outbox;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BookingStore> {
        &self.store
    }

    pub fn lessons_cache(&self) -> &CacheLayer<Vec<Lesson>> {
        &self.lessons
    }

    pub fn slots_cache(&self) -> &CacheLayer<Vec<Slot>> {
        &self.slots
    }

    pub fn overrides(&self) -> Vec<OverrideRecord> {
        self.audit.list()
    }

    pub async fn register_student(&self, student: Student) -> Result<Student, BookingError> {
        if student.name.trim().is_empty() {
            return Err(BookingError::validation("student name is required"));
        }
        if student.name.len() > MAX_NAME_LEN {
            return Err(BookingError::LimitExceeded("student name too long"));
        }
        if student.phone.as_ref().is_some_and(|p| p.len() > MAX_PHONE_LEN) {
            return Err(BookingError::LimitExceeded("phone number too long"));
        }
        self.store.register_student(student.clone()).await?;
        Ok(student)
    }

    pub async fn get_student(&self, id: Ulid) -> Result<Student, BookingError> {
        Ok(self.store.get_student(id).await?)
    }

    /// Pass when nothing conflicts; otherwise require an override and audit it.
    fn authorize(
        &self,
        operation: &str,
        conflicts: ConflictSet,
        by: Option<&Override>,
    ) -> Result<(), BookingError> {
        if conflicts.can_proceed() {
            return Ok(());
        }
        match by {
            Some(by) => self.audit.record(operation, by, &conflicts).map(|_| ()),
            None => Err(BookingError::Conflict(conflicts)),
        }
    }

    fn invalidate_lessons(&self) {
        self.lessons.invalidate(&keys::lesson_invalidation());
    }

    fn invalidate_slots(&self, date: NaiveDate) {
        for pattern in keys::slot_invalidations(date) {
            self.slots.invalidate(&pattern);
        }
    }

    /// Drop cache entries that expired more than `max_stale` ago.
    pub fn sweep_caches(&self, max_stale: Duration) -> usize {
        self.lessons.purge_expired(max_stale) + self.slots.purge_expired(max_stale)
    }

    /// Queue a message for every listed student that has a phone number.
    async fn notify_students(&self, kind: NotificationKind, student_ids: &[Ulid], date: NaiveDate) {
        for id in student_ids {
            match self.store.get_student(*id).await {
                Ok(Student {
                    phone: Some(phone),
                    name,
                    ..
                }) => {
                    self.outbox.enqueue(Notification { kind, phone, date, name });
                }
                Ok(_) => debug!("student {id} has no phone, skipping {kind:?} notification"),
                Err(e) => debug!("cannot notify student {id}: {e}"),
            }
        }
    }
}
