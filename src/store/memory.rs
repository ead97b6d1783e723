use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::*;

use super::{BookingStore, StoreError, StoreResult};

/// A single record mutation. Doubles as the WAL record format of [`super::WalStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    StudentRegistered(Student),
    SlotCreated(Slot),
    SlotUpdated(Slot),
    LessonCreated(Lesson),
    LessonUpdated(Lesson),
}

/// DashMap-backed record store. Writes are serialized through `write_gate` so a
/// read-modify-write of one record never interleaves with another.
pub struct MemoryStore {
    lessons: DashMap<Ulid, Lesson>,
    slots: DashMap<Ulid, Slot>,
    students: DashMap<Ulid, Student>,
    write_gate: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            lessons: DashMap::new(),
            slots: DashMap::new(),
            students: DashMap::new(),
            write_gate: Mutex::new(()),
        }
    }

    pub fn lesson_count(&self) -> usize {
        self.lessons.len()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    // ── Event preparation (validate, build the record, don't apply) ──

    pub(super) fn prepare_create_lesson(&self, fields: NewLesson) -> StoreResult<StoreEvent> {
        if fields.student_ids.is_empty() {
            return Err(StoreError::Invalid("lesson needs at least one student".into()));
        }
        if fields.duration_min == 0 {
            return Err(StoreError::Invalid("lesson duration must be positive".into()));
        }
        for sid in &fields.student_ids {
            if !self.students.contains_key(sid) {
                return Err(StoreError::Invalid(format!("unknown student {sid}")));
            }
        }
        Ok(StoreEvent::LessonCreated(Lesson {
            id: Ulid::new(),
            student_ids: fields.student_ids,
            teacher_id: fields.teacher_id,
            date: fields.date,
            start: fields.start,
            duration_min: fields.duration_min,
            status: fields.status,
            kind: fields.kind,
            price_cents: fields.price_cents,
        }))
    }

    pub(super) fn prepare_update_lesson(&self, id: Ulid, patch: LessonPatch) -> StoreResult<StoreEvent> {
        let mut lesson = self
            .lessons
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))?;
        if let Some(status) = patch.status {
            lesson.status = status;
        }
        if let Some(date) = patch.date {
            lesson.date = date;
        }
        if let Some(start) = patch.start {
            lesson.start = start;
        }
        if let Some(duration) = patch.duration_min {
            if duration == 0 {
                return Err(StoreError::Invalid("lesson duration must be positive".into()));
            }
            lesson.duration_min = duration;
        }
        Ok(StoreEvent::LessonUpdated(lesson))
    }

    pub(super) fn prepare_create_slot(&self, fields: NewSlot) -> StoreResult<StoreEvent> {
        if self.slots.contains_key(&fields.id) {
            return Err(StoreError::Invalid(format!("slot {} already exists", fields.id)));
        }
        if fields.end <= fields.start {
            return Err(StoreError::Invalid("slot must end after it starts".into()));
        }
        Ok(StoreEvent::SlotCreated(Slot {
            id: fields.id,
            teacher_id: fields.teacher_id,
            date: fields.date,
            start: fields.start,
            end: fields.end,
            status: SlotStatus::Open,
            lesson_ids: Vec::new(),
            student_ids: Vec::new(),
            kind: fields.kind,
        }))
    }

    pub(super) fn prepare_update_slot(&self, id: Ulid, patch: SlotPatch) -> StoreResult<StoreEvent> {
        let mut slot = self
            .slots
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))?;
        if let Some(status) = patch.status {
            slot.status = status;
        }
        if let Some(lessons) = patch.lesson_ids {
            slot.lesson_ids = lessons;
        }
        if let Some(students) = patch.student_ids {
            slot.student_ids = students;
        }
        Ok(StoreEvent::SlotUpdated(slot))
    }

    pub(super) fn prepare_register_student(&self, student: Student) -> StoreResult<StoreEvent> {
        if self.students.contains_key(&student.id) {
            return Err(StoreError::Invalid(format!("student {} already exists", student.id)));
        }
        Ok(StoreEvent::StudentRegistered(student))
    }

    // ── Event application ────────────────────────────────────

    pub fn apply(&self, event: &StoreEvent) {
        match event {
            StoreEvent::StudentRegistered(student) => {
                self.students.insert(student.id, student.clone());
            }
            StoreEvent::SlotCreated(slot) | StoreEvent::SlotUpdated(slot) => {
                self.slots.insert(slot.id, slot.clone());
            }
            StoreEvent::LessonCreated(lesson) | StoreEvent::LessonUpdated(lesson) => {
                self.lessons.insert(lesson.id, lesson.clone());
            }
        }
    }

    /// The minimal event sequence that recreates the current state.
    pub fn snapshot_events(&self) -> Vec<StoreEvent> {
        let mut events: Vec<StoreEvent> = self
            .students
            .iter()
            .map(|e| StoreEvent::StudentRegistered(e.value().clone()))
            .collect();
        events.extend(self.slots.iter().map(|e| StoreEvent::SlotCreated(e.value().clone())));
        events.extend(self.lessons.iter().map(|e| StoreEvent::LessonCreated(e.value().clone())));
        events
    }

    // ── Queries ──────────────────────────────────────────────

    pub(super) fn query_lessons(&self, range: DateRange, teacher_id: Option<Ulid>) -> Vec<Lesson> {
        let mut out: Vec<Lesson> = self
            .lessons
            .iter()
            .filter(|e| range.contains(e.date))
            .filter(|e| teacher_id.is_none() || e.teacher_id == teacher_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|l| (l.date, l.start, l.id));
        out
    }

    pub(super) fn query_slots(&self, range: DateRange, teacher_id: Option<Ulid>) -> Vec<Slot> {
        let mut out: Vec<Slot> = self
            .slots
            .iter()
            .filter(|e| range.contains(e.date))
            .filter(|e| teacher_id.is_none() || e.teacher_id == teacher_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|s| (s.date, s.start, s.id));
        out
    }

    pub(super) fn lesson(&self, id: Ulid) -> StoreResult<Lesson> {
        self.lessons
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    pub(super) fn slot(&self, id: Ulid) -> StoreResult<Slot> {
        self.slots
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    pub(super) fn student(&self, id: Ulid) -> StoreResult<Student> {
        self.students
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn list_lessons(&self, range: DateRange, teacher_id: Option<Ulid>) -> StoreResult<Vec<Lesson>> {
        Ok(self.query_lessons(range, teacher_id))
    }

    async fn list_slots(&self, range: DateRange, teacher_id: Option<Ulid>) -> StoreResult<Vec<Slot>> {
        Ok(self.query_slots(range, teacher_id))
    }

    async fn get_lesson(&self, id: Ulid) -> StoreResult<Lesson> {
        self.lesson(id)
    }

    async fn get_slot(&self, id: Ulid) -> StoreResult<Slot> {
        self.slot(id)
    }

    async fn create_lesson(&self, fields: NewLesson) -> StoreResult<Lesson> {
        let _gate = self.write_gate.lock().await;
        let event = self.prepare_create_lesson(fields)?;
        self.apply(&event);
        match event {
            StoreEvent::LessonCreated(lesson) => Ok(lesson),
            _ => unreachable!(),
        }
    }

    async fn update_lesson(&self, id: Ulid, patch: LessonPatch) -> StoreResult<Lesson> {
        let _gate = self.write_gate.lock().await;
        let event = self.prepare_update_lesson(id, patch)?;
        self.apply(&event);
        match event {
            StoreEvent::LessonUpdated(lesson) => Ok(lesson),
            _ => unreachable!(),
        }
    }

    async fn create_slot(&self, fields: NewSlot) -> StoreResult<Slot> {
        let _gate = self.write_gate.lock().await;
        let event = self.prepare_create_slot(fields)?;
        self.apply(&event);
        match event {
            StoreEvent::SlotCreated(slot) => Ok(slot),
            _ => unreachable!(),
        }
    }

    async fn update_slot(&self, id: Ulid, patch: SlotPatch) -> StoreResult<Slot> {
        let _gate = self.write_gate.lock().await;
        let event = self.prepare_update_slot(id, patch)?;
        self.apply(&event);
        match event {
            StoreEvent::SlotUpdated(slot) => Ok(slot),
            _ => unreachable!(),
        }
    }

    async fn register_student(&self, student: Student) -> StoreResult<()> {
        let _gate = self.write_gate.lock().await;
        let event = self.prepare_register_student(student)?;
        self.apply(&event);
        Ok(())
    }

    async fn get_student(&self, id: Ulid) -> StoreResult<Student> {
        self.student(id)
    }
}
