use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::conflict::teachers_compatible;
use super::{BookingEngine, BookingError};

/// What a calendar screen renders for a date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarView {
    pub range: DateRange,
    /// Active lessons, ordered by date and start.
    pub lessons: Vec<Lesson>,
    pub available_slots: Vec<Slot>,
    /// Closed slots, and open ones a lesson already sits in.
    pub occupied_slots: Vec<Slot>,
}

/// An open slot is offered only while nothing is linked to it and no active
/// lesson of a compatible teacher occupies exactly its interval.
pub fn is_bookable(slot: &Slot, lessons: &[Lesson]) -> bool {
    slot.is_open_and_unlinked()
        && !lessons.iter().any(|l| {
            l.is_active()
                && l.date == slot.date
                && l.start == slot.start
                && l.end_time() == slot.end
                && teachers_compatible(l.teacher_id, slot.teacher_id)
        })
}

impl CalendarView {
    pub fn build(range: DateRange, lessons: Vec<Lesson>, slots: Vec<Slot>) -> Self {
        let mut lessons: Vec<Lesson> = lessons
            .into_iter()
            .filter(|l| l.is_active() && range.contains(l.date))
            .collect();
        lessons.sort_by_key(|l| (l.date, l.start));

        let mut available_slots = Vec::new();
        let mut occupied_slots = Vec::new();
        for slot in slots.into_iter().filter(|s| range.contains(s.date)) {
            match slot.status {
                SlotStatus::Blocked | SlotStatus::Cancelled => {}
                SlotStatus::Open if is_bookable(&slot, &lessons) => available_slots.push(slot),
                SlotStatus::Open | SlotStatus::Closed => occupied_slots.push(slot),
            }
        }
        available_slots.sort_by_key(|s| (s.date, s.start));
        occupied_slots.sort_by_key(|s| (s.date, s.start));

        Self {
            range,
            lessons,
            available_slots,
            occupied_slots,
        }
    }
}

impl BookingEngine {
    /// Calendar for `range`, narrowed to one teacher's slots when given.
    ///
    /// Lessons are read for every teacher so a lesson without a teacher still
    /// occupies the slots it sits in.
    pub async fn calendar(&self, range: DateRange, teacher_id: Option<Ulid>) -> Result<CalendarView, BookingError> {
        let (lessons, slots) = tokio::try_join!(self.list_lessons(range, None), self.list_slots(range, teacher_id))?;
        let lessons = lessons
            .into_iter()
            .filter(|l| teachers_compatible(l.teacher_id, teacher_id))
            .collect();
        Ok(CalendarView::build(range, lessons, slots))
    }
}
