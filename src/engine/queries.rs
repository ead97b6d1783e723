use tracing::{debug, info};
use ulid::Ulid;

use crate::cache::keys;
use crate::limits::MAX_QUERY_DAYS;
use crate::model::*;

use super::conflict::{ConflictSet, Proposal, find_conflicts};
use super::{BookingEngine, BookingError};

fn check_range(range: &DateRange) -> Result<(), BookingError> {
    if range.from > range.to {
        return Err(BookingError::validation("date range ends before it starts"));
    }
    if range.days() > MAX_QUERY_DAYS {
        return Err(BookingError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

impl BookingEngine {
    /// Lessons in `range`, read through the lessons cache. May be stale when
    /// the store is unreachable.
    pub async fn list_lessons(&self, range: DateRange, teacher_id: Option<Ulid>) -> Result<Vec<Lesson>, BookingError> {
        check_range(&range)?;
        let key = keys::scope_key(keys::LESSONS, range, teacher_id);
        let store = self.store.clone();
        let hit = self
            .lessons
            .read_through(&key, self.config.lessons_ttl, self.config.read_mode, move || async move {
                store.list_lessons(range, teacher_id).await.map_err(BookingError::from)
            })
            .await?;
        if !hit.is_fresh {
            debug!("served stale {key}");
        }
        Ok(hit.data)
    }

    pub async fn list_slots(&self, range: DateRange, teacher_id: Option<Ulid>) -> Result<Vec<Slot>, BookingError> {
        check_range(&range)?;
        let key = keys::scope_key(keys::SLOTS, range, teacher_id);
        let store = self.store.clone();
        let hit = self
            .slots
            .read_through(&key, self.config.slots_ttl, self.config.read_mode, move || async move {
                store.list_slots(range, teacher_id).await.map_err(BookingError::from)
            })
            .await?;
        if !hit.is_fresh {
            debug!("served stale {key}");
        }
        Ok(hit.data)
    }

    /// Slots in `range` that can be booked right now.
    pub async fn available_slots(&self, range: DateRange, teacher_id: Option<Ulid>) -> Result<Vec<Slot>, BookingError> {
        Ok(self.calendar(range, teacher_id).await?.available_slots)
    }

    pub async fn get_lesson(&self, id: Ulid) -> Result<Lesson, BookingError> {
        Ok(self.store.get_lesson(id).await?)
    }

    pub async fn get_slot(&self, id: Ulid) -> Result<Slot, BookingError> {
        Ok(self.store.get_slot(id).await?)
    }

    /// Authoritative check of `proposal` against its calendar day.
    ///
    /// Both record kinds are read for every teacher and filtered here, so a
    /// record without a teacher still conflicts with everyone.
    pub async fn check_conflicts(&self, proposal: &Proposal) -> Result<ConflictSet, BookingError> {
        if proposal.span().is_none() {
            return Ok(ConflictSet::default());
        }
        let day = DateRange::day(proposal.date);
        let (lessons, slots) = tokio::try_join!(self.list_lessons(day, None), self.list_slots(day, None))?;
        let conflicts = find_conflicts(proposal, &lessons, &slots);
        if !conflicts.can_proceed() {
            metrics::counter!(crate::observability::CONFLICTS_DETECTED_TOTAL).increment(1);
            info!(
                "proposal on {} conflicts with {} lesson(s), {} open slot(s)",
                proposal.date,
                conflicts.lessons.len(),
                conflicts.open_slots.len()
            );
        }
        Ok(conflicts)
    }
}
