use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::model::{DateRange, Lesson, Slot};

use super::conflict::{ConflictSet, Proposal, find_conflicts};
use super::{BookingEngine, BookingError};

/// Outcome of one debounced evaluation, tagged with the edit that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisoryResult {
    pub generation: u64,
    pub conflicts: ConflictSet,
}

#[derive(Default)]
struct Snapshot {
    lessons: Vec<Lesson>,
    slots: Vec<Slot>,
}

/// Debounced, non-blocking conflict warnings for a proposal being edited.
///
/// Evaluates against records loaded up front, never the store. Every call to
/// [`propose`](Self::propose) restarts the quiet period; an evaluation only
/// runs if no newer edit arrived while it waited.
pub struct AdvisoryChecker {
    debounce: Duration,
    generation: Arc<AtomicU64>,
    snapshot: watch::Sender<Arc<Snapshot>>,
    results: watch::Sender<Option<AdvisoryResult>>,
}

impl AdvisoryChecker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            generation: Arc::new(AtomicU64::new(0)),
            snapshot: watch::Sender::new(Arc::new(Snapshot::default())),
            results: watch::Sender::new(None),
        }
    }

    /// Replace the records evaluations run against.
    pub fn load(&self, lessons: Vec<Lesson>, slots: Vec<Slot>) {
        self.snapshot.send_replace(Arc::new(Snapshot { lessons, slots }));
    }

    /// Schedule an evaluation of `proposal` and return its generation.
    pub fn propose(&self, proposal: Proposal) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.generation.clone();
        let snapshot = self.snapshot.subscribe();
        let results = self.results.clone();
        let debounce = self.debounce;

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if current.load(Ordering::SeqCst) != generation {
                debug!("advisory check {generation} superseded");
                return;
            }
            let records = snapshot.borrow().clone();
            let conflicts = find_conflicts(&proposal, &records.lessons, &records.slots);
            results.send_replace(Some(AdvisoryResult { generation, conflicts }));
        });
        generation
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AdvisoryResult>> {
        self.results.subscribe()
    }

    /// The most recently completed evaluation.
    pub fn latest(&self) -> Option<AdvisoryResult> {
        self.results.borrow().clone()
    }
}

impl BookingEngine {
    /// Checker preloaded with the cached records of `range`, debounced per config.
    pub async fn advisory_checker(&self, range: DateRange) -> Result<AdvisoryChecker, BookingError> {
        let (lessons, slots) = tokio::try_join!(self.list_lessons(range, None), self.list_slots(range, None))?;
        let checker = AdvisoryChecker::new(self.config.advisory_debounce);
        checker.load(lessons, slots);
        Ok(checker)
    }
}
