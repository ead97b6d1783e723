use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::memory::{MemoryStore, StoreEvent};
use super::{BookingStore, StoreError, StoreResult};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: StoreEvent,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<StoreEvent>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal<StoreEvent>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                for (_, tx) in batch {
                    let r = match &result {
                        Ok(()) => Ok(()),
                        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
                    };
                    let _ = tx.send(r);
                }

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal<StoreEvent>, batch: &[(StoreEvent, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal<StoreEvent>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events).map(|_| ()));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Durable [`BookingStore`]: every mutation is group-committed to the WAL
/// before it is applied to the in-memory records.
pub struct WalStore {
    records: MemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    write_gate: Mutex<()>,
}

impl WalStore {
    /// Replay the WAL at `path` and start the writer task. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events: Vec<StoreEvent> = Wal::replay(path)?;
        let records = MemoryStore::new();
        for event in &events {
            records.apply(event);
        }
        info!("replayed {} store events from {}", events.len(), path.display());

        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            records,
            wal_tx,
            write_gate: Mutex::new(()),
        })
    }

    async fn wal_append(&self, event: &StoreEvent) -> StoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL error: {e}")))
    }

    /// WAL-append + apply in one call.
    async fn persist_and_apply(&self, event: StoreEvent) -> StoreResult<StoreEvent> {
        self.wal_append(&event).await?;
        self.records.apply(&event);
        Ok(event)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact(&self) -> StoreResult<()> {
        let _gate = self.write_gate.lock().await;
        let events = self.records.snapshot_events();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL compaction failed: {e}")))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl BookingStore for WalStore {
    async fn list_lessons(&self, range: DateRange, teacher_id: Option<Ulid>) -> StoreResult<Vec<Lesson>> {
        Ok(self.records.query_lessons(range, teacher_id))
    }

    async fn list_slots(&self, range: DateRange, teacher_id: Option<Ulid>) -> StoreResult<Vec<Slot>> {
        Ok(self.records.query_slots(range, teacher_id))
    }

    async fn get_lesson(&self, id: Ulid) -> StoreResult<Lesson> {
        self.records.lesson(id)
    }

    async fn get_slot(&self, id: Ulid) -> StoreResult<Slot> {
        self.records.slot(id)
    }

    async fn create_lesson(&self, fields: NewLesson) -> StoreResult<Lesson> {
        let _gate = self.write_gate.lock().await;
        let event = self.records.prepare_create_lesson(fields)?;
        match self.persist_and_apply(event).await? {
            StoreEvent::LessonCreated(lesson) => Ok(lesson),
            _ => unreachable!(),
        }
    }

    async fn update_lesson(&self, id: Ulid, patch: LessonPatch) -> StoreResult<Lesson> {
        let _gate = self.write_gate.lock().await;
        let event = self.records.prepare_update_lesson(id, patch)?;
        match self.persist_and_apply(event).await? {
            StoreEvent::LessonUpdated(lesson) => Ok(lesson),
            _ => unreachable!(),
        }
    }

    async fn create_slot(&self, fields: NewSlot) -> StoreResult<Slot> {
        let _gate = self.write_gate.lock().await;
        let event = self.records.prepare_create_slot(fields)?;
        match self.persist_and_apply(event).await? {
            StoreEvent::SlotCreated(slot) => Ok(slot),
            _ => unreachable!(),
        }
    }

    async fn update_slot(&self, id: Ulid, patch: SlotPatch) -> StoreResult<Slot> {
        let _gate = self.write_gate.lock().await;
        let event = self.records.prepare_update_slot(id, patch)?;
        match self.persist_and_apply(event).await? {
            StoreEvent::SlotUpdated(slot) => Ok(slot),
            _ => unreachable!(),
        }
    }

    async fn register_student(&self, student: Student) -> StoreResult<()> {
        let _gate = self.write_gate.lock().await;
        let event = self.records.prepare_register_student(student)?;
        self.persist_and_apply(event).await?;
        Ok(())
    }

    async fn get_student(&self, id: Ulid) -> StoreResult<Student> {
        self.records.student(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn slot_fields(id: Ulid) -> NewSlot {
        NewSlot {
            id,
            teacher_id: Some(Ulid::new()),
            date: parse_date("2024-03-24").unwrap(),
            start: parse_hhmm("16:00").unwrap(),
            end: parse_hhmm("17:00").unwrap(),
            kind: None,
        }
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let path = test_wal_path("survive_reopen.wal");
        let slot_id = Ulid::new();
        let student_id = Ulid::new();
        {
            let store = WalStore::open(&path).unwrap();
            store
                .register_student(Student { id: student_id, name: "Lin".into(), phone: Some("+100".into()) })
                .await
                .unwrap();
            store.create_slot(slot_fields(slot_id)).await.unwrap();
            store
                .update_slot(slot_id, SlotPatch::status(SlotStatus::Blocked))
                .await
                .unwrap();
        }

        let reopened = WalStore::open(&path).unwrap();
        assert_eq!(reopened.get_slot(slot_id).await.unwrap().status, SlotStatus::Blocked);
        assert_eq!(reopened.get_student(student_id).await.unwrap().phone.as_deref(), Some("+100"));
    }

    #[tokio::test]
    async fn rejected_write_is_not_logged() {
        let path = test_wal_path("rejected_write.wal");
        let store = WalStore::open(&path).unwrap();
        let missing = Ulid::new();
        let result = store.update_slot(missing, SlotPatch::status(SlotStatus::Closed)).await;
        assert_eq!(result, Err(StoreError::NotFound(missing)));
        assert_eq!(store.appends_since_compact().await, 0);
    }

    #[tokio::test]
    async fn compaction_keeps_current_state() {
        let path = test_wal_path("compaction.wal");
        let slot_id = Ulid::new();
        {
            let store = WalStore::open(&path).unwrap();
            store.create_slot(slot_fields(slot_id)).await.unwrap();
            for status in [SlotStatus::Closed, SlotStatus::Open, SlotStatus::Closed] {
                store.update_slot(slot_id, SlotPatch::status(status)).await.unwrap();
            }
            assert_eq!(store.appends_since_compact().await, 4);
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
        }

        let events: Vec<StoreEvent> = Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 1);
        let reopened = WalStore::open(&path).unwrap();
        assert_eq!(reopened.get_slot(slot_id).await.unwrap().status, SlotStatus::Closed);
    }
}
