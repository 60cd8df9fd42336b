use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use super::{same_booked_slot, AppointmentStore, StoreError};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is running are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so the next batch starts clean.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    if let Err(e) = result {
        tracing::error!(error = %e, events = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── Store ────────────────────────────────────────────────

/// Durable store: in-memory indexes rebuilt from a write-ahead log on open.
pub struct WalStore {
    appointments: DashMap<Ulid, Appointment>,
    /// (location, date) → record ids, any status.
    lanes: DashMap<LaneKey, Vec<Ulid>>,
    /// Unique index over Booked records.
    slots: DashMap<SlotKey, Ulid>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Writers share it; compaction takes it exclusively so no append
    /// lands between the snapshot and the file swap.
    write_gate: RwLock<()>,
}

impl WalStore {
    /// Replay `path` and start the writer task. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            appointments: DashMap::new(),
            lanes: DashMap::new(),
            slots: DashMap::new(),
            wal_tx,
            write_gate: RwLock::new(()),
        };
        for event in &events {
            store.apply(event);
        }
        tracing::info!(path = %path.display(), events = events.len(), appointments = store.len(), "WAL replayed");
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.appointments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appointments.is_empty()
    }

    fn apply(&self, event: &Event) {
        match event {
            Event::AppointmentBooked { appointment } => self.index(appointment.clone()),
            Event::AppointmentUpdated { appointment } => {
                if let Some((_, old)) = self.appointments.remove(&appointment.id) {
                    self.unlink_lane(&old);
                    if !same_booked_slot(&old, appointment) {
                        self.release(&old);
                    }
                }
                self.index(appointment.clone());
            }
            Event::AppointmentDeleted { id } => {
                if let Some((_, old)) = self.appointments.remove(id) {
                    self.unlink_lane(&old);
                    self.release(&old);
                }
            }
        }
    }

    fn index(&self, appointment: Appointment) {
        self.lanes.entry(appointment.lane()).or_default().push(appointment.id);
        if appointment.status.blocks() {
            self.slots.insert(appointment.slot_key(), appointment.id);
        }
        self.appointments.insert(appointment.id, appointment);
    }

    fn unlink_lane(&self, old: &Appointment) {
        let lane = old.lane();
        if let Some(mut ids) = self.lanes.get_mut(&lane) {
            ids.retain(|id| *id != old.id);
        }
        self.lanes.remove_if(&lane, |_, ids| ids.is_empty());
    }

    /// Claim the unique slot for a Booked record before its event is written.
    /// Returns whether this call created the claim.
    fn reserve(&self, appointment: &Appointment) -> Result<bool, StoreError> {
        if !appointment.status.blocks() {
            return Ok(false);
        }
        match self.slots.entry(appointment.slot_key()) {
            Entry::Occupied(e) if *e.get() == appointment.id => Ok(false),
            Entry::Occupied(e) => Err(StoreError::Duplicate(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(appointment.id);
                Ok(true)
            }
        }
    }

    fn release(&self, appointment: &Appointment) {
        self.slots.remove_if(&appointment.slot_key(), |_, id| *id == appointment.id);
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| io::Error::other("WAL writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("WAL writer dropped response"))??;
        Ok(())
    }

    /// Reserve, append, apply. The reservation is rolled back if the append fails.
    async fn persist(&self, appointment: &Appointment, event: Event) -> Result<(), StoreError> {
        let _gate = self.write_gate.read().await;
        let reserved = self.reserve(appointment)?;
        if let Err(e) = self.wal_append(&event).await {
            if reserved {
                self.release(appointment);
            }
            return Err(e);
        }
        self.apply(&event);
        Ok(())
    }

    /// Rewrite the log as one `AppointmentBooked` per live record.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.write_gate.write().await;
        let mut snapshot: Vec<Appointment> = self.appointments.iter().map(|e| e.value().clone()).collect();
        snapshot.sort_by_key(|a| (a.created_at, a.id));
        let events: Vec<Event> = snapshot
            .into_iter()
            .map(|appointment| Event::AppointmentBooked { appointment })
            .collect();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| io::Error::other("WAL writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("WAL writer dropped response"))??;
        tracing::info!(appointments = count, "WAL compacted");
        Ok(())
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
impl AppointmentStore for WalStore {
    async fn day(&self, location_id: &str, date: CivilDate) -> Result<Vec<Appointment>, StoreError> {
        let lane = LaneKey {
            location_id: location_id.to_string(),
            date,
        };
        let ids = self.lanes.get(&lane).map(|ids| ids.clone()).unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.appointments.get(id).map(|a| a.value().clone()))
            .collect())
    }

    async fn get(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        Ok(self.appointments.get(&id).map(|a| a.value().clone()))
    }

    async fn insert(&self, appointment: Appointment) -> Result<(), StoreError> {
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist(&appointment, event).await
    }

    async fn replace(&self, appointment: Appointment) -> Result<(), StoreError> {
        if !self.appointments.contains_key(&appointment.id) {
            return Err(StoreError::NotFound(appointment.id));
        }
        let event = Event::AppointmentUpdated {
            appointment: appointment.clone(),
        };
        self.persist(&appointment, event).await
    }

    async fn remove(&self, id: Ulid) -> Result<Appointment, StoreError> {
        let _gate = self.write_gate.read().await;
        let existing = self.get(id).await?.ok_or(StoreError::NotFound(id))?;
        let event = Event::AppointmentDeleted { id };
        self.wal_append(&event).await?;
        self.apply(&event);
        Ok(existing)
    }

    async fn list(&self, filter: &AppointmentFilter) -> Result<Vec<Appointment>, StoreError> {
        Ok(self
            .appointments
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("chairbook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicate_slot() {
        let store = WalStore::open(&test_wal_path("dup.wal")).unwrap();
        store.insert(appointment("A", "S1", "2025-01-10", "10:00", &["cut"])).await.unwrap();
        let err = store
            .insert(appointment("A", "S1", "2025-01-10", "10:00", &["cut"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_on_one_slot_admit_one() {
        let store = Arc::new(WalStore::open(&test_wal_path("race.wal")).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert(appointment("A", "S1", "2025-01-10", "10:00", &["cut"])).await
            }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(store.day("A", date("2025-01-10")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let path = test_wal_path("reopen.wal");
        let mut moved = appointment("A", "S1", "2025-01-10", "10:00", &["cut"]);
        let gone = appointment("A", "S2", "2025-01-10", "10:00", &["cut"]);
        {
            let store = WalStore::open(&path).unwrap();
            store.insert(moved.clone()).await.unwrap();
            store.insert(gone.clone()).await.unwrap();
            moved.date = date("2025-01-11");
            moved.status = AppointmentStatus::Completed;
            store.replace(moved.clone()).await.unwrap();
            store.remove(gone.id).await.unwrap();
        }

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(moved.id).await.unwrap(), Some(moved.clone()));
        assert!(store.day("A", date("2025-01-10")).await.unwrap().is_empty());
        assert_eq!(store.day("A", date("2025-01-11")).await.unwrap().len(), 1);

        // Completed released the slot index
        store.insert(appointment("A", "S1", "2025-01-11", "10:00", &["cut"])).await.unwrap();
    }

    #[tokio::test]
    async fn replace_moves_the_slot_claim() {
        let store = WalStore::open(&test_wal_path("move.wal")).unwrap();
        let mut appt = appointment("A", "S1", "2025-01-10", "10:00", &["cut"]);
        store.insert(appt.clone()).await.unwrap();
        appt.time = time("11:00");
        store.replace(appt.clone()).await.unwrap();

        store.insert(appointment("A", "S1", "2025-01-10", "10:00", &["cut"])).await.unwrap();
        let err = store
            .insert(appointment("A", "S1", "2025-01-10", "11:00", &["cut"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn replace_unknown_is_not_found() {
        let store = WalStore::open(&test_wal_path("unknown.wal")).unwrap();
        let appt = appointment("A", "S1", "2025-01-10", "10:00", &["cut"]);
        assert!(matches!(store.replace(appt.clone()).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.remove(appt.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn compact_preserves_state_and_resets_counter() {
        let path = test_wal_path("compact.wal");
        let mut kept = appointment("A", "S1", "2025-01-10", "10:00", &["cut"]);
        {
            let store = WalStore::open(&path).unwrap();
            store.insert(kept.clone()).await.unwrap();
            for _ in 0..5 {
                let tmp = appointment("A", "S2", "2025-01-10", "12:00", &["cut"]);
                store.insert(tmp.clone()).await.unwrap();
                store.remove(tmp.id).await.unwrap();
            }
            kept.status = AppointmentStatus::Completed;
            store.replace(kept.clone()).await.unwrap();
            assert_eq!(store.appends_since_compact().await, 12);
            let before = std::fs::metadata(&path).unwrap().len();

            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before);
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![Event::AppointmentBooked { appointment: kept.clone() }]);
        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.get(kept.id).await.unwrap(), Some(kept));
    }
}
