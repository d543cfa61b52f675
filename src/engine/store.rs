use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

#[derive(Debug)]
pub enum StoreError {
    Wal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Table lookup and administration.
#[async_trait]
pub trait TableRegistry: Send + Sync {
    async fn find_table_by_id(&self, id: Ulid) -> Result<Option<Table>, StoreError>;
    async fn find_table_by_number(&self, number: u32) -> Result<Option<Table>, StoreError>;
    /// Ordered by capacity, then table number.
    async fn list_tables(&self, filter: &TableFilter) -> Result<Vec<Table>, StoreError>;
    async fn save_table(&self, table: Table) -> Result<Table, StoreError>;
    async fn delete_table(&self, id: Ulid) -> Result<(), StoreError>;
}

/// Booking persistence. List results are ordered by `start`.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find_by_id(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;
    async fn find_all(&self) -> Result<Vec<Booking>, StoreError>;
    async fn find_by_table(&self, table_id: Ulid) -> Result<Vec<Booking>, StoreError>;
    async fn find_by_customer_email(&self, email: &str) -> Result<Vec<Booking>, StoreError>;
    /// CONFIRMED bookings of `table_id` whose window touches or overlaps `window`.
    async fn find_overlapping(&self, table_id: Ulid, window: Window) -> Result<Vec<Booking>, StoreError>;
    /// Any status, `end < threshold`.
    async fn find_older_than(&self, threshold: Ms) -> Result<Vec<Booking>, StoreError>;
    /// CONFIRMED, `from <= start <= to`.
    async fn find_confirmed_starting_between(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, StoreError>;
    /// Any status, `from <= start <= to`.
    async fn find_starting_between(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, StoreError>;
    async fn save(&self, booking: Booking) -> Result<Booking, StoreError>;
    async fn delete(&self, booking: &Booking) -> Result<(), StoreError>;
    /// Returns the number of bookings removed.
    async fn delete_all(&self, bookings: &[Booking]) -> Result<usize, StoreError>;
}

// ── Per-table schedule ───────────────────────────────────────────

/// All bookings of one table, sorted by `start`.
#[derive(Debug, Clone, Default)]
pub struct TableSchedule {
    bookings: Vec<Booking>,
}

impl TableSchedule {
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.start, |b| b.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Insert, dropping any earlier copy with the same id.
    pub fn replace(&mut self, booking: Booking) {
        self.remove(booking.id);
        self.insert(booking);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose closed window meets `window`.
    /// Everything at index >= right_bound starts after `window.end`.
    pub fn overlapping(&self, window: &Window) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.start <= window.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.end >= window.start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter()
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }
}

// ── Group-commit WAL channel ─────────────────────────────────────

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

/// Owns the WAL. Takes the first queued append, drains whatever else is
/// already queued, then syncs the whole batch once.
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

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so a half-written batch does not
    // leak into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
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
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── WAL-backed store ─────────────────────────────────────────────

/// Durable in-memory store: every mutation is journaled before it is applied.
pub struct WalStore {
    tables: DashMap<Ulid, Table>,
    table_numbers: DashMap<u32, Ulid>,
    schedules: DashMap<Ulid, TableSchedule>,
    /// Reverse lookup: booking id → table id
    booking_to_table: DashMap<Ulid, Ulid>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Writers hold it shared; compaction holds it exclusively so the snapshot
    /// and the log swap see the same state.
    gate: RwLock<()>,
}

impl WalStore {
    /// Replay the WAL at `path` and start its writer task.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            tables: DashMap::new(),
            table_numbers: DashMap::new(),
            schedules: DashMap::new(),
            booking_to_table: DashMap::new(),
            wal_tx,
            gate: RwLock::new(()),
        };
        for event in &events {
            store.apply(event);
        }
        tracing::info!(
            "store opened from {}: {} events, {} tables, {} bookings",
            path.display(),
            events.len(),
            store.table_count(),
            store.booking_count()
        );
        Ok(store)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn booking_count(&self) -> usize {
        self.booking_to_table.len()
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    async fn persist_and_apply(&self, event: Event) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        self.wal_append(&event).await?;
        self.apply(&event);
        Ok(())
    }

    fn unlink_booking(&self, id: &Ulid) {
        if let Some((_, table_id)) = self.booking_to_table.remove(id) {
            if let Some(mut schedule) = self.schedules.get_mut(&table_id) {
                schedule.remove(*id);
            }
            self.schedules.remove_if(&table_id, |_, s| s.is_empty());
        }
    }

    fn apply(&self, event: &Event) {
        match event {
            Event::TableSaved { table } => {
                if let Some(prev) = self.tables.insert(table.id, table.clone())
                    && prev.table_number != table.table_number
                {
                    self.table_numbers
                        .remove_if(&prev.table_number, |_, id| *id == table.id);
                }
                self.table_numbers.insert(table.table_number, table.id);
            }
            Event::TableDeleted { id } => {
                if let Some((_, prev)) = self.tables.remove(id) {
                    self.table_numbers.remove_if(&prev.table_number, |_, tid| tid == id);
                }
            }
            Event::BookingSaved { booking } => {
                // Readers must always find the booking under some table, so
                // never unlink it before the new copy is in place.
                let previous = self.booking_to_table.get(&booking.id).map(|e| *e.value());
                if previous == Some(booking.table_id)
                    && let Some(mut schedule) = self.schedules.get_mut(&booking.table_id)
                {
                    schedule.replace(booking.clone());
                    return;
                }
                self.schedules
                    .entry(booking.table_id)
                    .or_default()
                    .replace(booking.clone());
                self.booking_to_table.insert(booking.id, booking.table_id);
                if let Some(old) = previous.filter(|t| *t != booking.table_id) {
                    if let Some(mut schedule) = self.schedules.get_mut(&old) {
                        schedule.remove(booking.id);
                    }
                    self.schedules.remove_if(&old, |_, s| s.is_empty());
                }
            }
            Event::BookingDeleted { id } => self.unlink_booking(id),
            Event::BookingsPurged { ids } => {
                for id in ids {
                    self.unlink_booking(id);
                }
            }
        }
    }

    fn collect_bookings(&self, mut keep: impl FnMut(&Booking) -> bool) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .schedules
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|b| keep(b))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by_key(|b| (b.start, b.id));
        out
    }

    /// Minimal event list that recreates the current state.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut tables: Vec<Table> = self.tables.iter().map(|e| e.value().clone()).collect();
        tables.sort_by_key(|t| t.table_number);
        let mut events: Vec<Event> = tables
            .into_iter()
            .map(|table| Event::TableSaved { table })
            .collect();
        events.extend(
            self.collect_bookings(|_| true)
                .into_iter()
                .map(|booking| Event::BookingSaved { booking }),
        );
        events
    }

    /// Rewrite the WAL with the current snapshot.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.gate.write().await;
        let events = self.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
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
impl TableRegistry for WalStore {
    async fn find_table_by_id(&self, id: Ulid) -> Result<Option<Table>, StoreError> {
        Ok(self.tables.get(&id).map(|e| e.value().clone()))
    }

    async fn find_table_by_number(&self, number: u32) -> Result<Option<Table>, StoreError> {
        let Some(id) = self.table_numbers.get(&number).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.tables.get(&id).map(|e| e.value().clone()))
    }

    async fn list_tables(&self, filter: &TableFilter) -> Result<Vec<Table>, StoreError> {
        let mut tables: Vec<Table> = self
            .tables
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        tables.sort_by_key(|t| (t.capacity, t.table_number));
        Ok(tables)
    }

    async fn save_table(&self, table: Table) -> Result<Table, StoreError> {
        self.persist_and_apply(Event::TableSaved { table: table.clone() }).await?;
        Ok(table)
    }

    async fn delete_table(&self, id: Ulid) -> Result<(), StoreError> {
        self.persist_and_apply(Event::TableDeleted { id }).await
    }
}

#[async_trait]
impl BookingStore for WalStore {
    async fn find_by_id(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        loop {
            let Some(table_id) = self.booking_to_table.get(&id).map(|e| *e.value()) else {
                return Ok(None);
            };
            if let Some(booking) = self.schedules.get(&table_id).and_then(|s| s.get(id).cloned()) {
                return Ok(Some(booking));
            }
            // Moved to another table between the two reads; follow it.
            if self.booking_to_table.get(&id).map(|e| *e.value()) == Some(table_id) {
                return Ok(None);
            }
        }
    }

    async fn find_all(&self) -> Result<Vec<Booking>, StoreError> {
        Ok(self.collect_bookings(|_| true))
    }

    async fn find_by_table(&self, table_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        Ok(self
            .schedules
            .get(&table_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_by_customer_email(&self, email: &str) -> Result<Vec<Booking>, StoreError> {
        Ok(self.collect_bookings(|b| b.customer_email == email))
    }

    async fn find_overlapping(&self, table_id: Ulid, window: Window) -> Result<Vec<Booking>, StoreError> {
        Ok(self
            .schedules
            .get(&table_id)
            .map(|s| {
                s.overlapping(&window)
                    .filter(|b| b.is_confirmed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_older_than(&self, threshold: Ms) -> Result<Vec<Booking>, StoreError> {
        Ok(self.collect_bookings(|b| b.end < threshold))
    }

    async fn find_confirmed_starting_between(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, StoreError> {
        Ok(self.collect_bookings(|b| b.is_confirmed() && from <= b.start && b.start <= to))
    }

    async fn find_starting_between(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, StoreError> {
        Ok(self.collect_bookings(|b| from <= b.start && b.start <= to))
    }

    async fn save(&self, booking: Booking) -> Result<Booking, StoreError> {
        self.persist_and_apply(Event::BookingSaved { booking: booking.clone() }).await?;
        Ok(booking)
    }

    async fn delete(&self, booking: &Booking) -> Result<(), StoreError> {
        self.persist_and_apply(Event::BookingDeleted { id: booking.id }).await
    }

    async fn delete_all(&self, bookings: &[Booking]) -> Result<usize, StoreError> {
        if bookings.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Ulid> = bookings.iter().map(|b| b.id).collect();
        let count = ids.len();
        self.persist_and_apply(Event::BookingsPurged { ids }).await?;
        Ok(count)
    }
}
