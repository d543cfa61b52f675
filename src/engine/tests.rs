use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::*;
use crate::model::*;
use crate::notify::{Channel, Notifier, NotifyError};

const H: Ms = HOUR_MS;
const M: Ms = MINUTE_MS;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("tablebook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

// ── Test doubles ─────────────────────────────────────────

/// Wraps the real store and counts calls, so tests can assert which
/// operations touched storage.
struct CountingStore {
    inner: WalStore,
    calls: AtomicUsize,
    overlap_calls: AtomicUsize,
    gate: StdMutex<Option<SaveGate>>,
}

/// Holds back the first matching `save` until released.
struct SaveGate {
    matches: Box<dyn Fn(&Booking) -> bool + Send + Sync>,
    held: Arc<Notify>,
    release: Arc<Notify>,
}

/// Handles for a gate installed with [`CountingStore::hold_save`].
struct HeldSave {
    held: Arc<Notify>,
    release: Arc<Notify>,
}

impl CountingStore {
    fn open(name: &str) -> Self {
        Self {
            inner: WalStore::open(&test_wal_path(name)).unwrap(),
            calls: AtomicUsize::new(0),
            overlap_calls: AtomicUsize::new(0),
            gate: StdMutex::new(None),
        }
    }

    fn hold_save(&self, matches: impl Fn(&Booking) -> bool + Send + Sync + 'static) -> HeldSave {
        let held = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(SaveGate {
            matches: Box::new(matches),
            held: held.clone(),
            release: release.clone(),
        });
        HeldSave { held, release }
    }

    async fn pass_gate(&self, booking: &Booking) {
        let gate = {
            let mut slot = self.gate.lock().unwrap();
            match slot.as_ref() {
                Some(gate) if (gate.matches)(booking) => slot.take(),
                _ => None,
            }
        };
        if let Some(gate) = gate {
            gate.held.notify_one();
            gate.release.notified().await;
        }
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.overlap_calls.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl TableRegistry for CountingStore {
    async fn find_table_by_id(&self, id: Ulid) -> Result<Option<Table>, StoreError> {
        self.hit();
        self.inner.find_table_by_id(id).await
    }
    async fn find_table_by_number(&self, number: u32) -> Result<Option<Table>, StoreError> {
        self.hit();
        self.inner.find_table_by_number(number).await
    }
    async fn list_tables(&self, filter: &TableFilter) -> Result<Vec<Table>, StoreError> {
        self.hit();
        self.inner.list_tables(filter).await
    }
    async fn save_table(&self, table: Table) -> Result<Table, StoreError> {
        self.hit();
        self.inner.save_table(table).await
    }
    async fn delete_table(&self, id: Ulid) -> Result<(), StoreError> {
        self.hit();
        self.inner.delete_table(id).await
    }
}

#[async_trait]
impl BookingStore for CountingStore {
    async fn find_by_id(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        self.hit();
        self.inner.find_by_id(id).await
    }
    async fn find_all(&self) -> Result<Vec<Booking>, StoreError> {
        self.hit();
        self.inner.find_all().await
    }
    async fn find_by_table(&self, table_id: Ulid) -> Result<Vec<Booking>, StoreError> {
        self.hit();
        self.inner.find_by_table(table_id).await
    }
    async fn find_by_customer_email(&self, email: &str) -> Result<Vec<Booking>, StoreError> {
        self.hit();
        self.inner.find_by_customer_email(email).await
    }
    async fn find_overlapping(&self, table_id: Ulid, window: Window) -> Result<Vec<Booking>, StoreError> {
        self.hit();
        self.overlap_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.find_overlapping(table_id, window).await
    }
    async fn find_older_than(&self, threshold: Ms) -> Result<Vec<Booking>, StoreError> {
        self.hit();
        self.inner.find_older_than(threshold).await
    }
    async fn find_confirmed_starting_between(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, StoreError> {
        self.hit();
        self.inner.find_confirmed_starting_between(from, to).await
    }
    async fn find_starting_between(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, StoreError> {
        self.hit();
        self.inner.find_starting_between(from, to).await
    }
    async fn save(&self, booking: Booking) -> Result<Booking, StoreError> {
        self.hit();
        self.pass_gate(&booking).await;
        self.inner.save(booking).await
    }
    async fn delete(&self, booking: &Booking) -> Result<(), StoreError> {
        self.hit();
        self.inner.delete(booking).await
    }
    async fn delete_all(&self, bookings: &[Booking]) -> Result<usize, StoreError> {
        self.hit();
        self.inner.delete_all(bookings).await
    }
}

type FailWhen = Box<dyn Fn(Channel, &Booking) -> bool + Send + Sync>;

/// Records every send attempt; fails the ones `fail_when` selects.
struct RecordingNotifier {
    attempts: StdMutex<Vec<(Channel, Ulid, bool)>>,
    fail_when: FailWhen,
}

impl RecordingNotifier {
    fn ok() -> Self {
        Self::failing(|_, _| false)
    }

    fn failing(fail_when: impl Fn(Channel, &Booking) -> bool + Send + Sync + 'static) -> Self {
        Self {
            attempts: StdMutex::new(Vec::new()),
            fail_when: Box::new(fail_when),
        }
    }

    fn record(&self, channel: Channel, booking: &Booking) -> Result<(), NotifyError> {
        let fail = (self.fail_when)(channel, booking);
        self.attempts.lock().unwrap().push((channel, booking.id, !fail));
        if fail {
            return Err(NotifyError::Transport("smtp unreachable".into()));
        }
        Ok(())
    }

    fn channels(&self) -> Vec<Channel> {
        self.attempts.lock().unwrap().iter().map(|(c, _, _)| *c).collect()
    }

    fn clear(&self) {
        self.attempts.lock().unwrap().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_booking_confirmation(&self, booking: &Booking, _: &Table) -> Result<(), NotifyError> {
        self.record(Channel::ConfirmationEmail, booking)
    }
    async fn send_booking_cancellation(&self, booking: &Booking, _: &Table) -> Result<(), NotifyError> {
        self.record(Channel::CancellationEmail, booking)
    }
    async fn send_booking_update(&self, booking: &Booking, _: &Table) -> Result<(), NotifyError> {
        self.record(Channel::UpdateEmail, booking)
    }
    async fn send_confirmation_sms(&self, booking: &Booking, _: &Table) -> Result<(), NotifyError> {
        self.record(Channel::ConfirmationSms, booking)
    }
    async fn send_cancellation_sms(&self, booking: &Booking, _: &Table) -> Result<(), NotifyError> {
        self.record(Channel::CancellationSms, booking)
    }
    async fn send_reminder_sms(&self, booking: &Booking, _: &Table) -> Result<(), NotifyError> {
        self.record(Channel::ReminderSms, booking)
    }
    async fn send_admin_notification_sms(&self, booking: &Booking, _: &Table, _: &str) -> Result<(), NotifyError> {
        self.record(Channel::AdminSms, booking)
    }
}

struct Harness {
    engine: Engine,
    store: Arc<CountingStore>,
    notifier: Arc<RecordingNotifier>,
}

fn harness_with(name: &str, notifier: RecordingNotifier) -> Harness {
    let store = Arc::new(CountingStore::open(name));
    let notifier = Arc::new(notifier);
    let engine = Engine::new(store.clone(), store.clone(), notifier.clone())
        .with_admin_phone(Some("+1 555 0100".into()));
    Harness { engine, store, notifier }
}

fn harness(name: &str) -> Harness {
    harness_with(name, RecordingNotifier::ok())
}

/// A base instant a day ahead, so windows built from it are in the future.
fn tomorrow() -> Ms {
    now_ms() + 24 * H
}

/// `hour` o'clock local time, `days` days from now.
fn local_at(days: i64, hour: i64) -> Ms {
    let day = local_date(now_ms() + days * DAY_MS).unwrap();
    local_midnight(day).unwrap() + hour * H
}

fn request(table_id: Ulid, start: Ms, end: Ms) -> BookingRequest {
    BookingRequest::new(table_id, start, end, "Ada Lovelace", "ada@example.com").with_phone("+44 20 7946 0000")
}

fn stored(table_id: Ulid, start: Ms, end: Ms, status: BookingStatus) -> Booking {
    Booking {
        id: Ulid::new(),
        table_id,
        start,
        end,
        customer_name: "Grace Hopper".into(),
        customer_email: "grace@example.com".into(),
        customer_phone: Some("+1 555 0142".into()),
        status,
    }
}

// ── Create ───────────────────────────────────────────────

#[tokio::test]
async fn conflict_boundaries_are_inclusive() {
    let h = harness("boundaries.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();

    let a = h.engine.create_booking(request(table.id, t + H, t + 3 * H)).await.unwrap();
    assert_eq!(a.status, BookingStatus::Confirmed);

    let b = h.engine.create_booking(request(table.id, t + 2 * H, t + 4 * H)).await;
    assert!(matches!(b, Err(EngineError::BookingConflict { table_number: 1 })));

    // Starts exactly where A ends.
    let c = h.engine.create_booking(request(table.id, t + 3 * H, t + 5 * H)).await;
    assert!(matches!(c, Err(EngineError::BookingConflict { .. })));

    let d = h.engine.create_booking(request(table.id, t + 3 * H + M, t + 5 * H)).await;
    assert!(d.is_ok());
    assert_eq!(h.engine.bookings_for_table(table.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn invalid_window_rejected_before_storage() {
    let h = harness("window_no_store.wal");
    let table_id = Ulid::new();
    let now = now_ms();
    h.store.reset();

    let past = h.engine.create_booking(request(table_id, now - M, now + H)).await;
    assert!(matches!(past, Err(EngineError::InvalidWindow(WindowError::StartInPast))));

    let mut missing = request(table_id, now + H, now + 2 * H);
    missing.end = None;
    let missing = h.engine.create_booking(missing).await;
    assert!(matches!(missing, Err(EngineError::InvalidWindow(WindowError::Missing))));

    let inverted = h.engine.create_booking(request(table_id, now + 2 * H, now + H)).await;
    assert!(matches!(inverted, Err(EngineError::InvalidWindow(WindowError::EndNotAfterStart))));

    let long = h.engine.create_booking(request(table_id, now + H, now + 9 * H + 1)).await;
    assert!(matches!(long, Err(EngineError::InvalidWindow(WindowError::TooLong))));

    assert_eq!(h.store.calls.load(Ordering::SeqCst), 0);
    assert!(h.notifier.channels().is_empty());
}

#[tokio::test]
async fn window_errors_checked_in_order() {
    let h = harness("window_order.wal");
    let now = now_ms();
    // In the past and inverted: the past start is reported.
    let err = h.engine.create_booking(request(Ulid::new(), now - H, now - 2 * H)).await;
    assert!(matches!(err, Err(EngineError::InvalidWindow(WindowError::StartInPast))));
}

#[tokio::test]
async fn invalid_customer_rejected_before_storage() {
    let h = harness("customer_no_store.wal");
    let t = tomorrow();
    h.store.reset();

    let mut short_name = request(Ulid::new(), t, t + H);
    short_name.customer_name = "A".into();
    assert!(matches!(
        h.engine.create_booking(short_name).await,
        Err(EngineError::InvalidRequest(_))
    ));

    let mut bad_email = request(Ulid::new(), t, t + H);
    bad_email.customer_email = "not-an-address".into();
    assert!(matches!(
        h.engine.create_booking(bad_email).await,
        Err(EngineError::InvalidRequest(_))
    ));

    let bad_phone = request(Ulid::new(), t, t + H).with_phone("call me maybe");
    assert!(matches!(
        h.engine.create_booking(bad_phone).await,
        Err(EngineError::InvalidRequest(_))
    ));

    assert_eq!(h.store.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn create_on_unknown_table() {
    let h = harness("unknown_table.wal");
    let t = tomorrow();
    let missing = Ulid::new();
    let err = h.engine.create_booking(request(missing, t, t + H)).await.unwrap_err();
    assert!(matches!(err, EngineError::TableNotFound(id) if id == missing));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn unknown_tables_leave_no_locks_behind() {
    let h = harness("unknown_table_locks.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    let booking = h.engine.create_booking(request(table.id, t, t + H)).await.unwrap();
    let before = h.engine.table_locks.len();

    for _ in 0..20 {
        let missing = Ulid::new();
        assert!(matches!(
            h.engine.create_booking(request(missing, t, t + H)).await,
            Err(EngineError::TableNotFound(_))
        ));
        assert!(matches!(
            h.engine.update_booking(booking.id, request(missing, t, t + H)).await,
            Err(EngineError::TableNotFound(_))
        ));
        let moved = BookingChanges { table_id: Some(missing), ..Default::default() };
        assert!(matches!(
            h.engine.patch_booking(booking.id, &moved).await,
            Err(EngineError::TableNotFound(_))
        ));
        assert!(matches!(
            h.engine.update_table(missing, TableSpec::new(2, 4, false)).await,
            Err(EngineError::TableNotFound(_))
        ));
        assert!(matches!(
            h.engine.delete_table(missing).await,
            Err(EngineError::TableNotFound(_))
        ));
    }
    assert_eq!(h.engine.table_locks.len(), before);
}

#[tokio::test]
async fn blank_phone_stored_as_absent() {
    let h = harness("blank_phone.wal");
    let table = h.engine.create_table(TableSpec::new(1, 2, false)).await.unwrap();
    let t = tomorrow();
    let booking = h
        .engine
        .create_booking(request(table.id, t, t + H).with_phone("   "))
        .await
        .unwrap();
    assert_eq!(booking.customer_phone, None);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn create_sends_all_confirmations() {
    let h = harness("notify_create.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    h.engine.create_booking(request(table.id, t, t + H)).await.unwrap();
    assert_eq!(
        h.notifier.channels(),
        vec![Channel::ConfirmationEmail, Channel::ConfirmationSms, Channel::AdminSms]
    );
}

#[tokio::test]
async fn email_failure_does_not_block_sms_or_booking() {
    let h = harness_with(
        "notify_email_fails.wal",
        RecordingNotifier::failing(|c, _| c == Channel::ConfirmationEmail),
    );
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();

    let booking = h.engine.create_booking(request(table.id, t, t + H)).await.unwrap();
    assert_eq!(h.engine.get_booking(booking.id).await.unwrap(), booking);

    let attempts = h.notifier.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0], (Channel::ConfirmationEmail, booking.id, false));
    assert_eq!(attempts[1], (Channel::ConfirmationSms, booking.id, true));
    assert_eq!(attempts[2], (Channel::AdminSms, booking.id, true));
}

#[tokio::test]
async fn no_admin_sms_without_admin_phone() {
    let store = Arc::new(CountingStore::open("no_admin.wal"));
    let notifier = Arc::new(RecordingNotifier::ok());
    let engine = Engine::new(store.clone(), store.clone(), notifier.clone()).with_admin_phone(Some("  ".into()));
    let table = engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    engine.create_booking(request(table.id, t, t + H)).await.unwrap();
    assert!(!notifier.channels().contains(&Channel::AdminSms));
}

#[tokio::test]
async fn failed_create_sends_nothing() {
    let h = harness("notify_conflict.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    h.engine.create_booking(request(table.id, t, t + H)).await.unwrap();
    h.notifier.clear();

    assert!(h.engine.create_booking(request(table.id, t, t + H)).await.is_err());
    assert!(h.notifier.channels().is_empty());
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn available_tables_ignore_cancelled_bookings() {
    let h = harness("available.wal");
    let big = h.engine.create_table(TableSpec::new(1, 6, false)).await.unwrap();
    let busy = h.engine.create_table(TableSpec::new(2, 4, false)).await.unwrap();
    let freed = h.engine.create_table(TableSpec::new(3, 4, true)).await.unwrap();
    let small = h.engine.create_table(TableSpec::new(4, 2, false)).await.unwrap();
    let t = tomorrow();

    h.engine.create_booking(request(busy.id, t + H, t + 3 * H)).await.unwrap();
    let cancelled = h.engine.create_booking(request(freed.id, t + H, t + 3 * H)).await.unwrap();
    h.engine.cancel_booking(cancelled.id).await.unwrap();

    let available = h
        .engine
        .find_available_tables(4, Some(t + 2 * H), Some(t + 4 * H))
        .await
        .unwrap();
    let ids: Vec<_> = available.iter().map(|t| t.id).collect();
    // Ordered by capacity, then table number.
    assert_eq!(ids, vec![freed.id, big.id]);
    assert!(!ids.contains(&small.id));
}

#[tokio::test]
async fn available_tables_validate_window() {
    let h = harness("available_window.wal");
    let now = now_ms();
    let err = h
        .engine
        .find_available_tables(2, Some(now - H), Some(now + H))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidWindow(WindowError::StartInPast)));
    let err = h.engine.find_available_tables(2, None, None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidWindow(WindowError::Missing)));
}

// ── Update ───────────────────────────────────────────────

#[tokio::test]
async fn update_without_reschedule_skips_conflict_check() {
    let h = harness("update_name_only.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    let booking = h.engine.create_booking(request(table.id, t, t + H)).await.unwrap();
    h.store.reset();
    h.notifier.clear();

    let mut req = BookingRequest::from_booking(&booking);
    req.customer_name = "Ada King".into();
    let updated = h.engine.update_booking(booking.id, req).await.unwrap();

    assert_eq!(updated.customer_name, "Ada King");
    assert_eq!(updated.id, booking.id);
    assert_eq!(updated.status, BookingStatus::Confirmed);
    assert_eq!(h.store.overlap_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.notifier.channels(), vec![Channel::UpdateEmail]);
}

#[tokio::test]
async fn update_reschedule_checks_other_bookings_only() {
    let h = harness("update_reschedule.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    let first = h.engine.create_booking(request(table.id, t, t + 2 * H)).await.unwrap();
    let second = h.engine.create_booking(request(table.id, t + 4 * H, t + 5 * H)).await.unwrap();
    h.store.reset();

    // Overlapping its own old window is fine.
    let mut req = BookingRequest::from_booking(&first);
    req.end = Some(t + 3 * H);
    let moved = h.engine.update_booking(first.id, req).await.unwrap();
    assert_eq!(moved.end, t + 3 * H);
    assert_eq!(h.store.overlap_calls.load(Ordering::SeqCst), 1);

    // Touching the second booking is not.
    let mut req = BookingRequest::from_booking(&moved);
    req.end = Some(second.start);
    let err = h.engine.update_booking(first.id, req).await.unwrap_err();
    assert!(matches!(err, EngineError::BookingConflict { table_number: 1 }));
    assert_eq!(h.engine.get_booking(first.id).await.unwrap().end, t + 3 * H);
}

#[tokio::test]
async fn update_moves_booking_between_tables() {
    let h = harness("update_move.wal");
    let one = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let two = h.engine.create_table(TableSpec::new(2, 4, false)).await.unwrap();
    let t = tomorrow();
    let booking = h.engine.create_booking(request(one.id, t, t + H)).await.unwrap();

    let mut req = BookingRequest::from_booking(&booking);
    req.table_id = two.id;
    let moved = h.engine.update_booking(booking.id, req).await.unwrap();
    assert_eq!(moved.table_id, two.id);

    assert!(h.engine.bookings_for_table(one.id).await.unwrap().is_empty());
    assert_eq!(h.engine.bookings_for_table(two.id).await.unwrap().len(), 1);
    // The old slot is free again.
    h.engine.create_booking(request(one.id, t, t + H)).await.unwrap();
}

#[tokio::test]
async fn update_errors() {
    let h = harness("update_errors.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    let booking = h.engine.create_booking(request(table.id, t, t + H)).await.unwrap();

    let missing = Ulid::new();
    let err = h
        .engine
        .update_booking(missing, request(table.id, t, t + H))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BookingNotFound(id) if id == missing));

    let mut req = BookingRequest::from_booking(&booking);
    req.table_id = Ulid::new();
    let err = h.engine.update_booking(booking.id, req).await.unwrap_err();
    assert!(matches!(err, EngineError::TableNotFound(_)));

    let mut req = BookingRequest::from_booking(&booking);
    req.start = Some(now_ms() - H);
    let err = h.engine.update_booking(booking.id, req).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidWindow(WindowError::StartInPast)));
}

// ── Cancel / delete ──────────────────────────────────────

#[tokio::test]
async fn cancel_frees_the_slot() {
    let h = harness("cancel.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    let booking = h.engine.create_booking(request(table.id, t, t + 2 * H)).await.unwrap();
    h.notifier.clear();

    let cancelled = h.engine.cancel_booking(booking.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(
        h.notifier.channels(),
        vec![Channel::CancellationEmail, Channel::CancellationSms]
    );

    // Record kept, slot reusable.
    assert_eq!(h.engine.get_booking(booking.id).await.unwrap().status, BookingStatus::Cancelled);
    h.engine.create_booking(request(table.id, t + H, t + 3 * H)).await.unwrap();
}

#[tokio::test]
async fn cancel_twice_is_rejected() {
    let h = harness("cancel_twice.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    let booking = h.engine.create_booking(request(table.id, t, t + H)).await.unwrap();
    h.engine.cancel_booking(booking.id).await.unwrap();
    h.notifier.clear();

    let err = h.engine.cancel_booking(booking.id).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyCancelled(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(h.notifier.channels().is_empty());

    let err = h.engine.cancel_booking(Ulid::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::BookingNotFound(_)));
}

#[tokio::test]
async fn delete_booking_removes_record() {
    let h = harness("delete_booking.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    let booking = h.engine.create_booking(request(table.id, t, t + H)).await.unwrap();
    h.notifier.clear();

    h.engine.delete_booking(booking.id).await.unwrap();
    assert!(matches!(
        h.engine.get_booking(booking.id).await,
        Err(EngineError::BookingNotFound(_))
    ));
    assert!(h.notifier.channels().is_empty());
    assert!(matches!(
        h.engine.delete_booking(booking.id).await,
        Err(EngineError::BookingNotFound(_))
    ));
}

// ── Tables ───────────────────────────────────────────────

#[tokio::test]
async fn table_numbers_are_unique() {
    let h = harness("table_numbers.wal");
    let one = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let two = h.engine.create_table(TableSpec::new(2, 2, true)).await.unwrap();

    let err = h.engine.create_table(TableSpec::new(1, 8, false)).await.unwrap_err();
    assert!(matches!(err, EngineError::TableNumberTaken(1)));

    let err = h.engine.update_table(two.id, TableSpec::new(1, 2, true)).await.unwrap_err();
    assert!(matches!(err, EngineError::TableNumberTaken(1)));

    // Keeping its own number is fine.
    let grown = h.engine.update_table(one.id, TableSpec::new(1, 6, true)).await.unwrap();
    assert_eq!((grown.capacity, grown.vip), (6, true));

    let renumbered = h.engine.update_table(two.id, TableSpec::new(7, 2, true)).await.unwrap();
    assert_eq!(renumbered.table_number, 7);
    assert_eq!(h.engine.get_table_by_number(7).await.unwrap(), Some(renumbered));
    assert_eq!(h.engine.get_table_by_number(2).await.unwrap(), None);
    // Number 2 is free again.
    h.engine.create_table(TableSpec::new(2, 4, false)).await.unwrap();
}

#[tokio::test]
async fn table_spec_validation() {
    let h = harness("table_spec.wal");
    for spec in [TableSpec::new(0, 4, false), TableSpec::new(1, 0, false), TableSpec::new(1, 101, false)] {
        assert!(matches!(
            h.engine.create_table(spec).await,
            Err(EngineError::InvalidRequest(_))
        ));
    }
    assert!(matches!(
        h.engine.update_table(Ulid::new(), TableSpec::new(1, 4, false)).await,
        Err(EngineError::TableNotFound(_))
    ));
}

#[tokio::test]
async fn list_tables_filters() {
    let h = harness("table_list.wal");
    h.engine.create_table(TableSpec::new(3, 8, true)).await.unwrap();
    h.engine.create_table(TableSpec::new(1, 2, false)).await.unwrap();
    h.engine.create_table(TableSpec::new(2, 2, true)).await.unwrap();

    let numbers = |tables: Vec<Table>| tables.iter().map(|t| t.table_number).collect::<Vec<_>>();
    let all = h.engine.list_tables(&TableFilter::default()).await.unwrap();
    assert_eq!(numbers(all), vec![1, 2, 3]);
    let vip = h
        .engine
        .list_tables(&TableFilter { vip_only: true, min_capacity: None })
        .await
        .unwrap();
    assert_eq!(numbers(vip), vec![2, 3]);
    let big = h
        .engine
        .list_tables(&TableFilter { vip_only: false, min_capacity: Some(4) })
        .await
        .unwrap();
    assert_eq!(numbers(big), vec![3]);
}

#[tokio::test]
async fn delete_table_in_use() {
    let h = harness("table_in_use.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    let booking = h.engine.create_booking(request(table.id, t, t + H)).await.unwrap();

    let err = h.engine.delete_table(table.id).await.unwrap_err();
    assert!(matches!(err, EngineError::TableInUse(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // A cancelled booking no longer holds the table.
    h.engine.cancel_booking(booking.id).await.unwrap();
    h.engine.delete_table(table.id).await.unwrap();
    assert!(matches!(
        h.engine.get_table(table.id).await,
        Err(EngineError::TableNotFound(_))
    ));
    assert!(matches!(
        h.engine.delete_table(table.id).await,
        Err(EngineError::TableNotFound(_))
    ));
}

#[tokio::test]
async fn delete_table_with_only_past_bookings() {
    let h = harness("table_past.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let now = now_ms();
    h.store
        .save(stored(table.id, now - 3 * H, now - 2 * H, BookingStatus::Confirmed))
        .await
        .unwrap();
    h.engine.delete_table(table.id).await.unwrap();
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn booking_lookups() {
    let h = harness("lookups.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    let first = h.engine.create_booking(request(table.id, t + 2 * H, t + 3 * H)).await.unwrap();
    let mut other = request(table.id, t, t + H);
    other.customer_email = "bob@example.com".into();
    let second = h.engine.create_booking(other).await.unwrap();

    let all: Vec<_> = h.engine.list_bookings().await.unwrap().iter().map(|b| b.id).collect();
    assert_eq!(all, vec![second.id, first.id]);

    let ada = h.engine.bookings_by_email(" ada@example.com ").await.unwrap();
    assert_eq!(ada, vec![first.clone()]);

    let err = h.engine.bookings_for_table(Ulid::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::TableNotFound(_)));
}

#[tokio::test]
async fn today_bookings_only_confirmed_today() {
    let h = harness("today.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let now = local_at(5, 9);
    let day = local_day_window(now).unwrap();

    let early = stored(table.id, day.start + H, day.start + 2 * H, BookingStatus::Confirmed);
    let late = stored(table.id, day.start + 20 * H, day.start + 21 * H, BookingStatus::Confirmed);
    let cancelled = stored(table.id, day.start + 12 * H, day.start + 13 * H, BookingStatus::Cancelled);
    let tomorrow = stored(table.id, day.end + H, day.end + 2 * H, BookingStatus::Confirmed);
    for b in [&early, &late, &cancelled, &tomorrow] {
        h.store.save(b.clone()).await.unwrap();
    }

    let today: Vec<_> = h.engine.today_bookings_at(now).await.unwrap().iter().map(|b| b.id).collect();
    assert_eq!(today, vec![early.id, late.id]);
}

// ── Maintenance ──────────────────────────────────────────

#[tokio::test]
async fn cleanup_purges_bookings_ended_a_week_ago() {
    let h = harness("cleanup.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let now = now_ms();
    let threshold = now - 7 * DAY_MS;

    let stale = stored(table.id, threshold - 2 * H, threshold - 1, BookingStatus::Confirmed);
    let stale_cancelled = stored(table.id, threshold - 3 * DAY_MS, threshold - 3 * DAY_MS + H, BookingStatus::Cancelled);
    let on_threshold = stored(table.id, threshold - H, threshold, BookingStatus::Confirmed);
    let recent = stored(table.id, now - 2 * H, now - H, BookingStatus::Confirmed);
    for b in [&stale, &stale_cancelled, &on_threshold, &recent] {
        h.store.save(b.clone()).await.unwrap();
    }

    assert_eq!(h.engine.cleanup_old_bookings_at(now).await.unwrap(), 2);
    let left: HashSet<_> = h.engine.list_bookings().await.unwrap().iter().map(|b| b.id).collect();
    assert_eq!(left, HashSet::from([on_threshold.id, recent.id]));

    assert_eq!(h.engine.cleanup_old_bookings_at(now).await.unwrap(), 0);
}

#[tokio::test]
async fn reminders_continue_past_failures() {
    let fail_for = Arc::new(StdMutex::new(None::<Ulid>));
    let selector = fail_for.clone();
    let h = harness_with(
        "reminders.wal",
        RecordingNotifier::failing(move |_, b| *selector.lock().unwrap() == Some(b.id)),
    );
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let now = local_at(3, 8);
    let day = local_day_window(now).unwrap();

    let first = stored(table.id, day.start + 12 * H, day.start + 13 * H, BookingStatus::Confirmed);
    let second = stored(table.id, day.start + 19 * H, day.start + 21 * H, BookingStatus::Confirmed);
    let cancelled = stored(table.id, day.start + 15 * H, day.start + 16 * H, BookingStatus::Cancelled);
    let next_day = stored(table.id, day.end + 12 * H, day.end + 13 * H, BookingStatus::Confirmed);
    for b in [&first, &second, &cancelled, &next_day] {
        h.store.save(b.clone()).await.unwrap();
    }
    *fail_for.lock().unwrap() = Some(first.id);

    let sent = h.engine.send_daily_reminders_at(now).await.unwrap();
    assert_eq!(sent, 1);

    let attempts = h.notifier.attempts.lock().unwrap().clone();
    assert_eq!(
        attempts,
        vec![
            (Channel::ReminderSms, first.id, false),
            (Channel::ReminderSms, second.id, true),
        ]
    );
}

#[tokio::test]
async fn reminders_with_nothing_due() {
    let h = harness("reminders_empty.wal");
    assert_eq!(h.engine.send_daily_reminders_at(local_at(2, 8)).await.unwrap(), 0);
    assert!(h.notifier.channels().is_empty());
}

// ── Reports ──────────────────────────────────────────────

#[tokio::test]
async fn reports_over_range() {
    let h = harness("reports.wal");
    let one = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let two = h.engine.create_table(TableSpec::new(2, 4, false)).await.unwrap();
    let day1 = local_at(2, 0);
    let day2 = local_at(3, 0);

    let a = h.engine.create_booking(request(one.id, day1 + 12 * H, day1 + 13 * H)).await.unwrap();
    h.engine.create_booking(request(one.id, day1 + 18 * H, day1 + 19 * H)).await.unwrap();
    h.engine.create_booking(request(two.id, day2 + 12 * H, day2 + 13 * H)).await.unwrap();
    let cancelled = h.engine.create_booking(request(one.id, day2 + 18 * H, day2 + 19 * H)).await.unwrap();
    h.engine.cancel_booking(cancelled.id).await.unwrap();
    // Starts in range but ends after it.
    h.engine.create_booking(request(two.id, day2 + 20 * H, day2 + 27 * H)).await.unwrap();

    let from = day1;
    let to = day2 + 24 * H - 1;

    let in_range = h.engine.bookings_in_range(from, to).await.unwrap();
    assert_eq!(in_range.len(), 4);
    assert_eq!(in_range[0].id, a.id);

    let counts = h.engine.daily_booking_counts(from, to).await.unwrap();
    let per_day: Vec<_> = counts.iter().map(|c| c.bookings).collect();
    assert_eq!(per_day, vec![2, 2]);
    assert_eq!(counts[0].day, local_date(day1).unwrap());

    let top = h.engine.top_booked_tables(from, to, 10).await.unwrap();
    assert_eq!(top.len(), 2);
    assert_eq!((top[0].table_number, top[0].bookings), (Some(1), 3));
    assert_eq!((top[1].table_number, top[1].bookings), (Some(2), 1));
    assert_eq!(h.engine.top_booked_tables(from, to, 1).await.unwrap().len(), 1);

    assert_eq!(h.engine.count_cancelled_in_range(from, to).await.unwrap(), 1);

    assert!(matches!(
        h.engine.bookings_in_range(to, from).await,
        Err(EngineError::InvalidRequest(_))
    ));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_admit_exactly_one() {
    let h = harness("race.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let engine = Arc::new(h.engine);
    let t = tomorrow();

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        let table_id = table.id;
        handles.push(tokio::spawn(async move {
            // Every window overlaps every other.
            engine
                .create_booking(request(table_id, t + i * M, t + 2 * H + i * M))
                .await
        }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::BookingConflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.bookings_for_table(table.id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_table_creates_keep_numbers_unique() {
    let h = harness("race_tables.wal");
    let engine = Arc::new(h.engine);

    let mut handles = Vec::new();
    for capacity in 1..=8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_table(TableSpec::new(5, capacity, false)).await
        }));
    }
    let mut ok = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_follows_a_booking_moved_while_it_waits() {
    let h = harness("cancel_moved.wal");
    let one = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let two = h.engine.create_table(TableSpec::new(2, 4, false)).await.unwrap();
    let three = h.engine.create_table(TableSpec::new(3, 4, false)).await.unwrap();
    let (two_id, three_id) = (two.id, three.id);
    let t = tomorrow();
    let id = h.engine.create_booking(request(one.id, t, t + H)).await.unwrap().id;
    let store = h.store.clone();
    let engine = Arc::new(h.engine);

    // Hold the move to table two mid-save, with table one still locked.
    let move_save = store.hold_save(move |b| b.table_id == two_id);
    let mover = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.update_booking(id, request(two_id, t, t + H)).await })
    };
    move_save.held.notified().await;

    // The cancel reads the booking on table one and queues for that lock.
    let cancel_save = store.hold_save(|b| b.status == BookingStatus::Cancelled);
    let canceller = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.cancel_booking(id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    move_save.release.notify_one();
    mover.await.unwrap().unwrap();
    cancel_save.held.notified().await;

    // Another move races the held cancel; it must wait for table two.
    let mut follow_up = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.update_booking(id, request(three_id, t + 2 * H, t + 3 * H)).await })
    };
    let early = tokio::time::timeout(Duration::from_millis(100), &mut follow_up).await.ok();
    assert!(early.is_none(), "move finished while the cancel held table two");
    cancel_save.release.notify_one();

    let cancelled = canceller.await.unwrap().unwrap();
    let moved = follow_up.await.unwrap().unwrap();
    assert_eq!(cancelled.table_id, two.id);
    assert_eq!((moved.table_id, moved.status), (three.id, BookingStatus::Cancelled));
    assert_eq!(engine.get_booking(id).await.unwrap(), moved);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_partial_edits_all_survive() {
    let h = harness("partial_edits.wal");
    let table = h.engine.create_table(TableSpec::new(1, 4, false)).await.unwrap();
    let t = tomorrow();
    let id = h.engine.create_booking(request(table.id, t, t + H)).await.unwrap().id;
    let engine = Arc::new(h.engine);

    let edits = [
        BookingChanges { customer_name: Some("Ada King".into()), ..Default::default() },
        BookingChanges { customer_email: Some("countess@example.com".into()), ..Default::default() },
        BookingChanges { customer_phone: Some(None), ..Default::default() },
    ];
    let handles: Vec<_> = edits
        .into_iter()
        .map(|changes| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.patch_booking(id, &changes).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = engine.get_booking(id).await.unwrap();
    assert_eq!(stored.customer_name, "Ada King");
    assert_eq!(stored.customer_email, "countess@example.com");
    assert_eq!(stored.customer_phone, None);
    assert_eq!((stored.start, stored.end), (t, t + H));

    let resize = TableChanges { capacity: Some(6), ..Default::default() };
    let promote = TableChanges { vip: Some(true), ..Default::default() };
    let (a, b) = tokio::join!(
        engine.patch_table(table.id, &resize),
        engine.patch_table(table.id, &promote)
    );
    a.unwrap();
    b.unwrap();
    let stored = engine.get_table(table.id).await.unwrap();
    assert_eq!((stored.table_number, stored.capacity, stored.vip), (1, 6, true));
}

#[tokio::test]
async fn state_survives_reopen() {
    let path = test_wal_path("reopen.wal");
    let t = tomorrow();
    let (table, booking) = {
        let store = Arc::new(WalStore::open(&path).unwrap());
        let engine = Engine::new(store.clone(), store.clone(), Arc::new(RecordingNotifier::ok()));
        let table = engine.create_table(TableSpec::new(9, 4, true)).await.unwrap();
        let booking = engine.create_booking(request(table.id, t, t + H)).await.unwrap();
        engine.cancel_booking(booking.id).await.unwrap();
        (table, booking)
    };

    let store = Arc::new(WalStore::open(&path).unwrap());
    let engine = Engine::new(store.clone(), store.clone(), Arc::new(RecordingNotifier::ok()));
    assert_eq!(engine.get_table(table.id).await.unwrap(), table);
    assert_eq!(
        engine.get_booking(booking.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
    // Table number index rebuilt too.
    assert!(matches!(
        engine.create_table(TableSpec::new(9, 2, false)).await,
        Err(EngineError::TableNumberTaken(9))
    ));
}
