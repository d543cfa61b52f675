use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Channel;
use crate::observability::*;

use super::conflict::{normalize_phone, now_ms, validate_customer, validate_window};
use super::{Engine, EngineError};

fn validate_table_spec(spec: &TableSpec) -> Result<(), EngineError> {
    if spec.table_number == 0 {
        return Err(EngineError::InvalidRequest("table number must be positive"));
    }
    if spec.capacity == 0 || spec.capacity > MAX_TABLE_CAPACITY {
        return Err(EngineError::InvalidRequest("capacity must be between 1 and 100"));
    }
    Ok(())
}

impl Engine {
    // ── Bookings ─────────────────────────────────────────────────

    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let window = validate_window(req.start, req.end, now_ms())?;
        validate_customer(&req)?;
        self.require_table(req.table_id).await?;

        let (booking, table) = {
            let guard = self.lock_table(req.table_id).await;
            let Some(table) = self.tables.find_table_by_id(req.table_id).await? else {
                // Deleted while we waited for the lock.
                drop(guard);
                self.forget_table_lock(&req.table_id);
                return Err(EngineError::TableNotFound(req.table_id));
            };
            if self.has_conflict(table.id, window, None).await? {
                metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
                warn!(table = table.table_number, start = window.start, end = window.end, "booking conflict");
                return Err(EngineError::BookingConflict { table_number: table.table_number });
            }
            let booking = Booking {
                id: Ulid::new(),
                table_id: table.id,
                start: window.start,
                end: window.end,
                customer_name: req.customer_name,
                customer_email: req.customer_email,
                customer_phone: normalize_phone(req.customer_phone),
                status: BookingStatus::Confirmed,
            };
            (self.bookings.save(booking).await?, table)
        };

        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        info!(booking_id = %booking.id, table = table.table_number, "booking created");

        self.notify(Channel::ConfirmationEmail, &booking, &table).await;
        self.notify(Channel::ConfirmationSms, &booking, &table).await;
        self.notify(Channel::AdminSms, &booking, &table).await;
        Ok(booking)
    }

    /// Replace every editable field of a booking.
    pub async fn update_booking(&self, id: Ulid, req: BookingRequest) -> Result<Booking, EngineError> {
        let window = validate_window(req.start, req.end, now_ms())?;
        validate_customer(&req)?;
        self.require_table(req.table_id).await?;

        let (existing, guards) = self.lock_booking(id, Some(req.table_id)).await?;
        self.commit_update(existing, req, window, guards).await
    }

    /// Apply a partial edit on top of the booking as it stands under its
    /// table lock, so concurrent edits to different columns all survive.
    pub async fn patch_booking(&self, id: Ulid, changes: &BookingChanges) -> Result<Booking, EngineError> {
        if let Some(table_id) = changes.table_id {
            self.require_table(table_id).await?;
        }

        let (existing, guards) = self.lock_booking(id, changes.table_id).await?;
        let req = changes.apply(&existing);
        let window = validate_window(req.start, req.end, now_ms())?;
        validate_customer(&req)?;
        self.commit_update(existing, req, window, guards).await
    }

    async fn commit_update(
        &self,
        existing: Booking,
        req: BookingRequest,
        window: Window,
        guards: Vec<OwnedMutexGuard<()>>,
    ) -> Result<Booking, EngineError> {
        let id = existing.id;
        let Some(table) = self.tables.find_table_by_id(req.table_id).await? else {
            drop(guards);
            self.forget_table_lock(&req.table_id);
            return Err(EngineError::TableNotFound(req.table_id));
        };

        let rescheduled =
            existing.table_id != table.id || existing.start != window.start || existing.end != window.end;
        if rescheduled && self.has_conflict(table.id, window, Some(id)).await? {
            metrics::counter!(BOOKING_CONFLICTS_TOTAL).increment(1);
            warn!(booking_id = %id, table = table.table_number, "booking conflict on update");
            return Err(EngineError::BookingConflict { table_number: table.table_number });
        }

        let booking = Booking {
            table_id: table.id,
            start: window.start,
            end: window.end,
            customer_name: req.customer_name,
            customer_email: req.customer_email,
            customer_phone: normalize_phone(req.customer_phone),
            ..existing
        };
        let booking = self.bookings.save(booking).await?;
        drop(guards);

        metrics::counter!(BOOKINGS_UPDATED_TOTAL).increment(1);
        info!(booking_id = %booking.id, table = table.table_number, "booking updated");

        self.notify(Channel::UpdateEmail, &booking, &table).await;
        Ok(booking)
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = {
            let (mut booking, _guards) = self.lock_booking(id, None).await?;
            if booking.status == BookingStatus::Cancelled {
                return Err(EngineError::AlreadyCancelled(id));
            }
            booking.status = BookingStatus::Cancelled;
            self.bookings.save(booking).await?
        };

        metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!(booking_id = %booking.id, "booking cancelled");

        if let Some(table) = self.table_for_notify(&booking).await {
            self.notify(Channel::CancellationEmail, &booking, &table).await;
            self.notify(Channel::CancellationSms, &booking, &table).await;
        }
        Ok(booking)
    }

    pub async fn delete_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let (booking, _guards) = self.lock_booking(id, None).await?;
        self.bookings.delete(&booking).await?;

        metrics::counter!(BOOKINGS_DELETED_TOTAL).increment(1);
        info!(booking_id = %id, "booking deleted");
        Ok(())
    }

    /// Read a booking and lock its table, plus `also` when given.
    ///
    /// An update may move the booking to another table while we wait, so the
    /// booking is re-read under the locks and the whole step retried until
    /// the table we locked is still the one it sits on.
    async fn lock_booking(
        &self,
        id: Ulid,
        also: Option<Ulid>,
    ) -> Result<(Booking, Vec<OwnedMutexGuard<()>>), EngineError> {
        loop {
            let seen = self
                .bookings
                .find_by_id(id)
                .await?
                .ok_or(EngineError::BookingNotFound(id))?;
            let guards = match also {
                Some(other) => self.lock_tables(&[seen.table_id, other]).await,
                None => vec![self.lock_table(seen.table_id).await],
            };
            let current = self
                .bookings
                .find_by_id(id)
                .await?
                .ok_or(EngineError::BookingNotFound(id))?;
            if current.table_id == seen.table_id {
                return Ok((current, guards));
            }
        }
    }

    /// Fails fast for unknown tables before any lock is taken for them.
    async fn require_table(&self, id: Ulid) -> Result<(), EngineError> {
        match self.tables.find_table_by_id(id).await? {
            Some(_) => Ok(()),
            None => Err(EngineError::TableNotFound(id)),
        }
    }

    // ── Tables ───────────────────────────────────────────────────

    pub async fn create_table(&self, spec: TableSpec) -> Result<Table, EngineError> {
        validate_table_spec(&spec)?;
        let _registry = self.registry_lock.lock().await;

        if self.tables.list_tables(&TableFilter::default()).await?.len() >= MAX_TABLES {
            return Err(EngineError::InvalidRequest("too many tables"));
        }
        if self.tables.find_table_by_number(spec.table_number).await?.is_some() {
            return Err(EngineError::TableNumberTaken(spec.table_number));
        }
        let table = self.tables.save_table(spec.into_table(Ulid::new())).await?;
        info!(table_id = %table.id, table = table.table_number, "table created");
        Ok(table)
    }

    /// Replace every field of a table.
    pub async fn update_table(&self, id: Ulid, spec: TableSpec) -> Result<Table, EngineError> {
        validate_table_spec(&spec)?;
        self.update_table_with(id, |_| spec).await
    }

    /// Apply a partial edit on top of the table as it stands under the
    /// registry lock.
    pub async fn patch_table(&self, id: Ulid, changes: &TableChanges) -> Result<Table, EngineError> {
        self.update_table_with(id, |existing| changes.apply(existing)).await
    }

    async fn update_table_with(
        &self,
        id: Ulid,
        build: impl FnOnce(&Table) -> TableSpec,
    ) -> Result<Table, EngineError> {
        let _registry = self.registry_lock.lock().await;

        // Tables only change under the registry lock, so this read holds.
        let existing = self
            .tables
            .find_table_by_id(id)
            .await?
            .ok_or(EngineError::TableNotFound(id))?;
        let _guard = self.lock_table(id).await;

        let spec = build(&existing);
        validate_table_spec(&spec)?;
        if existing.table_number != spec.table_number
            && let Some(other) = self.tables.find_table_by_number(spec.table_number).await?
            && other.id != id
        {
            return Err(EngineError::TableNumberTaken(spec.table_number));
        }
        let table = self.tables.save_table(spec.into_table(id)).await?;
        info!(table_id = %id, table = table.table_number, "table updated");
        Ok(table)
    }

    /// Refused while the table still has CONFIRMED bookings that have not ended.
    pub async fn delete_table(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry_lock.lock().await;
        if self.tables.find_table_by_id(id).await?.is_none() {
            return Err(EngineError::TableNotFound(id));
        }
        let guard = self.lock_table(id).await;

        let now = now_ms();
        let in_use = self
            .bookings
            .find_by_table(id)
            .await?
            .iter()
            .any(|b| b.is_confirmed() && b.end >= now);
        if in_use {
            return Err(EngineError::TableInUse(id));
        }
        self.tables.delete_table(id).await?;
        drop(guard);
        self.forget_table_lock(&id);
        info!(table_id = %id, "table deleted");
        Ok(())
    }
}
