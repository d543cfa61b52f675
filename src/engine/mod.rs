mod conflict;
mod error;
mod maintenance;
mod mutations;
mod queries;
pub mod store;
#[cfg(test)]
mod tests;

pub use conflict::{now_ms, validate_window};
pub use error::{EngineError, ErrorKind, WindowError};
pub use store::{BookingStore, StoreError, TableRegistry, WalStore};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::error;
use ulid::Ulid;

use crate::model::{Booking, Table};
use crate::notify::{Channel, Notifier};

/// The booking rule engine. Collaborators are injected once at startup.
pub struct Engine {
    tables: Arc<dyn TableRegistry>,
    bookings: Arc<dyn BookingStore>,
    notifier: Arc<dyn Notifier>,
    admin_phone: Option<String>,
    /// Serializes check-then-write per table.
    table_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Serializes table-number uniqueness checks. Taken before any table lock.
    registry_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        tables: Arc<dyn TableRegistry>,
        bookings: Arc<dyn BookingStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            tables,
            bookings,
            notifier,
            admin_phone: None,
            table_locks: DashMap::new(),
            registry_lock: Mutex::new(()),
        }
    }

    pub fn with_admin_phone(mut self, admin_phone: Option<String>) -> Self {
        self.admin_phone = admin_phone.filter(|p| !p.trim().is_empty());
        self
    }

    pub(super) async fn lock_table(&self, table_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self.table_locks.entry(table_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Lock several tables in id order.
    pub(super) async fn lock_tables(&self, table_ids: &[Ulid]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = table_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock_table(id).await);
        }
        guards
    }

    pub(super) fn forget_table_lock(&self, table_id: &Ulid) {
        self.table_locks.remove(table_id);
    }

    /// Send one notification inside its own failure boundary. Returns whether
    /// the sender reported success.
    pub(super) async fn notify(&self, channel: Channel, booking: &Booking, table: &Table) -> bool {
        let n = &self.notifier;
        let result = match channel {
            Channel::ConfirmationEmail => n.send_booking_confirmation(booking, table).await,
            Channel::CancellationEmail => n.send_booking_cancellation(booking, table).await,
            Channel::UpdateEmail => n.send_booking_update(booking, table).await,
            Channel::ConfirmationSms => n.send_confirmation_sms(booking, table).await,
            Channel::CancellationSms => n.send_cancellation_sms(booking, table).await,
            Channel::ReminderSms => n.send_reminder_sms(booking, table).await,
            Channel::AdminSms => {
                let Some(phone) = self.admin_phone.as_deref() else {
                    return false;
                };
                n.send_admin_notification_sms(booking, table, phone).await
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(booking_id = %booking.id, channel = channel.as_str(), "notification failed: {e}");
                metrics::counter!(
                    crate::observability::NOTIFICATION_FAILURES_TOTAL,
                    "channel" => channel.as_str()
                )
                .increment(1);
                false
            }
        }
    }

    /// Look up a booking's table for notification purposes. A missing table
    /// only costs the notifications, never the committed write.
    pub(super) async fn table_for_notify(&self, booking: &Booking) -> Option<Table> {
        match self.tables.find_table_by_id(booking.table_id).await {
            Ok(Some(table)) => Some(table),
            Ok(None) => {
                tracing::warn!(booking_id = %booking.id, table_id = %booking.table_id, "table gone, notifications skipped");
                None
            }
            Err(e) => {
                error!(booking_id = %booking.id, "table lookup for notification failed: {e}");
                None
            }
        }
    }
}
