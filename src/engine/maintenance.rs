use std::collections::HashSet;

use tracing::{info, warn};

use crate::limits::BOOKING_RETENTION_MS;
use crate::model::*;
use crate::notify::Channel;
use crate::observability::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Purge every booking that ended more than a week ago, any status.
    pub async fn cleanup_old_bookings(&self) -> Result<usize, EngineError> {
        self.cleanup_old_bookings_at(now_ms()).await
    }

    pub async fn cleanup_old_bookings_at(&self, now: Ms) -> Result<usize, EngineError> {
        let threshold = now - BOOKING_RETENTION_MS;
        let candidates = self.bookings.find_older_than(threshold).await?;
        if candidates.is_empty() {
            info!("cleanup: no bookings ended before {threshold}");
            return Ok(0);
        }

        let table_ids: Vec<_> = candidates.iter().map(|b| b.table_id).collect();
        let _guards = self.lock_tables(&table_ids).await;
        // Re-read under the locks; an update may have moved some of them
        // into the future meanwhile.
        let locked: HashSet<_> = table_ids.into_iter().collect();
        let mut old = self.bookings.find_older_than(threshold).await?;
        old.retain(|b| locked.contains(&b.table_id));

        let deleted = self.bookings.delete_all(&old).await?;
        metrics::counter!(CLEANUP_DELETED_TOTAL).increment(deleted as u64);
        info!("cleanup: deleted {deleted} bookings ended before {threshold}");
        Ok(deleted)
    }

    /// Remind every CONFIRMED booking starting today. Returns how many
    /// reminders were sent; a failed send is logged and skipped.
    pub async fn send_daily_reminders(&self) -> Result<usize, EngineError> {
        self.send_daily_reminders_at(now_ms()).await
    }

    pub async fn send_daily_reminders_at(&self, now: Ms) -> Result<usize, EngineError> {
        let day = local_day_window(now).ok_or(EngineError::InvalidRequest("time out of range"))?;
        let due = self
            .bookings
            .find_confirmed_starting_between(day.start, day.end)
            .await?;

        let mut sent = 0;
        for booking in &due {
            let Some(table) = self.table_for_notify(booking).await else {
                continue;
            };
            if self.notify(Channel::ReminderSms, booking, &table).await {
                sent += 1;
            }
        }
        if sent < due.len() {
            warn!("reminders: {} of {} failed or skipped", due.len() - sent, due.len());
        }
        metrics::counter!(REMINDERS_SENT_TOTAL).increment(sent as u64);
        info!("reminders: sent {sent} for {} bookings today", due.len());
        Ok(sent)
    }
}
