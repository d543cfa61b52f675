use std::collections::{BTreeMap, HashMap};

use ulid::Ulid;

use crate::limits::MAX_TOP_TABLES;
use crate::model::*;

use super::conflict::{now_ms, validate_window};
use super::{Engine, EngineError};

fn check_range(from: Ms, to: Ms) -> Result<(), EngineError> {
    if from > to {
        return Err(EngineError::InvalidRequest("range start after range end"));
    }
    Ok(())
}

impl Engine {
    // ── Bookings ─────────────────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.bookings
            .find_by_id(id)
            .await?
            .ok_or(EngineError::BookingNotFound(id))
    }

    pub async fn list_bookings(&self) -> Result<Vec<Booking>, EngineError> {
        Ok(self.bookings.find_all().await?)
    }

    pub async fn bookings_for_table(&self, table_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if self.tables.find_table_by_id(table_id).await?.is_none() {
            return Err(EngineError::TableNotFound(table_id));
        }
        Ok(self.bookings.find_by_table(table_id).await?)
    }

    pub async fn bookings_by_email(&self, email: &str) -> Result<Vec<Booking>, EngineError> {
        Ok(self.bookings.find_by_customer_email(email.trim()).await?)
    }

    /// CONFIRMED bookings starting on the current local calendar day.
    pub async fn today_bookings(&self) -> Result<Vec<Booking>, EngineError> {
        self.today_bookings_at(now_ms()).await
    }

    pub async fn today_bookings_at(&self, now: Ms) -> Result<Vec<Booking>, EngineError> {
        let day = local_day_window(now).ok_or(EngineError::InvalidRequest("time out of range"))?;
        Ok(self
            .bookings
            .find_confirmed_starting_between(day.start, day.end)
            .await?)
    }

    /// Bookings of any status lying entirely inside `[from, to]`.
    pub async fn bookings_in_range(&self, from: Ms, to: Ms) -> Result<Vec<Booking>, EngineError> {
        check_range(from, to)?;
        let mut found = self.bookings.find_starting_between(from, to).await?;
        found.retain(|b| b.end <= to);
        Ok(found)
    }

    /// Tables seating at least `min_capacity` with no CONFIRMED booking
    /// touching the window.
    pub async fn find_available_tables(
        &self,
        min_capacity: u32,
        start: Option<Ms>,
        end: Option<Ms>,
    ) -> Result<Vec<Table>, EngineError> {
        let window = validate_window(start, end, now_ms())?;
        let filter = TableFilter { vip_only: false, min_capacity: Some(min_capacity) };
        let mut available = Vec::new();
        for table in self.tables.list_tables(&filter).await? {
            if !self.has_conflict(table.id, window, None).await? {
                available.push(table);
            }
        }
        Ok(available)
    }

    // ── Tables ───────────────────────────────────────────────────

    pub async fn get_table(&self, id: Ulid) -> Result<Table, EngineError> {
        self.tables
            .find_table_by_id(id)
            .await?
            .ok_or(EngineError::TableNotFound(id))
    }

    pub async fn get_table_by_number(&self, number: u32) -> Result<Option<Table>, EngineError> {
        Ok(self.tables.find_table_by_number(number).await?)
    }

    pub async fn list_tables(&self, filter: &TableFilter) -> Result<Vec<Table>, EngineError> {
        Ok(self.tables.list_tables(filter).await?)
    }

    // ── Reports ──────────────────────────────────────────────────

    /// Bookings per local calendar day, by start, for days with at least one.
    pub async fn daily_booking_counts(&self, from: Ms, to: Ms) -> Result<Vec<DailyCount>, EngineError> {
        let mut days: BTreeMap<chrono::NaiveDate, u64> = BTreeMap::new();
        for b in self.bookings_in_range(from, to).await? {
            if let Some(day) = local_date(b.start) {
                *days.entry(day).or_default() += 1;
            }
        }
        Ok(days
            .into_iter()
            .map(|(day, bookings)| DailyCount { day, bookings })
            .collect())
    }

    /// Most booked tables in the range, busiest first.
    pub async fn top_booked_tables(&self, from: Ms, to: Ms, limit: usize) -> Result<Vec<TableUsage>, EngineError> {
        let mut counts: HashMap<Ulid, u64> = HashMap::new();
        for b in self.bookings_in_range(from, to).await? {
            *counts.entry(b.table_id).or_default() += 1;
        }
        let mut usage = Vec::with_capacity(counts.len());
        for (table_id, bookings) in counts {
            let table_number = self
                .tables
                .find_table_by_id(table_id)
                .await?
                .map(|t| t.table_number);
            usage.push(TableUsage { table_id, table_number, bookings });
        }
        usage.sort_by(|a, b| {
            b.bookings
                .cmp(&a.bookings)
                .then(a.table_number.unwrap_or(u32::MAX).cmp(&b.table_number.unwrap_or(u32::MAX)))
        });
        usage.truncate(limit.min(MAX_TOP_TABLES));
        Ok(usage)
    }

    pub async fn count_cancelled_in_range(&self, from: Ms, to: Ms) -> Result<u64, EngineError> {
        check_range(from, to)?;
        Ok(self
            .bookings
            .find_starting_between(from, to)
            .await?
            .iter()
            .filter(|b| b.status == BookingStatus::Cancelled)
            .count() as u64)
    }
}
