use std::fmt;
use std::str::FromStr;

use chrono::{Local, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Closed interval `[start, end]`.
///
/// Both ends are inclusive: a window ending at `t` and another starting at `t`
/// conflict with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Ms,
}

impl Window {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn conflicts_with(&self, other: &Window) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    /// Declared for completeness; no transition produces it.
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(BookingStatus::Pending),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// A physical seating unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: Ulid,
    pub table_number: u32,
    pub capacity: u32,
    pub vip: bool,
}

/// Admin-supplied table fields, used for both create and edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub table_number: u32,
    pub capacity: u32,
    pub vip: bool,
}

impl TableSpec {
    pub fn new(table_number: u32, capacity: u32, vip: bool) -> Self {
        Self { table_number, capacity, vip }
    }

    pub fn into_table(self, id: Ulid) -> Table {
        Table {
            id,
            table_number: self.table_number,
            capacity: self.capacity,
            vip: self.vip,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableFilter {
    pub vip_only: bool,
    pub min_capacity: Option<u32>,
}

impl TableFilter {
    pub fn matches(&self, table: &Table) -> bool {
        (!self.vip_only || table.vip) && self.min_capacity.is_none_or(|c| table.capacity >= c)
    }
}

/// A reservation of one table. `table_id` is a plain foreign key; the table is
/// fetched explicitly wherever its details are needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub table_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub status: BookingStatus,
}

impl Booking {
    pub fn window(&self) -> Window {
        Window::new(self.start, self.end)
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == BookingStatus::Confirmed
    }
}

/// Caller-built booking request. Timestamps are optional so that a missing
/// value is reported as a window error rather than a decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub table_id: Ulid,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
}

impl BookingRequest {
    pub fn new(
        table_id: Ulid,
        start: Ms,
        end: Ms,
        customer_name: impl Into<String>,
        customer_email: impl Into<String>,
    ) -> Self {
        Self {
            table_id,
            start: Some(start),
            end: Some(end),
            customer_name: customer_name.into(),
            customer_email: customer_email.into(),
            customer_phone: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.customer_phone = Some(phone.into());
        self
    }

    /// Start a request that re-submits an existing booking unchanged.
    pub fn from_booking(booking: &Booking) -> Self {
        Self {
            table_id: booking.table_id,
            start: Some(booking.start),
            end: Some(booking.end),
            customer_name: booking.customer_name.clone(),
            customer_email: booking.customer_email.clone(),
            customer_phone: booking.customer_phone.clone(),
        }
    }
}

/// Partial table edit from `UPDATE tables SET ...`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableChanges {
    pub table_number: Option<u32>,
    pub capacity: Option<u32>,
    pub vip: Option<bool>,
}

impl TableChanges {
    pub fn apply(&self, table: &Table) -> TableSpec {
        TableSpec::new(
            self.table_number.unwrap_or(table.table_number),
            self.capacity.unwrap_or(table.capacity),
            self.vip.unwrap_or(table.vip),
        )
    }
}

/// Partial booking edit from `UPDATE bookings SET ...`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingChanges {
    pub table_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    /// `Some(None)` clears the phone.
    pub customer_phone: Option<Option<String>>,
    pub status: Option<BookingStatus>,
}

impl BookingChanges {
    /// True when only the status column is assigned.
    pub fn is_status_only(&self) -> bool {
        self.status.is_some() && *self == BookingChanges { status: self.status, ..Default::default() }
    }

    pub fn apply(&self, booking: &Booking) -> BookingRequest {
        let mut req = BookingRequest::from_booking(booking);
        if let Some(id) = self.table_id {
            req.table_id = id;
        }
        if let Some(start) = self.start {
            req.start = Some(start);
        }
        if let Some(end) = self.end {
            req.end = Some(end);
        }
        if let Some(name) = &self.customer_name {
            req.customer_name = name.clone();
        }
        if let Some(email) = &self.customer_email {
            req.customer_email = email.clone();
        }
        if let Some(phone) = &self.customer_phone {
            req.customer_phone = phone.clone();
        }
        req
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TableSaved { table: Table },
    TableDeleted { id: Ulid },
    BookingSaved { booking: Booking },
    BookingDeleted { id: Ulid },
    BookingsPurged { ids: Vec<Ulid> },
}

// ── Report rows ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyCount {
    pub day: NaiveDate,
    pub bookings: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableUsage {
    pub table_id: Ulid,
    /// `None` when the table has since been deleted.
    pub table_number: Option<u32>,
    pub bookings: u64,
}

// ── Local calendar helpers ───────────────────────────────────────

/// Calendar date of an instant in server local time.
pub fn local_date(t: Ms) -> Option<NaiveDate> {
    Local
        .timestamp_millis_opt(t)
        .earliest()
        .map(|dt| dt.date_naive())
}

/// First millisecond of `day` in server local time.
pub fn local_midnight(day: NaiveDate) -> Option<Ms> {
    day.and_hms_opt(0, 0, 0)?
        .and_local_timezone(Local)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// `[start-of-day, end-of-day]` of the local calendar day containing `t`.
pub fn local_day_window(t: Ms) -> Option<Window> {
    let day = local_date(t)?;
    let start = local_midnight(day)?;
    let next = local_midnight(day.succ_opt()?)?;
    Some(Window::new(start, next - 1))
}
