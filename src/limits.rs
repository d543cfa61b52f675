use crate::model::{DAY_MS, HOUR_MS, Ms};

/// Longest bookable window.
pub const MAX_BOOKING_DURATION_MS: Ms = 8 * HOUR_MS;

/// Bookings whose end is older than this are purged by the cleanup job.
pub const BOOKING_RETENTION_MS: Ms = 7 * DAY_MS;

pub const MIN_CUSTOMER_NAME_LEN: usize = 2;
pub const MAX_CUSTOMER_NAME_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 100;
pub const MAX_PHONE_LEN: usize = 20;

pub const MAX_TABLES: usize = 10_000;
pub const MAX_TABLE_CAPACITY: u32 = 100;

/// Upper bound on rows returned by reporting queries.
pub const MAX_TOP_TABLES: usize = 100;
