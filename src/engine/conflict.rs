use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WindowError};

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Check a requested window against `now`. Fails fast on the first broken rule.
pub fn validate_window(start: Option<Ms>, end: Option<Ms>, now: Ms) -> Result<Window, WindowError> {
    let (Some(start), Some(end)) = (start, end) else {
        return Err(WindowError::Missing);
    };
    if start < now {
        return Err(WindowError::StartInPast);
    }
    if end <= start {
        return Err(WindowError::EndNotAfterStart);
    }
    let window = Window::new(start, end);
    if window.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(WindowError::TooLong);
    }
    Ok(window)
}

fn valid_phone(phone: &str) -> bool {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    digits.chars().count() <= MAX_PHONE_LEN
        && digits
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_whitespace() || matches!(c, '(' | ')' | '-'))
}

/// Customer fields of a request. Runs after window validation and before any
/// store access.
pub(crate) fn validate_customer(req: &BookingRequest) -> Result<(), EngineError> {
    let name_len = req.customer_name.trim().chars().count();
    if name_len < MIN_CUSTOMER_NAME_LEN || req.customer_name.chars().count() > MAX_CUSTOMER_NAME_LEN {
        return Err(EngineError::InvalidRequest("customer name must be 2 to 100 characters"));
    }
    let email = req.customer_email.trim();
    if email.is_empty() {
        return Err(EngineError::InvalidRequest("customer email required"));
    }
    if !email.contains('@') || req.customer_email.chars().count() > MAX_EMAIL_LEN {
        return Err(EngineError::InvalidRequest("customer email is not a valid address"));
    }
    if let Some(phone) = &req.customer_phone
        && !valid_phone(phone)
    {
        return Err(EngineError::InvalidRequest("customer phone is not a valid number"));
    }
    Ok(())
}

/// Blank phone numbers are stored as absent.
pub(crate) fn normalize_phone(phone: Option<String>) -> Option<String> {
    phone.filter(|p| !p.trim().is_empty())
}

impl Engine {
    /// Whether a CONFIRMED booking other than `exclude` occupies any part of
    /// `window` on the table, boundaries included.
    pub async fn has_conflict(
        &self,
        table_id: Ulid,
        window: Window,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let overlapping = self.bookings.find_overlapping(table_id, window).await?;
        Ok(overlapping.iter().any(|b| Some(b.id) != exclude))
    }
}
