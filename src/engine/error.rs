use ulid::Ulid;

use super::store::StoreError;

/// Why a booking window was rejected. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowError {
    Missing,
    StartInPast,
    EndNotAfterStart,
    TooLong,
}

impl std::fmt::Display for WindowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowError::Missing => write!(f, "start/end required"),
            WindowError::StartInPast => write!(f, "start in past"),
            WindowError::EndNotAfterStart => write!(f, "end not after start"),
            WindowError::TooLong => write!(f, "duration exceeds 8 hours"),
        }
    }
}

/// Coarse classification, for surfaces that map errors to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Storage,
}

#[derive(Debug)]
pub enum EngineError {
    InvalidWindow(WindowError),
    InvalidRequest(&'static str),
    TableNotFound(Ulid),
    BookingNotFound(Ulid),
    BookingConflict { table_number: u32 },
    AlreadyCancelled(Ulid),
    TableNumberTaken(u32),
    TableInUse(Ulid),
    Storage(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidWindow(_) | EngineError::InvalidRequest(_) => ErrorKind::Validation,
            EngineError::TableNotFound(_) | EngineError::BookingNotFound(_) => ErrorKind::NotFound,
            EngineError::BookingConflict { .. }
            | EngineError::AlreadyCancelled(_)
            | EngineError::TableNumberTaken(_)
            | EngineError::TableInUse(_) => ErrorKind::Conflict,
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidWindow(e) => write!(f, "invalid booking window: {e}"),
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::TableNotFound(id) => write!(f, "table not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::BookingConflict { table_number } => {
                write!(f, "table #{table_number} already booked for that time")
            }
            EngineError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            EngineError::TableNumberTaken(n) => write!(f, "table number {n} already exists"),
            EngineError::TableInUse(id) => {
                write!(f, "cannot delete table {id}: it has upcoming confirmed bookings")
            }
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<WindowError> for EngineError {
    fn from(e: WindowError) -> Self {
        EngineError::InvalidWindow(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Storage(e.to_string())
    }
}
