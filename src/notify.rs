use async_trait::async_trait;
use chrono::{Local, TimeZone};
use tracing::{debug, info};

use crate::model::{Booking, Ms, Table};

#[derive(Debug)]
pub enum NotifyError {
    InvalidRecipient(String),
    Transport(String),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::InvalidRecipient(r) => write!(f, "invalid recipient: {r}"),
            NotifyError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// One outbound notification kind. Used for logs and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ConfirmationEmail,
    CancellationEmail,
    UpdateEmail,
    ConfirmationSms,
    CancellationSms,
    ReminderSms,
    AdminSms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::ConfirmationEmail => "confirmation_email",
            Channel::CancellationEmail => "cancellation_email",
            Channel::UpdateEmail => "update_email",
            Channel::ConfirmationSms => "confirmation_sms",
            Channel::CancellationSms => "cancellation_sms",
            Channel::ReminderSms => "reminder_sms",
            Channel::AdminSms => "admin_sms",
        }
    }
}

/// Outbound email/SMS senders. Any method may fail; the engine logs the
/// failure and carries on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_booking_confirmation(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError>;
    async fn send_booking_cancellation(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError>;
    async fn send_booking_update(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError>;
    async fn send_confirmation_sms(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError>;
    async fn send_cancellation_sms(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError>;
    async fn send_reminder_sms(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError>;
    async fn send_admin_notification_sms(
        &self,
        booking: &Booking,
        table: &Table,
        admin_phone: &str,
    ) -> Result<(), NotifyError>;
}

fn format_local(t: Ms) -> String {
    match Local.timestamp_millis_opt(t).earliest() {
        Some(dt) => dt.format("%d.%m.%Y %H:%M").to_string(),
        None => t.to_string(),
    }
}

/// Subject and body for an email channel, or just the text for SMS.
pub fn render(channel: Channel, booking: &Booking, table: &Table) -> (String, String) {
    let when = format!("{} - {}", format_local(booking.start), format_local(booking.end));
    let name = &booking.customer_name;
    let n = table.table_number;
    match channel {
        Channel::ConfirmationEmail => (
            "Booking confirmed".into(),
            format!("Dear {name}, your booking of table #{n} for {when} is confirmed. Booking id: {}.", booking.id),
        ),
        Channel::CancellationEmail => (
            "Booking cancelled".into(),
            format!("Dear {name}, your booking of table #{n} for {when} has been cancelled."),
        ),
        Channel::UpdateEmail => (
            "Booking updated".into(),
            format!("Dear {name}, your booking has been changed. Table #{n}, {when}."),
        ),
        Channel::ConfirmationSms => (String::new(), format!("Booking confirmed: table #{n}, {when}.")),
        Channel::CancellationSms => (String::new(), format!("Booking cancelled: table #{n}, {when}.")),
        Channel::ReminderSms => (
            String::new(),
            format!("Reminder: you have a booking today, table #{n}, {when}."),
        ),
        Channel::AdminSms => (
            String::new(),
            format!("New booking: {name}, table #{n}, {when}, {}", booking.customer_email),
        ),
    }
}

/// Renders every message and writes it to the log. Real transports live
/// outside this crate.
pub struct LogNotifier {
    enabled: bool,
}

impl LogNotifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn email(&self, channel: Channel, booking: &Booking, table: &Table) -> Result<(), NotifyError> {
        if !self.enabled {
            debug!(booking_id = %booking.id, channel = channel.as_str(), "notifications disabled");
            return Ok(());
        }
        if !booking.customer_email.contains('@') {
            return Err(NotifyError::InvalidRecipient(booking.customer_email.clone()));
        }
        let (subject, body) = render(channel, booking, table);
        let payload = serde_json::json!({
            "to": booking.customer_email,
            "subject": subject,
            "body": body,
        });
        info!(booking_id = %booking.id, channel = channel.as_str(), %payload, "email");
        Ok(())
    }

    fn sms(&self, channel: Channel, booking: &Booking, table: &Table, to: Option<&str>) -> Result<(), NotifyError> {
        let Some(to) = to.filter(|p| !p.trim().is_empty()) else {
            debug!(booking_id = %booking.id, channel = channel.as_str(), "no phone number, sms skipped");
            return Ok(());
        };
        if !self.enabled {
            debug!(booking_id = %booking.id, channel = channel.as_str(), "notifications disabled");
            return Ok(());
        }
        let (_, text) = render(channel, booking, table);
        let payload = serde_json::json!({ "to": to, "text": text });
        info!(booking_id = %booking.id, channel = channel.as_str(), %payload, "sms");
        Ok(())
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_booking_confirmation(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError> {
        self.email(Channel::ConfirmationEmail, booking, table)
    }

    async fn send_booking_cancellation(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError> {
        self.email(Channel::CancellationEmail, booking, table)
    }

    async fn send_booking_update(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError> {
        self.email(Channel::UpdateEmail, booking, table)
    }

    async fn send_confirmation_sms(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError> {
        self.sms(Channel::ConfirmationSms, booking, table, booking.customer_phone.as_deref())
    }

    async fn send_cancellation_sms(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError> {
        self.sms(Channel::CancellationSms, booking, table, booking.customer_phone.as_deref())
    }

    async fn send_reminder_sms(&self, booking: &Booking, table: &Table) -> Result<(), NotifyError> {
        self.sms(Channel::ReminderSms, booking, table, booking.customer_phone.as_deref())
    }

    async fn send_admin_notification_sms(
        &self,
        booking: &Booking,
        table: &Table,
        admin_phone: &str,
    ) -> Result<(), NotifyError> {
        self.sms(Channel::AdminSms, booking, table, Some(admin_phone))
    }
}
