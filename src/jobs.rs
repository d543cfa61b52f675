use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use tracing::{error, info};

use crate::engine::{Engine, StoreError, WalStore};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Next `hour:00` strictly after `now`, in `now`'s time zone. Skips days on
/// which that wall-clock time does not exist.
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let mut day = now.date_naive();
    for _ in 0..3 {
        if let Some(at) = day
            .and_hms_opt(hour, 0, 0)
            .and_then(|t| t.and_local_timezone(tz.clone()).earliest())
            && at > *now
        {
            return Some(at);
        }
        day = day.succ_opt()?;
    }
    None
}

async fn run_daily<F, Fut>(name: &'static str, hour: u32, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let now = Local::now();
        let Some(next) = next_daily_run(&now, hour) else {
            error!("{name}: cannot schedule at hour {hour}, job stopped");
            return;
        };
        let wait = next.signed_duration_since(now).to_std().unwrap_or_default();
        info!("{name}: next run at {next}");
        tokio::time::sleep(wait).await;
        job().await;
    }
}

/// Daily purge of bookings that ended over a week ago.
pub async fn run_cleanup_job(engine: Arc<Engine>, hour: u32) {
    run_daily("cleanup", hour, || {
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.cleanup_old_bookings().await {
                error!("cleanup failed: {e}");
            }
        }
    })
    .await
}

/// Daily reminder SMS for today's confirmed bookings.
pub async fn run_reminder_job(engine: Arc<Engine>, hour: u32) {
    run_daily("reminders", hour, || {
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.send_daily_reminders().await {
                error!("reminders failed: {e}");
            }
        }
    })
    .await
}

/// Compact once the WAL has grown past `threshold` appends. Returns whether
/// it compacted.
pub async fn compact_if_needed(store: &WalStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    store.compact().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}
