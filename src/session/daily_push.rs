use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::entities::DailySnapshot;
use crate::store::local::LocalStore;
use crate::store::remote::{paths, to_document, RemoteStore};
use crate::utils::clock::Clock;

/// Delay before a failed midnight push is attempted again. Stands in for the
/// platform scheduler that retried the original job.
const RETRY_DELAY: Duration = Duration::from_secs(15 * 60);

/// Writes the current goal map as the goal-history entry of `date`. One
/// attempt; retrying is the caller's business.
pub async fn push_goal_history(
    local: &LocalStore,
    remote: &dyn RemoteStore,
    uid: &str,
    date: NaiveDate,
) -> Result<()> {
    let tracked = local.tracked_apps(uid).await?;
    let goals = DailySnapshot::goals(date, &tracked);
    remote
        .set(&paths::goal_history_entry(uid, date), to_document(&goals)?)
        .await
}

/// Loop that wakes at every local midnight and records the goal map under
/// the day that just began. A failed push is retried every fifteen minutes
/// until it lands, then the loop goes back to waiting for midnight.
pub async fn run_daily_push(
    local: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    uid: Arc<str>,
    shutdown: CancellationToken,
) {
    loop {
        let until_midnight = until_next_midnight(&*clock);
        tokio::select! {
            _ = shutdown.cancelled() => {
                return;
            }
            _ = clock.sleep(until_midnight) => ()
        }

        loop {
            let date = clock.today();
            match push_goal_history(&local, &*remote, &uid, date).await {
                Ok(()) => {
                    info!("Pushed goal history for {date}");
                    break;
                }
                Err(e) => {
                    warn!("Goal history push for {date} failed, will retry: {e:#}");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return;
                }
                _ = clock.sleep(RETRY_DELAY) => ()
            }
        }
    }
}

fn until_next_midnight(clock: &dyn Clock) -> Duration {
    (clock.next_midnight() - clock.time())
        .to_std()
        .unwrap_or(Duration::ZERO)
}
