use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::platform::usage_stats::UsageStatsProvider;
use crate::store::remote::{paths, RemoteStore};
use crate::utils::clock::Clock;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How far back the latest foreground event may lie and still count as
/// "running right now".
const RUNNING_LOOKBACK: chrono::Duration = chrono::Duration::seconds(10);

/// Watches whether one app is in the foreground and mirrors the transitions
/// into this member's usage document, so the rest of the group sees the
/// session while it is still running.
///
/// Only transitions are written. A start stamps `lastStartTime`, a stop folds
/// the elapsed time into `usageSeconds` and clears the stamp again. Stops land
/// in a transaction that backs off when no start marker is present, which
/// keeps two devices of the same user from closing one session twice.
pub struct GroupUsageMonitor {
    remote: Arc<dyn RemoteStore>,
    usage_stats: Arc<dyn UsageStatsProvider>,
    clock: Arc<dyn Clock>,
    uid: Arc<str>,
    group_id: Arc<str>,
    package: Arc<str>,
    shutdown: CancellationToken,
}

impl GroupUsageMonitor {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        usage_stats: Arc<dyn UsageStatsProvider>,
        clock: Arc<dyn Clock>,
        uid: Arc<str>,
        group_id: Arc<str>,
        package: Arc<str>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            remote,
            usage_stats,
            clock,
            uid,
            group_id,
            package,
            shutdown,
        }
    }

    pub async fn run(self) {
        debug!(
            "Monitoring {} for group {} as {}",
            self.package, self.group_id, self.uid
        );
        // Unknown until the first probe, so the first result always writes.
        // Coming up with the app already closed then reconciles a stale
        // `isRunning` left over from a shutdown mid-session.
        let mut running: Option<bool> = None;
        let mut poll_point = self.clock.instant();
        loop {
            let now_running = self.probe().await;
            if running != Some(now_running) {
                if now_running {
                    self.mark_started().await;
                } else {
                    self.mark_stopped().await;
                }
                running = Some(now_running);
            }

            poll_point += POLL_INTERVAL;
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return;
                }
                _ = self.clock.sleep_until(poll_point) => ()
            }
        }
    }

    async fn probe(&self) -> bool {
        match self
            .usage_stats
            .foreground_app(self.clock.time(), RUNNING_LOOKBACK)
            .await
        {
            Ok(current) => current.as_deref() == Some(&*self.package),
            Err(e) => {
                warn!("Foreground probe failed: {e}");
                false
            }
        }
    }

    async fn mark_started(&self) {
        let now_millis = self.clock.time().timestamp_millis();
        let result = self
            .remote
            .transact(
                &paths::group_member(&self.group_id, &self.uid),
                Box::new(move |current| {
                    let mut doc = current.unwrap_or_default();
                    doc.insert("isRunning".into(), json!(true));
                    doc.insert("lastStartTime".into(), json!(now_millis));
                    Some(doc)
                }),
            )
            .await;
        match result {
            Ok(()) => debug!("Session start for {} in {}", self.package, self.group_id),
            Err(e) => warn!(
                "Could not publish session start in group {}: {e}",
                self.group_id
            ),
        }
    }

    async fn mark_stopped(&self) {
        let now_millis = self.clock.time().timestamp_millis();
        let result = self
            .remote
            .transact(
                &paths::group_member(&self.group_id, &self.uid),
                Box::new(move |current| {
                    // No document or no start marker means no open session.
                    let mut doc = current?;
                    let last_start = doc.get("lastStartTime").and_then(Value::as_i64)?;
                    let accumulated = doc
                        .get("usageSeconds")
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    let elapsed = ((now_millis - last_start) / 1000).max(0) as u64;
                    doc.insert("usageSeconds".into(), json!(accumulated + elapsed));
                    doc.insert("isRunning".into(), json!(false));
                    doc.insert("lastStartTime".into(), Value::Null);
                    Some(doc)
                }),
            )
            .await;
        match result {
            Ok(()) => debug!("Session stop for {} in {}", self.package, self.group_id),
            Err(e) => warn!(
                "Could not publish session stop in group {}: {e}",
                self.group_id
            ),
        }
    }
}
