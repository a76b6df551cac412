use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::session::Session;
use crate::utils::clock::Clock;

use super::report::format_minutes;
use super::{open_session, Services};

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Runs the tracker until ctrl-c: periodic refreshes of today's view, the
/// midnight goal-history push, and the group monitor when one of the
/// groups watches an app.
pub async fn process_track_command(services: &Services) -> Result<()> {
    let session = open_session(services).await?;

    let report = session.sync().await;
    if !report.is_complete() {
        warn!("Starting from a partial sync, failed: {:?}", report.failed);
    }

    session.start_daily_push().await;
    if let Some((group_id, package)) = watched_group(&session).await {
        info!("Monitoring {package} for group {group_id}");
        session.start_group_monitor(group_id, package).await;
    }

    let shutdown_token = CancellationToken::new();

    tokio::join!(
        detect_shutdown(shutdown_token.clone()),
        run_refresh_loop(&session, services.clock.clone(), shutdown_token.clone()),
    );

    session.stop_background_tasks().await;
    Ok(())
}

/// The first local group that watches an app.
async fn watched_group(session: &Session) -> Option<(Arc<str>, Arc<str>)> {
    let groups = match session.groups().groups().await {
        Ok(groups) => groups,
        Err(e) => {
            warn!("Group list unavailable: {e:#}");
            return None;
        }
    };
    groups.into_iter().find_map(|group| {
        let package = group.app_id?;
        Some((group.group_id, package))
    })
}

/// Rebuilds today's view every interval and prints a line whenever the
/// total moves.
async fn run_refresh_loop(
    session: &Session,
    clock: Arc<dyn Clock>,
    shutdown_token: CancellationToken,
) {
    let mut last_total: Option<u32> = None;
    let mut poll_point = clock.instant();
    loop {
        let refresh = session.refresh_today().await;
        let total = refresh.view.total_minutes();
        if last_total != Some(total) {
            let goal = session.overall_goal().await;
            println!(
                "{}\t{} of {}",
                refresh.view.date,
                format_minutes(total),
                format_minutes(goal),
            );
            last_total = Some(total);
        }
        if let Err(e) = refresh.persist.await {
            warn!("Persisting the refresh failed: {e}");
        }

        poll_point += REFRESH_INTERVAL;
        select! {
            _ = shutdown_token.cancelled() => return,
            _ = clock.sleep_until(poll_point) => (),
        }
    }
}

async fn detect_shutdown(cancellation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            cancellation.cancel();
        },
    };
}
