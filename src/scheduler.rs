//! Periodic syncs of every healthy bank connection.

use std::time::Duration;

use tokio::{
    task::{JoinHandle, JoinSet},
    time::MissedTickBehavior,
};

use crate::sync::{SyncOrchestrator, SyncResult, SyncTrigger};

/// Spawn a task that syncs all syncable connections every `interval`.
///
/// The first round starts immediately. Rounds never overlap: a round that takes
/// longer than `interval` delays the next one.
pub fn spawn_scheduler(orchestrator: SyncOrchestrator, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            sync_due_connections(&orchestrator).await;
        }
    })
}

/// Sync every active connection that does not need re-authorization, concurrently.
///
/// Returns the results in no particular order.
pub async fn sync_due_connections(orchestrator: &SyncOrchestrator) -> Vec<SyncResult> {
    let start_time = std::time::Instant::now();

    let connection_ids = match orchestrator.syncable_connection_ids() {
        Ok(connection_ids) => connection_ids,
        Err(error) => {
            tracing::error!("Could not load connections for scheduled sync: {error}");
            return Vec::new();
        }
    };

    let mut tasks = JoinSet::new();

    for connection_id in connection_ids {
        let orchestrator = orchestrator.clone();
        tasks.spawn(async move {
            orchestrator
                .run_sync(connection_id, SyncTrigger::Scheduled)
                .await
        });
    }

    let mut results = Vec::with_capacity(tasks.len());

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(error) => tracing::error!("A scheduled sync task failed: {error}"),
        }
    }

    let failed = results.iter().filter(|result| !result.success).count();
    tracing::info!(
        "Scheduled sync of {} connections finished in {}ms, {failed} failed",
        results.len(),
        start_time.elapsed().as_millis()
    );

    results
}
