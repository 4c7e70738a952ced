// src/coordinator/health.rs
//
// Health loop, spec.md §4.4. Marks silent workers offline and times out
// stale jobs. Like `scheduling.rs`, every tick re-reads the store; nothing
// here survives between ticks but the atomics in `HealthStats`.

use crate::config::CoordinatorConfig;
use crate::error::StoreResult;
use crate::model::{JobStatus, NodeStatus};
use crate::store::Store;
use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct HealthStats {
    pub nodes_marked_offline: AtomicU64,
    pub jobs_timed_out: AtomicU64,
}

pub async fn run_once(
    store: &Arc<Store>,
    config: &CoordinatorConfig,
    stats: &Arc<HealthStats>,
) -> StoreResult<()> {
    let store = store.clone();
    let stats = stats.clone();
    let worker_timeout = config.worker_timeout;
    let heartbeat_timeout = config.heartbeat_timeout;

    tokio::task::spawn_blocking(move || -> StoreResult<()> {
        for node in store.list_stale_nodes(worker_timeout)? {
            store.update_node_status(node.id, NodeStatus::Offline)?;
            stats.nodes_marked_offline.fetch_add(1, Ordering::Relaxed);
            warn!("node {} ({}) marked offline: no heartbeat", node.id, node.name);
        }

        for job in store.get_running_over_timeout(heartbeat_timeout)? {
            if store
                .transition_state(job.id, JobStatus::TimedOut, "no heartbeat")
                .unwrap_or(false)
            {
                stats.jobs_timed_out.fetch_add(1, Ordering::Relaxed);
                info!("job {} timed out while running: no heartbeat", job.id);
            }
        }

        for job in store.get_assigned_over_timeout()? {
            if store
                .transition_state(job.id, JobStatus::TimedOut, "failed to start")
                .unwrap_or(false)
            {
                stats.jobs_timed_out.fetch_add(1, Ordering::Relaxed);
                info!("job {} timed out while assigned: failed to start", job.id);
            }
        }

        Ok(())
    })
    .await
    .expect("store task panicked")
}
