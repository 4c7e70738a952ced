// src/coordinator/cleanup.rs
//
// Cleanup loop, spec.md §4.5. Reclaims orphans (assigned worker offline)
// and previously-timed-out jobs, retrying or terminating per the retry
// budget. This is also what makes crash recovery (spec.md §8 invariant 7)
// hold: a coordinator that restarts finds its orphans here within one
// cleanup interval regardless of what state they were frozen in.

use crate::config::CoordinatorConfig;
use crate::error::StoreResult;
use crate::model::{Job, JobStatus};
use crate::store::Store;
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct CleanupStats {
    pub orphans_found: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub terminal_after_exhausted: AtomicU64,
}

/// Routes one stuck job to `retrying` (and then `queued`) or `failed`,
/// depending on remaining retry budget. `running` jobs detour through
/// `timed_out` first since the FSM has no `running -> retrying` edge.
fn retry_or_terminate(store: &Store, job: &Job, reason: &str, stats: &CleanupStats) -> StoreResult<()> {
    let routed_status = if job.status == JobStatus::Running {
        store.transition_state(job.id, JobStatus::TimedOut, reason)?;
        JobStatus::TimedOut
    } else {
        job.status
    };

    if !matches!(routed_status, JobStatus::Assigned | JobStatus::TimedOut) {
        return Ok(());
    }

    if job.retry_count >= job.max_retries {
        store.transition_state(job.id, JobStatus::Failed, reason)?;
        stats.terminal_after_exhausted.fetch_add(1, Ordering::Relaxed);
        info!("job {} exhausted retries ({}); marked failed: {}", job.id, job.retry_count, reason);
    } else {
        store.transition_state(job.id, JobStatus::Retrying, reason)?;
        store.retry_job(job.id, reason)?;
        stats.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        info!("job {} re-queued for retry (attempt {}): {}", job.id, job.retry_count + 1, reason);
    }
    Ok(())
}

pub async fn run_once(
    store: &Arc<Store>,
    config: &CoordinatorConfig,
    stats: &Arc<CleanupStats>,
) -> StoreResult<()> {
    let store = store.clone();
    let stats = stats.clone();
    let worker_timeout = config.worker_timeout;

    tokio::task::spawn_blocking(move || -> StoreResult<()> {
        for job in store.get_orphaned(worker_timeout)? {
            stats.orphans_found.fetch_add(1, Ordering::Relaxed);
            retry_or_terminate(&store, &job, "worker dead", &stats)?;
        }

        for job in store.get_timed_out()? {
            retry_or_terminate(&store, &job, "timed out", &stats)?;
        }

        Ok(())
    })
    .await
    .expect("store task panicked")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Engine, JobSpec, NodeStatus, Priority, QueueClass};
    use std::collections::HashMap;

    fn spec() -> JobSpec {
        JobSpec {
            scenario: "s".into(),
            engine: Engine::Ffmpeg,
            queue: QueueClass::Default,
            priority: Priority::Medium,
            confidence_hint: None,
            parameters: HashMap::new(),
            max_retries: 1,
        }
    }

    fn test_node() -> crate::model::Node {
        crate::model::Node::new_registration(
            "w".into(),
            "10.9.9.9:1".into(),
            4,
            "x".into(),
            4096,
            4096,
            None,
            vec![],
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn orphaned_running_job_retries_once_then_fails() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let node = store.register_node(test_node()).unwrap();
        let job = store.create_job(spec()).unwrap();
        store.assign_job_to_worker(job.id, node.id).unwrap();
        store
            .transition_state(job.id, JobStatus::Running, "started")
            .unwrap();
        store.update_node_status(node.id, NodeStatus::Offline).unwrap();

        let config = CoordinatorConfig::from_env();
        let stats = Arc::new(CleanupStats::default());
        run_once(&store, &config, &stats).await.unwrap();

        let reloaded = store.get_job(job.id).unwrap();
        assert_eq!(reloaded.status, JobStatus::Queued);
        assert_eq!(reloaded.retry_count, 1);

        // Second orphan round (worker still offline, job reassigned to same dead node
        // would not happen in practice, but simulate exhaustion directly):
        let node2 = store.register_node(test_node()).unwrap();
        store.assign_job_to_worker(job.id, node2.id).unwrap();
        store
            .transition_state(job.id, JobStatus::Running, "started")
            .unwrap();
        store.update_node_status(node2.id, NodeStatus::Offline).unwrap();

        run_once(&store, &config, &stats).await.unwrap();
        let final_job = store.get_job(job.id).unwrap();
        assert_eq!(final_job.status, JobStatus::Failed);
    }
}
