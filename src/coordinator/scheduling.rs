// src/coordinator/scheduling.rs
//
// Priority + fairness scheduler, spec.md §4.3. The ordering and aging math
// is pure and unit-tested in isolation; `run_once` is the only part that
// touches the store, and it re-reads fresh every tick — no carried-over
// node/job state, unlike the teacher's `MarketplaceCoordinator::schedule_work`
// which mutated a long-lived `ready_queue`/`nodes` map (see DESIGN.md).

use crate::error::StoreResult;
use crate::model::{Job, Node};
use crate::store::Store;
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const AGING_BUCKET: i64 = 300; // 5 minutes

/// `priority_weight` boosted by one per elapsed 5-minute bucket, capped at
/// `high`'s base weight (3) so an aged `batch/low` job can tie but never
/// outrank a `live/high` job of equal age.
pub fn effective_priority_weight(job: &Job, now: chrono::DateTime<Utc>) -> u32 {
    let waited_secs = (now - job.created_at).num_seconds().max(0);
    let aging_buckets = (waited_secs / AGING_BUCKET) as u32;
    (job.priority.weight() + aging_buckets).min(3)
}

/// `(queue_weight desc, effective_priority_weight desc, created_at asc)`,
/// spec.md §4.3 step 2-3. Stable sort preserves FIFO among exact ties.
pub fn order_jobs(mut jobs: Vec<Job>, now: chrono::DateTime<Utc>) -> Vec<Job> {
    jobs.sort_by(|a, b| {
        b.queue
            .weight()
            .cmp(&a.queue.weight())
            .then_with(|| {
                effective_priority_weight(b, now).cmp(&effective_priority_weight(a, now))
            })
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    jobs
}

/// First node in `nodes` able to take `job` — a GPU-requiring job skips
/// nodes without a declared GPU, spec.md §4.3 step 4 / §8 scenario S6.
pub fn pick_eligible_node<'a>(job: &Job, nodes: &[&'a Node]) -> Option<&'a Node> {
    nodes
        .iter()
        .find(|n| !job.requires_gpu() || n.gpu_type.is_some())
        .copied()
}

#[derive(Debug, Default)]
pub struct SchedulingStats {
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
}

impl SchedulingStats {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.attempts.load(Ordering::Relaxed),
            self.successes.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }
}

/// Runs one scheduling tick: fetch available nodes + queued jobs, order
/// them, greedily assign. Consumed nodes and already-placed jobs are
/// dropped from further consideration within the same tick. The whole tick
/// runs inside a single `spawn_blocking` since every `Store` call is
/// synchronous; stats are updated from the blocking closure via the shared
/// atomics.
pub async fn run_once(store: &Arc<Store>, stats: &Arc<SchedulingStats>) -> StoreResult<()> {
    let store = store.clone();
    let stats = stats.clone();

    tokio::task::spawn_blocking(move || -> StoreResult<()> {
        let nodes = store.list_available_nodes()?;
        let jobs = store.get_queued(None, None)?;

        let now = Utc::now();
        let ordered = order_jobs(jobs, now);
        let mut remaining_nodes: Vec<&Node> = nodes.iter().collect();

        for job in &ordered {
            if remaining_nodes.is_empty() {
                break;
            }
            let Some(node) = pick_eligible_node(job, &remaining_nodes) else {
                continue;
            };
            let node_id = node.id;

            stats.attempts.fetch_add(1, Ordering::Relaxed);
            match store.assign_job_to_worker(job.id, node_id) {
                Ok(true) => {
                    stats.successes.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "assigned job {} (seq {}) to node {}",
                        job.id, job.sequence_number, node_id
                    );
                    remaining_nodes.retain(|n| n.id != node_id);
                }
                Ok(false) => {
                    // Already assigned to this node by a prior tick; leave
                    // the node consumed so we don't double-assign it.
                    remaining_nodes.retain(|n| n.id != node_id);
                }
                Err(e) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    warn!("assignment of job {} to node {} failed: {}", job.id, node_id, e);
                    // NodeBusy/InvalidTransition: try the next job against
                    // the remaining nodes rather than aborting the tick.
                }
            }
        }

        debug!(
            "scheduling tick complete: {} queued jobs, {} available nodes at start",
            ordered.len(),
            nodes.len()
        );
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

    fn job_at(priority: Priority, queue: QueueClass, age_secs: i64) -> Job {
        let spec = JobSpec {
            scenario: "s".into(),
            engine: Engine::Ffmpeg,
            queue,
            priority,
            confidence_hint: None,
            parameters: HashMap::new(),
            max_retries: 3,
        };
        let mut job = Job::from_spec(spec, 1);
        job.created_at = Utc::now() - chrono::Duration::seconds(age_secs);
        job
    }

    #[test]
    fn orders_by_queue_then_priority_then_fifo() {
        let now = Utc::now();
        let low_batch = job_at(Priority::Low, QueueClass::Batch, 0);
        let high_live = job_at(Priority::High, QueueClass::Live, 0);
        let medium_default = job_at(Priority::Medium, QueueClass::Default, 0);

        let ordered = order_jobs(vec![low_batch, high_live, medium_default], now);
        assert_eq!(ordered[0].queue, QueueClass::Live);
        assert_eq!(ordered[1].queue, QueueClass::Default);
        assert_eq!(ordered[2].queue, QueueClass::Batch);
    }

    #[test]
    fn aging_boosts_but_never_exceeds_high_weight() {
        let now = Utc::now();
        let ancient_low = job_at(Priority::Low, QueueClass::Default, 3600);
        assert_eq!(effective_priority_weight(&ancient_low, now), 3);
    }

    #[test]
    fn aging_does_not_apply_before_five_minutes() {
        let now = Utc::now();
        let fresh_low = job_at(Priority::Low, QueueClass::Default, 60);
        assert_eq!(effective_priority_weight(&fresh_low, now), 1);
    }

    #[test]
    fn aged_batch_low_ties_but_does_not_outrank_equal_age_live_high() {
        let now = Utc::now();
        let aged_batch_low = job_at(Priority::Low, QueueClass::Batch, 3600);
        let live_high = job_at(Priority::High, QueueClass::Live, 3600);
        let ordered = order_jobs(vec![aged_batch_low, live_high], now);
        assert_eq!(ordered[0].queue, QueueClass::Live);
    }

    #[test]
    fn gpu_job_skips_nodes_without_gpu() {
        let spec = JobSpec {
            scenario: "s".into(),
            engine: Engine::Ffmpeg,
            queue: QueueClass::Default,
            priority: Priority::Medium,
            confidence_hint: None,
            parameters: HashMap::from([(
                "codec".to_string(),
                serde_json::json!("h264_nvenc"),
            )]),
            max_retries: 3,
        };
        let job = Job::from_spec(spec, 1);
        assert!(job.requires_gpu());

        let cpu_node = Node::new_registration(
            "n1".into(),
            "10.0.0.1:1".into(),
            8,
            "x".into(),
            8192,
            8192,
            None,
            vec![],
            HashMap::new(),
        );
        let gpu_node = Node::new_registration(
            "n2".into(),
            "10.0.0.2:1".into(),
            8,
            "x".into(),
            8192,
            8192,
            Some("nvidia-t4".into()),
            vec![],
            HashMap::new(),
        );

        let nodes = vec![&cpu_node, &gpu_node];
        let picked = pick_eligible_node(&job, &nodes).unwrap();
        assert_eq!(picked.id, gpu_node.id);
    }

    #[test]
    fn non_gpu_job_takes_first_available_node_regardless() {
        let spec = JobSpec {
            scenario: "s".into(),
            engine: Engine::Ffmpeg,
            queue: QueueClass::Default,
            priority: Priority::Medium,
            confidence_hint: None,
            parameters: HashMap::new(),
            max_retries: 3,
        };
        let job = Job::from_spec(spec, 1);
        let cpu_node = Node::new_registration(
            "n1".into(),
            "10.0.0.3:1".into(),
            8,
            "x".into(),
            8192,
            8192,
            None,
            vec![],
            HashMap::new(),
        );
        let nodes = vec![&cpu_node];
        assert!(pick_eligible_node(&job, &nodes).is_some());
    }
}
