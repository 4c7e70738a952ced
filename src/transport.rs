// src/transport.rs
//
// Generalizes the teacher's `Transport` trait (src/transport.rs), which
// moved DAG-shaped coordinator/worker messages over an append-only event
// log. The wire protocol itself is explicitly out of scope here (spec.md
// §1); what survives is the shape of the seam — an async trait a worker
// process calls against, so that a real network transport can be dropped
// in later without touching `coordinator`/`worker` code.
//
// `LocalTransport` is the only implementor: it calls straight through to
// the shared `Store`, which is exactly what an in-process worker needs and
// what the integration tests exercise.

use crate::error::StoreResult;
use crate::model::{Job, JobSpec, Node, NodeStatus};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn register_node(&self, node: Node) -> StoreResult<Node>;
    async fn heartbeat(&self, node_id: Uuid) -> StoreResult<()>;
    async fn set_node_status(&self, node_id: Uuid, status: NodeStatus) -> StoreResult<()>;

    /// Worker's poll for newly-assigned work. Returns `None` when nothing
    /// is assigned to this node right now.
    async fn next_assigned_job(&self, node_id: Uuid) -> StoreResult<Option<Job>>;

    /// Folds the worker-side half of spec.md §6's `next_job` into an
    /// explicit call: `assigned -> running`, once the worker has actually
    /// started executing the job rather than merely observed the
    /// assignment.
    async fn mark_job_running(&self, job_id: Uuid) -> StoreResult<()>;

    async fn heartbeat_job(&self, job_id: Uuid) -> StoreResult<()>;
    async fn report_progress(&self, job_id: Uuid, progress_pct: u8) -> StoreResult<()>;
    async fn report_result(
        &self,
        job_id: Uuid,
        node_id: Uuid,
        outcome: JobOutcome,
    ) -> StoreResult<()>;

    async fn submit_job(&self, spec: JobSpec) -> StoreResult<Job>;
    async fn get_job(&self, job_id: Uuid) -> StoreResult<Job>;
    async fn cancel_job(&self, job_id: Uuid) -> StoreResult<bool>;
}

/// Outcome a worker reports back after running a job (spec.md §4.6 step 7).
pub enum JobOutcome {
    Completed,
    Failed {
        message: String,
        reason: crate::model::FailureReason,
        logs: String,
    },
    /// The job was already moved to `canceled` by the admin path; this
    /// just confirms the worker tore the process down and releases the
    /// node, spec.md §5 cancellation semantics.
    Canceled,
}

pub struct LocalTransport {
    store: Arc<crate::store::Store>,
}

impl LocalTransport {
    pub fn new(store: Arc<crate::store::Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    async fn register_node(&self, node: Node) -> StoreResult<Node> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.register_node(node))
            .await
            .expect("store task panicked")
    }

    async fn heartbeat(&self, node_id: Uuid) -> StoreResult<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.update_node_heartbeat(node_id))
            .await
            .expect("store task panicked")
    }

    async fn set_node_status(&self, node_id: Uuid, status: NodeStatus) -> StoreResult<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.update_node_status(node_id, status))
            .await
            .expect("store task panicked")
    }

    async fn next_assigned_job(&self, node_id: Uuid) -> StoreResult<Option<Job>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let node = store.get_node(node_id)?;
            match node.current_job_id {
                Some(job_id) => store.get_job(job_id).map(Some),
                None => Ok(None),
            }
        })
        .await
        .expect("store task panicked")
    }

    async fn mark_job_running(&self, job_id: Uuid) -> StoreResult<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            store
                .transition_state(job_id, crate::model::JobStatus::Running, "execution started")
                .map(|_| ())
        })
        .await
        .expect("store task panicked")
    }

    async fn heartbeat_job(&self, job_id: Uuid) -> StoreResult<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.heartbeat_job(job_id))
            .await
            .expect("store task panicked")
    }

    async fn report_progress(&self, job_id: Uuid, progress_pct: u8) -> StoreResult<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.set_progress(job_id, progress_pct))
            .await
            .expect("store task panicked")
    }

    async fn report_result(
        &self,
        job_id: Uuid,
        node_id: Uuid,
        outcome: JobOutcome,
    ) -> StoreResult<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || match outcome {
            JobOutcome::Completed => store.complete_job(job_id, node_id).map(|_| ()),
            JobOutcome::Failed {
                message,
                reason,
                logs,
            } => {
                store.set_failure(job_id, &message, reason, &logs)?;
                let job = store.get_job(job_id)?;
                if crate::fsm::should_retry(job.retry_count, job.max_retries, reason) {
                    store.retry_job(job_id, &message)
                } else {
                    store
                        .transition_state(job_id, crate::model::JobStatus::Failed, &message)
                        .map(|_| ())
                }
            }
            JobOutcome::Canceled => store.release_node_if_attached(node_id, job_id),
        })
        .await
        .expect("store task panicked")
    }

    async fn submit_job(&self, spec: JobSpec) -> StoreResult<Job> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.create_job(spec))
            .await
            .expect("store task panicked")
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Job> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.get_job(job_id))
            .await
            .expect("store task panicked")
    }

    async fn cancel_job(&self, job_id: Uuid) -> StoreResult<bool> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            store.transition_state(job_id, crate::model::JobStatus::Canceled, "canceled by admin")
        })
        .await
        .expect("store task panicked")
    }
}
