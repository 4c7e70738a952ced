// src/worker/mod.rs
//
// Per-node worker daemon, spec.md §4.6. Grounded in the teacher's
// `NodeGuardian::boot`/`try_accept_job` (src/guardian.rs): semaphore-bounded
// concurrency and a poll-heartbeat-execute outer loop, generalized from the
// teacher's HPC-job acceptance to this system's `ClusterTransport` seam.

pub mod process;
pub mod resources;
pub mod supervisor;

use crate::config::WorkerConfig;
use crate::model::{Node, NodeStatus};
use crate::transport::ClusterTransport;
use log::{error, info, warn};
use resources::free_disk_mb;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use supervisor::{JobSupervisor, SupervisorConfig};
use uuid::Uuid;

/// Readiness as the outside world would probe it (spec.md §4.6 step 4 /
/// §6 `/ready`). This crate doesn't bind a socket — that's the excluded
/// transport layer — but exposes the computation as a pure-ish function so
/// a future HTTP layer has nothing left to implement but the handler.
#[derive(Debug, Clone)]
pub struct ReadinessReport {
    pub encoder_on_path: bool,
    pub disk_ok: bool,
    pub last_heartbeat_ok: bool,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.encoder_on_path && self.disk_ok && self.last_heartbeat_ok
    }
}

fn binary_on_path(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
        })
        .unwrap_or(false)
}

pub struct WorkerHarness {
    transport: Arc<dyn ClusterTransport>,
    config: WorkerConfig,
    work_dir: std::path::PathBuf,
    node_id: std::sync::OnceLock<Uuid>,
    last_heartbeat_ok: Arc<AtomicBool>,
    active_jobs: Arc<AtomicU64>,
}

impl WorkerHarness {
    pub fn new(transport: Arc<dyn ClusterTransport>, config: WorkerConfig, work_dir: std::path::PathBuf) -> Self {
        Self {
            transport,
            config,
            work_dir,
            node_id: std::sync::OnceLock::new(),
            last_heartbeat_ok: Arc::new(AtomicBool::new(false)),
            active_jobs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Detects hardware and registers with the coordinator, spec.md §4.6
    /// step 1 / §9 "worker self-description", grounded in the teacher's
    /// `ResourceLedger::detect()`.
    pub async fn boot(&self, name: String, address: String) -> anyhow::Result<Uuid> {
        let mut sys = sysinfo::System::new_all();
        sys.refresh_all();

        let cpu_threads = num_cpus::get();
        let cpu_model = sys
            .cpus()
            .first()
            .map(|c| c.brand().to_string())
            .unwrap_or_else(|| "unknown".into());
        let ram_total_mb = sys.total_memory() / (1024 * 1024);
        let ram_free_mb = sys.available_memory() / (1024 * 1024);
        let gpu_type = detect_gpu();

        let node = Node::new_registration(
            name,
            address,
            cpu_threads,
            cpu_model,
            ram_total_mb,
            ram_free_mb,
            gpu_type,
            vec![],
            Default::default(),
        );

        let registered = self.transport.register_node(node).await?;
        info!("registered as node {} ({})", registered.id, registered.name);
        let _ = self.node_id.set(registered.id);
        Ok(registered.id)
    }

    fn node_id(&self) -> Uuid {
        *self.node_id.get().expect("boot() must run before run()")
    }

    pub fn readiness(&self) -> ReadinessReport {
        ReadinessReport {
            encoder_on_path: binary_on_path("ffmpeg") || binary_on_path("gst-launch-1.0"),
            disk_ok: free_disk_mb(&self.work_dir) > self.config.min_disk_mb,
            last_heartbeat_ok: self.last_heartbeat_ok.load(Ordering::Relaxed),
        }
    }

    /// Runs the heartbeat task, the job-acquisition task, and per-job
    /// supervisors until `shutdown` flips to `true`. On shutdown, waits up
    /// to a 30s grace window (spec.md §5) for in-flight job supervisors to
    /// finish before returning, so a stopped worker doesn't orphan a
    /// transcode mid-flight.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let node_id = self.node_id();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.max_concurrent_jobs));
        let supervisors = Arc::new(tokio::sync::Mutex::new(tokio::task::JoinSet::new()));

        let heartbeat = {
            let transport = self.transport.clone();
            let interval = self.config.heartbeat_interval;
            let shutdown = shutdown.clone();
            let last_heartbeat_ok = self.last_heartbeat_ok.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    match transport.heartbeat(node_id).await {
                        Ok(()) => last_heartbeat_ok.store(true, Ordering::Relaxed),
                        Err(e) => {
                            last_heartbeat_ok.store(false, Ordering::Relaxed);
                            warn!("heartbeat failed: {e}");
                        }
                    }
                }
            })
        };

        let acquisition = {
            let transport = self.transport.clone();
            let interval = self.config.poll_interval;
            let shutdown = shutdown.clone();
            let semaphore = semaphore.clone();
            let active_jobs = self.active_jobs.clone();
            let supervisors = supervisors.clone();
            let supervisor_config = SupervisorConfig {
                min_disk_mb: self.config.min_disk_mb,
                max_cpu_percent: self.config.max_cpu_percent,
                max_memory_mb: self.config.max_memory_mb,
                persist_inputs: self.config.persist_inputs,
                persist_outputs: self.config.persist_outputs,
                work_dir: self.work_dir.clone(),
            };

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if semaphore.available_permits() == 0 {
                        continue;
                    }
                    match transport.next_assigned_job(node_id).await {
                        Ok(Some(job)) => {
                            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                                continue;
                            };
                            active_jobs.fetch_add(1, Ordering::Relaxed);
                            let transport = transport.clone();
                            let active_jobs = active_jobs.clone();
                            let supervisor = JobSupervisor::new(
                                transport,
                                node_id,
                                SupervisorConfig {
                                    min_disk_mb: supervisor_config.min_disk_mb,
                                    max_cpu_percent: supervisor_config.max_cpu_percent,
                                    max_memory_mb: supervisor_config.max_memory_mb,
                                    persist_inputs: supervisor_config.persist_inputs,
                                    persist_outputs: supervisor_config.persist_outputs,
                                    work_dir: supervisor_config.work_dir.clone(),
                                },
                            );
                            supervisors.lock().await.spawn(async move {
                                supervisor.run(job).await;
                                active_jobs.fetch_sub(1, Ordering::Relaxed);
                                drop(permit);
                            });
                        }
                        Ok(None) => {}
                        Err(e) => error!("job acquisition poll failed: {e}"),
                    }
                }
            })
        };

        let _ = tokio::join!(acquisition, heartbeat);

        let remaining = supervisors.lock().await.len();
        if remaining > 0 {
            info!("waiting up to 30s for {remaining} in-flight job(s) to finish");
        }
        let mut set = supervisors.lock().await;
        let drain = async {
            while set.join_next().await.is_some() {}
        };
        if tokio::time::timeout(std::time::Duration::from_secs(30), drain)
            .await
            .is_err()
        {
            warn!("shutdown grace window elapsed with job supervisors still running; abandoning them");
            set.abort_all();
        }
    }
}

fn detect_gpu() -> Option<String> {
    // No privileged hardware probing here (explicitly excluded, spec.md
    // §1 "hardware capability detection"); this is the coarse heuristic
    // the teacher's `ResourceLedger::detect()` used before deferring to
    // Slurm/PBS environment variables, adapted to a plain device-node
    // check.
    if std::path::Path::new("/dev/nvidia0").exists() {
        Some("nvidia".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_requires_all_three_checks() {
        let report = ReadinessReport {
            encoder_on_path: true,
            disk_ok: true,
            last_heartbeat_ok: true,
        };
        assert!(report.is_ready());

        let degraded = ReadinessReport {
            disk_ok: false,
            ..report
        };
        assert!(!degraded.is_ready());
    }
}
