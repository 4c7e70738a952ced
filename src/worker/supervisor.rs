// src/worker/supervisor.rs
//
// Full per-job execution lifecycle, spec.md §4.6 steps 1-10. Grounded in
// the teacher's `NodeGuardian::execute_lifecycle` (src/guardian.rs) for the
// overall shape (preflight -> launch -> supervise -> collect -> cleanup ->
// report, with guaranteed resource release on every exit path) and in
// `ExternalDriver` (src/drivers/external.rs) for the "pipe stdio, classify
// on exit code" process-supervision idiom — the science-specific adapter
// phases themselves don't carry over.

use crate::fsm;
use crate::logbuf::LogBuffer;
use crate::model::{Engine, FailureReason, Job};
use crate::transport::{ClusterTransport, JobOutcome};
use crate::worker::process;
use crate::worker::resources::{free_disk_mb, JobCgroup};
use log::{info, warn};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

pub struct SupervisorConfig {
    pub min_disk_mb: u64,
    pub max_cpu_percent: u32,
    pub max_memory_mb: u64,
    pub persist_inputs: bool,
    pub persist_outputs: bool,
    pub work_dir: std::path::PathBuf,
}

/// Stderr substrings mapped to failure reasons, spec.md §4.6 step 8. Checked
/// in order; first match wins.
const FAILURE_MARKERS: &[(&str, FailureReason)] = &[
    ("no such file or directory", FailureReason::InputError),
    ("invalid data found", FailureReason::InputError),
    ("connection refused", FailureReason::NetworkError),
    ("network is unreachable", FailureReason::NetworkError),
    ("timed out", FailureReason::NetworkError),
    ("no space left on device", FailureReason::ResourceError),
    ("cannot allocate memory", FailureReason::ResourceError),
    ("unsupported codec", FailureReason::CapabilityMismatch),
    ("device or resource busy", FailureReason::ResourceError),
];

fn classify_stderr(tail: &str) -> FailureReason {
    let lower = tail.to_ascii_lowercase();
    for (marker, reason) in FAILURE_MARKERS {
        if lower.contains(marker) {
            return *reason;
        }
    }
    FailureReason::RuntimeError
}

fn select_engine(job: &Job) -> Engine {
    match job.engine {
        Engine::Ffmpeg => Engine::Ffmpeg,
        Engine::Gstreamer => Engine::Gstreamer,
        Engine::Auto => {
            if job.parameters.contains_key("pipeline") {
                Engine::Gstreamer
            } else {
                Engine::Ffmpeg
            }
        }
    }
}

fn build_command(engine: Engine, job: &Job) -> (String, Vec<String>) {
    let input = job
        .parameters
        .get("input")
        .and_then(|v| v.as_str())
        .unwrap_or("input.ts")
        .to_string();
    let output = job
        .parameters
        .get("output")
        .and_then(|v| v.as_str())
        .unwrap_or("output.mp4")
        .to_string();

    match engine {
        Engine::Gstreamer => {
            let pipeline = job
                .parameters
                .get("pipeline")
                .and_then(|v| v.as_str())
                .unwrap_or("videotestsrc ! autovideosink")
                .to_string();
            (
                "gst-launch-1.0".to_string(),
                pipeline.split_whitespace().map(str::to_string).collect(),
            )
        }
        Engine::Ffmpeg | Engine::Auto => {
            let codec = job
                .parameters
                .get("codec")
                .and_then(|v| v.as_str())
                .unwrap_or("libx264")
                .to_string();
            let bitrate = job
                .parameters
                .get("bitrate")
                .and_then(|v| v.as_str())
                .map(str::to_string);

            let mut args = vec!["-y".to_string(), "-i".to_string(), input, "-c:v".to_string(), codec];
            if let Some(b) = bitrate {
                args.push("-b:v".to_string());
                args.push(b);
            }
            args.push(output);
            ("ffmpeg".to_string(), args)
        }
    }
}

enum Outcome {
    Completed { duration: Duration, fps: Option<f64> },
    Canceled,
    TimedOutExpected,
    Failed { reason: FailureReason, message: String },
}

pub struct JobSupervisor {
    transport: Arc<dyn ClusterTransport>,
    node_id: Uuid,
    config: SupervisorConfig,
}

impl JobSupervisor {
    pub fn new(transport: Arc<dyn ClusterTransport>, node_id: Uuid, config: SupervisorConfig) -> Self {
        Self {
            transport,
            node_id,
            config,
        }
    }

    pub async fn run(&self, job: Job) {
        // `assigned -> running`, spec.md §6 `next_job`. If this loses the
        // race against an admin cancellation, don't start the encoder at
        // all; just confirm teardown so the node is freed.
        if let Err(e) = self.transport.mark_job_running(job.id).await {
            warn!("job {} could not transition to running: {e}; treating as canceled", job.id);
            let _ = self
                .transport
                .report_result(job.id, self.node_id, JobOutcome::Canceled)
                .await;
            return;
        }

        let logbuf = Arc::new(LogBuffer::new(2000));
        let outcome = self.execute(&job, &logbuf).await;
        self.report(&job, outcome, &logbuf).await;
    }

    async fn execute(&self, job: &Job, logbuf: &Arc<LogBuffer>) -> Outcome {
        // 1. Preflight.
        let free_mb = free_disk_mb(&self.config.work_dir);
        if free_mb < self.config.min_disk_mb {
            return Outcome::Failed {
                reason: FailureReason::ResourceError,
                message: format!("insufficient disk: {free_mb}MB free, need {}MB", self.config.min_disk_mb),
            };
        }
        let start = Instant::now();

        // 2. Input stage is skipped: input-file generation is an excluded
        // external collaborator (spec.md §1). A job whose parameters don't
        // name an input is an input error, not synthesized.
        if job.parameters.get("input").and_then(|v| v.as_str()).is_none() {
            return Outcome::Failed {
                reason: FailureReason::InputError,
                message: "job parameters do not name an input".into(),
            };
        }

        // 3. Engine selection + capability check.
        let engine = select_engine(job);
        if job.requires_gpu() {
            // The worker harness is handed its own node's gpu_type by the
            // caller via job parameters at dispatch time in this
            // single-process build; see worker/mod.rs for the node lookup
            // that feeds `requires_gpu` mismatches back here as a
            // capability_mismatch rather than letting them hit the encoder.
            let has_gpu = job
                .parameters
                .get("__node_has_gpu")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !has_gpu {
                return Outcome::Failed {
                    reason: FailureReason::CapabilityMismatch,
                    message: "job requires a hardware encoder this node lacks".into(),
                };
            }
        }

        // 4. Command build.
        let (program, args) = build_command(engine, job);

        // 5. Isolation.
        let cgroup = JobCgroup::create(&job.id.to_string(), self.config.max_cpu_percent, self.config.max_memory_mb);
        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&self.config.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process::set_process_group(&mut cmd);
        crate::worker::resources::apply_niceness(&mut cmd);

        // 6. Launch.
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                cgroup.teardown();
                return Outcome::Failed {
                    reason: FailureReason::RuntimeError,
                    message: format!("failed to launch {program}: {e}"),
                };
            }
        };
        if let Some(pid) = child.id() {
            cgroup.attach(pid);
        }
        if !cgroup.is_isolated() {
            warn!("job {} running without cgroup isolation", job.id);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stderr_tail = Arc::new(std::sync::Mutex::new(String::new()));

        if let Some(out) = stdout {
            let logbuf = logbuf.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logbuf.push(line);
                }
            });
        }
        let stderr_task = if let Some(err) = stderr {
            let logbuf = logbuf.clone();
            let tail = stderr_tail.clone();
            Some(tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logbuf.push(format!("[stderr] {line}"));
                    let mut t = tail.lock().unwrap();
                    t.push_str(&line);
                    t.push('\n');
                    let excess = t.len().saturating_sub(8192);
                    if excess > 0 {
                        t.drain(0..excess);
                    }
                }
            }))
        } else {
            None
        };

        // 7. Supervise: cancellation poll + timeout race, plus a keepalive
        // task so `last_activity` stays fresh for the duration of a long
        // encode (spec.md §4.4/§4.6: heartbeat or progress update). Interval
        // is well under the coordinator's default 120s heartbeat_timeout so
        // a live job is never mistaken for a stalled one.
        let timeout = fsm::compute_timeout(job.engine, job.declared_duration_secs());
        let cancel_poll = self.cancel_poll(job.id);
        let keepalive = self.keepalive(job.id, job.declared_duration_secs(), logbuf.clone());

        tokio::pin!(cancel_poll);
        let keepalive_handle = tokio::spawn(keepalive);
        let wait_result = tokio::select! {
            res = tokio::time::timeout(timeout, child.wait()) => Some(res),
            _ = &mut cancel_poll => {
                process::terminate_with_grace(&mut child, Duration::from_secs(30)).await;
                None
            }
        };
        keepalive_handle.abort();

        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        cgroup.teardown();

        let outcome = match wait_result {
            None => Outcome::Canceled,
            Some(Err(_elapsed)) => {
                // Context deadline hit. For GStreamer jobs with a declared
                // duration this is the expected success idiom (spec.md §4.6
                // step 8); otherwise it's a real timeout failure.
                process::terminate_with_grace(&mut child, Duration::from_secs(30)).await;
                if matches!(job.engine, Engine::Gstreamer) && job.declared_duration_secs().is_some() {
                    Outcome::TimedOutExpected
                } else {
                    Outcome::Failed {
                        reason: FailureReason::Timeout,
                        message: "execution exceeded computed timeout".into(),
                    }
                }
            }
            Some(Ok(Ok(status))) if status.success() => Outcome::Completed {
                duration: start.elapsed(),
                fps: parse_fps(&logbuf.snapshot()),
            },
            Some(Ok(Ok(_status))) => {
                let tail = stderr_tail.lock().unwrap().clone();
                Outcome::Failed {
                    reason: classify_stderr(&tail),
                    message: format!("process exited non-zero: {}", tail.lines().last().unwrap_or("")),
                }
            }
            Some(Ok(Err(e))) => Outcome::Failed {
                reason: FailureReason::RuntimeError,
                message: format!("wait() failed: {e}"),
            },
        };

        // 9. Cleanup of generated artifacts.
        self.cleanup_artifacts(job);

        outcome
    }

    /// Keeps `last_activity` fresh while the process runs: a plain
    /// heartbeat every tick, plus a progress percentage when the ffmpeg
    /// log tail yields one. Runs forever; the caller aborts the task once
    /// the process exits or is canceled.
    fn keepalive(
        &self,
        job_id: Uuid,
        declared_duration_secs: Option<f64>,
        logbuf: Arc<LogBuffer>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let transport = self.transport.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if let Err(e) = transport.heartbeat_job(job_id).await {
                    warn!("heartbeat for job {job_id} failed: {e}");
                }
                if let Some(pct) = compute_progress_pct(&logbuf.snapshot(), declared_duration_secs) {
                    if let Err(e) = transport.report_progress(job_id, pct).await {
                        warn!("progress report for job {job_id} failed: {e}");
                    }
                }
            }
        }
    }

    /// Polls the authoritative job status every 5s; resolves once the job
    /// is observed `canceled`. Runs forever otherwise (the `select!` in
    /// `execute` races it against the process exit).
    async fn cancel_poll(&self, job_id: Uuid) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            match self.transport.get_job(job_id).await {
                Ok(j) if j.status == crate::model::JobStatus::Canceled => return,
                Ok(_) => continue,
                // A worker that observes its assigned job gone treats that
                // as cancel, spec.md §7 propagation policy.
                Err(crate::error::StoreError::NotFound) => return,
                Err(e) => {
                    warn!("cancellation poll for job {job_id} failed: {e}");
                }
            }
        }
    }

    fn cleanup_artifacts(&self, job: &Job) {
        if !self.config.persist_inputs {
            if let Some(input) = job.parameters.get("input").and_then(|v| v.as_str()) {
                if is_test_artifact(input) {
                    let _ = std::fs::remove_file(self.config.work_dir.join(input));
                }
            }
        }
        if !self.config.persist_outputs {
            if let Some(output) = job.parameters.get("output").and_then(|v| v.as_str()) {
                if is_test_artifact(output) {
                    let _ = std::fs::remove_file(self.config.work_dir.join(output));
                }
            }
        }
    }

    async fn report(&self, job: &Job, outcome: Outcome, logbuf: &Arc<LogBuffer>) {
        let result = match outcome {
            Outcome::Completed { duration, fps } => {
                info!(
                    "job {} completed in {:?} (fps={:?})",
                    job.id, duration, fps
                );
                logbuf.push(format!(
                    "-- completed in {:.1}s, fps={}",
                    duration.as_secs_f64(),
                    fps.map(|f| f.to_string()).unwrap_or_else(|| "n/a".into())
                ));
                JobOutcome::Completed
            }
            Outcome::TimedOutExpected => {
                info!("job {} reached declared duration deadline (expected)", job.id);
                JobOutcome::Completed
            }
            Outcome::Canceled => {
                info!("job {} canceled, confirming process teardown", job.id);
                JobOutcome::Canceled
            }
            Outcome::Failed { reason, message } => {
                warn!("job {} failed: {message} ({reason:?})", job.id);
                JobOutcome::Failed {
                    message,
                    reason,
                    logs: logbuf.snapshot(),
                }
            }
        };

        self.report_with_retry(job.id, result).await;
    }

    /// Delivers the result with exponential backoff, never dropping it
    /// (spec.md §4.6 closing paragraph / §7 worker propagation policy).
    async fn report_with_retry(&self, job_id: Uuid, outcome: JobOutcome) {
        let mut attempt = 0u32;
        loop {
            let retry_payload = match &outcome {
                JobOutcome::Completed => JobOutcome::Completed,
                JobOutcome::Failed { message, reason, logs } => JobOutcome::Failed {
                    message: message.clone(),
                    reason: *reason,
                    logs: logs.clone(),
                },
                JobOutcome::Canceled => JobOutcome::Canceled,
            };
            match self.transport.report_result(job_id, self.node_id, retry_payload).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("reporting result for job {job_id} failed (attempt {attempt}): {e}");
                    attempt += 1;
                    if attempt > 8 {
                        warn!("giving up reporting job {job_id} after {attempt} attempts");
                        return;
                    }
                    tokio::time::sleep(fsm::compute_backoff(attempt)).await;
                }
            }
        }
    }
}

fn is_test_artifact(path: &str) -> bool {
    path.contains("transcode-cluster-test-") || path.starts_with("/tmp/")
}

/// Best-effort fps parse out of ffmpeg-style progress lines
/// (`frame=123 fps=29.7 ...`), spec.md §4.6 step 8.
fn parse_fps(log_tail: &str) -> Option<f64> {
    log_tail
        .rsplit("fps=")
        .nth(0)
        .and_then(|s| s.split_whitespace().next())
        .and_then(|s| s.parse::<f64>().ok())
}

/// Best-effort elapsed-seconds parse out of ffmpeg-style progress lines
/// (`time=00:00:04.00`).
fn parse_elapsed_secs(log_tail: &str) -> Option<f64> {
    let stamp = log_tail.rsplit("time=").nth(0)?.split_whitespace().next()?;
    let mut parts = stamp.splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Percentage through a declared duration, clamped to 0-100. `None` when
/// the job didn't declare a duration or the log tail has no progress yet.
fn compute_progress_pct(log_tail: &str, declared_duration_secs: Option<f64>) -> Option<u8> {
    let declared = declared_duration_secs?;
    if declared <= 0.0 {
        return None;
    }
    let elapsed = parse_elapsed_secs(log_tail)?;
    Some(((elapsed / declared) * 100.0).clamp(0.0, 100.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_markers() {
        assert_eq!(
            classify_stderr("Error: No such file or directory"),
            FailureReason::InputError
        );
        assert_eq!(
            classify_stderr("curl: (7) Failed to connect: Connection refused"),
            FailureReason::NetworkError
        );
        assert_eq!(classify_stderr("segfault city"), FailureReason::RuntimeError);
    }

    #[test]
    fn parses_fps_from_progress_line() {
        let tail = "frame=  120 fps= 29.8 q=23.0 size=  1024kB time=00:00:04.00";
        assert_eq!(parse_fps(tail), Some(29.8));
    }

    #[test]
    fn parses_elapsed_secs_from_progress_line() {
        let tail = "frame=  120 fps= 29.8 q=23.0 size=  1024kB time=00:01:04.50";
        assert_eq!(parse_elapsed_secs(tail), Some(64.5));
    }

    #[test]
    fn computes_progress_pct_against_declared_duration() {
        let tail = "frame=120 fps=29.8 time=00:00:05.00";
        assert_eq!(compute_progress_pct(tail, Some(10.0)), Some(50));
    }

    #[test]
    fn progress_pct_is_none_without_declared_duration() {
        let tail = "frame=120 fps=29.8 time=00:00:05.00";
        assert_eq!(compute_progress_pct(tail, None), None);
    }

    #[test]
    fn progress_pct_clamps_past_declared_duration() {
        let tail = "frame=120 fps=29.8 time=00:00:30.00";
        assert_eq!(compute_progress_pct(tail, Some(10.0)), Some(100));
    }

    #[test]
    fn test_artifact_detection() {
        assert!(is_test_artifact("/tmp/in.ts"));
        assert!(is_test_artifact("transcode-cluster-test-abc123.mp4"));
        assert!(!is_test_artifact("/srv/media/final.mp4"));
    }
}
