// src/worker/resources.rs
//
// Resource isolation, spec.md §4.6 step 5. Grounded in the teacher's
// `ResourceLedger`/`Sandbox` (src/resources.rs): same "detect capability,
// degrade gracefully" shape, but the teacher allocated CPU core/GPU index
// bitmasks for a Slurm/PBS-style batch scheduler. This system bounds
// concurrency by job slots (`max_concurrent_jobs`, enforced by a
// semaphore in `worker/mod.rs`), not core count, since one transcode job
// can legitimately consume a whole node — so what's reused here is the
// cgroup-attachment idiom, not the bitmask allocator.

use log::warn;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupApi {
    V2,
    V1,
    None,
}

impl CgroupApi {
    /// Auto-detected at worker startup. Degrades to `None` rather than
    /// erroring — unprivileged/containerized hosts are expected, spec.md
    /// §4.6 step 5 / §9.
    pub fn detect() -> Self {
        if PathBuf::from("/sys/fs/cgroup/cgroup.controllers").exists() {
            CgroupApi::V2
        } else if PathBuf::from("/sys/fs/cgroup/cpu").exists() {
            CgroupApi::V1
        } else {
            CgroupApi::None
        }
    }
}

/// A per-job cgroup. `attach` is best-effort: any failure logs a warning
/// and the job proceeds unisolated rather than failing outright.
pub struct JobCgroup {
    api: CgroupApi,
    /// v2: a single unified-hierarchy dir. v1: cpu dir + memory dir, both
    /// needing the pid attached separately.
    paths: Vec<PathBuf>,
}

impl JobCgroup {
    pub fn create(job_id: &str, max_cpu_percent: u32, max_memory_mb: u64) -> Self {
        let api = CgroupApi::detect();
        let paths = match api {
            CgroupApi::V2 => create_v2(job_id, max_cpu_percent, max_memory_mb)
                .map(|p| vec![p])
                .unwrap_or_default(),
            CgroupApi::V1 => create_v1(job_id, max_cpu_percent, max_memory_mb).unwrap_or_default(),
            CgroupApi::None => Vec::new(),
        };
        if paths.is_empty() && api != CgroupApi::None {
            warn!("cgroup creation failed for job {job_id}, continuing without isolation");
        }
        Self { api, paths }
    }

    /// Attaches `pid` to every dir this job's cgroup spans (both controllers
    /// on v1, the single unified dir on v2).
    pub fn attach(&self, pid: u32) {
        if self.api == CgroupApi::None {
            return;
        }
        for path in &self.paths {
            let procs_file = path.join("cgroup.procs");
            if let Err(e) = fs::write(&procs_file, pid.to_string()) {
                warn!("failed to attach pid {pid} to cgroup {}: {e}", path.display());
            }
        }
    }

    /// Dismantles the cgroup directories, spec.md §4.6 step 9. A no-op if
    /// isolation never applied.
    pub fn teardown(&self) {
        for path in &self.paths {
            let _ = fs::remove_dir(path);
        }
    }

    pub fn is_isolated(&self) -> bool {
        !self.paths.is_empty()
    }
}

fn create_v2(job_id: &str, max_cpu_percent: u32, max_memory_mb: u64) -> Option<PathBuf> {
    let dir = PathBuf::from("/sys/fs/cgroup/transcode-cluster").join(job_id);
    fs::create_dir_all(&dir).ok()?;
    // `cpu.max`: "<quota> <period>"; 100% of a 100ms period per percent point.
    let period_us = 100_000u64;
    let quota_us = (period_us * max_cpu_percent as u64) / 100;
    fs::write(dir.join("cpu.max"), format!("{quota_us} {period_us}")).ok()?;
    fs::write(
        dir.join("memory.max"),
        (max_memory_mb * 1024 * 1024).to_string(),
    )
    .ok()?;
    Some(dir)
}

fn create_v1(job_id: &str, max_cpu_percent: u32, max_memory_mb: u64) -> Option<Vec<PathBuf>> {
    let cpu_dir = PathBuf::from("/sys/fs/cgroup/cpu/transcode-cluster").join(job_id);
    let mem_dir = PathBuf::from("/sys/fs/cgroup/memory/transcode-cluster").join(job_id);
    fs::create_dir_all(&cpu_dir).ok()?;
    fs::create_dir_all(&mem_dir).ok()?;

    let period_us = 100_000i64;
    let quota_us = (period_us * max_cpu_percent as i64) / 100;
    fs::write(cpu_dir.join("cpu.cfs_period_us"), period_us.to_string()).ok()?;
    fs::write(cpu_dir.join("cpu.cfs_quota_us"), quota_us.to_string()).ok()?;
    fs::write(
        mem_dir.join("memory.limit_in_bytes"),
        (max_memory_mb * 1024 * 1024).to_string(),
    )
    .ok()?;

    Some(vec![cpu_dir, mem_dir])
}

/// Applies niceness to the about-to-spawn command, spec.md §4.6 step 5.
/// `+10` matches the teacher's `Sandbox` default.
#[cfg(unix)]
pub fn apply_niceness(cmd: &mut tokio::process::Command) {
    unsafe {
        cmd.pre_exec(|| {
            libc::nice(10);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn apply_niceness(_cmd: &mut tokio::process::Command) {}

/// Free disk space check ahead of execution, spec.md §4.6 step 1.
/// Grounded in the teacher's `SystemMonitor` (sysinfo-backed).
pub fn free_disk_mb(path: &std::path::Path) -> u64 {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() / (1024 * 1024))
        .unwrap_or(u64::MAX) // unknown mount: don't block the job on a monitoring gap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_never_panics() {
        let _ = CgroupApi::detect();
    }
}
