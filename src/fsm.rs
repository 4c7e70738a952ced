// src/fsm.rs
//
// =============================================================================
// TRANSCODE CLUSTER: JOB FINITE STATE MACHINE
// =============================================================================
//
// Pure logic, no I/O. The store is the only caller; it routes every status
// mutation through `allowed_transition` rather than writing `job.status`
// directly, which is the anti-pattern the teacher's `NodeGuardian` and
// `MarketplaceCoordinator` both exhibited (see DESIGN.md).

use crate::model::{Engine, FailureReason, JobStatus};
use std::time::Duration;

/// Allowed transitions, spec.md §4.2. Everything not listed is rejected.
pub fn allowed_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    if from == to {
        // Idempotent no-op calls are handled by the store layer, not here;
        // the FSM itself has no self-loops.
        return false;
    }
    matches!(
        (from, to),
        (Queued, Assigned)
            | (Queued, Canceled)
            | (Assigned, Running)
            | (Assigned, Canceled)
            | (Assigned, Retrying)
            | (Assigned, Failed)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, TimedOut)
            | (Running, Paused)
            | (Running, Canceled)
            | (Paused, Running)
            | (Paused, Canceled)
            | (TimedOut, Retrying)
            | (TimedOut, Failed)
            | (Retrying, Queued)
            | (Retrying, Failed)
    )
}

const SAFETY_MARGIN: Duration = Duration::from_secs(60);
const FFMPEG_DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const GSTREAMER_DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const GSTREAMER_MARGIN: Duration = Duration::from_secs(30);

/// `assigned` has its own cap regardless of engine (spec.md §4.2).
pub const ASSIGNED_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Pure function of engine + declared duration. `Engine::Auto` is treated as
/// FFmpeg for timeout purposes, matching the worker's engine-selection
/// default (spec.md §4.6 step 3).
pub fn compute_timeout(engine: Engine, declared_duration_secs: Option<f64>) -> Duration {
    match engine {
        Engine::Auto | Engine::Ffmpeg => match declared_duration_secs {
            Some(d) if d > 0.0 => Duration::from_secs_f64(d * 2.0) + SAFETY_MARGIN,
            _ => FFMPEG_DEFAULT_TIMEOUT,
        },
        Engine::Gstreamer => match declared_duration_secs {
            Some(d) if d > 0.0 => Duration::from_secs_f64(d) + GSTREAMER_MARGIN,
            _ => GSTREAMER_DEFAULT_TIMEOUT,
        },
    }
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Exponential backoff from 5s doubling to a 5-minute cap (spec.md §4.2).
pub fn compute_backoff(retry_count: u32) -> Duration {
    let scaled = INITIAL_BACKOFF.saturating_mul(1u32.checked_shl(retry_count).unwrap_or(u32::MAX));
    std::cmp::min(scaled, MAX_BACKOFF)
}

/// Whether a job should be retried rather than terminated, combining the
/// retry-count budget with the failure classifier (spec.md §4.2).
pub fn should_retry(retry_count: u32, max_retries: u32, reason: FailureReason) -> bool {
    retry_count < max_retries && reason.is_retry_eligible()
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    #[test]
    fn allows_documented_edges() {
        let edges = [
            (Queued, Assigned),
            (Queued, Canceled),
            (Assigned, Running),
            (Assigned, Canceled),
            (Assigned, Retrying),
            (Assigned, Failed),
            (Running, Completed),
            (Running, Failed),
            (Running, TimedOut),
            (Running, Paused),
            (Running, Canceled),
            (Paused, Running),
            (Paused, Canceled),
            (TimedOut, Retrying),
            (TimedOut, Failed),
            (Retrying, Queued),
            (Retrying, Failed),
        ];
        for (from, to) in edges {
            assert!(allowed_transition(from, to), "{:?} -> {:?}", from, to);
        }
    }

    #[test]
    fn rejects_terminal_outgoing_edges() {
        for terminal in [Completed, Failed, Canceled] {
            for to in [Queued, Assigned, Running, Paused, TimedOut, Retrying] {
                assert!(!allowed_transition(terminal, to));
            }
        }
    }

    #[test]
    fn rejects_skip_ahead_edges() {
        assert!(!allowed_transition(Queued, Running));
        assert!(!allowed_transition(Queued, Completed));
        assert!(!allowed_transition(Assigned, Paused));
        assert!(!allowed_transition(Assigned, Completed));
    }

    #[test]
    fn rejects_self_loop() {
        assert!(!allowed_transition(Running, Running));
    }

    #[test]
    fn ffmpeg_timeout_is_monotone_in_duration() {
        let t1 = compute_timeout(Engine::Ffmpeg, Some(10.0));
        let t2 = compute_timeout(Engine::Ffmpeg, Some(20.0));
        assert!(t2 > t1);
        assert_eq!(t1, Duration::from_secs(20) + SAFETY_MARGIN);
    }

    #[test]
    fn ffmpeg_default_timeout_without_duration() {
        assert_eq!(compute_timeout(Engine::Ffmpeg, None), FFMPEG_DEFAULT_TIMEOUT);
    }

    #[test]
    fn gstreamer_timeout_is_monotone_in_duration() {
        let t1 = compute_timeout(Engine::Gstreamer, Some(10.0));
        let t2 = compute_timeout(Engine::Gstreamer, Some(20.0));
        assert!(t2 > t1);
        assert_eq!(t1, Duration::from_secs(10) + GSTREAMER_MARGIN);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(compute_backoff(0), Duration::from_secs(5));
        assert_eq!(compute_backoff(1), Duration::from_secs(10));
        assert_eq!(compute_backoff(2), Duration::from_secs(20));
        assert_eq!(compute_backoff(10), MAX_BACKOFF);
    }

    #[test]
    fn backoff_within_bounds_for_all_small_retry_counts() {
        for n in 0..20u32 {
            let b = compute_backoff(n);
            let lower = INITIAL_BACKOFF.saturating_mul(1u32.checked_shl(n).unwrap_or(u32::MAX));
            let expected = std::cmp::min(lower, MAX_BACKOFF);
            assert_eq!(b, expected);
            assert!(b <= MAX_BACKOFF);
        }
    }

    #[test]
    fn only_specific_reasons_are_retry_eligible() {
        assert!(FailureReason::RuntimeError.is_retry_eligible());
        assert!(FailureReason::NetworkError.is_retry_eligible());
        assert!(FailureReason::ResourceError.is_retry_eligible());
        assert!(FailureReason::Timeout.is_retry_eligible());
        assert!(!FailureReason::UserError.is_retry_eligible());
        assert!(!FailureReason::CapabilityMismatch.is_retry_eligible());
        assert!(!FailureReason::InputError.is_retry_eligible());
    }

    #[test]
    fn should_retry_respects_budget_and_classifier() {
        assert!(should_retry(0, 3, FailureReason::RuntimeError));
        assert!(!should_retry(3, 3, FailureReason::RuntimeError));
        assert!(!should_retry(0, 3, FailureReason::CapabilityMismatch));
    }
}
