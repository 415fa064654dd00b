//! Transient per-job run state: state machine, progress counters, throughput
//! smoothing and the volume-request sub-protocol.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobState {
    #[default]
    None,
    Waiting,
    Running,
    Done,
    Error,
    Aborted,
    /// Remote job whose slave connector dropped.
    Disconnected,
}

impl JobState {
    /// Active states block delete/reset and a second trigger.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobState::None => "none",
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Error => "error",
            JobState::Aborted => "aborted",
            JobState::Disconnected => "disconnected",
        };
        write!(f, "{text}")
    }
}

/// Severity of the current run message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MessageCode {
    #[default]
    None,
    Info,
    Error,
}

/// Current run message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMessage {
    pub code: MessageCode,
    pub text: String,
}

/// Progress counters reported by the create/restore collaborators.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProgressCounters {
    pub done_count: u64,
    pub done_size: u64,
    pub total_count: u64,
    pub total_size: u64,
    pub storage_done_size: u64,
    pub storage_total_size: u64,
}

/// Fixed-window moving average over timed samples.
///
/// Samples are cumulative totals; the rate is the growth across the window
/// divided by its time span.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<(DateTime<Utc>, u64)>,
}

const DEFAULT_FILTER_WINDOW: usize = 10;

impl Default for MovingAverage {
    fn default() -> Self {
        Self::new(DEFAULT_FILTER_WINDOW)
    }
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            samples: VecDeque::new(),
        }
    }

    /// Append a cumulative sample at `now`.
    pub fn append(&mut self, now: DateTime<Utc>, total: u64) {
        self.samples.push_back((now, total));
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
    }

    /// Units per second across the window; zero before two samples exist.
    pub fn rate(&self) -> f64 {
        let (Some((t0, v0)), Some((t1, v1))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let span_ms = (*t1 - *t0).num_milliseconds();
        if span_ms <= 0 || v1 <= v0 {
            return 0.0;
        }
        (v1 - v0) as f64 * 1000.0 / span_ms as f64
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// The volume-request state machine between the storage layer and clients.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VolumeRequest {
    /// No volume interaction pending.
    #[default]
    Idle,
    /// The storage layer asked for a volume; waiting on the client.
    Requested {
        volume_number: u32,
        message: String,
    },
    /// Client answered `volumeLoad`.
    Loaded { volume_number: u32 },
    /// Client answered `volumeUnload`.
    Unload,
}

/// Answer the runner hands back to the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeResult {
    /// Still waiting on the client.
    None,
    Ok(u32),
    Unload,
    Aborted,
}

/// Transient per-job run information.
#[derive(Debug, Clone, Default)]
pub struct RunningInfo {
    pub state: JobState,
    pub progress: ProgressCounters,
    pub current_entry_name: String,
    pub current_entry_done: u64,
    pub current_entry_total: u64,
    pub current_storage_name: String,
    pub message: RunMessage,
    pub volume_request: VolumeRequest,
    /// Shared with the run callbacks so aborts are observed lock-free.
    pub requested_abort: Arc<AtomicBool>,
    /// Name of the actor that requested the abort, for the outcome log.
    pub abort_actor: String,

    entries_filter: MovingAverage,
    bytes_filter: MovingAverage,
    storage_bytes_filter: MovingAverage,
}

impl RunningInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset everything for a fresh run.
    pub fn reset(&mut self) {
        *self = Self {
            state: self.state,
            ..Self::default()
        };
    }

    /// Feed a progress callback into the counters and the three filters.
    pub fn update_progress(&mut self, now: DateTime<Utc>, progress: ProgressCounters) {
        self.progress = progress;
        self.entries_filter.append(now, progress.done_count);
        self.bytes_filter.append(now, progress.done_size);
        self.storage_bytes_filter
            .append(now, progress.storage_done_size);
    }

    pub fn entries_per_second(&self) -> f64 {
        self.entries_filter.rate()
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_filter.rate()
    }

    pub fn storage_bytes_per_second(&self) -> f64 {
        self.storage_bytes_filter.rate()
    }

    /// Estimated rest time: the worst case across the three filters.
    pub fn estimated_rest_time(&self) -> Duration {
        let rest = |remaining: u64, rate: f64| -> f64 {
            if remaining == 0 {
                0.0
            } else if rate <= 0.0 {
                f64::INFINITY
            } else {
                remaining as f64 / rate
            }
        };

        let p = &self.progress;
        let candidates = [
            rest(
                p.total_count.saturating_sub(p.done_count),
                self.entries_filter.rate(),
            ),
            rest(
                p.total_size.saturating_sub(p.done_size),
                self.bytes_filter.rate(),
            ),
            rest(
                p.storage_total_size.saturating_sub(p.storage_done_size),
                self.storage_bytes_filter.rate(),
            ),
        ];

        let worst = candidates.into_iter().fold(0.0f64, f64::max);
        if worst.is_finite() {
            Duration::from_secs_f64(worst)
        } else {
            Duration::MAX
        }
    }

    pub fn is_abort_requested(&self) -> bool {
        self.requested_abort.load(Ordering::SeqCst)
    }

    /// Answer for the storage layer's volume request poll.
    pub fn volume_result(&self) -> VolumeResult {
        if self.is_abort_requested() {
            return VolumeResult::Aborted;
        }
        match &self.volume_request {
            VolumeRequest::Idle | VolumeRequest::Requested { .. } => VolumeResult::None,
            VolumeRequest::Loaded { volume_number } => VolumeResult::Ok(*volume_number),
            VolumeRequest::Unload => VolumeResult::Unload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn test_rate_over_window() {
        let mut filter = MovingAverage::new(10);
        filter.append(at(0), 0);
        filter.append(at(10), 1000);
        assert!((filter.rate() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_needs_two_samples() {
        let mut filter = MovingAverage::new(10);
        assert_eq!(filter.rate(), 0.0);
        filter.append(at(0), 500);
        assert_eq!(filter.rate(), 0.0);
    }

    #[test]
    fn test_window_drops_old_samples() {
        let mut filter = MovingAverage::new(3);
        // A burst followed by stagnation: old burst samples leave the window.
        filter.append(at(0), 0);
        filter.append(at(1), 1_000_000);
        filter.append(at(2), 1_000_000);
        filter.append(at(3), 1_000_000);
        filter.append(at(4), 1_000_000);
        assert_eq!(filter.rate(), 0.0);
    }

    #[test]
    fn test_estimated_rest_time_takes_worst_filter() {
        let mut info = RunningInfo::new();
        info.update_progress(
            at(0),
            ProgressCounters {
                done_count: 0,
                done_size: 0,
                total_count: 100,
                total_size: 10_000,
                storage_done_size: 0,
                storage_total_size: 1_000,
            },
        );
        info.update_progress(
            at(10),
            ProgressCounters {
                done_count: 50,       // 5/s  -> 10 s left
                done_size: 1_000,     // 100/s -> 90 s left
                total_count: 100,
                total_size: 10_000,
                storage_done_size: 500, // 50/s -> 10 s left
                storage_total_size: 1_000,
            },
        );

        let rest = info.estimated_rest_time();
        assert_eq!(rest.as_secs(), 90);
    }

    #[test]
    fn test_volume_result_follows_client_answers() {
        let mut info = RunningInfo::new();
        assert_eq!(info.volume_result(), VolumeResult::None);

        info.volume_request = VolumeRequest::Requested {
            volume_number: 2,
            message: "insert volume 2".to_string(),
        };
        assert_eq!(info.volume_result(), VolumeResult::None);

        info.volume_request = VolumeRequest::Loaded { volume_number: 2 };
        assert_eq!(info.volume_result(), VolumeResult::Ok(2));

        info.volume_request = VolumeRequest::Unload;
        assert_eq!(info.volume_result(), VolumeResult::Unload);

        info.requested_abort.store(true, Ordering::SeqCst);
        assert_eq!(info.volume_result(), VolumeResult::Aborted);
    }

    #[test]
    fn test_active_states() {
        assert!(JobState::Waiting.is_active());
        assert!(JobState::Running.is_active());
        assert!(!JobState::Done.is_active());
        assert!(!JobState::None.is_active());
    }
}
