use std::time::Duration;

use log::{error, info};
use serde::Serialize;

/// Progress of a running stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
    /// 0-100.
    pub percent: f64,
    /// Estimated time remaining, once a rate is known.
    pub eta: Option<Duration>,
}

impl Progress {
    /// Computes percent and ETA from the counts and the time spent so far.
    pub fn new(processed: usize, failed: usize, total: usize, elapsed: Duration) -> Self {
        let done = processed + failed;
        let percent = if total == 0 {
            100.0
        } else {
            (done as f64 / total as f64 * 100.0).min(100.0)
        };

        let secs = elapsed.as_secs_f64();
        let eta = if done > 0 && secs > 0.0 {
            let rate = done as f64 / secs;
            let remaining = total.saturating_sub(done) as f64;
            Some(Duration::from_secs_f64(remaining / rate))
        } else {
            None
        };

        Self {
            processed,
            failed,
            total,
            percent,
            eta,
        }
    }
}

/// The summary reported when a stage completes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub stage: String,
    pub processed: usize,
    pub failed: usize,
    /// processed / (processed + failed), to 4 decimal places.
    pub success_rate: f64,
    pub duration_seconds: f64,
    /// Items per second.
    pub avg_speed: f64,
}

impl RunSummary {
    pub fn new(stage: &str, processed: usize, failed: usize, elapsed: Duration) -> Self {
        let total = processed + failed;
        let success_rate = if total == 0 {
            1.0
        } else {
            (processed as f64 / total as f64 * 10_000.0).round() / 10_000.0
        };
        let duration_seconds = elapsed.as_secs_f64();
        let avg_speed = if duration_seconds > 0.0 {
            total as f64 / duration_seconds
        } else {
            0.0
        };

        Self {
            stage: stage.to_string(),
            processed,
            failed,
            success_rate,
            duration_seconds,
            avg_speed,
        }
    }
}

/// Receives lifecycle events. Exactly one of `mark_completed` or
/// `mark_failed` follows each `mark_running`.
pub trait TaskSink {
    fn mark_running(&mut self, stage: &str, total: usize);
    fn update_progress(&mut self, stage: &str, progress: &Progress);
    fn mark_completed(&mut self, stage: &str, summary: &RunSummary);
    fn mark_failed(&mut self, stage: &str, message: &str);
}

/// Reports lifecycle events through the `log` crate.
#[derive(Debug, Default)]
pub struct LogSink;

impl TaskSink for LogSink {
    fn mark_running(&mut self, stage: &str, total: usize) {
        info!("{stage}: started, {total} items to process");
    }

    fn update_progress(&mut self, stage: &str, progress: &Progress) {
        let eta = progress
            .eta
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            "{stage}: {:.1}% ({} processed, {} failed of {}), ETA {eta}",
            progress.percent, progress.processed, progress.failed, progress.total
        );
    }

    fn mark_completed(&mut self, stage: &str, summary: &RunSummary) {
        info!(
            "{stage}: completed, {} processed, {} failed, success rate {:.2}% in {:.3}s",
            summary.processed,
            summary.failed,
            summary.success_rate * 100.0,
            summary.duration_seconds
        );
    }

    fn mark_failed(&mut self, stage: &str, message: &str) {
        error!("{stage}: failed: {message}");
    }
}

/// One lifecycle event, as captured by `RecordingSink`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Running { stage: String, total: usize },
    Progress { stage: String, progress: Progress },
    Completed { stage: String, summary: RunSummary },
    Failed { stage: String, message: String },
}

/// Keeps every event in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<TaskEvent>,
}

impl RecordingSink {
    /// Events that end a run: completions and failures.
    pub fn terminal_events(&self) -> Vec<&TaskEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, TaskEvent::Completed { .. } | TaskEvent::Failed { .. }))
            .collect()
    }
}

impl TaskSink for RecordingSink {
    fn mark_running(&mut self, stage: &str, total: usize) {
        self.events.push(TaskEvent::Running {
            stage: stage.to_string(),
            total,
        });
    }

    fn update_progress(&mut self, stage: &str, progress: &Progress) {
        self.events.push(TaskEvent::Progress {
            stage: stage.to_string(),
            progress: progress.clone(),
        });
    }

    fn mark_completed(&mut self, stage: &str, summary: &RunSummary) {
        self.events.push(TaskEvent::Completed {
            stage: stage.to_string(),
            summary: summary.clone(),
        });
    }

    fn mark_failed(&mut self, stage: &str, message: &str) {
        self.events.push(TaskEvent::Failed {
            stage: stage.to_string(),
            message: message.to_string(),
        });
    }
}
