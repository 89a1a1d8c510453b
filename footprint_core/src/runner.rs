use core::fmt;
use std::time::Instant;

use anyhow::Result;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    model::PointId,
    store::{Commit, PointStore, StageKind},
    task::{Progress, RunSummary, TaskSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunMode {
    /// Process only items whose derived field is unset.
    Incremental,
    /// Clear everything the stage derived, then process all items.
    FullRecompute,
}

/// Why a point could not be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InvalidCoordinates,
    InvalidTimestamp,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidCoordinates => write!(f, "missing or invalid coordinates"),
            SkipReason::InvalidTimestamp => write!(f, "timestamp out of range"),
        }
    }
}

/// The per-point result of a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Done(T),
    Skipped(SkipReason),
}

/// Splits per-point outcomes into the successful values and a count of skips,
/// logging each skip.
pub fn partition_outcomes<T>(stage: StageKind, outcomes: Vec<(PointId, Outcome<T>)>) -> (Vec<(PointId, T)>, usize) {
    let mut done = Vec::with_capacity(outcomes.len());
    let mut skipped = 0;

    for (id, outcome) in outcomes {
        match outcome {
            Outcome::Done(value) => done.push((id, value)),
            Outcome::Skipped(reason) => {
                warn!("{stage}: skipping point {id}: {reason}");
                skipped += 1;
            }
        }
    }

    (done, skipped)
}

/// What one call of a stage's batch function produced.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub processed: usize,
    pub failed: usize,
    pub commit: Commit,
}

/// Runs a stage to completion.
///
/// `total` is asked for the amount of work once, after any clearing.
/// `next_batch` is called repeatedly with the store as it stands after the
/// previous commit, and returns `None` when there is no more work. Each
/// returned commit is applied before the next call, so a failure loses at
/// most the batch in flight.
pub fn run_stage<S, T, N>(
    stage: StageKind,
    store: &mut S,
    sink: &mut dyn TaskSink,
    mode: RunMode,
    total: T,
    next_batch: N,
) -> Result<RunSummary>
where
    S: PointStore + ?Sized,
    T: FnOnce(&S) -> Result<usize>,
    N: FnMut(&S) -> Result<Option<BatchOutcome>>,
{
    let name = stage.to_string();
    let started = Instant::now();

    let mut running = false;
    match drive(stage, &name, store, sink, mode, total, next_batch, started, &mut running) {
        Ok((processed, failed)) => {
            let summary = RunSummary::new(&name, processed, failed, started.elapsed());
            sink.mark_completed(&name, &summary);
            Ok(summary)
        }
        Err(e) => {
            // Failed before the amount of work was known.
            if !running {
                sink.mark_running(&name, 0);
            }
            sink.mark_failed(&name, &format!("{e:#}"));
            Err(e.context(format!("Stage {name} failed")))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn drive<S, T, N>(
    stage: StageKind,
    name: &str,
    store: &mut S,
    sink: &mut dyn TaskSink,
    mode: RunMode,
    total: T,
    mut next_batch: N,
    started: Instant,
    running: &mut bool,
) -> Result<(usize, usize)>
where
    S: PointStore + ?Sized,
    T: FnOnce(&S) -> Result<usize>,
    N: FnMut(&S) -> Result<Option<BatchOutcome>>,
{
    if mode == RunMode::FullRecompute {
        store.clear(stage)?;
    }

    let total = total(&*store)?;
    sink.mark_running(name, total);
    *running = true;
    info!("{name}: running in {mode:?} mode over {total} items");

    let mut processed = 0;
    let mut failed = 0;
    let mut batches = 0;

    while let Some(batch) = next_batch(&*store)? {
        let report = if batch.commit.is_empty() {
            Default::default()
        } else {
            store.commit(batch.commit)?
        };

        batches += 1;
        processed += batch.processed;
        failed += batch.failed + report.failed;
        debug!(
            "{name}: batch {batches} processed {}, failed {}, {} writes ({} failed)",
            batch.processed, batch.failed, report.written, report.failed
        );

        let progress = Progress::new(processed, failed, total.max(processed + failed), started.elapsed());
        sink.update_progress(name, &progress);
    }

    Ok((processed, failed))
}
