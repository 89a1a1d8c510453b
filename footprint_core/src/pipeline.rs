use anyhow::Result;
use log::info;
use logging_timer::time;
use serde::Serialize;

use crate::{
    config::PipelineConfig,
    gap, outlier,
    runner::RunMode,
    stay,
    store::{PointStore, StageKind},
    task::{RunSummary, TaskSink},
    transport, trip,
};

/// One summary per stage that ran, in order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub mode: Option<RunMode>,
    pub stages: Vec<RunSummary>,
}

/// Runs the stages in dependency order: outliers, transport modes, stays,
/// trips, then gap completion. Stops at the first stage that fails; the
/// work of earlier stages is kept.
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Validates the configuration up front so that no stage starts with
    /// values it cannot use.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The stages this pipeline will run.
    pub fn stages(&self) -> Vec<StageKind> {
        let mut stages = vec![
            StageKind::Outliers,
            StageKind::TransportModes,
            StageKind::Stays,
            StageKind::Trips,
        ];
        if self.config.gaps.enabled {
            stages.push(StageKind::GapCompletion);
        }
        stages
    }

    pub fn run_stage<S: PointStore + ?Sized>(
        &self,
        stage: StageKind,
        store: &mut S,
        sink: &mut dyn TaskSink,
        mode: RunMode,
    ) -> Result<RunSummary> {
        match stage {
            StageKind::Outliers => outlier::run(store, sink, &self.config, mode),
            StageKind::TransportModes => transport::run(store, sink, &self.config, mode),
            StageKind::Stays => stay::run(store, sink, &self.config, mode),
            StageKind::Trips => trip::run(store, sink, &self.config, mode),
            StageKind::GapCompletion => gap::run(store, sink, &self.config, mode),
        }
    }

    #[time]
    pub fn run<S: PointStore + ?Sized>(
        &self,
        store: &mut S,
        sink: &mut dyn TaskSink,
        mode: RunMode,
    ) -> Result<PipelineReport> {
        let mut report = PipelineReport {
            mode: Some(mode),
            stages: Vec::new(),
        };

        for stage in self.stages() {
            info!("Running stage {stage}");
            report.stages.push(self.run_stage(stage, store, sink, mode)?);
        }

        Ok(report)
    }
}
