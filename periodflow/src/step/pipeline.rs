//! Sequential pipeline driver.
//!
//! Steps run strictly one after another: a step's `persist` has completed
//! and flushed before the next step's `setup` starts. The first failure of
//! a required step halts the run; optional steps that fail are recorded
//! as skipped and the run continues with the metadata from before them.

use super::{ResultSignal, Step, StepRunner, StepState};
use crate::context::{Metadata, StepContext};
use crate::errors::StepError;
use crate::events::{EventSink, NoOpEventSink, STEP_SKIPPED};
use crate::manifest::PipelineManifest;
use crate::period::PeriodLabel;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

struct Entry {
    step: Arc<dyn Step>,
    optional: bool,
}

/// An ordered list of steps sharing one manifest.
pub struct Pipeline {
    manifest: Arc<PipelineManifest>,
    steps: Vec<Entry>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("manifest", &self.manifest)
            .field("steps", &self.step_names())
            .finish_non_exhaustive()
    }
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// Step name.
    pub name: String,
    /// Signal the step reported.
    pub signal: ResultSignal,
    /// True if the step failed but was optional.
    pub skipped: bool,
    /// Terminal lifecycle state.
    pub final_state: StepState,
    /// Wall time across all phases.
    pub duration_ms: u64,
    /// Outputs the manifest holds for this step afterwards.
    pub outputs: usize,
    /// Failure message, if any.
    pub error: Option<String>,
}

/// The required step that stopped the run.
#[derive(Debug)]
pub struct HaltedStep {
    /// Step name.
    pub name: String,
    /// Why it failed.
    pub error: StepError,
}

/// Outcome of a pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    /// Run id shared by every step context.
    pub run_id: Uuid,
    /// Target period.
    pub period: PeriodLabel,
    /// One report per step that ran, in order.
    pub steps: Vec<StepReport>,
    /// Metadata after the last successful step.
    pub metadata: Metadata,
    /// Set if a required step failed.
    pub halted: Option<HaltedStep>,
}

impl PipelineReport {
    /// Returns true if no required step failed.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        self.halted.is_none()
    }

    /// The worst signal across all steps that ran.
    #[must_use]
    pub fn signal(&self) -> ResultSignal {
        if self.halted.is_some() {
            ResultSignal::Failure
        } else if self
            .steps
            .iter()
            .any(|s| s.skipped || s.signal == ResultSignal::SuccessWithWarnings)
        {
            ResultSignal::SuccessWithWarnings
        } else {
            ResultSignal::Success
        }
    }

    /// Report for a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }
}

impl Pipeline {
    /// Creates an empty pipeline around a loaded manifest.
    #[must_use]
    pub fn new(manifest: Arc<PipelineManifest>) -> Self {
        Self {
            manifest,
            steps: Vec::new(),
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Appends a required step.
    #[must_use]
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Entry {
            step: Arc::new(step),
            optional: false,
        });
        self
    }

    /// Appends a step whose failure does not halt the run.
    #[must_use]
    pub fn optional_step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Entry {
            step: Arc::new(step),
            optional: true,
        });
        self
    }

    /// The shared manifest.
    #[must_use]
    pub const fn manifest(&self) -> &Arc<PipelineManifest> {
        &self.manifest
    }

    /// Step names in run order.
    #[must_use]
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|e| e.step.name().to_string()).collect()
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no steps were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step in order.
    ///
    /// Each step gets a fresh context carrying the run id, period and the
    /// metadata accumulated so far.
    pub async fn run(&self, initial: StepContext) -> PipelineReport {
        let runner = StepRunner::new(self.sink.clone());
        let run_id = initial.run_id();
        let period = initial.period();
        let mut metadata = initial.metadata().clone();
        let mut steps = Vec::with_capacity(self.steps.len());
        let mut halted = None;
        let mut first = Some(initial);

        info!(%run_id, %period, steps = self.steps.len(), "Pipeline started");

        for entry in &self.steps {
            let name = entry.step.name().to_string();
            let ctx = first.take().unwrap_or_else(|| {
                StepContext::new(period)
                    .with_run_id(run_id)
                    .with_metadata(metadata.clone())
            });

            let started = Instant::now();
            let run = runner.run(entry.step.as_ref(), ctx).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let mut report = StepReport {
                name: name.clone(),
                signal: run.signal,
                skipped: false,
                final_state: run.state,
                duration_ms,
                outputs: self.manifest.all_outputs(&name).len(),
                error: run.error.as_ref().map(ToString::to_string),
            };

            if let Some(ctx) = run.context {
                metadata = ctx.metadata().clone();
                steps.push(report);
                continue;
            }

            let error = run
                .error
                .unwrap_or_else(|| StepError::computation(&name, "step failed without an error"));
            if entry.optional {
                warn!(step = %name, error = %error, "Optional step failed, skipping");
                self.sink.emit(
                    STEP_SKIPPED,
                    Some(serde_json::json!({"step": name, "error": error.to_dict()})),
                );
                report.skipped = true;
                steps.push(report);
                continue;
            }

            warn!(step = %name, error = %error, "Required step failed, halting pipeline");
            steps.push(report);
            halted = Some(HaltedStep { name, error });
            break;
        }

        let report = PipelineReport {
            run_id,
            period,
            steps,
            metadata,
            halted,
        };
        info!(%run_id, signal = ?report.signal(), "Pipeline finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MetadataKey;
    use crate::events::CollectingEventSink;
    use crate::step::fixtures::{FailAt, ScriptedStep};
    use crate::storage::InMemoryRepository;

    fn manifest() -> Arc<PipelineManifest> {
        Arc::new(PipelineManifest::load(Arc::new(InMemoryRepository::new())).unwrap())
    }

    fn ctx() -> StepContext {
        StepContext::new("202509A".parse().unwrap())
    }

    #[tokio::test]
    async fn test_runs_in_order_and_registers() {
        let manifest = manifest();
        let pipeline = Pipeline::new(manifest.clone())
            .step(ScriptedStep::new("weather").registering(manifest.clone()))
            .step(ScriptedStep::new("clusters").registering(manifest.clone()));

        let report = pipeline.run(ctx()).await;

        assert!(report.succeeded());
        assert_eq!(report.signal(), ResultSignal::Success);
        assert_eq!(pipeline.step_names(), vec!["weather", "clusters"]);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.step("weather").unwrap().outputs, 1);
        assert_eq!(manifest.stages(), vec!["clusters", "weather"]);
    }

    #[tokio::test]
    async fn test_required_failure_halts_before_next_setup() {
        let manifest = manifest();
        let later = Arc::new(ScriptedStep::new("later"));
        let pipeline = Pipeline::new(manifest.clone())
            .step(ScriptedStep::new("first").registering(manifest.clone()))
            .step(ScriptedStep::new("broken").failing_at(FailAt::Persist))
            .step(later.clone());

        let report = pipeline.run(ctx()).await;

        assert!(!report.succeeded());
        assert_eq!(report.signal(), ResultSignal::Failure);
        assert_eq!(report.halted.as_ref().unwrap().name, "broken");
        assert_eq!(report.steps.len(), 2);
        assert!(later.calls().is_empty());
        // The earlier stage's registration survives.
        assert!(manifest.contains("first", "output"));
    }

    #[tokio::test]
    async fn test_optional_failure_is_skipped() {
        let sink = Arc::new(CollectingEventSink::new());
        let pipeline = Pipeline::new(manifest())
            .with_event_sink(sink.clone())
            .optional_step(ScriptedStep::new("extras").failing_at(FailAt::Setup))
            .step(ScriptedStep::new("core"));

        let report = pipeline.run(ctx()).await;

        assert!(report.succeeded());
        assert_eq!(report.signal(), ResultSignal::SuccessWithWarnings);
        assert!(report.step("extras").unwrap().skipped);
        assert_eq!(report.step("extras").unwrap().final_state, StepState::Failed);
        assert_eq!(report.step("core").unwrap().final_state, StepState::Persisted);
        assert_eq!(sink.events_of_type(STEP_SKIPPED).len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_flows_between_steps() {
        const DONE: MetadataKey<bool> = MetadataKey::new("weather_done");

        let pipeline = Pipeline::new(manifest())
            .step(ScriptedStep::new("weather").writing(&["weather_done"]))
            .step(ScriptedStep::new("clusters").reading(&["weather_done"]));

        let report = pipeline.run(ctx()).await;

        assert!(report.succeeded());
        assert!(report.metadata.get(&DONE).unwrap());
    }

    #[tokio::test]
    async fn test_run_id_is_shared() {
        let initial = ctx();
        let run_id = initial.run_id();
        let report = Pipeline::new(manifest())
            .step(ScriptedStep::new("a"))
            .run(initial)
            .await;
        assert_eq!(report.run_id, run_id);
    }
}
