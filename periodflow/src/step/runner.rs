//! Drives a single step through its lifecycle.

use super::{ResultSignal, Step, StepState};
use crate::context::StepContext;
use crate::errors::StepError;
use crate::events::{EventSink, NoOpEventSink, STEP_COMPLETED, STEP_FAILED, STEP_PHASE, STEP_STARTED};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// The result of running one step.
#[derive(Debug)]
pub struct StepRun {
    /// Terminal state reached.
    pub state: StepState,
    /// Signal reported to the driver.
    pub signal: ResultSignal,
    /// The context returned by `persist`, if the step got that far.
    pub context: Option<StepContext>,
    /// The failure, if any.
    pub error: Option<StepError>,
}

impl StepRun {
    /// Returns true for `Success` and `SuccessWithWarnings`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.signal != ResultSignal::Failure
    }
}

/// Runs steps one at a time, emitting lifecycle events.
#[derive(Clone)]
pub struct StepRunner {
    sink: Arc<dyn EventSink>,
}

impl Default for StepRunner {
    fn default() -> Self {
        Self::new(Arc::new(NoOpEventSink))
    }
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner").finish_non_exhaustive()
    }
}

impl StepRunner {
    /// Creates a runner reporting to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Runs every phase of `step` in order. Stops at the first failure.
    pub async fn run(&self, step: &dyn Step, ctx: StepContext) -> StepRun {
        let span = tracing::info_span!(
            "step",
            step = %step.name(),
            period = %ctx.period(),
            run_id = %ctx.run_id()
        );
        self.run_inner(step, ctx).instrument(span).await
    }

    async fn run_inner(&self, step: &dyn Step, ctx: StepContext) -> StepRun {
        let name = step.name().to_string();
        let base = json!({
            "step": name,
            "period": ctx.period().to_string(),
            "run_id": ctx.run_id().to_string(),
        });
        self.sink.emit(STEP_STARTED, Some(base.clone()));
        info!("Step started");

        let mut state = StepState::Created;
        match self.drive(step, ctx, &mut state).await {
            Ok((ctx, clean)) => {
                for key in step.writes() {
                    if !ctx.metadata().contains(key) {
                        warn!(key, "Step did not write declared metadata key");
                    }
                }
                let signal = if clean {
                    ResultSignal::Success
                } else {
                    warn!("Validation reported recoverable issues");
                    ResultSignal::SuccessWithWarnings
                };
                let mut data = base;
                data["signal"] = json!(signal);
                self.sink.emit(STEP_COMPLETED, Some(data));
                info!(signal = ?signal, "Step completed");
                StepRun {
                    state,
                    signal,
                    context: Some(ctx),
                    error: None,
                }
            }
            Err(error) => {
                let phase = state.next().map_or("unknown", StepState::phase);
                let mut data = base;
                data["phase"] = json!(phase);
                data["error"] = json!(error.to_dict());
                self.sink.emit(STEP_FAILED, Some(data));
                warn!(phase, error = %error, "Step failed");
                StepRun {
                    state: StepState::Failed,
                    signal: ResultSignal::Failure,
                    context: None,
                    error: Some(error),
                }
            }
        }
    }

    async fn drive(
        &self,
        step: &dyn Step,
        ctx: StepContext,
        state: &mut StepState,
    ) -> Result<(StepContext, bool), StepError> {
        if let Some(missing) = step.reads().iter().find(|key| !ctx.metadata().contains(key)) {
            return Err(StepError::missing_input(step.name(), *missing));
        }

        let ctx = step.setup(ctx).await?;
        self.transition(step, state, StepState::Setup);

        let ctx = step.apply(ctx)?;
        self.transition(step, state, StepState::Applied);

        let clean = step.validate(&ctx)?;
        self.transition(step, state, StepState::Validated);

        let ctx = step.persist(ctx).await?;
        self.transition(step, state, StepState::Persisted);

        Ok((ctx, clean))
    }

    fn transition(&self, step: &dyn Step, state: &mut StepState, to: StepState) {
        debug_assert!(state.can_transition_to(to), "illegal transition {state} -> {to}");
        *state = to;
        debug!(state = %to, "Step phase finished");
        self.sink.emit(
            STEP_PHASE,
            Some(json!({"step": step.name(), "state": to})),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MetadataKey;
    use crate::events::CollectingEventSink;
    use crate::step::fixtures::{FailAt, ScriptedStep};

    fn ctx() -> StepContext {
        StepContext::new("202509A".parse().unwrap())
    }

    #[tokio::test]
    async fn test_success_visits_every_phase() {
        let sink = Arc::new(CollectingEventSink::new());
        let runner = StepRunner::new(sink.clone());
        let step = ScriptedStep::new("clean");

        let run = runner.run(&step, ctx()).await;

        assert!(run.is_success());
        assert_eq!(run.state, StepState::Persisted);
        assert_eq!(run.signal, ResultSignal::Success);
        assert_eq!(step.calls(), vec!["setup", "apply", "validate", "persist"]);
        assert_eq!(
            sink.event_types(),
            vec![
                STEP_STARTED,
                STEP_PHASE,
                STEP_PHASE,
                STEP_PHASE,
                STEP_PHASE,
                STEP_COMPLETED
            ]
        );
    }

    #[tokio::test]
    async fn test_validation_warning_still_persists() {
        let step = ScriptedStep::new("warn").with_validation(false);
        let run = StepRunner::default().run(&step, ctx()).await;

        assert_eq!(run.signal, ResultSignal::SuccessWithWarnings);
        assert_eq!(run.state, StepState::Persisted);
        assert!(step.calls().contains(&"persist"));
    }

    #[tokio::test]
    async fn test_apply_failure_halts_before_persist() {
        let sink = Arc::new(CollectingEventSink::new());
        let step = ScriptedStep::new("broken").failing_at(FailAt::Apply);
        let run = StepRunner::new(sink.clone()).run(&step, ctx()).await;

        assert_eq!(run.state, StepState::Failed);
        assert!(matches!(run.error, Some(StepError::Computation { .. })));
        assert_eq!(step.calls(), vec!["setup", "apply"]);

        let failed = sink.events_of_type(STEP_FAILED);
        assert_eq!(failed.len(), 1);
        let data = failed[0].1.as_ref().unwrap();
        assert_eq!(data["phase"], "apply");
        assert_eq!(data["error"]["code"], "computation");
    }

    #[tokio::test]
    async fn test_structural_validation_error_blocks_persist() {
        let step = ScriptedStep::new("bad").failing_at(FailAt::Validate);
        let run = StepRunner::default().run(&step, ctx()).await;

        assert!(matches!(run.error, Some(StepError::DataValidation { .. })));
        assert!(!step.calls().contains(&"persist"));
    }

    #[tokio::test]
    async fn test_declared_read_must_be_present() {
        const STORES: MetadataKey<usize> = MetadataKey::new("store_count");

        let step = ScriptedStep::new("needs").reading(&["store_count"]);
        let run = StepRunner::default().run(&step, ctx()).await;
        assert!(matches!(run.error, Some(StepError::MissingInput { ref input, .. }) if input == "store_count"));
        assert!(step.calls().is_empty());

        let mut ready = ctx();
        ready.metadata_mut().set(&STORES, &3).unwrap();
        let run = StepRunner::default().run(&step, ready).await;
        assert!(run.is_success());
    }
}
