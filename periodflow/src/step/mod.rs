//! The lifecycle contract every stage implements.
//!
//! A step moves through `setup → apply → validate → persist`. Each phase
//! takes the context by value and hands back the one the next phase sees.
//! Steps receive their collaborators (repository, manifest) at
//! construction; nothing is looked up from global state.

#[cfg(test)]
mod fixtures;
mod pipeline;
mod runner;
mod state;

pub use crate::errors::ResultSignal;
pub use pipeline::{HaltedStep, Pipeline, PipelineReport, StepReport};
pub use runner::{StepRun, StepRunner};
pub use state::StepState;

use crate::context::StepContext;
use crate::errors::StepError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// One stage of the pipeline.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Stage name. Also the manifest and ledger key of the stage.
    fn name(&self) -> &str;

    /// Metadata keys this step expects earlier steps to have written.
    fn reads(&self) -> &[&'static str] {
        &[]
    }

    /// Metadata keys this step promises to write.
    fn writes(&self) -> &[&'static str] {
        &[]
    }

    /// Acquires inputs.
    ///
    /// # Errors
    ///
    /// `MissingInput` if a required upstream output is absent.
    async fn setup(&self, ctx: StepContext) -> Result<StepContext, StepError>;

    /// Transforms `ctx.data`. Must not perform I/O.
    ///
    /// # Errors
    ///
    /// `Computation` on invalid data shape.
    fn apply(&self, ctx: StepContext) -> Result<StepContext, StepError>;

    /// Checks the transformed data.
    ///
    /// `Ok(false)` flags recoverable quality issues; `Err(DataValidation)`
    /// means persisting would be unsafe.
    fn validate(&self, ctx: &StepContext) -> Result<bool, StepError>;

    /// Writes outputs and registers them with the manifest.
    ///
    /// Re-running for the same period must overwrite, never duplicate.
    async fn persist(&self, ctx: StepContext) -> Result<StepContext, StepError>;
}

#[async_trait]
impl<S: Step + ?Sized> Step for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn reads(&self) -> &[&'static str] {
        (**self).reads()
    }

    fn writes(&self) -> &[&'static str] {
        (**self).writes()
    }

    async fn setup(&self, ctx: StepContext) -> Result<StepContext, StepError> {
        (**self).setup(ctx).await
    }

    fn apply(&self, ctx: StepContext) -> Result<StepContext, StepError> {
        (**self).apply(ctx)
    }

    fn validate(&self, ctx: &StepContext) -> Result<bool, StepError> {
        (**self).validate(ctx)
    }

    async fn persist(&self, ctx: StepContext) -> Result<StepContext, StepError> {
        (**self).persist(ctx).await
    }
}
