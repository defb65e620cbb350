//! Scripted steps for lifecycle tests.

use super::Step;
use crate::context::{MetadataKey, StepContext};
use crate::errors::StepError;
use crate::manifest::PipelineManifest;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Setup,
    Apply,
    Validate,
    Persist,
}

#[derive(Debug)]
pub struct ScriptedStep {
    name: String,
    fail_at: Option<FailAt>,
    clean: bool,
    reads: &'static [&'static str],
    writes: &'static [&'static str],
    manifest: Option<Arc<PipelineManifest>>,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedStep {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail_at: None,
            clean: true,
            reads: &[],
            writes: &[],
            manifest: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub const fn failing_at(mut self, phase: FailAt) -> Self {
        self.fail_at = Some(phase);
        self
    }

    pub const fn with_validation(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub const fn reading(mut self, keys: &'static [&'static str]) -> Self {
        self.reads = keys;
        self
    }

    /// Writes each key as `true` during persist.
    pub const fn writing(mut self, keys: &'static [&'static str]) -> Self {
        self.writes = keys;
        self
    }

    /// Registers `output` at `memory://<name>` during persist.
    pub fn registering(mut self, manifest: Arc<PipelineManifest>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn record(&self, phase: &'static str, at: FailAt) -> Result<(), StepError> {
        self.calls.lock().push(phase);
        if self.fail_at != Some(at) {
            return Ok(());
        }
        Err(match at {
            FailAt::Setup => StepError::missing_input(&self.name, "upstream"),
            FailAt::Apply => StepError::computation(&self.name, "bad shape"),
            FailAt::Validate => StepError::data_validation(&self.name, "null keys"),
            FailAt::Persist => StepError::computation(&self.name, "disk full"),
        })
    }
}

#[async_trait]
impl Step for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn reads(&self) -> &[&'static str] {
        self.reads
    }

    fn writes(&self) -> &[&'static str] {
        self.writes
    }

    async fn setup(&self, ctx: StepContext) -> Result<StepContext, StepError> {
        self.record("setup", FailAt::Setup)?;
        Ok(ctx)
    }

    fn apply(&self, ctx: StepContext) -> Result<StepContext, StepError> {
        self.record("apply", FailAt::Apply)?;
        Ok(ctx)
    }

    fn validate(&self, _ctx: &StepContext) -> Result<bool, StepError> {
        self.record("validate", FailAt::Validate)?;
        Ok(self.clean)
    }

    async fn persist(&self, mut ctx: StepContext) -> Result<StepContext, StepError> {
        self.record("persist", FailAt::Persist)?;
        if let Some(manifest) = &self.manifest {
            manifest.register(
                &self.name,
                "output",
                Some(ctx.period()),
                format!("memory://{}", self.name),
            )?;
        }
        for key in self.writes {
            ctx.metadata_mut().set(&MetadataKey::<bool>::new(key), &true)?;
        }
        Ok(ctx)
    }
}
