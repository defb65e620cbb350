//! Data carried through a step's lifecycle.
//!
//! A [`StepContext`] is moved into each phase and a new one is returned,
//! so the context a phase observes is exactly what the previous phase
//! produced.

mod metadata;

pub use metadata::{Metadata, MetadataKey};

use crate::dataset::Dataset;
use crate::period::PeriodLabel;
use uuid::Uuid;

/// The dataset and metadata threaded through one step invocation.
#[derive(Debug, Clone)]
pub struct StepContext {
    run_id: Uuid,
    period: PeriodLabel,
    data: Dataset,
    metadata: Metadata,
}

impl StepContext {
    /// Creates a context for `period` with a fresh run id.
    #[must_use]
    pub fn new(period: PeriodLabel) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            period,
            data: Dataset::new(),
            metadata: Metadata::new(),
        }
    }

    /// Uses a specific run id.
    #[must_use]
    pub const fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Replaces the dataset.
    #[must_use]
    pub fn with_data(mut self, data: Dataset) -> Self {
        self.data = data;
        self
    }

    /// Replaces the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// The pipeline run this context belongs to.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The target period of the run.
    #[must_use]
    pub const fn period(&self) -> PeriodLabel {
        self.period
    }

    /// The current dataset.
    #[must_use]
    pub const fn data(&self) -> &Dataset {
        &self.data
    }

    /// Takes the dataset out, leaving an empty one.
    pub fn take_data(&mut self) -> Dataset {
        std::mem::take(&mut self.data)
    }

    /// The accumulated metadata.
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable metadata.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Context for the next step: same run, period and metadata, empty dataset.
    #[must_use]
    pub fn carry_forward(&self) -> Self {
        Self {
            run_id: self.run_id,
            period: self.period,
            data: Dataset::new(),
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTE: MetadataKey<String> = MetadataKey::new("note");

    #[test]
    fn test_carry_forward_keeps_metadata_not_data() {
        let period = "202509A".parse().unwrap();
        let mut ctx = StepContext::new(period).with_data(Dataset::new().with_column("x"));
        ctx.metadata_mut().set(&NOTE, &"hello".to_string()).unwrap();

        let next = ctx.carry_forward();
        assert_eq!(next.run_id(), ctx.run_id());
        assert_eq!(next.period(), period);
        assert!(next.data().columns().is_empty());
        assert_eq!(next.metadata().get(&NOTE).unwrap(), "hello");
    }
}
