//! Pipeline definitions: ordered stages and the fixed progress weight table.
//!
//! A pipeline is an ordered list of named stages. Each stage carries a weight;
//! progress after a stage completes is the cumulative weight share, so progress
//! is deterministic for a given definition and never decreases with ordinal.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// One checkpointable unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Relative share of the pipeline's progress bar.
    pub weight: u32,
}

/// Ordered stage list for one job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    name: String,
    stages: Vec<StageDefinition>,
    total_weight: u64,
}

impl PipelineDefinition {
    /// Build a definition from `(stage_name, weight)` pairs in execution order.
    pub fn new<I, S>(name: impl Into<String>, stages: I) -> DomainResult<Self>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let stages: Vec<StageDefinition> = stages
            .into_iter()
            .map(|(name, weight)| StageDefinition {
                name: name.into(),
                weight,
            })
            .collect();

        if stages.is_empty() {
            return Err(DomainError::validation("pipeline must have at least one stage"));
        }
        if u32::try_from(stages.len()).is_err() {
            return Err(DomainError::validation("too many stages"));
        }
        for (idx, stage) in stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(DomainError::validation(format!("stage {idx} has an empty name")));
            }
            if stages[..idx].iter().any(|s| s.name == stage.name) {
                return Err(DomainError::validation(format!(
                    "duplicate stage name: {}",
                    stage.name
                )));
            }
        }

        let total_weight: u64 = stages.iter().map(|s| u64::from(s.weight)).sum();
        if total_weight == 0 {
            return Err(DomainError::validation("pipeline weights must not all be zero"));
        }

        Ok(Self {
            name: name.into(),
            stages,
            total_weight,
        })
    }

    /// ingest → extract → classify → embed → relate.
    pub fn document_processing() -> Self {
        Self {
            name: "document_processing".to_string(),
            stages: [
                ("ingest", 10),
                ("extract", 30),
                ("classify", 20),
                ("embed", 25),
                ("relate", 15),
            ]
            .into_iter()
            .map(|(name, weight)| StageDefinition {
                name: name.to_string(),
                weight,
            })
            .collect(),
            total_weight: 100,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn len(&self) -> u32 {
        self.stages.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, ordinal: u32) -> Option<&StageDefinition> {
        self.stages.get(ordinal as usize)
    }

    pub fn ordinal_of(&self, stage_name: &str) -> Option<u32> {
        self.stages
            .iter()
            .position(|s| s.name == stage_name)
            .map(|idx| idx as u32)
    }

    /// First ordinal to execute given the latest checkpointed ordinal.
    pub fn resume_point(latest_checkpoint: Option<u32>) -> u32 {
        latest_checkpoint.map(|o| o + 1).unwrap_or(0)
    }

    /// Progress percentage once the stage at `ordinal` has checkpointed.
    ///
    /// Floors intermediate values; the last stage always reports 100.
    pub fn progress_after(&self, ordinal: u32) -> u8 {
        let last = self.len().saturating_sub(1);
        if ordinal >= last {
            return 100;
        }
        let done: u64 = self.stages[..=ordinal as usize]
            .iter()
            .map(|s| u64::from(s.weight))
            .sum();
        ((done * 100) / self.total_weight).min(100) as u8
    }

    /// Progress implied by a (possibly absent) latest checkpoint.
    pub fn progress_at(&self, latest_checkpoint: Option<u32>) -> u8 {
        latest_checkpoint
            .map(|ordinal| self.progress_after(ordinal))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn document_pipeline_weights_accumulate() {
        let def = PipelineDefinition::document_processing();
        assert_eq!(def.len(), 5);
        assert_eq!(def.progress_after(0), 10);
        assert_eq!(def.progress_after(1), 40);
        assert_eq!(def.progress_after(2), 60);
        assert_eq!(def.progress_after(3), 85);
        assert_eq!(def.progress_after(4), 100);
        assert_eq!(def.ordinal_of("embed"), Some(3));
    }

    #[test]
    fn resume_point_starts_after_latest_checkpoint() {
        assert_eq!(PipelineDefinition::resume_point(None), 0);
        assert_eq!(PipelineDefinition::resume_point(Some(0)), 1);
        assert_eq!(PipelineDefinition::resume_point(Some(3)), 4);
    }

    #[test]
    fn rejects_invalid_definitions() {
        let empty: Vec<(&str, u32)> = vec![];
        assert!(PipelineDefinition::new("p", empty).is_err());
        assert!(PipelineDefinition::new("p", [("a", 1), ("a", 2)]).is_err());
        assert!(PipelineDefinition::new("p", [("a", 0), ("b", 0)]).is_err());
        assert!(PipelineDefinition::new("p", [("", 1)]).is_err());
    }

    #[test]
    fn zero_weight_stage_keeps_progress_flat() {
        let def = PipelineDefinition::new("p", [("a", 50), ("b", 0), ("c", 50)]).unwrap();
        assert_eq!(def.progress_after(0), 50);
        assert_eq!(def.progress_after(1), 50);
        assert_eq!(def.progress_after(2), 100);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: progress never decreases with ordinal and ends at 100.
        #[test]
        fn progress_is_monotonic_and_ends_at_100(
            weights in prop::collection::vec(0u32..1_000u32, 1..12)
        ) {
            prop_assume!(weights.iter().any(|w| *w > 0));
            let stages: Vec<(String, u32)> = weights
                .iter()
                .enumerate()
                .map(|(i, w)| (format!("s{i}"), *w))
                .collect();
            let def = PipelineDefinition::new("p", stages).unwrap();

            let mut previous = 0u8;
            for ordinal in 0..def.len() {
                let p = def.progress_after(ordinal);
                prop_assert!(p >= previous);
                prop_assert!(p <= 100);
                previous = p;
            }
            prop_assert_eq!(def.progress_after(def.len() - 1), 100);
        }
    }
}
