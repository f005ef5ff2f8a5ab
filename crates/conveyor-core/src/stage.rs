//! The canonical stage list.
//!
//! Every task runs through the same ordered list of stages; pipelines with
//! fewer meaningful steps rely on absent handlers being recorded as skipped.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One step inside a task, drawn from the canonical stage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "ingestion")]
    Ingestion,
    #[serde(rename = "preProcessing")]
    PreProcessing,
    #[serde(rename = "promptTemplating")]
    PromptTemplating,
    #[serde(rename = "inference")]
    Inference,
    #[serde(rename = "parsing")]
    Parsing,
    #[serde(rename = "validateStructure")]
    ValidateStructure,
    #[serde(rename = "validateQuality")]
    ValidateQuality,
    #[serde(rename = "critique")]
    Critique,
    #[serde(rename = "refine")]
    Refine,
    #[serde(rename = "finalValidation")]
    FinalValidation,
    #[serde(rename = "integration")]
    Integration,
}

impl Stage {
    /// Canonical execution order.
    pub const ALL: [Stage; 11] = [
        Stage::Ingestion,
        Stage::PreProcessing,
        Stage::PromptTemplating,
        Stage::Inference,
        Stage::Parsing,
        Stage::ValidateStructure,
        Stage::ValidateQuality,
        Stage::Critique,
        Stage::Refine,
        Stage::FinalValidation,
        Stage::Integration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingestion => "ingestion",
            Stage::PreProcessing => "preProcessing",
            Stage::PromptTemplating => "promptTemplating",
            Stage::Inference => "inference",
            Stage::Parsing => "parsing",
            Stage::ValidateStructure => "validateStructure",
            Stage::ValidateQuality => "validateQuality",
            Stage::Critique => "critique",
            Stage::Refine => "refine",
            Stage::FinalValidation => "finalValidation",
            Stage::Integration => "integration",
        }
    }

    /// Position in the canonical order.
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0)
    }

    /// Validation stages do not contribute to the rolling stage output:
    /// a validator inspects, it does not transform.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Stage::ValidateStructure | Stage::ValidateQuality | Stage::FinalValidation
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            // "validateFinal" is the historical name of the final validation
            // stage and still appears in older status documents.
            .or(if s == "validateFinal" {
                Some(Stage::FinalValidation)
            } else {
                None
            })
            .ok_or_else(|| Error::UnknownStage(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_is_stable() {
        assert_eq!(Stage::ALL.len(), 11);
        assert_eq!(Stage::ALL[0], Stage::Ingestion);
        assert_eq!(Stage::ALL[10], Stage::Integration);
        assert_eq!(Stage::Inference.index(), 3);
    }

    #[test]
    fn round_trips_names() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert_eq!(
            "validateFinal".parse::<Stage>().unwrap(),
            Stage::FinalValidation
        );
        assert!("deploy".parse::<Stage>().is_err());
    }

    #[test]
    fn validation_stages_are_classified() {
        assert!(Stage::ValidateStructure.is_validation());
        assert!(Stage::FinalValidation.is_validation());
        assert!(!Stage::Refine.is_validation());
        assert!(!Stage::Integration.is_validation());
    }
}
