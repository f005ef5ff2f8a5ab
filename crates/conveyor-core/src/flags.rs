//! Flags accumulated across stages.
//!
//! Flags are a plain JSON-object map. Values are restricted to a bounded
//! variant set; the variant tag is what flag-type conflict checks compare.

use serde_json::{Map, Value};

/// The accumulated flag map for one task run.
pub type FlagMap = Map<String, Value>;

/// Flag key that gates the critique/refine/finalValidation stages.
pub const NEEDS_REFINEMENT: &str = "needsRefinement";

/// Variant tag of a flag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FlagType {
    #[display("bool")]
    Bool,
    #[display("int")]
    Int,
    #[display("float")]
    Float,
    #[display("string")]
    String,
    #[display("object")]
    Object,
}

impl FlagType {
    /// Classify a JSON value. Null and arrays are not valid flag values.
    pub fn of(value: &Value) -> Option<FlagType> {
        match value {
            Value::Bool(_) => Some(FlagType::Bool),
            Value::Number(n) if n.is_f64() => Some(FlagType::Float),
            Value::Number(_) => Some(FlagType::Int),
            Value::String(_) => Some(FlagType::String),
            Value::Object(_) => Some(FlagType::Object),
            Value::Null | Value::Array(_) => None,
        }
    }
}

/// True exactly when `flags.needsRefinement` is the boolean `true`.
pub fn needs_refinement(flags: &FlagMap) -> bool {
    matches!(flags.get(NEEDS_REFINEMENT), Some(Value::Bool(true)))
}
