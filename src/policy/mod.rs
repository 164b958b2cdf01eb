//! 策略层：Continue / Retry / Replan / Escalate 决策

pub mod confidence;
pub mod decision;
pub mod engine;

pub use confidence::{ConfidenceScorer, FailureRatioScorer, FixedConfidence};
pub use decision::{Decision, PolicyInput};
pub use engine::{PolicyConfig, PolicyEngine};
