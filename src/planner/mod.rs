//! 规划层：planning brain 适配、候选解析与 Planner

pub mod brain;
pub mod candidate;
pub mod engine;

pub use brain::{FixedPlanBrain, LlmPlanningBrain, PlanningBrain, PlanningContext};
pub use candidate::{parse_proposal, PlanCandidate};
pub use engine::{Planner, ValidatedPlan};
