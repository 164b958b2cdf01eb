//! 执行层：有界并发派发、超时、gate 与补偿

pub mod runner;

pub use runner::{Compensation, Dispatch, Executor, StepReport};
