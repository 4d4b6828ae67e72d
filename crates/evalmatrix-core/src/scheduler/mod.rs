//! Scheduling: retry policy, per-model auth breaker and the matrix runner.

pub mod breaker;
pub mod policy;
pub mod runner;

pub use breaker::CircuitBreaker;
pub use policy::RetryPolicy;
pub use runner::{CancelToken, MatrixRunner, RunReport};
