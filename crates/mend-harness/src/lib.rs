//! Admission control and process lifecycle for the pipeline.
//!
//! The [`breaker::TokenBreaker`] is the single policy point rationing
//! model tokens and task concurrency; [`shutdown::ShutdownSignal`] is the
//! cooperative cancellation primitive every suspension point races.

pub mod breaker;
pub mod shutdown;

pub use breaker::{BreakerDecision, TokenBreaker};
pub use shutdown::ShutdownSignal;
