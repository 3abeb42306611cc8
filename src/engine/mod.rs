//! Execution substrate: task queue, runner loop, periodic beat.

pub mod beat;
pub mod context;
pub mod queue;
pub mod runner;

pub use beat::Beat;
pub use context::ExecutionContext;
pub use queue::TaskQueue;
pub use runner::{Runner, RunnerConfig, TaskOutcome, TaskRouter};
