//! Background worker for Tally.
//!
//! Runs grade and analytics jobs from a bounded queue on a pool of tokio
//! tasks, and schedules daily rollups for every live course.

pub mod config;
pub mod error;
pub mod queue;
pub mod scheduler;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use queue::{Job, JobOutcome, JobQueue, WorkerPool, execute};
pub use scheduler::Scheduler;

#[cfg(test)]
mod tests;
