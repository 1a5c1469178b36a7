//! Core types, grading algorithms, and the store trait for Tally.
//!
//! This crate is deliberately free of database and runtime dependencies.
//! Every computation here is a pure function over records read through
//! [`store::GradeStore`]; orchestration (locking, retries, scheduling) lives in
//! `tally-engine`.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod authoring;
pub mod columns;
pub mod course_grade;
pub mod error;
pub mod gamification;
pub mod ids;
pub mod intervention;
pub mod quiz_result;
pub mod rollup;
pub mod scoring;
pub mod store;
pub mod time;

pub use error::{Error, Result};
pub use ids::EntityRef;
