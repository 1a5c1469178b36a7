//! Orchestration of Tally's grade and analytics operations.
//!
//! [`Engine`] wraps a [`GradeStore`] and exposes the operations the rest of
//! the system calls:
//!
//! - [`Engine::record_attempt`] scores and stores one answer, then re-syncs
//!   the learner's quiz result.
//! - [`Engine::recompute_quiz_result`] rebuilds a quiz result from its
//!   attempts and credits gamification on completion.
//! - [`Engine::recompute_course_grade`] maps quiz results onto weighted grade
//!   columns, appending history when the value changes.
//! - [`Engine::run_rollup`] snapshots a course's analytics for one date.
//! - [`Engine::evaluate_interventions`] drives the intervention lifecycle
//!   from the latest rollup.
//!
//! Every operation holds a per-key lock, retries conflicting writes with
//! backoff, and runs under a timeout. The pure computations live in
//! `tally-core`; this crate only sequences reads, computation and writes.

mod cancel;
pub mod error;
mod grades;
mod interventions;
pub mod locks;
mod quiz;
pub mod retry;
mod rollups;


use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, NaiveDate, Utc};
use tally_core::{
  EntityRef,
  course_grade::DEFAULT_GRADE_EPSILON,
  gamification::GamificationConfig,
  ids::CourseId,
  store::GradeStore,
  time::{Clock, ReportingZone, SystemClock},
};
use tokio_util::sync::CancellationToken;

pub use error::{EngineError, Result};
pub use grades::CourseGradeOutcome;
pub use quiz::RecordedAttempt;
pub use retry::RetryPolicy;
pub use rollups::RollupOutcome;

use crate::{cancel::CourseCancellations, locks::KeyedLocks};

/// Tunables shared by every operation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub retry:         RetryPolicy,
  pub job_timeout:   Duration,
  /// Grade changes smaller than this do not count as a change.
  pub grade_epsilon: f64,
  pub zone:          ReportingZone,
  pub gamification:  GamificationConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      retry:         RetryPolicy::default(),
      job_timeout:   Duration::from_secs(30),
      grade_epsilon: DEFAULT_GRADE_EPSILON,
      zone:          ReportingZone::utc(),
      gamification:  GamificationConfig::default(),
    }
  }
}

/// The grade and analytics engine. Cheap to clone; clones share locks,
/// cancellation state and the store.
pub struct Engine<S> {
  store:         Arc<S>,
  config:        Arc<EngineConfig>,
  clock:         Arc<dyn Clock>,
  locks:         Arc<KeyedLocks<EntityRef>>,
  cancellations: Arc<CourseCancellations>,
}

impl<S> Clone for Engine<S> {
  fn clone(&self) -> Self {
    Self {
      store:         Arc::clone(&self.store),
      config:        Arc::clone(&self.config),
      clock:         Arc::clone(&self.clock),
      locks:         Arc::clone(&self.locks),
      cancellations: Arc::clone(&self.cancellations),
    }
  }
}

impl<S: GradeStore> Engine<S> {
  pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
    Self {
      store,
      config: Arc::new(config),
      clock: Arc::new(SystemClock),
      locks: Arc::new(KeyedLocks::new()),
      cancellations: Arc::new(CourseCancellations::new(CancellationToken::new())),
    }
  }

  /// Replace the wall clock.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Tie every course's cancellation to `shutdown`.
  pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
    self.cancellations = Arc::new(CourseCancellations::new(shutdown));
    self
  }

  pub fn store(&self) -> &S { &self.store }

  pub fn config(&self) -> &EngineConfig { &self.config }

  /// Stop in-flight rollups and intervention runs for a course.
  pub fn cancel_course(&self, course_id: CourseId) {
    tracing::info!(course_id, "cancelling course work");
    self.cancellations.cancel(course_id);
  }

  /// Cancel everything; later course work fails with `Cancelled`.
  pub fn shutdown(&self) { self.cancellations.shutdown(); }

  /// The current date in the reporting zone.
  pub fn today(&self) -> NaiveDate { self.config.zone.date_of(self.clock.now()) }

  pub(crate) fn now(&self) -> DateTime<Utc> { self.clock.now() }

  pub(crate) fn course_token(&self, course_id: CourseId) -> Arc<CancellationToken> {
    self.cancellations.token(course_id)
  }

  /// Run `op` under the job timeout, retrying concurrency conflicts with
  /// backoff until the retry budget is spent.
  pub(crate) async fn guarded<T, F, Fut>(&self, entity: EntityRef, mut op: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let retry = self.config.retry;
    let attempts = async {
      let mut attempt = 1;
      loop {
        match op().await {
          Err(err @ EngineError::ConcurrencyConflict { .. }) => {
            if attempt >= retry.max_attempts() {
              return Err(EngineError::Transient {
                entity,
                attempts: attempt,
                source: Box::new(err),
              });
            }
            let delay = retry.delay_after(attempt);
            tracing::warn!(%entity, attempt, ?delay, "conflicting write, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
          }
          other => return other,
        }
      }
    };

    match tokio::time::timeout(self.config.job_timeout, attempts).await {
      Ok(result) => result,
      Err(_) => Err(EngineError::Timeout { entity, after: self.config.job_timeout }),
    }
  }
}
