//! The job queue and the pool of workers draining it.
//!
//! Jobs go through a bounded [`mpsc`] channel. Every worker task shares the
//! receiving end and runs one job at a time; the engine's per-key locks keep
//! jobs touching the same record from interleaving. Workers stop when the
//! shutdown token fires or the queue is closed and empty.

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tally_core::{
  EntityRef,
  course_grade::CourseGradeResult,
  ids::{CourseId, LearnerId, QuizId},
  intervention::CourseIntervention,
  quiz_result::QuizResult,
  store::GradeStore,
};
use tally_engine::{Engine, EngineError, RollupOutcome};
use tokio::{
  sync::{Mutex, mpsc},
  task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, WorkerError};

// ─── Jobs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
  RecomputeQuizResult { learner_id: LearnerId, quiz_id: QuizId },
  RecomputeCourseGrade { learner_id: LearnerId, course_id: CourseId },
  /// Snapshot a course for `date`, then optionally evaluate interventions
  /// against the new rollup.
  RunRollup { course_id: CourseId, date: NaiveDate, evaluate_after: bool },
  EvaluateInterventions { course_id: CourseId },
}

impl Job {
  pub fn name(&self) -> &'static str {
    match self {
      Self::RecomputeQuizResult { .. } => "recompute_quiz_result",
      Self::RecomputeCourseGrade { .. } => "recompute_course_grade",
      Self::RunRollup { .. } => "run_rollup",
      Self::EvaluateInterventions { .. } => "evaluate_interventions",
    }
  }

  /// The record the job works on.
  pub fn entity(&self) -> EntityRef {
    match *self {
      Self::RecomputeQuizResult { learner_id, quiz_id } => {
        EntityRef::QuizResult { learner: learner_id, quiz: quiz_id }
      }
      Self::RecomputeCourseGrade { learner_id, course_id } => {
        EntityRef::CourseGrade { learner: learner_id, course: course_id }
      }
      Self::RunRollup { course_id, date, .. } => EntityRef::Rollup { course: course_id, date },
      Self::EvaluateInterventions { course_id } => EntityRef::Course { id: course_id },
    }
  }
}

/// A job as it sits in the queue.
#[derive(Debug, Clone)]
pub struct Envelope {
  pub id:          Uuid,
  pub job:         Job,
  pub enqueued_at: DateTime<Utc>,
}

/// What a finished job produced.
#[derive(Debug, Clone)]
pub enum JobOutcome {
  QuizResult(QuizResult),
  CourseGrade(CourseGradeResult),
  Rollup {
    outcome:       RollupOutcome,
    interventions: Vec<CourseIntervention>,
  },
  Interventions(Vec<CourseIntervention>),
}

/// Run one job to completion against `engine`.
pub async fn execute<S: GradeStore>(
  engine: &Engine<S>,
  job: &Job,
) -> tally_engine::Result<JobOutcome> {
  match *job {
    Job::RecomputeQuizResult { learner_id, quiz_id } => engine
      .recompute_quiz_result(learner_id, quiz_id)
      .await
      .map(JobOutcome::QuizResult),
    Job::RecomputeCourseGrade { learner_id, course_id } => engine
      .recompute_course_grade(learner_id, course_id)
      .await
      .map(|outcome| JobOutcome::CourseGrade(outcome.result)),
    Job::RunRollup { course_id, date, evaluate_after } => {
      let outcome = engine.run_rollup(course_id, date).await?;
      let interventions = if evaluate_after {
        engine.evaluate_interventions(course_id).await?
      } else {
        Vec::new()
      };
      Ok(JobOutcome::Rollup { outcome, interventions })
    }
    Job::EvaluateInterventions { course_id } => engine
      .evaluate_interventions(course_id)
      .await
      .map(JobOutcome::Interventions),
  }
}

// ─── Queue ────────────────────────────────────────────────────────────────────

/// Sending half of the job queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
  tx: mpsc::Sender<Envelope>,
}

impl JobQueue {
  pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Self { tx }, rx)
  }

  /// Enqueue a job, waiting for room if the queue is full.
  pub async fn submit(&self, job: Job) -> Result<Uuid> {
    let envelope = Self::wrap(job);
    let id = envelope.id;
    self
      .tx
      .send(envelope)
      .await
      .map_err(|_| WorkerError::QueueClosed)?;
    Ok(id)
  }

  /// Enqueue a job without waiting.
  pub fn try_submit(&self, job: Job) -> Result<Uuid> {
    let envelope = Self::wrap(job);
    let id = envelope.id;
    self.tx.try_send(envelope).map_err(|e| match e {
      mpsc::error::TrySendError::Full(_) => WorkerError::QueueFull,
      mpsc::error::TrySendError::Closed(_) => WorkerError::QueueClosed,
    })?;
    Ok(id)
  }

  fn wrap(job: Job) -> Envelope {
    Envelope { id: Uuid::new_v4(), job, enqueued_at: Utc::now() }
  }
}

// ─── Workers ──────────────────────────────────────────────────────────────────

/// Handles to the spawned worker tasks.
pub struct WorkerPool {
  handles:  Vec<JoinHandle<()>>,
  shutdown: CancellationToken,
}

impl WorkerPool {
  /// Spawn `workers` tasks draining `rx` until `shutdown` fires.
  pub fn spawn<S>(
    engine: Engine<S>,
    workers: usize,
    rx: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
  ) -> Self
  where
    S: GradeStore + 'static,
  {
    let rx = Arc::new(Mutex::new(rx));
    let handles = (0..workers.max(1))
      .map(|worker| {
        let engine = engine.clone();
        let rx = Arc::clone(&rx);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
          info!(worker, "worker started");
          loop {
            let next = tokio::select! {
              _ = shutdown.cancelled() => {
                info!(worker, "worker received shutdown signal");
                break;
              }
              next = async { rx.lock().await.recv().await } => next,
            };
            let Some(envelope) = next else {
              debug!(worker, "queue closed");
              break;
            };
            run_job(&engine, worker, envelope).await;
          }
          info!(worker, "worker stopped");
        })
      })
      .collect();

    Self { handles, shutdown }
  }

  /// Signal every worker to stop after its current job.
  pub fn shutdown(&self) { self.shutdown.cancel(); }

  /// Wait for every worker to exit.
  pub async fn join(self) {
    for handle in self.handles {
      if let Err(e) = handle.await {
        error!(error = %e, "worker task panicked");
      }
    }
  }
}

async fn run_job<S: GradeStore>(engine: &Engine<S>, worker: usize, envelope: Envelope) {
  let Envelope { id, job, enqueued_at } = envelope;
  let entity = job.entity();
  let waited_ms = (Utc::now() - enqueued_at).num_milliseconds();
  debug!(worker, %id, job = job.name(), %entity, waited_ms, "job started");

  let started = Instant::now();
  let result = execute(engine, &job).await;
  let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

  match result {
    Ok(outcome) => {
      info!(worker, %id, job = job.name(), %entity, elapsed_ms, "job finished");
      log_outcome(&outcome);
    }
    Err(e @ EngineError::Cancelled { .. }) => {
      warn!(worker, %id, job = job.name(), %entity, error = %e, "job cancelled");
    }
    Err(e) => {
      error!(
        worker,
        %id,
        job = job.name(),
        %entity,
        retryable = e.is_retryable(),
        error = %e,
        "job failed"
      );
    }
  }
}

fn log_outcome(outcome: &JobOutcome) {
  match outcome {
    JobOutcome::QuizResult(result) => {
      debug!(status = %result.status, score = result.score, "quiz result");
    }
    JobOutcome::CourseGrade(result) => {
      debug!(grade = ?result.grade, version = result.version, "course grade");
    }
    JobOutcome::Rollup { outcome, interventions } => {
      debug!(
        low_confidence = outcome.rollup.low_confidence,
        objectives = outcome.lo_rollups.len(),
        interventions_changed = interventions.len(),
        "rollup"
      );
    }
    JobOutcome::Interventions(changed) => {
      debug!(interventions_changed = changed.len(), "interventions");
    }
  }
}
