//! Periodic rollup scheduling.

use std::{collections::BTreeSet, time::Duration};

use tally_core::{ids::CourseId, store::GradeStore};
use tally_engine::Engine;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
  error::{Result, WorkerError},
  queue::{Job, JobQueue},
};

/// Enqueues a rollup (followed by intervention evaluation) for every live
/// course on each tick. Re-running a date overwrites that date's rollup, so
/// ticking several times a day keeps today's snapshot current.
pub struct Scheduler<S> {
  engine:  Engine<S>,
  queue:   JobQueue,
  courses: Option<BTreeSet<CourseId>>,
  every:   Duration,
}

impl<S: GradeStore> Scheduler<S> {
  pub fn new(
    engine: Engine<S>,
    queue: JobQueue,
    courses: Option<Vec<CourseId>>,
    every: Duration,
  ) -> Self {
    Self { engine, queue, courses: courses.map(BTreeSet::from_iter), every }
  }

  /// Enqueue today's rollups. Returns the number of jobs submitted.
  pub async fn tick(&self) -> Result<usize> {
    let date = self.engine.today();
    let courses = self
      .engine
      .store()
      .list_courses()
      .await
      .map_err(|e| WorkerError::Store(Box::new(e)))?;

    let mut submitted = 0;
    for course in courses {
      if course.deleted {
        continue;
      }
      if let Some(only) = &self.courses
        && !only.contains(&course.course_id)
      {
        continue;
      }
      let id = self
        .queue
        .submit(Job::RunRollup { course_id: course.course_id, date, evaluate_after: true })
        .await?;
      debug!(%id, course_id = course.course_id, %date, "rollup enqueued");
      submitted += 1;
    }

    info!(%date, submitted, "scheduled rollups");
    Ok(submitted)
  }

  /// Tick until `shutdown` fires. The first tick happens immediately.
  pub async fn run(self, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(self.every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        _ = shutdown.cancelled() => {
          info!("scheduler received shutdown signal");
          break;
        }
        _ = interval.tick() => {
          if let Err(e) = self.tick().await {
            error!(error = %e, "scheduling pass failed");
            if matches!(e, WorkerError::QueueClosed) {
              break;
            }
          }
        }
      }
    }
  }
}
