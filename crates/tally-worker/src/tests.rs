//! Queue, worker pool and scheduler tests against an in-memory store.

use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use tally_core::{
  authoring::{Course, Question, Quiz, QuizQuestion},
  columns::{ColumnAggregation, ColumnCategory, ColumnQuizMapping, GradeColumn},
  course_grade::Grade,
  scoring::{NewAttempt, PenaltyPolicy},
  store::GradeStore,
};
use tally_engine::{Engine, EngineConfig};
use tally_store_sqlite::SqliteStore;
use tokio_util::sync::CancellationToken;

use crate::{Job, JobOutcome, JobQueue, Scheduler, WorkerError, WorkerPool, execute};

/// Live course 1 with learner 7 and a two-question quiz 10 worth the whole
/// grade; deleted course 2.
async fn engine() -> Engine<SqliteStore> {
  let store = SqliteStore::open_in_memory().await.unwrap();
  store
    .put_course(Course { course_id: 1, name: "Algebra".into(), deleted: false })
    .await
    .unwrap();
  store
    .put_course(Course { course_id: 2, name: "Retired".into(), deleted: true })
    .await
    .unwrap();
  store.enroll(1, 7).await.unwrap();

  store
    .put_quiz(Quiz {
      quiz_id:   10,
      course_id: 1,
      title:     "Quiz".into(),
      penalty:   PenaltyPolicy::default(),
    })
    .await
    .unwrap();
  for question_id in [11, 12] {
    store
      .put_question(Question {
        question_id,
        max_points: 1.0,
        objective_id: None,
        time_limit_secs: None,
      })
      .await
      .unwrap();
    store
      .assign_question(QuizQuestion {
        quiz_id: 10,
        question_id,
        added_at: Utc::now() - TimeDelta::days(1),
        removed_at: None,
      })
      .await
      .unwrap();
  }
  store
    .put_grade_column(GradeColumn {
      column_id:   1,
      course_id:   1,
      name:        "Quizzes".into(),
      category:    ColumnCategory::Process,
      weight:      Some(100.0),
      aggregation: ColumnAggregation::Average,
      required:    false,
    })
    .await
    .unwrap();
  store
    .map_quiz(ColumnQuizMapping { column_id: 1, quiz_id: 10 })
    .await
    .unwrap();

  Engine::new(Arc::new(store), EngineConfig::default())
}

async fn answer_all(engine: &Engine<SqliteStore>) {
  for question_id in [11, 12] {
    engine
      .record_attempt(NewAttempt {
        learner_id: 7,
        quiz_id: 10,
        question_id,
        answer_id: None,
        is_correct: true,
        time_spent_secs: 4.0,
        attempt_index: 1,
      })
      .await
      .unwrap();
  }
}

#[tokio::test]
async fn tick_enqueues_live_courses_only() {
  let engine = engine().await;
  let (queue, mut rx) = JobQueue::new(8);
  let today = engine.today();
  let scheduler = Scheduler::new(engine, queue, None, Duration::from_secs(60));

  assert_eq!(scheduler.tick().await.unwrap(), 1);

  let envelope = rx.try_recv().unwrap();
  assert_eq!(envelope.job, Job::RunRollup { course_id: 1, date: today, evaluate_after: true });
  assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn tick_respects_course_filter() {
  let engine = engine().await;
  let (queue, mut rx) = JobQueue::new(8);
  let scheduler = Scheduler::new(engine, queue, Some(vec![3]), Duration::from_secs(60));

  assert_eq!(scheduler.tick().await.unwrap(), 0);
  assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn try_submit_reports_full_and_closed_queue() {
  let (queue, rx) = JobQueue::new(1);
  let job = Job::EvaluateInterventions { course_id: 1 };

  queue.try_submit(job.clone()).unwrap();
  assert!(matches!(queue.try_submit(job.clone()), Err(WorkerError::QueueFull)));

  drop(rx);
  assert!(matches!(queue.try_submit(job), Err(WorkerError::QueueClosed)));
}

#[tokio::test]
async fn execute_runs_rollup_then_interventions() {
  let engine = engine().await;
  answer_all(&engine).await;
  let date = engine.today();

  let outcome = execute(&engine, &Job::RunRollup { course_id: 1, date, evaluate_after: true })
    .await
    .unwrap();

  let JobOutcome::Rollup { outcome, interventions } = outcome else {
    panic!("expected a rollup outcome");
  };
  assert_eq!(outcome.rollup.course_id, 1);
  assert_eq!(outcome.rollup.snapshot_date, date);
  assert!(interventions.is_empty());

  let stored = engine.store().rollup(1, date).await.unwrap().unwrap();
  assert_eq!(stored.snapshot_date, date);
  assert_eq!(stored.metrics.enrolled, 1);
  assert_eq!(stored.metrics.graded_learners, 1);
  assert!((stored.metrics.mean_score.unwrap() - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn execute_rollup_for_deleted_course_is_cancelled() {
  let engine = engine().await;
  let date = engine.today();

  let err = execute(&engine, &Job::RunRollup { course_id: 2, date, evaluate_after: false })
    .await
    .unwrap_err();

  assert!(matches!(err, tally_engine::EngineError::Cancelled { .. }));
  assert_eq!(engine.store().rollup(2, date).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_drains_queue_until_shutdown() {
  let engine = engine().await;

  let shutdown = CancellationToken::new();
  let (queue, rx) = JobQueue::new(4);
  let pool = WorkerPool::spawn(engine.clone(), 2, rx, shutdown.clone());

  queue
    .submit(Job::RecomputeCourseGrade { learner_id: 7, course_id: 1 })
    .await
    .unwrap();

  let mut grade = None;
  for _ in 0..200 {
    grade = engine.store().course_grade(7, 1).await.unwrap();
    if grade.is_some() {
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  let grade = grade.expect("worker computed the grade");
  assert_eq!(grade.version, 1);
  assert!(matches!(grade.grade, Grade::Incomplete { .. }));

  pool.shutdown();
  tokio::time::timeout(Duration::from_secs(5), pool.join())
    .await
    .unwrap();
}
