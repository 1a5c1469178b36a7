//! Integration tests for `SqliteStore` against an in-memory database.

use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};
use tally_core::{
  authoring::{Course, Question, Quiz, QuizQuestion},
  columns::{ColumnAggregation, ColumnCategory, ColumnQuizMapping, GradeColumn},
  course_grade::{ColumnValue, CourseGradeResult, Grade, IncompleteReason},
  gamification::{CompletionMarker, LearnerStats},
  intervention::{
    Cohort, Comparison, CourseAnalyticsConfig, InterventionKind, InterventionParameters,
    InterventionStatus, NewIntervention, NewInterventionResult, TargetGroup,
  },
  quiz_result::{QuizResult, QuizStatus},
  rollup::{CourseAnalyticsRollup, CourseLORollup, CourseMetrics, MetricKey, ObjectiveMetrics},
  scoring::{NewAttempt, PenaltyPolicy},
  store::{CasOutcome, GradeStore},
};

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn t(hours: i64) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 9, 1, 8, 0, 0).unwrap() + TimeDelta::hours(hours)
}

fn day(d: u32) -> NaiveDate { NaiveDate::from_ymd_opt(2024, 9, d).unwrap() }

async fn seeded() -> SqliteStore {
  let s = store().await;
  s.put_course(Course { course_id: 1, name: "Algebra".into(), deleted: false })
    .await
    .unwrap();
  s.put_quiz(Quiz {
    quiz_id:   10,
    course_id: 1,
    title:     "Week 1".into(),
    penalty:   PenaltyPolicy { attempt_decay_factor: 0.5, ..Default::default() },
  })
  .await
  .unwrap();
  for id in 1..=3 {
    s.put_question(Question {
      question_id:     id,
      max_points:      10.0,
      objective_id:    Some(100),
      time_limit_secs: None,
    })
    .await
    .unwrap();
    s.assign_question(QuizQuestion {
      quiz_id:     10,
      question_id: id,
      added_at:    t(-24),
      removed_at:  None,
    })
    .await
    .unwrap();
  }
  s
}

fn quiz_result(version: i64) -> QuizResult {
  QuizResult {
    learner_id: 7,
    quiz_id: 10,
    status: QuizStatus::Completed,
    raw_total_points: 20.0,
    max_points: 30.0,
    bonuses_total: 0.0,
    score: 2.0 / 3.0,
    completion_time: Some(t(1)),
    synced_at: t(1),
    attempt_count: 3,
    last_attempt_id: Some(3),
    version,
  }
}

fn grade(value: Option<f64>, at: DateTime<Utc>) -> CourseGradeResult {
  CourseGradeResult {
    learner_id:  7,
    course_id:   1,
    columns:     vec![ColumnValue {
      column_id:      1,
      name:           "process".into(),
      weight:         100.0,
      value,
      scored_quizzes: usize::from(value.is_some()),
    }],
    grade:       match value {
      Some(value) => Grade::Graded { value },
      None => Grade::Incomplete { reason: IncompleteReason::NoScoredColumns },
    },
    computed_at: at,
    value_since: at,
    last_error:  None,
    version:     0,
  }
}

// ─── Authoring reads ─────────────────────────────────────────────────────────

#[tokio::test]
async fn authoring_data_round_trips() {
  let s = seeded().await;

  let quiz = s.quiz(10).await.unwrap().unwrap();
  assert_eq!(quiz.penalty.attempt_decay_factor, 0.5);
  assert_eq!(s.course_quizzes(1).await.unwrap().len(), 1);

  let questions = s.questions(vec![1, 3, 99]).await.unwrap();
  assert_eq!(questions.iter().map(|q| q.question_id).collect::<Vec<_>>(), vec![1, 3]);

  s.retire_question(10, 2, t(5)).await.unwrap();
  let assignments = s.quiz_questions(10).await.unwrap();
  assert_eq!(assignments.len(), 3);
  assert_eq!(assignments[1].removed_at, Some(t(5)));

  assert!(s.analytics_config(1).await.unwrap().is_none());
}

#[tokio::test]
async fn grade_columns_and_mappings() {
  let s = seeded().await;
  s.put_grade_column(GradeColumn {
    column_id:   1,
    course_id:   1,
    name:        "Process".into(),
    category:    ColumnCategory::Process,
    weight:      Some(100.0),
    aggregation: ColumnAggregation::BestOfN { n: 2 },
    required:    true,
  })
  .await
  .unwrap();
  s.map_quiz(ColumnQuizMapping { column_id: 1, quiz_id: 10 }).await.unwrap();
  s.map_quiz(ColumnQuizMapping { column_id: 1, quiz_id: 10 }).await.unwrap();

  let columns = s.grade_columns(1).await.unwrap();
  assert_eq!(columns.len(), 1);
  assert_eq!(columns[0].aggregation, ColumnAggregation::BestOfN { n: 2 });
  assert_eq!(columns[0].category, ColumnCategory::Process);
  assert_eq!(s.column_mappings(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn analytics_config_round_trips() {
  let s = seeded().await;
  let mut config = CourseAnalyticsConfig::default();
  config.feature_flags.insert(InterventionKind::Reminder, true);
  s.put_analytics_config(1, config.clone()).await.unwrap();

  let loaded = s.analytics_config(1).await.unwrap().unwrap();
  assert_eq!(loaded, config);
  assert!(loaded.is_enabled(InterventionKind::Reminder));
}

// ─── Attempts ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_attempt_is_not_stored() {
  let s = seeded().await;
  let attempt = NewAttempt {
    learner_id:      7,
    quiz_id:         10,
    question_id:     1,
    answer_id:       Some(4),
    is_correct:      true,
    time_spent_secs: 12.5,
    attempt_index:   1,
  };

  let first = s.insert_attempt(attempt.clone(), 10.0, t(0)).await.unwrap();
  assert!(first.is_some());
  let second = s.insert_attempt(attempt, 5.0, t(1)).await.unwrap();
  assert!(second.is_none());

  let stored = s.attempts(7, 10).await.unwrap();
  assert_eq!(stored.len(), 1);
  assert_eq!(stored[0].points_earned, 10.0);
  assert_eq!(stored[0].created_at, t(0));
}

// ─── Quiz results ────────────────────────────────────────────────────────────

#[tokio::test]
async fn quiz_result_cas() {
  let s = seeded().await;

  let CasOutcome::Committed(saved) = s.save_quiz_result(quiz_result(0), None).await.unwrap() else {
    panic!("first insert should commit");
  };
  assert_eq!(saved.version, 1);

  // A second "insert" loses.
  assert_eq!(s.save_quiz_result(quiz_result(0), None).await.unwrap(), CasOutcome::Conflict);

  // A stale version loses; the current one wins.
  assert_eq!(s.save_quiz_result(quiz_result(0), Some(7)).await.unwrap(), CasOutcome::Conflict);
  let CasOutcome::Committed(updated) = s.save_quiz_result(saved, Some(1)).await.unwrap() else {
    panic!("matching version should commit");
  };
  assert_eq!(updated.version, 2);

  let stored = s.quiz_result(7, 10).await.unwrap().unwrap();
  assert_eq!(stored.version, 2);
  assert_eq!(stored.status, QuizStatus::Completed);
  assert_eq!(stored.synced_at, t(1));
  assert_eq!(s.quiz_results(7, vec![10, 11]).await.unwrap().len(), 1);
}

// ─── Course grades ───────────────────────────────────────────────────────────

#[tokio::test]
async fn grade_update_appends_history_atomically() {
  let s = seeded().await;

  let CasOutcome::Committed(v1) =
    s.save_course_grade(grade(Some(0.5), t(1)), None, None).await.unwrap()
  else {
    panic!("insert should commit");
  };

  let next = CourseGradeResult { version: v1.version, ..grade(Some(0.9), t(2)) };
  let history = v1.snapshot(t(2));

  // Stale version: neither the update nor the history row is written.
  let outcome = s
    .save_course_grade(next.clone(), Some(v1.version + 5), Some(history.clone()))
    .await
    .unwrap();
  assert_eq!(outcome, CasOutcome::Conflict);
  assert!(s.course_grade_history(7, 1).await.unwrap().is_empty());

  let outcome = s
    .save_course_grade(next, Some(v1.version), Some(history))
    .await
    .unwrap();
  assert!(matches!(outcome, CasOutcome::Committed(ref g) if g.version == 2));

  let rows = s.course_grade_history(7, 1).await.unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].prior_grade, Grade::Graded { value: 0.5 });
  assert_eq!(rows[0].changed_at, t(2));

  let current = s.course_grade(7, 1).await.unwrap().unwrap();
  assert_eq!(current.grade.value(), Some(0.9));
  assert_eq!(s.course_grades(1).await.unwrap().len(), 1);
  assert_eq!(s.course_grade_history_for_course(1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn incomplete_grade_round_trips() {
  let s = seeded().await;
  let mut g = grade(None, t(1));
  g.grade = Grade::Incomplete {
    reason: IncompleteReason::Configuration { detail: "weights sum to 90".into() },
  };
  g.last_error = Some("weights sum to 90".into());
  s.save_course_grade(g.clone(), None, None).await.unwrap();

  let stored = s.course_grade(7, 1).await.unwrap().unwrap();
  assert_eq!(stored.grade, g.grade);
  assert_eq!(stored.last_error, g.last_error);
}

// ─── Rollups ─────────────────────────────────────────────────────────────────

fn rollup(date: NaiveDate, mean: f64) -> (CourseAnalyticsRollup, Vec<CourseLORollup>) {
  let metrics = CourseMetrics {
    enrolled:                4,
    active_learners:         3,
    graded_learners:         3,
    completion_rate:         0.75,
    mean_score:              Some(mean),
    median_score:            Some(mean),
    score_distribution:      vec![0; 10],
    objective_mastery:       [(100, 0.6)].into(),
    inactive_learners:       vec![4],
    low_scorers:             vec![],
    struggling_learners:     vec![2],
    mastered_share:          Some(2.0 / 3.0),
    open_interventions:      0,
    evaluated_interventions: 0,
  };
  let course = CourseAnalyticsRollup {
    course_id: 1,
    snapshot_date: date,
    metrics,
    sample_size: 3,
    confidence: 0.5,
    low_confidence: true,
    computed_at: t(3),
  };
  let lo = CourseLORollup {
    course_id: 1,
    objective_id: 100,
    snapshot_date: date,
    metrics: ObjectiveMetrics {
      sample_size:         3,
      mean_mastery:        Some(0.6),
      mastered_share:      Some(1.0 / 3.0),
      struggling_learners: vec![2],
    },
    sample_size: 3,
    confidence: 0.5,
    low_confidence: true,
    computed_at: t(3),
  };
  (course, vec![lo])
}

#[tokio::test]
async fn rollup_for_same_date_overwrites() {
  let s = seeded().await;
  let (r1, lo1) = rollup(day(2), 0.4);
  s.save_rollups(r1, lo1).await.unwrap();
  let (r2, _) = rollup(day(2), 0.8);
  s.save_rollups(r2, vec![]).await.unwrap();

  let stored = s.rollup(1, day(2)).await.unwrap().unwrap();
  assert_eq!(stored.metrics.mean_score, Some(0.8));
  assert_eq!(stored.metrics.objective_mastery.get(&100), Some(&0.6));
  assert!(s.lo_rollups(1, day(2)).await.unwrap().is_empty());
}

#[tokio::test]
async fn rollup_lookups_by_date() {
  let s = seeded().await;
  for (d, mean) in [(2, 0.4), (5, 0.5), (9, 0.6)] {
    let (r, lo) = rollup(day(d), mean);
    s.save_rollups(r, lo).await.unwrap();
  }

  assert_eq!(s.latest_rollup(1).await.unwrap().unwrap().snapshot_date, day(9));
  assert_eq!(
    s.first_rollup_on_or_after(1, day(3)).await.unwrap().unwrap().snapshot_date,
    day(5)
  );
  assert!(s.first_rollup_on_or_after(1, day(10)).await.unwrap().is_none());

  let los = s.lo_rollups(1, day(5)).await.unwrap();
  assert_eq!(los.len(), 1);
  assert_eq!(los[0].metric(MetricKey::MeanMastery), Some(0.6));
}

// ─── Gamification ────────────────────────────────────────────────────────────

#[tokio::test]
async fn gamification_upserts_stats_and_marker() {
  let s = seeded().await;
  assert!(s.learner_stats(7).await.unwrap().is_none());

  let mut stats = LearnerStats::new(7);
  stats.total_points = 20.0;
  stats.updated_at = Some(t(1));
  let marker = CompletionMarker {
    learner_id:     7,
    quiz_id:        10,
    synced_at:      t(1),
    credited_raw:   20.0,
    credited_bonus: 0.0,
  };
  s.save_gamification(stats.clone(), marker.clone()).await.unwrap();

  stats.total_points = 25.0;
  let marker2 = CompletionMarker { synced_at: t(2), credited_raw: 25.0, ..marker };
  s.save_gamification(stats.clone(), marker2.clone()).await.unwrap();

  assert_eq!(s.learner_stats(7).await.unwrap().unwrap(), stats);
  assert_eq!(s.completion_marker(7, 10).await.unwrap().unwrap(), marker2);
}

// ─── Interventions ───────────────────────────────────────────────────────────

fn new_intervention() -> NewIntervention {
  NewIntervention {
    course_id:      1,
    objective_id:   None,
    kind:           InterventionKind::Reminder,
    target_group:   TargetGroup::InactiveLearners,
    parameters:     InterventionParameters {
      metric:     MetricKey::CompletionRate,
      comparison: Comparison::Below,
      threshold:  0.9,
      observed:   0.75,
      cohort:     Cohort::Learners(vec![4]),
    },
    metrics_before: [("completion_rate".to_string(), 0.75)].into(),
    trigger_date:   day(2),
    low_confidence: false,
    created_at:     t(4),
  }
}

#[tokio::test]
async fn pending_update_rewrites_trigger() {
  let s = seeded().await;
  let mut iv = s
    .insert_intervention(NewIntervention { low_confidence: true, ..new_intervention() })
    .await
    .unwrap();

  iv.low_confidence = false;
  iv.trigger_date = day(3);
  iv.parameters.observed = 0.5;
  iv.metrics_before = [("completion_rate".to_string(), 0.5)].into();
  let outcome = s.update_intervention(iv.clone(), InterventionStatus::Pending).await.unwrap();
  assert_eq!(outcome, CasOutcome::Committed(iv.clone()));

  let reloaded = s.intervention(iv.intervention_id).await.unwrap().unwrap();
  assert_eq!(reloaded, iv);
  assert_eq!(reloaded.status, InterventionStatus::Pending);
}

#[tokio::test]
async fn intervention_lifecycle_with_status_cas() {
  let s = seeded().await;
  let mut iv = s.insert_intervention(new_intervention()).await.unwrap();
  assert_eq!(iv.status, InterventionStatus::Pending);

  iv.transition(InterventionStatus::Scheduled, t(5)).unwrap();
  let outcome = s.update_intervention(iv.clone(), InterventionStatus::Pending).await.unwrap();
  assert!(matches!(outcome, CasOutcome::Committed(_)));

  // Someone else already moved it on.
  let outcome = s.update_intervention(iv.clone(), InterventionStatus::Pending).await.unwrap();
  assert_eq!(outcome, CasOutcome::Conflict);

  iv.transition(InterventionStatus::Executed, t(6)).unwrap();
  s.update_intervention(iv.clone(), InterventionStatus::Scheduled).await.unwrap();

  let result = NewInterventionResult::new(
    &iv,
    [("completion_rate".to_string(), 0.9)].into(),
    day(9),
    t(200),
  );
  let CasOutcome::Committed(stored) =
    s.record_intervention_result(iv.clone(), result.clone()).await.unwrap()
  else {
    panic!("executed intervention should be evaluable");
  };
  assert!((stored.improvement["completion_rate"] - 0.15).abs() < 1e-9);

  // Evaluating twice is refused.
  assert_eq!(
    s.record_intervention_result(iv.clone(), result).await.unwrap(),
    CasOutcome::Conflict
  );

  let reloaded = s.intervention(iv.intervention_id).await.unwrap().unwrap();
  assert_eq!(reloaded.status, InterventionStatus::Evaluated);
  assert_eq!(reloaded.evaluated_at, Some(t(200)));
  assert_eq!(reloaded.parameters.cohort, Cohort::Learners(vec![4]));
  assert_eq!(s.intervention_results(iv.intervention_id).await.unwrap().len(), 1);
  assert_eq!(s.interventions(1).await.unwrap().len(), 1);
  assert_eq!(s.evaluated_intervention_count(1, t(201)).await.unwrap(), 1);
  assert_eq!(s.evaluated_intervention_count(1, t(199)).await.unwrap(), 0);
}
