//! The `GradeStore` trait: the persistence interface the engine reads and
//! writes through.
//!
//! The trait is implemented by storage backends (e.g. `tally-store-sqlite`).
//! `tally-engine` depends on this abstraction, not on any concrete backend.

use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};

use crate::{
  authoring::{Course, Question, Quiz, QuizQuestion},
  columns::{ColumnQuizMapping, GradeColumn},
  course_grade::{CourseGradeHistory, CourseGradeResult, GradeConfig, NewGradeHistory},
  gamification::{CompletionMarker, LearnerStats},
  ids::{CourseId, InterventionId, LearnerId, QuestionId, QuizId},
  intervention::{
    CourseAnalyticsConfig, CourseIntervention, InterventionResult, InterventionStatus,
    NewIntervention, NewInterventionResult,
  },
  quiz_result::QuizResult,
  rollup::{CourseAnalyticsRollup, CourseLORollup},
  scoring::{NewAttempt, QuestionAttempt},
};

/// Outcome of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome<T> {
  /// The write went through; carries the stored record with its new version.
  Committed(T),
  /// Another writer got there first. Nothing was written.
  Conflict,
}

/// Abstraction over a Tally grade store backend.
///
/// Authoring data (courses, quizzes, questions, columns, configs) is read
/// only. Attempts and grade history are append-only. Derived records (quiz
/// results, course grades) are written with compare-and-swap on a version
/// counter; `expected_version: None` means "must not exist yet".
///
/// All methods return `Send` futures so the trait can be used from
/// multi-threaded tokio workers.
pub trait GradeStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Authoring data ────────────────────────────────────────────────────

  fn course(
    &self,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Option<Course>, Self::Error>> + Send + '_;

  /// All courses, including deleted ones.
  fn list_courses(&self) -> impl Future<Output = Result<Vec<Course>, Self::Error>> + Send + '_;

  /// Learners enrolled in a course, ascending.
  fn course_learners(
    &self,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Vec<LearnerId>, Self::Error>> + Send + '_;

  fn quiz(
    &self,
    quiz_id: QuizId,
  ) -> impl Future<Output = Result<Option<Quiz>, Self::Error>> + Send + '_;

  fn course_quizzes(
    &self,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Vec<Quiz>, Self::Error>> + Send + '_;

  /// Every assignment of a question to the quiz, past and current.
  fn quiz_questions(
    &self,
    quiz_id: QuizId,
  ) -> impl Future<Output = Result<Vec<QuizQuestion>, Self::Error>> + Send + '_;

  /// Question definitions by id. Unknown ids are simply absent.
  fn questions(
    &self,
    ids: Vec<QuestionId>,
  ) -> impl Future<Output = Result<Vec<Question>, Self::Error>> + Send + '_;

  fn grade_columns(
    &self,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Vec<GradeColumn>, Self::Error>> + Send + '_;

  /// Mappings for every column of the course.
  fn column_mappings(
    &self,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Vec<ColumnQuizMapping>, Self::Error>> + Send + '_;

  fn grade_config(
    &self,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Option<GradeConfig>, Self::Error>> + Send + '_;

  fn analytics_config(
    &self,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Option<CourseAnalyticsConfig>, Self::Error>> + Send + '_;

  // ── Attempts (append-only) ────────────────────────────────────────────

  /// Persist a scored attempt. Returns `None` without writing if the
  /// `(learner, quiz, question, attempt_index)` key already exists.
  fn insert_attempt(
    &self,
    attempt: NewAttempt,
    points_earned: f64,
    created_at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Option<QuestionAttempt>, Self::Error>> + Send + '_;

  /// All attempts of a learner in a quiz, ordered by id.
  fn attempts(
    &self,
    learner_id: LearnerId,
    quiz_id: QuizId,
  ) -> impl Future<Output = Result<Vec<QuestionAttempt>, Self::Error>> + Send + '_;

  /// All attempts of a learner across the given quizzes, ordered by id.
  fn learner_attempts(
    &self,
    learner_id: LearnerId,
    quiz_ids: Vec<QuizId>,
  ) -> impl Future<Output = Result<Vec<QuestionAttempt>, Self::Error>> + Send + '_;

  // ── Quiz results ──────────────────────────────────────────────────────

  fn quiz_result(
    &self,
    learner_id: LearnerId,
    quiz_id: QuizId,
  ) -> impl Future<Output = Result<Option<QuizResult>, Self::Error>> + Send + '_;

  fn quiz_results(
    &self,
    learner_id: LearnerId,
    quiz_ids: Vec<QuizId>,
  ) -> impl Future<Output = Result<Vec<QuizResult>, Self::Error>> + Send + '_;

  /// Compare-and-swap save. The committed record carries the new version.
  fn save_quiz_result(
    &self,
    result: QuizResult,
    expected_version: Option<i64>,
  ) -> impl Future<Output = Result<CasOutcome<QuizResult>, Self::Error>> + Send + '_;

  // ── Course grades ─────────────────────────────────────────────────────

  fn course_grade(
    &self,
    learner_id: LearnerId,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Option<CourseGradeResult>, Self::Error>> + Send + '_;

  fn course_grades(
    &self,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Vec<CourseGradeResult>, Self::Error>> + Send + '_;

  /// Compare-and-swap save. When `history` is given it is appended in the
  /// same transaction; on conflict neither is written.
  fn save_course_grade(
    &self,
    result: CourseGradeResult,
    expected_version: Option<i64>,
    history: Option<NewGradeHistory>,
  ) -> impl Future<Output = Result<CasOutcome<CourseGradeResult>, Self::Error>> + Send + '_;

  /// History rows of one learner's grade, ordered by `changed_at`.
  fn course_grade_history(
    &self,
    learner_id: LearnerId,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Vec<CourseGradeHistory>, Self::Error>> + Send + '_;

  /// History rows of every learner in a course, ordered by `changed_at`.
  fn course_grade_history_for_course(
    &self,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Vec<CourseGradeHistory>, Self::Error>> + Send + '_;

  // ── Rollups ───────────────────────────────────────────────────────────

  /// Upsert a course rollup and replace its objective rollups for the same
  /// date, atomically.
  fn save_rollups(
    &self,
    rollup: CourseAnalyticsRollup,
    lo_rollups: Vec<CourseLORollup>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn rollup(
    &self,
    course_id: CourseId,
    date: NaiveDate,
  ) -> impl Future<Output = Result<Option<CourseAnalyticsRollup>, Self::Error>> + Send + '_;

  fn latest_rollup(
    &self,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Option<CourseAnalyticsRollup>, Self::Error>> + Send + '_;

  /// The earliest rollup dated on or after `date`.
  fn first_rollup_on_or_after(
    &self,
    course_id: CourseId,
    date: NaiveDate,
  ) -> impl Future<Output = Result<Option<CourseAnalyticsRollup>, Self::Error>> + Send + '_;

  fn lo_rollups(
    &self,
    course_id: CourseId,
    date: NaiveDate,
  ) -> impl Future<Output = Result<Vec<CourseLORollup>, Self::Error>> + Send + '_;

  // ── Gamification ──────────────────────────────────────────────────────

  fn learner_stats(
    &self,
    learner_id: LearnerId,
  ) -> impl Future<Output = Result<Option<LearnerStats>, Self::Error>> + Send + '_;

  fn completion_marker(
    &self,
    learner_id: LearnerId,
    quiz_id: QuizId,
  ) -> impl Future<Output = Result<Option<CompletionMarker>, Self::Error>> + Send + '_;

  /// Upsert stats and the completion marker together.
  fn save_gamification(
    &self,
    stats: LearnerStats,
    marker: CompletionMarker,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  // ── Interventions ─────────────────────────────────────────────────────

  fn interventions(
    &self,
    course_id: CourseId,
  ) -> impl Future<Output = Result<Vec<CourseIntervention>, Self::Error>> + Send + '_;

  fn intervention(
    &self,
    id: InterventionId,
  ) -> impl Future<Output = Result<Option<CourseIntervention>, Self::Error>> + Send + '_;

  fn insert_intervention(
    &self,
    intervention: NewIntervention,
  ) -> impl Future<Output = Result<CourseIntervention, Self::Error>> + Send + '_;

  /// Write the intervention back if its stored status is still
  /// `expected_status`.
  fn update_intervention(
    &self,
    intervention: CourseIntervention,
    expected_status: InterventionStatus,
  ) -> impl Future<Output = Result<CasOutcome<CourseIntervention>, Self::Error>> + Send + '_;

  /// Move an executed intervention to evaluated and store its result, in
  /// one transaction.
  fn record_intervention_result(
    &self,
    intervention: CourseIntervention,
    result: NewInterventionResult,
  ) -> impl Future<Output = Result<CasOutcome<InterventionResult>, Self::Error>> + Send + '_;

  fn intervention_results(
    &self,
    intervention_id: InterventionId,
  ) -> impl Future<Output = Result<Vec<InterventionResult>, Self::Error>> + Send + '_;

  /// Number of evaluated interventions of a course with a result recorded
  /// before `before`.
  fn evaluated_intervention_count(
    &self,
    course_id: CourseId,
    before: DateTime<Utc>,
  ) -> impl Future<Output = Result<u32, Self::Error>> + Send + '_;
}
