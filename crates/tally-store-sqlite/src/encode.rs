//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (nanoseconds, `Z`
//! suffix) so that lexical order matches chronological order. Dates are
//! `YYYY-MM-DD`. Nested structures (policies, metric bundles, grades) are
//! stored as compact JSON; simple enums as their snake_case names.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::Row;
use tally_core::{
  authoring::{Quiz, QuizQuestion},
  columns::GradeColumn,
  course_grade::{CourseGradeHistory, CourseGradeResult},
  gamification::{CompletionMarker, LearnerStats},
  intervention::{CourseIntervention, InterventionResult},
  quiz_result::QuizResult,
  rollup::{CourseAnalyticsRollup, CourseLORollup},
  scoring::QuestionAttempt,
};

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| Error::DateParse(e.to_string()))
}

/// Parse a snake_case enum discriminant.
pub fn decode_enum<T: FromStr>(column: &'static str, s: &str) -> Result<T> {
  s.parse()
    .map_err(|_| Error::UnknownValue { column, value: s.to_owned() })
}

// ─── Row types ───────────────────────────────────────────────────────────────
//
// Each `Raw*` holds the column values of one row exactly as read. Decoding
// happens outside the database thread so parse failures surface as this
// crate's `Error` rather than as a rusqlite error.

pub const QUIZ_COLUMNS: &str = "quiz_id, course_id, title, penalty_json";

pub struct RawQuiz {
  pub quiz_id:      i64,
  pub course_id:    i64,
  pub title:        String,
  pub penalty_json: String,
}

impl RawQuiz {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      quiz_id:      row.get(0)?,
      course_id:    row.get(1)?,
      title:        row.get(2)?,
      penalty_json: row.get(3)?,
    })
  }

  pub fn into_quiz(self) -> Result<Quiz> {
    Ok(Quiz {
      quiz_id:   self.quiz_id,
      course_id: self.course_id,
      title:     self.title,
      penalty:   serde_json::from_str(&self.penalty_json)?,
    })
  }
}

pub struct RawQuizQuestion {
  pub quiz_id:     i64,
  pub question_id: i64,
  pub added_at:    String,
  pub removed_at:  Option<String>,
}

impl RawQuizQuestion {
  pub fn into_quiz_question(self) -> Result<QuizQuestion> {
    Ok(QuizQuestion {
      quiz_id:     self.quiz_id,
      question_id: self.question_id,
      added_at:    decode_dt(&self.added_at)?,
      removed_at:  decode_opt_dt(self.removed_at)?,
    })
  }
}

pub struct RawColumn {
  pub column_id:        i64,
  pub course_id:        i64,
  pub name:             String,
  pub category:         String,
  pub weight:           Option<f64>,
  pub aggregation_json: String,
  pub required:         bool,
}

impl RawColumn {
  pub fn into_column(self) -> Result<GradeColumn> {
    Ok(GradeColumn {
      column_id:   self.column_id,
      course_id:   self.course_id,
      name:        self.name,
      category:    decode_enum("grade_columns.category", &self.category)?,
      weight:      self.weight,
      aggregation: serde_json::from_str(&self.aggregation_json)?,
      required:    self.required,
    })
  }
}

pub const ATTEMPT_COLUMNS: &str = "attempt_id, learner_id, quiz_id, question_id, answer_id, \
  is_correct, time_spent_secs, attempt_index, points_earned, created_at";

pub struct RawAttempt {
  pub attempt_id:      i64,
  pub learner_id:      i64,
  pub quiz_id:         i64,
  pub question_id:     i64,
  pub answer_id:       Option<i64>,
  pub is_correct:      bool,
  pub time_spent_secs: f64,
  pub attempt_index:   u32,
  pub points_earned:   f64,
  pub created_at:      String,
}

impl RawAttempt {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      attempt_id:      row.get(0)?,
      learner_id:      row.get(1)?,
      quiz_id:         row.get(2)?,
      question_id:     row.get(3)?,
      answer_id:       row.get(4)?,
      is_correct:      row.get(5)?,
      time_spent_secs: row.get(6)?,
      attempt_index:   row.get(7)?,
      points_earned:   row.get(8)?,
      created_at:      row.get(9)?,
    })
  }

  pub fn into_attempt(self) -> Result<QuestionAttempt> {
    Ok(QuestionAttempt {
      attempt_id:      self.attempt_id,
      learner_id:      self.learner_id,
      quiz_id:         self.quiz_id,
      question_id:     self.question_id,
      answer_id:       self.answer_id,
      is_correct:      self.is_correct,
      time_spent_secs: self.time_spent_secs,
      attempt_index:   self.attempt_index,
      points_earned:   self.points_earned,
      created_at:      decode_dt(&self.created_at)?,
    })
  }
}

pub const QUIZ_RESULT_COLUMNS: &str = "learner_id, quiz_id, status, raw_total_points, \
  max_points, bonuses_total, score, completion_time, synced_at, attempt_count, \
  last_attempt_id, version";

pub struct RawQuizResult {
  pub learner_id:       i64,
  pub quiz_id:          i64,
  pub status:           String,
  pub raw_total_points: f64,
  pub max_points:       f64,
  pub bonuses_total:    f64,
  pub score:            f64,
  pub completion_time:  Option<String>,
  pub synced_at:        String,
  pub attempt_count:    u32,
  pub last_attempt_id:  Option<i64>,
  pub version:          i64,
}

impl RawQuizResult {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      learner_id:       row.get(0)?,
      quiz_id:          row.get(1)?,
      status:           row.get(2)?,
      raw_total_points: row.get(3)?,
      max_points:       row.get(4)?,
      bonuses_total:    row.get(5)?,
      score:            row.get(6)?,
      completion_time:  row.get(7)?,
      synced_at:        row.get(8)?,
      attempt_count:    row.get(9)?,
      last_attempt_id:  row.get(10)?,
      version:          row.get(11)?,
    })
  }

  pub fn into_result(self) -> Result<QuizResult> {
    Ok(QuizResult {
      learner_id:       self.learner_id,
      quiz_id:          self.quiz_id,
      status:           decode_enum("quiz_results.status", &self.status)?,
      raw_total_points: self.raw_total_points,
      max_points:       self.max_points,
      bonuses_total:    self.bonuses_total,
      score:            self.score,
      completion_time:  decode_opt_dt(self.completion_time)?,
      synced_at:        decode_dt(&self.synced_at)?,
      attempt_count:    self.attempt_count,
      last_attempt_id:  self.last_attempt_id,
      version:          self.version,
    })
  }
}

pub const COURSE_GRADE_COLUMNS: &str = "learner_id, course_id, grade_json, columns_json, \
  computed_at, value_since, last_error, version";

pub struct RawCourseGrade {
  pub learner_id:   i64,
  pub course_id:    i64,
  pub grade_json:   String,
  pub columns_json: String,
  pub computed_at:  String,
  pub value_since:  String,
  pub last_error:   Option<String>,
  pub version:      i64,
}

impl RawCourseGrade {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      learner_id:   row.get(0)?,
      course_id:    row.get(1)?,
      grade_json:   row.get(2)?,
      columns_json: row.get(3)?,
      computed_at:  row.get(4)?,
      value_since:  row.get(5)?,
      last_error:   row.get(6)?,
      version:      row.get(7)?,
    })
  }

  pub fn into_grade(self) -> Result<CourseGradeResult> {
    Ok(CourseGradeResult {
      learner_id:  self.learner_id,
      course_id:   self.course_id,
      columns:     serde_json::from_str(&self.columns_json)?,
      grade:       serde_json::from_str(&self.grade_json)?,
      computed_at: decode_dt(&self.computed_at)?,
      value_since: decode_dt(&self.value_since)?,
      last_error:  self.last_error,
      version:     self.version,
    })
  }
}

pub const HISTORY_COLUMNS: &str = "history_id, learner_id, course_id, prior_grade_json, \
  prior_columns_json, prior_value_since, prior_computed_at, changed_at";

pub struct RawGradeHistory {
  pub history_id:         i64,
  pub learner_id:         i64,
  pub course_id:          i64,
  pub prior_grade_json:   String,
  pub prior_columns_json: String,
  pub prior_value_since:  String,
  pub prior_computed_at:  String,
  pub changed_at:         String,
}

impl RawGradeHistory {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      history_id:         row.get(0)?,
      learner_id:         row.get(1)?,
      course_id:          row.get(2)?,
      prior_grade_json:   row.get(3)?,
      prior_columns_json: row.get(4)?,
      prior_value_since:  row.get(5)?,
      prior_computed_at:  row.get(6)?,
      changed_at:         row.get(7)?,
    })
  }

  pub fn into_history(self) -> Result<CourseGradeHistory> {
    Ok(CourseGradeHistory {
      history_id:        self.history_id,
      learner_id:        self.learner_id,
      course_id:         self.course_id,
      prior_grade:       serde_json::from_str(&self.prior_grade_json)?,
      prior_columns:     serde_json::from_str(&self.prior_columns_json)?,
      prior_value_since: decode_dt(&self.prior_value_since)?,
      prior_computed_at: decode_dt(&self.prior_computed_at)?,
      changed_at:        decode_dt(&self.changed_at)?,
    })
  }
}

pub const ROLLUP_COLUMNS: &str =
  "course_id, snapshot_date, metrics_json, sample_size, confidence, low_confidence, computed_at";

pub struct RawRollup {
  pub course_id:      i64,
  pub snapshot_date:  String,
  pub metrics_json:   String,
  pub sample_size:    u32,
  pub confidence:     f64,
  pub low_confidence: bool,
  pub computed_at:    String,
}

impl RawRollup {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      course_id:      row.get(0)?,
      snapshot_date:  row.get(1)?,
      metrics_json:   row.get(2)?,
      sample_size:    row.get(3)?,
      confidence:     row.get(4)?,
      low_confidence: row.get(5)?,
      computed_at:    row.get(6)?,
    })
  }

  pub fn into_rollup(self) -> Result<CourseAnalyticsRollup> {
    Ok(CourseAnalyticsRollup {
      course_id:      self.course_id,
      snapshot_date:  decode_date(&self.snapshot_date)?,
      metrics:        serde_json::from_str(&self.metrics_json)?,
      sample_size:    self.sample_size,
      confidence:     self.confidence,
      low_confidence: self.low_confidence,
      computed_at:    decode_dt(&self.computed_at)?,
    })
  }
}

pub const LO_ROLLUP_COLUMNS: &str = "course_id, objective_id, snapshot_date, metrics_json, \
  sample_size, confidence, low_confidence, computed_at";

pub struct RawLORollup {
  pub course_id:      i64,
  pub objective_id:   i64,
  pub snapshot_date:  String,
  pub metrics_json:   String,
  pub sample_size:    u32,
  pub confidence:     f64,
  pub low_confidence: bool,
  pub computed_at:    String,
}

impl RawLORollup {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      course_id:      row.get(0)?,
      objective_id:   row.get(1)?,
      snapshot_date:  row.get(2)?,
      metrics_json:   row.get(3)?,
      sample_size:    row.get(4)?,
      confidence:     row.get(5)?,
      low_confidence: row.get(6)?,
      computed_at:    row.get(7)?,
    })
  }

  pub fn into_rollup(self) -> Result<CourseLORollup> {
    Ok(CourseLORollup {
      course_id:      self.course_id,
      objective_id:   self.objective_id,
      snapshot_date:  decode_date(&self.snapshot_date)?,
      metrics:        serde_json::from_str(&self.metrics_json)?,
      sample_size:    self.sample_size,
      confidence:     self.confidence,
      low_confidence: self.low_confidence,
      computed_at:    decode_dt(&self.computed_at)?,
    })
  }
}

pub struct RawStats {
  pub learner_id:        i64,
  pub total_points:      f64,
  pub current_level:     u32,
  pub experience_points: f64,
  pub current_streak:    u32,
  pub best_streak:       u32,
  pub perfect_scores:    u32,
  pub quizzes_completed: u32,
  pub avg_response_secs: f64,
  pub responses_counted: u32,
  pub updated_at:        Option<String>,
}

impl RawStats {
  pub fn into_stats(self) -> Result<LearnerStats> {
    Ok(LearnerStats {
      learner_id:        self.learner_id,
      total_points:      self.total_points,
      current_level:     self.current_level,
      experience_points: self.experience_points,
      current_streak:    self.current_streak,
      best_streak:       self.best_streak,
      perfect_scores:    self.perfect_scores,
      quizzes_completed: self.quizzes_completed,
      avg_response_secs: self.avg_response_secs,
      responses_counted: self.responses_counted,
      updated_at:        decode_opt_dt(self.updated_at)?,
    })
  }
}

pub struct RawMarker {
  pub learner_id:     i64,
  pub quiz_id:        i64,
  pub synced_at:      String,
  pub credited_raw:   f64,
  pub credited_bonus: f64,
}

impl RawMarker {
  pub fn into_marker(self) -> Result<CompletionMarker> {
    Ok(CompletionMarker {
      learner_id:     self.learner_id,
      quiz_id:        self.quiz_id,
      synced_at:      decode_dt(&self.synced_at)?,
      credited_raw:   self.credited_raw,
      credited_bonus: self.credited_bonus,
    })
  }
}

pub const INTERVENTION_COLUMNS: &str = "intervention_id, course_id, objective_id, kind, \
  target_group, status, parameters_json, metrics_before_json, trigger_date, low_confidence, \
  created_at, scheduled_at, executed_at, evaluated_at, cancelled_at";

pub struct RawIntervention {
  pub intervention_id:     i64,
  pub course_id:           i64,
  pub objective_id:        Option<i64>,
  pub kind:                String,
  pub target_group:        String,
  pub status:              String,
  pub parameters_json:     String,
  pub metrics_before_json: String,
  pub trigger_date:        String,
  pub low_confidence:      bool,
  pub created_at:          String,
  pub scheduled_at:        Option<String>,
  pub executed_at:         Option<String>,
  pub evaluated_at:        Option<String>,
  pub cancelled_at:        Option<String>,
}

impl RawIntervention {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      intervention_id:     row.get(0)?,
      course_id:           row.get(1)?,
      objective_id:        row.get(2)?,
      kind:                row.get(3)?,
      target_group:        row.get(4)?,
      status:              row.get(5)?,
      parameters_json:     row.get(6)?,
      metrics_before_json: row.get(7)?,
      trigger_date:        row.get(8)?,
      low_confidence:      row.get(9)?,
      created_at:          row.get(10)?,
      scheduled_at:        row.get(11)?,
      executed_at:         row.get(12)?,
      evaluated_at:        row.get(13)?,
      cancelled_at:        row.get(14)?,
    })
  }

  pub fn into_intervention(self) -> Result<CourseIntervention> {
    Ok(CourseIntervention {
      intervention_id: self.intervention_id,
      course_id:       self.course_id,
      objective_id:    self.objective_id,
      kind:            decode_enum("interventions.kind", &self.kind)?,
      target_group:    decode_enum("interventions.target_group", &self.target_group)?,
      status:          decode_enum("interventions.status", &self.status)?,
      parameters:      serde_json::from_str(&self.parameters_json)?,
      metrics_before:  serde_json::from_str(&self.metrics_before_json)?,
      trigger_date:    decode_date(&self.trigger_date)?,
      low_confidence:  self.low_confidence,
      created_at:      decode_dt(&self.created_at)?,
      scheduled_at:    decode_opt_dt(self.scheduled_at)?,
      executed_at:     decode_opt_dt(self.executed_at)?,
      evaluated_at:    decode_opt_dt(self.evaluated_at)?,
      cancelled_at:    decode_opt_dt(self.cancelled_at)?,
    })
  }
}

pub const INTERVENTION_RESULT_COLUMNS: &str = "result_id, intervention_id, metrics_before_json, \
  metrics_after_json, improvement_json, after_date, evaluated_at";

pub struct RawInterventionResult {
  pub result_id:           i64,
  pub intervention_id:     i64,
  pub metrics_before_json: String,
  pub metrics_after_json:  String,
  pub improvement_json:    String,
  pub after_date:          String,
  pub evaluated_at:        String,
}

impl RawInterventionResult {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      result_id:           row.get(0)?,
      intervention_id:     row.get(1)?,
      metrics_before_json: row.get(2)?,
      metrics_after_json:  row.get(3)?,
      improvement_json:    row.get(4)?,
      after_date:          row.get(5)?,
      evaluated_at:        row.get(6)?,
    })
  }

  pub fn into_result(self) -> Result<InterventionResult> {
    Ok(InterventionResult {
      result_id:       self.result_id,
      intervention_id: self.intervention_id,
      metrics_before:  serde_json::from_str(&self.metrics_before_json)?,
      metrics_after:   serde_json::from_str(&self.metrics_after_json)?,
      improvement:     serde_json::from_str(&self.improvement_json)?,
      after_date:      decode_date(&self.after_date)?,
      evaluated_at:    decode_dt(&self.evaluated_at)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamps_sort_lexically() {
    let a = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let b = a + chrono::TimeDelta::nanoseconds(1_500);
    let (ea, eb) = (encode_dt(a), encode_dt(b));
    assert_eq!(ea.len(), eb.len());
    assert!(ea < eb);
    assert_eq!(decode_dt(&eb).unwrap(), b);
  }

  #[test]
  fn unknown_enum_value_is_reported() {
    let err = decode_enum::<tally_core::quiz_result::QuizStatus>("quiz_results.status", "paused")
      .unwrap_err();
    assert!(matches!(err, Error::UnknownValue { column: "quiz_results.status", .. }));
  }
}
