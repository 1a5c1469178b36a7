//! Course grades: weighted combination of grade-column values, with an
//! append-only history of every change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  columns::{ColumnCategory, ColumnLookup, ColumnMap, GradeColumn},
  ids::{ColumnId, CourseId, EntityRef, LearnerId},
  quiz_result::QuizResult,
  Error, Result,
};

/// Column weights are percentages and must add up to this.
pub const WEIGHT_TOTAL: f64 = 100.0;
const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Default tolerance below which a grade is considered unchanged.
pub const DEFAULT_GRADE_EPSILON: f64 = 1e-6;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Per-course category weights, used when columns carry no weights of their
/// own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeConfig {
  pub course_id:         CourseId,
  pub process_weight:    f64,
  #[serde(default)]
  pub midterm_weight:    f64,
  pub final_exam_weight: f64,
}

impl GradeConfig {
  pub fn weight_for(&self, category: ColumnCategory) -> Option<f64> {
    match category {
      ColumnCategory::Process => Some(self.process_weight),
      ColumnCategory::Midterm => Some(self.midterm_weight),
      ColumnCategory::Final => Some(self.final_exam_weight),
      ColumnCategory::Other => None,
    }
  }

  pub fn total(&self) -> f64 {
    self.process_weight + self.midterm_weight + self.final_exam_weight
  }
}

/// Resolve the effective weight of every column of a course.
///
/// Explicit column weights win when every column has one. With none set, the
/// course's [`GradeConfig`] weight for each category is split evenly across
/// that category's columns. Mixed setups, totals other than 100, and
/// required columns with no quizzes are configuration errors.
pub fn resolve_weights(
  course_id: CourseId,
  map:       &ColumnMap<'_>,
  config:    Option<&GradeConfig>,
) -> Result<BTreeMap<ColumnId, f64>> {
  let columns: Vec<&GradeColumn> = map.columns().collect();
  if columns.is_empty() {
    return Err(Error::configuration(course_id, "course has no grade columns"));
  }

  for column in &columns {
    if column.required && map.quiz_count(column.column_id) == 0 {
      return Err(Error::configuration(
        course_id,
        format!("required column '{}' has no quizzes mapped", column.name),
      ));
    }
    if let Some(w) = column.weight
      && (!w.is_finite() || w < 0.0)
    {
      return Err(Error::configuration(
        course_id,
        format!("column '{}' has invalid weight {w}", column.name),
      ));
    }
  }

  let weighted = columns.iter().filter(|c| c.weight.is_some()).count();
  let weights: BTreeMap<ColumnId, f64> = if weighted == columns.len() {
    columns
      .iter()
      .map(|c| (c.column_id, c.weight.unwrap_or_default()))
      .collect()
  } else if weighted == 0 {
    let Some(config) = config else {
      return Err(Error::configuration(
        course_id,
        "columns carry no weights and the course has no grade config",
      ));
    };
    if !within_total(config.total()) {
      return Err(Error::configuration(
        course_id,
        format!("grade config weights sum to {}, expected {WEIGHT_TOTAL}", config.total()),
      ));
    }
    let mut per_category: BTreeMap<ColumnCategory, usize> = BTreeMap::new();
    for c in &columns {
      *per_category.entry(c.category).or_default() += 1;
    }
    let mut weights = BTreeMap::new();
    for c in &columns {
      let Some(category_weight) = config.weight_for(c.category) else {
        return Err(Error::configuration(
          course_id,
          format!(
            "column '{}' is in category '{}' which the grade config does not weight",
            c.name, c.category
          ),
        ));
      };
      let share = per_category.get(&c.category).copied().unwrap_or(1) as f64;
      weights.insert(c.column_id, category_weight / share);
    }
    weights
  } else {
    return Err(Error::configuration(
      course_id,
      format!("{weighted} of {} columns carry explicit weights", columns.len()),
    ));
  };

  let total: f64 = weights.values().sum();
  if !within_total(total) {
    return Err(Error::configuration(
      course_id,
      format!("column weights sum to {total}, expected {WEIGHT_TOTAL}"),
    ));
  }
  Ok(weights)
}

fn within_total(total: f64) -> bool { (total - WEIGHT_TOTAL).abs() <= WEIGHT_TOLERANCE }

// ─── Grade values ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IncompleteReason {
  /// No column has a scored quiz yet.
  NoScoredColumns,
  /// Grading configuration could not be applied.
  Configuration { detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Grade {
  Graded { value: f64 },
  /// No numeric grade can be given yet.
  Incomplete { reason: IncompleteReason },
}

impl Grade {
  pub fn value(&self) -> Option<f64> {
    match self {
      Self::Graded { value } => Some(*value),
      Self::Incomplete { .. } => None,
    }
  }

  /// Whether moving from `self` to `next` is a change worth recording.
  /// Two incomplete grades are equal regardless of reason.
  pub fn differs_from(&self, next: &Grade, epsilon: f64) -> bool {
    match (self.value(), next.value()) {
      (Some(a), Some(b)) => (a - b).abs() > epsilon,
      (None, None) => false,
      _ => true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnValue {
  pub column_id:      ColumnId,
  pub name:           String,
  pub weight:         f64,
  /// `None` when the column has no scored quiz.
  pub value:          Option<f64>,
  pub scored_quizzes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseGradeResult {
  pub learner_id:  LearnerId,
  pub course_id:   CourseId,
  pub columns:     Vec<ColumnValue>,
  pub grade:       Grade,
  pub computed_at: DateTime<Utc>,
  /// When the current grade value took effect. Unchanged recomputations
  /// move `computed_at` but not this.
  pub value_since: DateTime<Utc>,
  /// The last configuration error, kept for operators.
  pub last_error:  Option<String>,
  pub version:     i64,
}

impl CourseGradeResult {
  pub fn entity(&self) -> EntityRef {
    EntityRef::CourseGrade { learner: self.learner_id, course: self.course_id }
  }

  /// The history row that preserves this state when it is replaced at
  /// `changed_at`.
  pub fn snapshot(&self, changed_at: DateTime<Utc>) -> NewGradeHistory {
    NewGradeHistory {
      learner_id:        self.learner_id,
      course_id:         self.course_id,
      prior_grade:       self.grade.clone(),
      prior_columns:     self.columns.clone(),
      prior_value_since: self.value_since,
      prior_computed_at: self.computed_at,
      changed_at,
    }
  }
}

/// A history row about to be appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGradeHistory {
  pub learner_id:        LearnerId,
  pub course_id:         CourseId,
  pub prior_grade:       Grade,
  pub prior_columns:     Vec<ColumnValue>,
  pub prior_value_since: DateTime<Utc>,
  pub prior_computed_at: DateTime<Utc>,
  pub changed_at:        DateTime<Utc>,
}

/// A persisted, immutable history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseGradeHistory {
  pub history_id:        i64,
  pub learner_id:        LearnerId,
  pub course_id:         CourseId,
  pub prior_grade:       Grade,
  pub prior_columns:     Vec<ColumnValue>,
  pub prior_value_since: DateTime<Utc>,
  pub prior_computed_at: DateTime<Utc>,
  pub changed_at:        DateTime<Utc>,
}

// ─── Computation ─────────────────────────────────────────────────────────────

/// Compute per-column values and the combined grade for one learner.
///
/// Only scored (completed) results of mapped quizzes count. Columns without
/// a scored quiz drop out of both numerator and denominator; a zero
/// denominator yields [`Grade::Incomplete`].
pub fn compute_course_grade(
  map:     &ColumnMap<'_>,
  weights: &BTreeMap<ColumnId, f64>,
  results: &[QuizResult],
) -> (Vec<ColumnValue>, Grade) {
  let mut by_column: BTreeMap<ColumnId, Vec<&QuizResult>> = BTreeMap::new();
  for result in results.iter().filter(|r| r.is_scored()) {
    if let ColumnLookup::Mapped(column) = map.lookup(result.quiz_id) {
      by_column.entry(column.column_id).or_default().push(result);
    }
  }

  let columns: Vec<ColumnValue> = map
    .columns()
    .map(|column| {
      let scored = by_column.get(&column.column_id).map(Vec::as_slice).unwrap_or(&[]);
      ColumnValue {
        column_id:      column.column_id,
        name:           column.name.clone(),
        weight:         weights.get(&column.column_id).copied().unwrap_or(0.0),
        value:          column.aggregation.evaluate(scored),
        scored_quizzes: scored.len(),
      }
    })
    .collect();

  let grade = combine(&columns);
  (columns, grade)
}

/// `Σ(value × weight) / Σ(weight)` over columns that have a value.
pub fn combine(columns: &[ColumnValue]) -> Grade {
  let (numerator, denominator) = columns
    .iter()
    .filter_map(|c| c.value.map(|v| (v, c.weight)))
    .fold((0.0, 0.0), |(n, d), (v, w)| (n + v * w, d + w));

  if denominator <= 0.0 {
    Grade::Incomplete { reason: IncompleteReason::NoScoredColumns }
  } else {
    Grade::Graded { value: numerator / denominator }
  }
}

/// The grade value in effect just before `cutoff`, reconstructed from the
/// current row and its history.
pub fn grade_as_of(
  current: Option<&CourseGradeResult>,
  history: &[CourseGradeHistory],
  cutoff:  DateTime<Utc>,
) -> Option<f64> {
  let current = current
    .filter(|c| c.value_since < cutoff)
    .map(|c| (c.value_since, c.grade.value()));
  let past = history
    .iter()
    .filter(|h| h.prior_value_since < cutoff)
    .map(|h| (h.prior_value_since, h.prior_grade.value()));

  current
    .into_iter()
    .chain(past)
    .max_by_key(|(since, _)| *since)
    .and_then(|(_, value)| value)
}

#[cfg(test)]
mod tests {
  use chrono::{TimeDelta, TimeZone};

  use super::*;
  use crate::{
    columns::{ColumnAggregation, ColumnQuizMapping},
    quiz_result::QuizStatus,
  };

  fn column(id: ColumnId, category: ColumnCategory, weight: Option<f64>) -> GradeColumn {
    GradeColumn {
      column_id: id,
      course_id: 1,
      name: category.to_string(),
      category,
      weight,
      aggregation: ColumnAggregation::Average,
      required: false,
    }
  }

  fn result(quiz_id: i64, score: f64, status: QuizStatus) -> QuizResult {
    QuizResult {
      learner_id: 1,
      quiz_id,
      status,
      raw_total_points: score * 10.0,
      max_points: 10.0,
      bonuses_total: 0.0,
      score,
      completion_time: None,
      synced_at: Utc::now(),
      attempt_count: 1,
      last_attempt_id: None,
      version: 1,
    }
  }

  fn process_final() -> (Vec<GradeColumn>, Vec<ColumnQuizMapping>) {
    (
      vec![
        column(1, ColumnCategory::Process, Some(50.0)),
        column(2, ColumnCategory::Final, Some(50.0)),
      ],
      vec![
        ColumnQuizMapping { column_id: 1, quiz_id: 10 },
        ColumnQuizMapping { column_id: 2, quiz_id: 20 },
      ],
    )
  }

  #[test]
  fn weighted_combination_of_two_columns() {
    let (columns, mappings) = process_final();
    let map = ColumnMap::new(1, &columns, &mappings);
    let weights = resolve_weights(1, &map, None).unwrap();

    let results = [
      result(10, 0.8, QuizStatus::Completed),
      result(20, 0.6, QuizStatus::Completed),
    ];
    let (_, grade) = compute_course_grade(&map, &weights, &results);
    assert!((grade.value().unwrap() - 0.70).abs() < 1e-9);
  }

  #[test]
  fn missing_column_is_excluded_not_zeroed() {
    let (columns, mappings) = process_final();
    let map = ColumnMap::new(1, &columns, &mappings);
    let weights = resolve_weights(1, &map, None).unwrap();

    let results = [
      result(10, 0.8, QuizStatus::Completed),
      result(20, 0.1, QuizStatus::InProgress),
    ];
    let (cols, grade) = compute_course_grade(&map, &weights, &results);
    assert!((grade.value().unwrap() - 0.8).abs() < 1e-9);
    assert_eq!(cols[1].value, None);
  }

  #[test]
  fn no_scored_columns_is_incomplete() {
    let (columns, mappings) = process_final();
    let map = ColumnMap::new(1, &columns, &mappings);
    let weights = resolve_weights(1, &map, None).unwrap();
    let (_, grade) = compute_course_grade(&map, &weights, &[]);
    assert_eq!(
      grade,
      Grade::Incomplete { reason: IncompleteReason::NoScoredColumns }
    );
  }

  #[test]
  fn grade_config_fallback_splits_category_weight() {
    let columns = vec![
      column(1, ColumnCategory::Process, None),
      column(2, ColumnCategory::Process, None),
      column(3, ColumnCategory::Final, None),
    ];
    let map = ColumnMap::new(1, &columns, &[]);
    let config = GradeConfig {
      course_id:         1,
      process_weight:    60.0,
      midterm_weight:    0.0,
      final_exam_weight: 40.0,
    };
    let weights = resolve_weights(1, &map, Some(&config)).unwrap();
    assert_eq!(weights[&1], 30.0);
    assert_eq!(weights[&2], 30.0);
    assert_eq!(weights[&3], 40.0);
  }

  #[test]
  fn weights_not_summing_to_100_are_rejected() {
    let columns = vec![
      column(1, ColumnCategory::Process, Some(50.0)),
      column(2, ColumnCategory::Final, Some(40.0)),
    ];
    let map = ColumnMap::new(1, &columns, &[]);
    let err = resolve_weights(1, &map, None).unwrap_err();
    assert!(matches!(err, Error::Configuration { course_id: 1, .. }));
  }

  #[test]
  fn mixed_weights_are_rejected() {
    let columns = vec![
      column(1, ColumnCategory::Process, Some(100.0)),
      column(2, ColumnCategory::Final, None),
    ];
    let map = ColumnMap::new(1, &columns, &[]);
    assert!(resolve_weights(1, &map, None).is_err());
  }

  #[test]
  fn required_column_without_quizzes_is_rejected() {
    let mut columns = vec![
      column(1, ColumnCategory::Process, Some(50.0)),
      column(2, ColumnCategory::Final, Some(50.0)),
    ];
    columns[1].required = true;
    let mappings = vec![ColumnQuizMapping { column_id: 1, quiz_id: 10 }];
    let map = ColumnMap::new(1, &columns, &mappings);
    assert!(resolve_weights(1, &map, None).is_err());
  }

  #[test]
  fn differs_from_respects_epsilon() {
    let a = Grade::Graded { value: 0.5 };
    let b = Grade::Graded { value: 0.5 + 1e-9 };
    let inc = Grade::Incomplete { reason: IncompleteReason::NoScoredColumns };
    assert!(!a.differs_from(&b, DEFAULT_GRADE_EPSILON));
    assert!(a.differs_from(&inc, DEFAULT_GRADE_EPSILON));
    assert!(!inc.differs_from(
      &Grade::Incomplete {
        reason: IncompleteReason::Configuration { detail: "x".into() }
      },
      DEFAULT_GRADE_EPSILON
    ));
  }

  #[test]
  fn grade_as_of_walks_history() {
    let t = |h: i64| Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::hours(h);
    let current = CourseGradeResult {
      learner_id:  1,
      course_id:   1,
      columns:     vec![],
      grade:       Grade::Graded { value: 0.9 },
      computed_at: t(30),
      value_since: t(20),
      last_error:  None,
      version:     2,
    };
    let history = vec![CourseGradeHistory {
      history_id:        1,
      learner_id:        1,
      course_id:         1,
      prior_grade:       Grade::Graded { value: 0.4 },
      prior_columns:     vec![],
      prior_value_since: t(10),
      prior_computed_at: t(15),
      changed_at:        t(20),
    }];

    assert_eq!(grade_as_of(Some(&current), &history, t(5)), None);
    assert_eq!(grade_as_of(Some(&current), &history, t(12)), Some(0.4));
    assert_eq!(grade_as_of(Some(&current), &history, t(25)), Some(0.9));
  }
}
