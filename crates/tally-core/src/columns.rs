//! Grade columns and the quiz → column lookup.
//!
//! A column is a named, weighted bucket of quizzes (e.g. "process",
//! "midterm", "final"). Each quiz feeds at most one column of its course.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
  ids::{ColumnId, CourseId, EntityRef, QuizId},
  quiz_result::{IntegrityIssue, QuizResult},
};

// ─── Column definitions ──────────────────────────────────────────────────────

/// Which share of a [`GradeConfig`](crate::course_grade::GradeConfig) a column
/// draws its weight from when the column itself has none.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ColumnCategory {
  Process,
  Midterm,
  Final,
  Other,
}

/// How the scores of the quizzes in one column combine into a column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ColumnAggregation {
  /// Mean of normalized quiz scores.
  #[default]
  Average,
  /// Mean of the `n` best normalized quiz scores.
  BestOfN { n: u32 },
  /// Total earned points over total achievable points.
  Sum,
}

impl ColumnAggregation {
  /// Combine the scored results of one column. Returns `None` when there is
  /// nothing to score.
  pub fn evaluate(&self, results: &[&QuizResult]) -> Option<f64> {
    if results.is_empty() {
      return None;
    }
    match self {
      Self::Average => Some(mean(results.iter().map(|r| r.score))),
      Self::BestOfN { n } => {
        let mut scores: Vec<f64> = results.iter().map(|r| r.score).collect();
        scores.sort_by(|a, b| b.total_cmp(a));
        let take = usize::try_from((*n).max(1)).unwrap_or(usize::MAX);
        Some(mean(scores.into_iter().take(take)))
      }
      Self::Sum => {
        let max: f64 = results.iter().map(|r| r.max_points.max(0.0)).sum();
        if max <= 0.0 {
          return None;
        }
        let earned: f64 = results.iter().map(|r| r.earned_points()).sum();
        Some((earned / max).clamp(0.0, 1.0))
      }
    }
  }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
  let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
  if count == 0 { 0.0 } else { sum / count as f64 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeColumn {
  pub column_id:   ColumnId,
  pub course_id:   CourseId,
  pub name:        String,
  pub category:    ColumnCategory,
  /// Explicit weight percentage. When every column of a course has one, these
  /// override the course's `GradeConfig`.
  pub weight:      Option<f64>,
  #[serde(default)]
  pub aggregation: ColumnAggregation,
  /// A required column must have at least one quiz mapped to it.
  #[serde(default)]
  pub required:    bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnQuizMapping {
  pub column_id: ColumnId,
  pub quiz_id:   QuizId,
}

// ─── Lookup ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColumnLookup<'a> {
  Mapped(&'a GradeColumn),
  /// No mapping exists; the quiz is left out of the course grade.
  Unmapped,
}

/// The resolved quiz → column mapping of one course.
#[derive(Debug, Clone)]
pub struct ColumnMap<'a> {
  columns:   BTreeMap<ColumnId, &'a GradeColumn>,
  by_quiz:   BTreeMap<QuizId, ColumnId>,
  conflicts: Vec<IntegrityIssue>,
}

impl<'a> ColumnMap<'a> {
  /// Build the lookup for `course_id`. Columns of other courses and mappings
  /// to unknown columns are ignored. If a quiz is mapped to several columns
  /// the lowest column id wins and the rest are reported as conflicts.
  pub fn new(
    course_id: CourseId,
    columns:   &'a [GradeColumn],
    mappings:  &[ColumnQuizMapping],
  ) -> Self {
    let columns: BTreeMap<ColumnId, &GradeColumn> = columns
      .iter()
      .filter(|c| c.course_id == course_id)
      .map(|c| (c.column_id, c))
      .collect();

    let mut sorted: Vec<ColumnQuizMapping> = mappings
      .iter()
      .copied()
      .filter(|m| columns.contains_key(&m.column_id))
      .collect();
    sorted.sort_by_key(|m| (m.quiz_id, m.column_id));
    sorted.dedup();

    let mut by_quiz = BTreeMap::new();
    let mut conflicts = Vec::new();
    for m in sorted {
      if let Some(&kept) = by_quiz.get(&m.quiz_id) {
        conflicts.push(IntegrityIssue {
          entity: EntityRef::Quiz { id: m.quiz_id },
          detail: format!(
            "mapped to columns {kept} and {}; only {kept} is used",
            m.column_id
          ),
        });
        continue;
      }
      by_quiz.insert(m.quiz_id, m.column_id);
    }

    Self { columns, by_quiz, conflicts }
  }

  pub fn lookup(&self, quiz_id: QuizId) -> ColumnLookup<'a> {
    self
      .by_quiz
      .get(&quiz_id)
      .and_then(|id| self.columns.get(id))
      .map_or(ColumnLookup::Unmapped, |c| ColumnLookup::Mapped(*c))
  }

  pub fn columns(&self) -> impl Iterator<Item = &'a GradeColumn> + '_ {
    self.columns.values().copied()
  }

  pub fn mapped_quizzes(&self) -> impl Iterator<Item = QuizId> + '_ {
    self.by_quiz.keys().copied()
  }

  pub fn quiz_count(&self, column_id: ColumnId) -> usize {
    self.by_quiz.values().filter(|&&c| c == column_id).count()
  }

  /// Quizzes among `quizzes` that no column claims.
  pub fn unmapped(&self, quizzes: impl IntoIterator<Item = QuizId>) -> Vec<QuizId> {
    quizzes
      .into_iter()
      .filter(|q| !self.by_quiz.contains_key(q))
      .collect()
  }

  pub fn conflicts(&self) -> &[IntegrityIssue] { &self.conflicts }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::*;
  use crate::quiz_result::QuizStatus;

  fn column(id: ColumnId, category: ColumnCategory) -> GradeColumn {
    GradeColumn {
      column_id: id,
      course_id: 1,
      name: format!("col{id}"),
      category,
      weight: None,
      aggregation: ColumnAggregation::Average,
      required: false,
    }
  }

  fn result(quiz_id: QuizId, raw: f64, max: f64) -> QuizResult {
    QuizResult {
      learner_id: 1,
      quiz_id,
      status: QuizStatus::Completed,
      raw_total_points: raw,
      max_points: max,
      bonuses_total: 0.0,
      score: raw / max,
      completion_time: None,
      synced_at: Utc::now(),
      attempt_count: 1,
      last_attempt_id: None,
      version: 1,
    }
  }

  #[test]
  fn lookup_resolves_mapped_and_unmapped() {
    let columns = vec![column(10, ColumnCategory::Process), column(11, ColumnCategory::Final)];
    let mappings = vec![
      ColumnQuizMapping { column_id: 10, quiz_id: 100 },
      ColumnQuizMapping { column_id: 11, quiz_id: 101 },
    ];
    let map = ColumnMap::new(1, &columns, &mappings);

    assert!(matches!(map.lookup(100), ColumnLookup::Mapped(c) if c.column_id == 10));
    assert_eq!(map.lookup(999), ColumnLookup::Unmapped);
    assert_eq!(map.unmapped([100, 101, 102]), vec![102]);
  }

  #[test]
  fn duplicate_mapping_keeps_lowest_column() {
    let columns = vec![column(10, ColumnCategory::Process), column(11, ColumnCategory::Final)];
    let mappings = vec![
      ColumnQuizMapping { column_id: 11, quiz_id: 100 },
      ColumnQuizMapping { column_id: 10, quiz_id: 100 },
    ];
    let map = ColumnMap::new(1, &columns, &mappings);
    assert!(matches!(map.lookup(100), ColumnLookup::Mapped(c) if c.column_id == 10));
    assert_eq!(map.conflicts().len(), 1);
  }

  #[test]
  fn foreign_columns_are_ignored() {
    let mut other = column(20, ColumnCategory::Process);
    other.course_id = 2;
    let columns = vec![other];
    let mappings = vec![ColumnQuizMapping { column_id: 20, quiz_id: 100 }];
    let map = ColumnMap::new(1, &columns, &mappings);
    assert_eq!(map.lookup(100), ColumnLookup::Unmapped);
  }

  #[test]
  fn aggregation_modes() {
    let a = result(1, 10.0, 10.0);
    let b = result(2, 5.0, 10.0);
    let c = result(3, 0.0, 20.0);
    let rs = [&a, &b, &c];

    let avg = ColumnAggregation::Average.evaluate(&rs).unwrap();
    assert!((avg - 0.5).abs() < 1e-9);

    let best = ColumnAggregation::BestOfN { n: 2 }.evaluate(&rs).unwrap();
    assert!((best - 0.75).abs() < 1e-9);

    let sum = ColumnAggregation::Sum.evaluate(&rs).unwrap();
    assert!((sum - 15.0 / 40.0).abs() < 1e-9);

    assert_eq!(ColumnAggregation::Average.evaluate(&[]), None);
  }
}
