//! Quiz results: the per-(learner, quiz) aggregate of question attempts.
//!
//! A result is never edited in place by clients. It is recomputed from the
//! full attempt set, and recomputing the same set always yields the same
//! result apart from `synced_at`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  authoring::{Question, Quiz, QuizQuestion},
  gamification::GamificationConfig,
  ids::{AttemptId, EntityRef, LearnerId, QuestionId, QuizId},
  scoring::QuestionAttempt,
};

/// Tolerance used when deciding whether a score is perfect.
const PERFECT_EPSILON: f64 = 1e-9;

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QuizStatus {
  InProgress,
  Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizResult {
  pub learner_id:       LearnerId,
  pub quiz_id:          QuizId,
  pub status:           QuizStatus,
  /// Sum of counted awarded points, before bonuses.
  pub raw_total_points: f64,
  /// Sum of achievable points over the questions that count for this learner.
  pub max_points:       f64,
  pub bonuses_total:    f64,
  /// `clamp(raw + bonuses, 0, max) / max`, or 0 when nothing is achievable.
  pub score:            f64,
  pub completion_time:  Option<DateTime<Utc>>,
  /// When this result was last recomputed from attempts.
  pub synced_at:        DateTime<Utc>,
  /// Number of attempt rows the result was computed from.
  pub attempt_count:    u32,
  pub last_attempt_id:  Option<AttemptId>,
  /// Optimistic concurrency version; assigned by the store.
  pub version:          i64,
}

impl QuizResult {
  pub fn entity(&self) -> EntityRef {
    EntityRef::QuizResult { learner: self.learner_id, quiz: self.quiz_id }
  }

  /// Only completed results feed course grades and streaks.
  pub fn is_scored(&self) -> bool { self.status == QuizStatus::Completed }

  pub fn is_perfect(&self) -> bool {
    self.max_points > 0.0 && self.score >= 1.0 - PERFECT_EPSILON
  }

  /// Identifies the attempt set a result was computed from.
  pub fn fingerprint(&self) -> AttemptFingerprint {
    AttemptFingerprint {
      attempt_count:   self.attempt_count,
      last_attempt_id: self.last_attempt_id,
    }
  }

  /// Whether `other` scores the same attempt set the same way. Ignores when
  /// each was synced and the stored version.
  pub fn same_outcome(&self, other: &QuizResult) -> bool {
    self.learner_id == other.learner_id
      && self.quiz_id == other.quiz_id
      && self.fingerprint() == other.fingerprint()
      && self.status == other.status
      && self.raw_total_points == other.raw_total_points
      && self.max_points == other.max_points
      && self.bonuses_total == other.bonuses_total
      && self.score == other.score
      && self.completion_time == other.completion_time
  }

  /// Raw points plus bonuses, clamped to what the quiz can award.
  pub fn earned_points(&self) -> f64 {
    (self.raw_total_points + self.bonuses_total).clamp(0.0, self.max_points.max(0.0))
  }
}

/// Attempts are append-only, so their count and highest id identify a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptFingerprint {
  pub attempt_count:   u32,
  pub last_attempt_id: Option<AttemptId>,
}

impl AttemptFingerprint {
  pub fn of(attempts: &[QuestionAttempt]) -> Self {
    Self {
      attempt_count:   u32::try_from(attempts.len()).unwrap_or(u32::MAX),
      last_attempt_id: attempts.iter().map(|a| a.attempt_id).max(),
    }
  }
}

/// An attempt or assignment that was left out of aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityIssue {
  pub entity: EntityRef,
  pub detail: String,
}

#[derive(Debug, Clone)]
pub struct QuizAggregation {
  pub result:  QuizResult,
  pub skipped: Vec<IntegrityIssue>,
}

/// Recompute a learner's result for `quiz` from every attempt they made.
///
/// * Only the highest `attempt_index` per question counts.
/// * The achievable maximum covers every question assigned to the quiz when
///   the learner first attempted it, plus every question they attempted, so
///   retiring a question later does not change historical scores.
/// * Attempts for questions with no definition are skipped and reported.
pub fn aggregate_quiz_result(
  learner_id:  LearnerId,
  quiz:        &Quiz,
  assignments: &[QuizQuestion],
  questions:   &BTreeMap<QuestionId, Question>,
  attempts:    &[QuestionAttempt],
  bonus:       &GamificationConfig,
  synced_at:   DateTime<Utc>,
) -> QuizAggregation {
  let mut skipped = Vec::new();
  let mut latest: BTreeMap<QuestionId, &QuestionAttempt> = BTreeMap::new();
  let mut first_attempt_at: Option<DateTime<Utc>> = None;

  for attempt in attempts {
    if attempt.learner_id != learner_id || attempt.quiz_id != quiz.quiz_id {
      skipped.push(IntegrityIssue {
        entity: attempt.entity(),
        detail: format!(
          "attempt belongs to learner {} / quiz {}",
          attempt.learner_id, attempt.quiz_id
        ),
      });
      continue;
    }
    if !questions.contains_key(&attempt.question_id) {
      skipped.push(IntegrityIssue {
        entity: attempt.entity(),
        detail: format!("question {} does not exist", attempt.question_id),
      });
      continue;
    }

    first_attempt_at = Some(match first_attempt_at {
      Some(at) => at.min(attempt.created_at),
      None => attempt.created_at,
    });
    latest
      .entry(attempt.question_id)
      .and_modify(|current| {
        if (attempt.attempt_index, attempt.attempt_id)
          > (current.attempt_index, current.attempt_id)
        {
          *current = attempt;
        }
      })
      .or_insert(attempt);
  }

  let mut counted: BTreeSet<QuestionId> = BTreeSet::new();
  for assignment in assignments.iter().filter(|qq| qq.quiz_id == quiz.quiz_id) {
    let in_scope = match first_attempt_at {
      Some(at) => assignment.assigned_at(at),
      None => assignment.is_current(),
    };
    if !in_scope {
      continue;
    }
    if questions.contains_key(&assignment.question_id) {
      counted.insert(assignment.question_id);
    } else {
      skipped.push(IntegrityIssue {
        entity: EntityRef::Question { id: assignment.question_id },
        detail: format!("assigned to quiz {} but has no definition", quiz.quiz_id),
      });
    }
  }
  counted.extend(latest.keys().copied());

  let max_points: f64 = counted
    .iter()
    .filter_map(|id| questions.get(id))
    .map(|q| q.max_points.max(0.0))
    .sum();

  let raw_total_points: f64 = latest
    .iter()
    .map(|(id, attempt)| {
      let cap = questions.get(id).map_or(0.0, |q| q.max_points.max(0.0));
      attempt.points_earned.clamp(0.0, cap)
    })
    .sum();

  let mut answered: Vec<&QuestionAttempt> = latest.values().copied().collect();
  answered.sort_by(|a, b| {
    a.created_at
      .cmp(&b.created_at)
      .then(a.attempt_id.cmp(&b.attempt_id))
  });
  let bonuses_total = bonus.streak_bonus(answered.iter().map(|a| a.is_correct));

  let score = if max_points > 0.0 {
    (raw_total_points + bonuses_total).clamp(0.0, max_points) / max_points
  } else {
    0.0
  };

  let completed =
    !counted.is_empty() && counted.iter().all(|id| latest.contains_key(id));
  let completion_time = if completed {
    answered.last().map(|a| a.created_at)
  } else {
    None
  };
  let fingerprint = AttemptFingerprint::of(attempts);

  let result = QuizResult {
    learner_id,
    quiz_id: quiz.quiz_id,
    status: if completed { QuizStatus::Completed } else { QuizStatus::InProgress },
    raw_total_points,
    max_points,
    bonuses_total,
    score,
    completion_time,
    synced_at,
    attempt_count: fingerprint.attempt_count,
    last_attempt_id: fingerprint.last_attempt_id,
    version: 0,
  };

  QuizAggregation { result, skipped }
}
