//! The scoring unit: one question attempt in, awarded points out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  authoring::Question,
  ids::{AttemptId, EntityRef, LearnerId, QuestionId, QuizId},
  Error, Result,
};

// ─── Penalty policy ──────────────────────────────────────────────────────────

/// Per-quiz penalty configuration. Every field has a neutral default, so an
/// empty policy awards full points for every correct answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyPolicy {
  /// Points deducted per second spent beyond the allowed time.
  pub late_penalty_per_second:  f64,
  /// Allowed time per question. Falls back to the question's own limit; with
  /// neither set no time penalty applies.
  pub allowed_time_secs:        Option<f64>,
  /// Attempts with a higher index than this earn nothing.
  pub max_attempts_before_zero: Option<u32>,
  /// Multiplier applied once per re-attempt: `factor^(attempt_index - 1)`.
  pub attempt_decay_factor:     f64,
}

impl Default for PenaltyPolicy {
  fn default() -> Self {
    Self {
      late_penalty_per_second:  0.0,
      allowed_time_secs:        None,
      max_attempts_before_zero: None,
      attempt_decay_factor:     1.0,
    }
  }
}

// ─── Attempts ────────────────────────────────────────────────────────────────

/// An answer submission as received from the quiz-taking flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAttempt {
  pub learner_id:      LearnerId,
  pub quiz_id:         QuizId,
  pub question_id:     QuestionId,
  pub answer_id:       Option<i64>,
  pub is_correct:      bool,
  pub time_spent_secs: f64,
  /// 1 for the first try at a question within the quiz, then 2, 3, ...
  pub attempt_index:   u32,
}

impl NewAttempt {
  pub fn entity(&self) -> EntityRef {
    EntityRef::Attempt {
      learner:       self.learner_id,
      quiz:          self.quiz_id,
      question:      self.question_id,
      attempt_index: self.attempt_index,
    }
  }
}

/// A persisted, immutable question attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionAttempt {
  pub attempt_id:      AttemptId,
  pub learner_id:      LearnerId,
  pub quiz_id:         QuizId,
  pub question_id:     QuestionId,
  pub answer_id:       Option<i64>,
  pub is_correct:      bool,
  pub time_spent_secs: f64,
  pub attempt_index:   u32,
  /// Points awarded after penalties, fixed at record time.
  pub points_earned:   f64,
  pub created_at:      DateTime<Utc>,
}

impl QuestionAttempt {
  pub fn entity(&self) -> EntityRef {
    EntityRef::Attempt {
      learner:       self.learner_id,
      quiz:          self.quiz_id,
      question:      self.question_id,
      attempt_index: self.attempt_index,
    }
  }
}

// ─── Scoring ─────────────────────────────────────────────────────────────────

/// Award points for a single attempt.
///
/// The result is always within `[0, question.max_points]`. A missing or
/// malformed question is reported as [`Error::DataIntegrity`] so the caller
/// can skip the attempt; scoring itself never panics.
pub fn score_attempt(
  attempt:  &NewAttempt,
  question: Option<&Question>,
  policy:   &PenaltyPolicy,
) -> Result<f64> {
  let Some(question) = question else {
    return Err(Error::integrity(
      attempt.entity(),
      format!("question {} does not exist", attempt.question_id),
    ));
  };
  if question.question_id != attempt.question_id {
    return Err(Error::integrity(
      attempt.entity(),
      format!(
        "attempt references question {} but was scored against {}",
        attempt.question_id, question.question_id
      ),
    ));
  }
  if !question.max_points.is_finite() || question.max_points < 0.0 {
    return Err(Error::integrity(
      EntityRef::Question { id: question.question_id },
      format!("invalid max_points {}", question.max_points),
    ));
  }
  if attempt.attempt_index == 0 {
    return Err(Error::integrity(attempt.entity(), "attempt_index starts at 1"));
  }
  if !attempt.time_spent_secs.is_finite() || attempt.time_spent_secs < 0.0 {
    return Err(Error::integrity(
      attempt.entity(),
      format!("invalid time_spent_secs {}", attempt.time_spent_secs),
    ));
  }

  let max = question.max_points;
  if !attempt.is_correct {
    return Ok(0.0);
  }
  if let Some(limit) = policy.max_attempts_before_zero
    && attempt.attempt_index > limit
  {
    return Ok(0.0);
  }

  let exponent = i32::try_from(attempt.attempt_index - 1).unwrap_or(i32::MAX);
  let decay = policy.attempt_decay_factor.clamp(0.0, 1.0).powi(exponent);
  let mut points = max * decay;

  if let Some(allowed) = policy.allowed_time_secs.or(question.time_limit_secs) {
    let overtime = attempt.time_spent_secs - allowed;
    if overtime > 0.0 {
      points -= overtime * policy.late_penalty_per_second.max(0.0);
    }
  }

  Ok(points.clamp(0.0, max))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn question(max_points: f64) -> Question {
    Question {
      question_id: 7,
      max_points,
      objective_id: None,
      time_limit_secs: Some(30.0),
    }
  }

  fn attempt(is_correct: bool, attempt_index: u32, time_spent_secs: f64) -> NewAttempt {
    NewAttempt {
      learner_id: 1,
      quiz_id: 2,
      question_id: 7,
      answer_id: None,
      is_correct,
      time_spent_secs,
      attempt_index,
    }
  }

  #[test]
  fn correct_answer_without_penalties_earns_max() {
    let pts = score_attempt(&attempt(true, 1, 90.0), Some(&question(10.0)), &PenaltyPolicy::default())
      .unwrap();
    assert_eq!(pts, 10.0);
  }

  #[test]
  fn incorrect_answer_earns_zero() {
    let pts = score_attempt(&attempt(false, 1, 1.0), Some(&question(10.0)), &PenaltyPolicy::default())
      .unwrap();
    assert_eq!(pts, 0.0);
  }

  #[test]
  fn decay_applies_per_reattempt() {
    let policy = PenaltyPolicy { attempt_decay_factor: 0.5, ..Default::default() };
    let pts = score_attempt(&attempt(true, 3, 1.0), Some(&question(8.0)), &policy).unwrap();
    assert!((pts - 2.0).abs() < 1e-12);
  }

  #[test]
  fn attempts_past_limit_earn_zero() {
    let policy = PenaltyPolicy { max_attempts_before_zero: Some(2), ..Default::default() };
    let pts = score_attempt(&attempt(true, 3, 1.0), Some(&question(8.0)), &policy).unwrap();
    assert_eq!(pts, 0.0);
  }

  #[test]
  fn time_penalty_uses_question_limit_and_floors_at_zero() {
    let policy = PenaltyPolicy { late_penalty_per_second: 0.5, ..Default::default() };
    let pts = score_attempt(&attempt(true, 1, 34.0), Some(&question(10.0)), &policy).unwrap();
    assert!((pts - 8.0).abs() < 1e-12);

    let pts = score_attempt(&attempt(true, 1, 500.0), Some(&question(10.0)), &policy).unwrap();
    assert_eq!(pts, 0.0);
  }

  #[test]
  fn policy_allowed_time_overrides_question_limit() {
    let policy = PenaltyPolicy {
      late_penalty_per_second: 1.0,
      allowed_time_secs: Some(60.0),
      ..Default::default()
    };
    let pts = score_attempt(&attempt(true, 1, 45.0), Some(&question(10.0)), &policy).unwrap();
    assert_eq!(pts, 10.0);
  }

  #[test]
  fn unknown_question_is_integrity_error() {
    let err = score_attempt(&attempt(true, 1, 1.0), None, &PenaltyPolicy::default()).unwrap_err();
    assert!(matches!(err, Error::DataIntegrity { .. }));
  }

  #[test]
  fn zero_attempt_index_is_rejected() {
    let err = score_attempt(&attempt(true, 0, 1.0), Some(&question(1.0)), &PenaltyPolicy::default())
      .unwrap_err();
    assert!(matches!(err, Error::DataIntegrity { .. }));
  }
}
