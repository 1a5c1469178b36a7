//! Authoring and enrollment records.
//!
//! These are owned by the course-authoring subsystem. The engine only reads
//! them, so none of them carry versions or history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  ids::{CourseId, ObjectiveId, QuestionId, QuizId},
  scoring::PenaltyPolicy,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
  pub course_id: CourseId,
  pub name:      String,
  /// Set once the course has been deleted; in-flight jobs for it cancel.
  pub deleted:   bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
  pub question_id:     QuestionId,
  pub max_points:      f64,
  /// The learning objective this question measures, if tagged.
  pub objective_id:    Option<ObjectiveId>,
  /// Time allowed before the late penalty starts, unless the quiz's penalty
  /// policy overrides it.
  pub time_limit_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quiz {
  pub quiz_id:   QuizId,
  pub course_id: CourseId,
  pub title:     String,
  #[serde(default)]
  pub penalty:   PenaltyPolicy,
}

/// One assignment of a question to a quiz. Removing a question from a quiz
/// closes the assignment rather than deleting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizQuestion {
  pub quiz_id:     QuizId,
  pub question_id: QuestionId,
  pub added_at:    DateTime<Utc>,
  pub removed_at:  Option<DateTime<Utc>>,
}

impl QuizQuestion {
  /// Whether the question was part of the quiz at `at`.
  pub fn assigned_at(&self, at: DateTime<Utc>) -> bool {
    self.added_at <= at && self.removed_at.is_none_or(|removed| removed > at)
  }

  pub fn is_current(&self) -> bool { self.removed_at.is_none() }
}
