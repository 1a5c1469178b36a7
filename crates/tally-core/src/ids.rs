//! Surrogate keys and entity references.
//!
//! Every record the engine touches is addressed by an integer key owned by
//! the persistence layer. [`EntityRef`] names one such record (or a composite
//! key) so that errors and log lines can point operators at exactly the unit
//! that needs re-running.

use std::fmt;

use chrono::NaiveDate;

pub type LearnerId = i64;
pub type CourseId = i64;
pub type QuizId = i64;
pub type QuestionId = i64;
pub type AttemptId = i64;
pub type ColumnId = i64;
pub type ObjectiveId = i64;
pub type InterventionId = i64;

/// A reference to one record (or one composite-keyed unit of work).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
  Course { id: CourseId },
  Quiz { id: QuizId },
  Question { id: QuestionId },
  Attempt {
    learner:       LearnerId,
    quiz:          QuizId,
    question:      QuestionId,
    attempt_index: u32,
  },
  QuizResult { learner: LearnerId, quiz: QuizId },
  CourseGrade { learner: LearnerId, course: CourseId },
  GradeColumn { id: ColumnId },
  Rollup { course: CourseId, date: NaiveDate },
  LearnerStats { learner: LearnerId },
  Intervention { id: InterventionId },
}

impl fmt::Display for EntityRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Course { id } => write!(f, "course {id}"),
      Self::Quiz { id } => write!(f, "quiz {id}"),
      Self::Question { id } => write!(f, "question {id}"),
      Self::Attempt { learner, quiz, question, attempt_index } => write!(
        f,
        "attempt(learner={learner}, quiz={quiz}, question={question}, index={attempt_index})"
      ),
      Self::QuizResult { learner, quiz } => {
        write!(f, "quiz_result(learner={learner}, quiz={quiz})")
      }
      Self::CourseGrade { learner, course } => {
        write!(f, "course_grade(learner={learner}, course={course})")
      }
      Self::GradeColumn { id } => write!(f, "grade_column {id}"),
      Self::Rollup { course, date } => {
        write!(f, "rollup(course={course}, date={date})")
      }
      Self::LearnerStats { learner } => write!(f, "learner_stats {learner}"),
      Self::Intervention { id } => write!(f, "intervention {id}"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn display_names_composite_keys() {
    let r = EntityRef::QuizResult { learner: 3, quiz: 9 };
    assert_eq!(r.to_string(), "quiz_result(learner=3, quiz=9)");

    let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    let r = EntityRef::Rollup { course: 7, date };
    assert_eq!(r.to_string(), "rollup(course=7, date=2024-05-01)");
  }
}
