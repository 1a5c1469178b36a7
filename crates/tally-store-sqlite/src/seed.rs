//! Writers for authoring and enrollment data.
//!
//! The engine never calls these; they exist for the authoring side, fixtures
//! and tests. They are plain upserts keyed by the caller-supplied ids.

use chrono::{DateTime, Utc};
use tally_core::{
  authoring::{Course, Question, Quiz, QuizQuestion},
  columns::{ColumnQuizMapping, GradeColumn},
  course_grade::GradeConfig,
  ids::{CourseId, LearnerId, QuestionId, QuizId},
  intervention::CourseAnalyticsConfig,
};

use crate::{encode::encode_dt, Result, SqliteStore};

impl SqliteStore {
  pub async fn put_course(&self, course: Course) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO courses (course_id, name, deleted) VALUES (?1, ?2, ?3)
           ON CONFLICT (course_id) DO UPDATE SET
             name = excluded.name, deleted = excluded.deleted",
          rusqlite::params![course.course_id, course.name, course.deleted],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Flag a course as deleted. Its records stay in place.
  pub async fn mark_course_deleted(&self, course_id: CourseId) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE courses SET deleted = 1 WHERE course_id = ?1",
          rusqlite::params![course_id],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub async fn enroll(&self, course_id: CourseId, learner_id: LearnerId) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR IGNORE INTO enrollments (course_id, learner_id) VALUES (?1, ?2)",
          rusqlite::params![course_id, learner_id],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub async fn put_question(&self, question: Question) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO questions (question_id, max_points, objective_id, time_limit_secs)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT (question_id) DO UPDATE SET
             max_points = excluded.max_points,
             objective_id = excluded.objective_id,
             time_limit_secs = excluded.time_limit_secs",
          rusqlite::params![
            question.question_id,
            question.max_points,
            question.objective_id,
            question.time_limit_secs,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub async fn put_quiz(&self, quiz: Quiz) -> Result<()> {
    let penalty_json = serde_json::to_string(&quiz.penalty)?;
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO quizzes (quiz_id, course_id, title, penalty_json)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT (quiz_id) DO UPDATE SET
             course_id = excluded.course_id,
             title = excluded.title,
             penalty_json = excluded.penalty_json",
          rusqlite::params![quiz.quiz_id, quiz.course_id, quiz.title, penalty_json],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub async fn assign_question(&self, assignment: QuizQuestion) -> Result<()> {
    let added_at = encode_dt(assignment.added_at);
    let removed_at = assignment.removed_at.map(encode_dt);
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO quiz_questions (quiz_id, question_id, added_at, removed_at)
           VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![assignment.quiz_id, assignment.question_id, added_at, removed_at],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Close the open assignment of `question_id` in `quiz_id`.
  pub async fn retire_question(
    &self,
    quiz_id:     QuizId,
    question_id: QuestionId,
    at:          DateTime<Utc>,
  ) -> Result<()> {
    let at = encode_dt(at);
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE quiz_questions SET removed_at = ?3
           WHERE quiz_id = ?1 AND question_id = ?2 AND removed_at IS NULL",
          rusqlite::params![quiz_id, question_id, at],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub async fn put_grade_column(&self, column: GradeColumn) -> Result<()> {
    let aggregation_json = serde_json::to_string(&column.aggregation)?;
    let category = column.category.as_ref().to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO grade_columns (
             column_id, course_id, name, category, weight, aggregation_json, required
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
           ON CONFLICT (column_id) DO UPDATE SET
             course_id = excluded.course_id,
             name = excluded.name,
             category = excluded.category,
             weight = excluded.weight,
             aggregation_json = excluded.aggregation_json,
             required = excluded.required",
          rusqlite::params![
            column.column_id,
            column.course_id,
            column.name,
            category,
            column.weight,
            aggregation_json,
            column.required,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub async fn map_quiz(&self, mapping: ColumnQuizMapping) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR IGNORE INTO column_quiz_mappings (column_id, quiz_id) VALUES (?1, ?2)",
          rusqlite::params![mapping.column_id, mapping.quiz_id],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub async fn put_grade_config(&self, config: GradeConfig) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO grade_configs (course_id, process_weight, midterm_weight, final_exam_weight)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT (course_id) DO UPDATE SET
             process_weight = excluded.process_weight,
             midterm_weight = excluded.midterm_weight,
             final_exam_weight = excluded.final_exam_weight",
          rusqlite::params![
            config.course_id,
            config.process_weight,
            config.midterm_weight,
            config.final_exam_weight,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  pub async fn put_analytics_config(
    &self,
    course_id: CourseId,
    config:    CourseAnalyticsConfig,
  ) -> Result<()> {
    let config_json = serde_json::to_string(&config)?;
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO analytics_configs (course_id, config_json) VALUES (?1, ?2)
           ON CONFLICT (course_id) DO UPDATE SET config_json = excluded.config_json",
          rusqlite::params![course_id, config_json],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}
