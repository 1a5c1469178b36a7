//! Course grade recomputation.

use chrono::{DateTime, Utc};
use tally_core::{
  EntityRef,
  columns::ColumnMap,
  course_grade::{
    CourseGradeHistory, CourseGradeResult, Grade, IncompleteReason, compute_course_grade,
    resolve_weights,
  },
  ids::{CourseId, LearnerId, QuizId},
  store::{CasOutcome, GradeStore},
};

use crate::{
  Engine,
  error::{EngineError, Result, store_err},
};

/// What [`Engine::recompute_course_grade`] stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CourseGradeOutcome {
  pub result:           CourseGradeResult,
  /// Quizzes of the course that no grade column picks up.
  pub unmapped_quizzes: Vec<QuizId>,
  /// Whether the previous value was moved into history.
  pub history_appended: bool,
}

impl<S: GradeStore> Engine<S> {
  /// Recompute one learner's course grade from their scored quiz results.
  ///
  /// A configuration problem still stores an `Incomplete` grade carrying the
  /// error text, then fails with [`EngineError::Configuration`].
  pub async fn recompute_course_grade(
    &self,
    learner_id: LearnerId,
    course_id: CourseId,
  ) -> Result<CourseGradeOutcome> {
    let entity = EntityRef::CourseGrade { learner: learner_id, course: course_id };
    let trigger = self.now();
    self
      .guarded(entity, || self.sync_course_grade(learner_id, course_id, trigger))
      .await
  }

  /// Every prior value of a learner's grade, oldest first.
  pub async fn course_grade_history(
    &self,
    learner_id: LearnerId,
    course_id: CourseId,
  ) -> Result<Vec<CourseGradeHistory>> {
    self
      .store
      .course_grade_history(learner_id, course_id)
      .await
      .map_err(store_err(EntityRef::CourseGrade { learner: learner_id, course: course_id }))
  }

  async fn sync_course_grade(
    &self,
    learner_id: LearnerId,
    course_id: CourseId,
    trigger: DateTime<Utc>,
  ) -> Result<CourseGradeOutcome> {
    let entity = EntityRef::CourseGrade { learner: learner_id, course: course_id };
    let _guard = self.locks.lock(entity).await;

    let course = self
      .store
      .course(course_id)
      .await
      .map_err(store_err(entity))?
      .ok_or(EngineError::NotFound(EntityRef::Course { id: course_id }))?;
    let stored = self
      .store
      .course_grade(learner_id, course_id)
      .await
      .map_err(store_err(entity))?;
    if let Some(current) = stored.as_ref()
      && current.computed_at > trigger
    {
      tracing::debug!(%entity, "course grade computed after trigger, coalesced");
      return Ok(CourseGradeOutcome {
        result:           current.clone(),
        unmapped_quizzes: Vec::new(),
        history_appended: false,
      });
    }

    let now = self.now();
    let quizzes = self
      .store
      .course_quizzes(course.course_id)
      .await
      .map_err(store_err(entity))?;
    let columns = self
      .store
      .grade_columns(course_id)
      .await
      .map_err(store_err(entity))?;
    let mappings = self
      .store
      .column_mappings(course_id)
      .await
      .map_err(store_err(entity))?;
    let config = self
      .store
      .grade_config(course_id)
      .await
      .map_err(store_err(entity))?;

    let map = ColumnMap::new(course_id, &columns, &mappings);
    for conflict in map.conflicts() {
      tracing::warn!(entity = %conflict.entity, detail = %conflict.detail, "ignored column mapping");
    }
    let unmapped_quizzes = map.unmapped(quizzes.iter().map(|q| q.quiz_id));
    if !unmapped_quizzes.is_empty() {
      tracing::warn!(%entity, ?unmapped_quizzes, "quizzes not mapped to any grade column");
    }

    let (column_values, grade, config_error) = match resolve_weights(course_id, &map, config.as_ref()) {
      Ok(weights) => {
        let results = self
          .store
          .quiz_results(learner_id, map.mapped_quizzes().collect())
          .await
          .map_err(store_err(entity))?;
        let (column_values, grade) = compute_course_grade(&map, &weights, &results);
        (column_values, grade, None)
      }
      Err(tally_core::Error::Configuration { detail, .. }) => {
        tracing::warn!(%entity, %detail, "course grade configuration rejected");
        let grade = Grade::Incomplete {
          reason: IncompleteReason::Configuration { detail: detail.clone() },
        };
        (Vec::new(), grade, Some(detail))
      }
      Err(err) => return Err(err.into()),
    };

    let changed = stored
      .as_ref()
      .is_none_or(|s| s.grade.differs_from(&grade, self.config.grade_epsilon));
    let value_since = match stored.as_ref() {
      Some(s) if !changed => s.value_since,
      _ => now,
    };
    let history = stored.as_ref().filter(|_| changed).map(|s| s.snapshot(now));
    let history_appended = history.is_some();

    let next = CourseGradeResult {
      learner_id,
      course_id,
      columns: column_values,
      grade,
      computed_at: now,
      value_since,
      last_error: config_error.clone(),
      version: stored.as_ref().map_or(0, |s| s.version),
    };

    let result = match self
      .store
      .save_course_grade(next, stored.as_ref().map(|s| s.version), history)
      .await
      .map_err(store_err(entity))?
    {
      CasOutcome::Committed(result) => result,
      CasOutcome::Conflict => return Err(EngineError::ConcurrencyConflict { entity }),
    };

    if changed {
      tracing::info!(
        %entity,
        grade = ?result.grade.value(),
        previous = ?stored.as_ref().and_then(|s| s.grade.value()),
        "course grade changed"
      );
    } else {
      tracing::debug!(%entity, "course grade unchanged");
    }

    if let Some(detail) = config_error {
      return Err(EngineError::course_config(course_id, detail));
    }
    Ok(CourseGradeOutcome { result, unmapped_quizzes, history_appended })
  }
}
