//! Recording attempts, re-syncing quiz results, and crediting completions.

use std::collections::{BTreeMap, BTreeSet};

use chrono::TimeDelta;
use tally_core::{
  EntityRef,
  authoring::Quiz,
  gamification::{GamificationUpdate, LearnerStats, apply_completion},
  ids::{CourseId, LearnerId, QuestionId, QuizId},
  quiz_result::{QuizResult, aggregate_quiz_result},
  scoring::{NewAttempt, QuestionAttempt, score_attempt},
  store::{CasOutcome, GradeStore},
};

use crate::{
  Engine,
  error::{EngineError, Result, store_err},
};

/// One pass of a quiz result sync.
struct QuizSync {
  result:         QuizResult,
  course_id:      CourseId,
  /// A scored result was written, or a previously scored one replaced.
  grade_affected: bool,
}

/// What [`Engine::record_attempt`] stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAttempt {
  pub attempt:       QuestionAttempt,
  pub points_earned: f64,
  /// The re-synced quiz result. `None` if the re-sync failed; the attempt is
  /// stored regardless and the next sync picks it up.
  pub quiz_result:   Option<QuizResult>,
}

impl<S: GradeStore> Engine<S> {
  /// Score one answer, persist it, and re-sync the learner's quiz result.
  ///
  /// The question must be assigned to the quiz at the time of the attempt.
  /// A duplicate `(learner, quiz, question, attempt_index)` stores nothing
  /// and fails with [`EngineError::DataIntegrity`].
  pub async fn record_attempt(&self, attempt: NewAttempt) -> Result<RecordedAttempt> {
    let entity = attempt.entity();
    let now = self.now();

    let quiz = self.load_quiz(attempt.quiz_id).await?;
    let assignments = self
      .store
      .quiz_questions(attempt.quiz_id)
      .await
      .map_err(store_err(entity))?;
    if !assignments
      .iter()
      .any(|a| a.question_id == attempt.question_id && a.assigned_at(now))
    {
      return Err(EngineError::DataIntegrity {
        entity,
        detail: format!(
          "question {} is not assigned to quiz {}",
          attempt.question_id, attempt.quiz_id
        ),
      });
    }

    let question = self
      .store
      .questions(vec![attempt.question_id])
      .await
      .map_err(store_err(entity))?
      .into_iter()
      .find(|q| q.question_id == attempt.question_id);
    let points_earned = score_attempt(&attempt, question.as_ref(), &quiz.penalty)?;

    let Some(stored) = self
      .store
      .insert_attempt(attempt, points_earned, now)
      .await
      .map_err(store_err(entity))?
    else {
      tracing::warn!(%entity, "duplicate attempt rejected");
      return Err(EngineError::DataIntegrity {
        entity,
        detail: "attempt index already recorded".into(),
      });
    };
    tracing::debug!(%entity, points_earned, "attempt recorded");

    let quiz_result = match self.resync_quiz_result(stored.learner_id, quiz.quiz_id).await {
      Ok(result) => Some(result),
      Err(err) => {
        tracing::warn!(%entity, error = %err, "quiz result re-sync failed after attempt");
        None
      }
    };

    Ok(RecordedAttempt { attempt: stored, points_earned, quiz_result })
  }

  /// Rebuild a learner's quiz result from every attempt on record.
  ///
  /// Coalesced into a no-op returning the stored result when re-aggregating
  /// yields the same outcome. A change to a scored result also recomputes the
  /// learner's grade in the quiz's course.
  pub async fn recompute_quiz_result(
    &self,
    learner_id: LearnerId,
    quiz_id: QuizId,
  ) -> Result<QuizResult> {
    self.resync_quiz_result(learner_id, quiz_id).await
  }

  pub async fn learner_stats(&self, learner_id: LearnerId) -> Result<Option<LearnerStats>> {
    self
      .store
      .learner_stats(learner_id)
      .await
      .map_err(store_err(EntityRef::LearnerStats { learner: learner_id }))
  }

  async fn resync_quiz_result(&self, learner_id: LearnerId, quiz_id: QuizId) -> Result<QuizResult> {
    let entity = EntityRef::QuizResult { learner: learner_id, quiz: quiz_id };
    let QuizSync { result, course_id, grade_affected } = self
      .guarded(entity, || self.sync_quiz_result(learner_id, quiz_id))
      .await?;

    if grade_affected
      && let Err(err) = self.recompute_course_grade(learner_id, course_id).await
    {
      tracing::warn!(%entity, course_id, error = %err, "course grade refresh failed after quiz change");
    }
    Ok(result)
  }

  async fn sync_quiz_result(&self, learner_id: LearnerId, quiz_id: QuizId) -> Result<QuizSync> {
    let entity = EntityRef::QuizResult { learner: learner_id, quiz: quiz_id };
    let _guard = self.locks.lock(entity).await;

    let quiz = self.load_quiz(quiz_id).await?;
    let stored = self
      .store
      .quiz_result(learner_id, quiz_id)
      .await
      .map_err(store_err(entity))?;

    let attempts = self
      .store
      .attempts(learner_id, quiz_id)
      .await
      .map_err(store_err(entity))?;

    // Strictly increasing, so a re-sync never looks already credited.
    let now = self.now();
    let synced_at = match stored.as_ref() {
      Some(current) if current.synced_at >= now => {
        current.synced_at + TimeDelta::nanoseconds(1)
      }
      _ => now,
    };

    let assignments = self
      .store
      .quiz_questions(quiz_id)
      .await
      .map_err(store_err(entity))?;
    let question_ids: BTreeSet<QuestionId> = assignments
      .iter()
      .map(|a| a.question_id)
      .chain(attempts.iter().map(|a| a.question_id))
      .collect();
    let questions = self
      .store
      .questions(question_ids.into_iter().collect())
      .await
      .map_err(store_err(entity))?
      .into_iter()
      .map(|q| (q.question_id, q))
      .collect::<BTreeMap<_, _>>();

    let aggregation = aggregate_quiz_result(
      learner_id,
      &quiz,
      &assignments,
      &questions,
      &attempts,
      &self.config.gamification,
      synced_at,
    );
    for issue in &aggregation.skipped {
      tracing::warn!(entity = %issue.entity, detail = %issue.detail, "skipped during quiz aggregation");
    }

    if let Some(current) = stored.as_ref()
      && current.same_outcome(&aggregation.result)
    {
      tracing::debug!(%entity, "quiz result unchanged, coalesced");
      self.credit_completion(current, &attempts).await?;
      return Ok(QuizSync {
        result:         current.clone(),
        course_id:      quiz.course_id,
        grade_affected: false,
      });
    }
    let was_scored = stored.as_ref().is_some_and(QuizResult::is_scored);

    let expected = stored.as_ref().map(|r| r.version);
    match self
      .store
      .save_quiz_result(aggregation.result, expected)
      .await
      .map_err(store_err(entity))?
    {
      CasOutcome::Committed(result) => {
        tracing::debug!(
          %entity,
          status = %result.status,
          score = result.score,
          version = result.version,
          "quiz result recomputed"
        );
        self.credit_completion(&result, &attempts).await?;
        let grade_affected = was_scored || result.is_scored();
        Ok(QuizSync { result, course_id: quiz.course_id, grade_affected })
      }
      CasOutcome::Conflict => Err(EngineError::ConcurrencyConflict { entity }),
    }
  }

  /// Fold a completed result into the learner's stats once per sync.
  async fn credit_completion(
    &self,
    result: &QuizResult,
    attempts: &[QuestionAttempt],
  ) -> Result<()> {
    if !result.is_scored() {
      return Ok(());
    }
    let entity = EntityRef::LearnerStats { learner: result.learner_id };
    let _guard = self.locks.lock(entity).await;

    let stats = self
      .store
      .learner_stats(result.learner_id)
      .await
      .map_err(store_err(entity))?
      .unwrap_or_else(|| LearnerStats::new(result.learner_id));
    let marker = self
      .store
      .completion_marker(result.learner_id, result.quiz_id)
      .await
      .map_err(store_err(entity))?;

    let response_times = counted_response_times(attempts);
    match apply_completion(
      &self.config.gamification,
      stats,
      marker.as_ref(),
      result,
      &response_times,
      self.now(),
    ) {
      GamificationUpdate::NotCompleted | GamificationUpdate::AlreadyProcessed => Ok(()),
      GamificationUpdate::Applied { stats, marker, levels_gained } => {
        let level = stats.current_level;
        self
          .store
          .save_gamification(stats, marker)
          .await
          .map_err(store_err(entity))?;
        if levels_gained > 0 {
          tracing::info!(%entity, level, levels_gained, "learner levelled up");
        } else {
          tracing::debug!(%entity, quiz_id = result.quiz_id, "completion credited");
        }
        Ok(())
      }
    }
  }

  pub(crate) async fn load_quiz(&self, quiz_id: QuizId) -> Result<Quiz> {
    let entity = EntityRef::Quiz { id: quiz_id };
    self
      .store
      .quiz(quiz_id)
      .await
      .map_err(store_err(entity))?
      .ok_or(EngineError::NotFound(entity))
  }
}

/// Response time of the counted (latest) attempt for each question.
fn counted_response_times(attempts: &[QuestionAttempt]) -> Vec<f64> {
  let mut latest: BTreeMap<QuestionId, &QuestionAttempt> = BTreeMap::new();
  for attempt in attempts {
    let slot = latest.entry(attempt.question_id).or_insert(attempt);
    if (attempt.attempt_index, attempt.attempt_id) > (slot.attempt_index, slot.attempt_id) {
      *slot = attempt;
    }
  }
  latest.values().map(|a| a.time_spent_secs).collect()
}
