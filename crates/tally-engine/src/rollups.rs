//! Daily course analytics snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use tally_core::{
  EntityRef,
  course_grade::{CourseGradeHistory, CourseGradeResult, grade_as_of},
  ids::{CourseId, LearnerId, QuestionId, QuizId},
  quiz_result::QuizResult,
  rollup::{CourseAnalyticsRollup, CourseLORollup, LearnerSnapshot, RollupInput, build_rollups},
  scoring::QuestionAttempt,
  store::GradeStore,
};
use tokio_util::sync::CancellationToken;

use crate::{
  Engine,
  error::{EngineError, Result, store_err},
};

#[derive(Debug, Clone, PartialEq)]
pub struct RollupOutcome {
  pub rollup:     CourseAnalyticsRollup,
  pub lo_rollups: Vec<CourseLORollup>,
}

impl<S: GradeStore> Engine<S> {
  /// Compute and store the course and objective rollups for `date`.
  ///
  /// Inputs are read as of the end of `date` in the reporting zone. Re-running
  /// a date overwrites its rollups. A cancelled or timed-out run stores
  /// nothing.
  pub async fn run_rollup(&self, course_id: CourseId, date: NaiveDate) -> Result<RollupOutcome> {
    let entity = EntityRef::Rollup { course: course_id, date };
    self
      .guarded(entity, || self.build_and_store_rollup(course_id, date))
      .await
  }

  async fn build_and_store_rollup(
    &self,
    course_id: CourseId,
    date: NaiveDate,
  ) -> Result<RollupOutcome> {
    let entity = EntityRef::Rollup { course: course_id, date };
    let _guard = self.locks.lock(entity).await;

    let token = self.course_token(course_id);
    let course = self
      .store
      .course(course_id)
      .await
      .map_err(store_err(entity))?
      .ok_or(EngineError::NotFound(EntityRef::Course { id: course_id }))?;
    if course.deleted {
      self.cancel_course(course_id);
      return Err(EngineError::Cancelled { entity });
    }
    checkpoint(&token, entity)?;

    let now = self.now();
    let cutoff = self.config.zone.cutoff(date);
    let config = self
      .store
      .analytics_config(course_id)
      .await
      .map_err(store_err(entity))?
      .unwrap_or_default();
    let learners = self
      .store
      .course_learners(course_id)
      .await
      .map_err(store_err(entity))?;
    let quiz_ids: Vec<QuizId> = self
      .store
      .course_quizzes(course_id)
      .await
      .map_err(store_err(entity))?
      .into_iter()
      .map(|q| q.quiz_id)
      .collect();

    let grades: HashMap<LearnerId, CourseGradeResult> = self
      .store
      .course_grades(course_id)
      .await
      .map_err(store_err(entity))?
      .into_iter()
      .map(|g| (g.learner_id, g))
      .collect();
    let mut history: HashMap<LearnerId, Vec<CourseGradeHistory>> = HashMap::new();
    for row in self
      .store
      .course_grade_history_for_course(course_id)
      .await
      .map_err(store_err(entity))?
    {
      history.entry(row.learner_id).or_default().push(row);
    }

    let mut records: Vec<(LearnerId, Vec<QuizResult>, Vec<QuestionAttempt>)> =
      Vec::with_capacity(learners.len());
    for learner_id in learners {
      checkpoint(&token, entity)?;
      let results = self
        .store
        .quiz_results(learner_id, quiz_ids.clone())
        .await
        .map_err(store_err(entity))?;
      let attempts = self
        .store
        .learner_attempts(learner_id, quiz_ids.clone())
        .await
        .map_err(store_err(entity))?;
      records.push((learner_id, results, attempts));
      tokio::task::yield_now().await;
    }

    let question_ids: BTreeSet<QuestionId> = records
      .iter()
      .flat_map(|(_, _, attempts)| attempts.iter().map(|a| a.question_id))
      .collect();
    let questions = self
      .store
      .questions(question_ids.into_iter().collect())
      .await
      .map_err(store_err(entity))?
      .into_iter()
      .map(|q| (q.question_id, q))
      .collect::<BTreeMap<_, _>>();

    let mut snapshots = Vec::with_capacity(records.len());
    for (learner_id, results, attempts) in &records {
      checkpoint(&token, entity)?;
      let grade = grade_as_of(
        grades.get(learner_id),
        history.get(learner_id).map(Vec::as_slice).unwrap_or(&[]),
        cutoff,
      );
      snapshots.push(LearnerSnapshot::capture(
        *learner_id,
        grade,
        results,
        attempts,
        &questions,
        cutoff,
      ));
    }

    let interventions = self
      .store
      .interventions(course_id)
      .await
      .map_err(store_err(entity))?;
    let open_interventions = interventions
      .iter()
      .filter(|iv| iv.created_at < cutoff && iv.status.is_open())
      .count();
    let evaluated_interventions = self
      .store
      .evaluated_intervention_count(course_id, cutoff)
      .await
      .map_err(store_err(entity))?;

    let input = RollupInput {
      course_id,
      snapshot_date: date,
      quiz_count: quiz_ids.len(),
      learners: &snapshots,
      open_interventions: u32::try_from(open_interventions).unwrap_or(u32::MAX),
      evaluated_interventions,
      computed_at: now,
    };
    let (rollup, lo_rollups) = build_rollups(&input, &config);

    checkpoint(&token, entity)?;
    if rollup.low_confidence {
      tracing::warn!(
        %entity,
        sample_size = rollup.sample_size,
        confidence = rollup.confidence,
        "low-confidence rollup"
      );
    }
    self
      .store
      .save_rollups(rollup.clone(), lo_rollups.clone())
      .await
      .map_err(store_err(entity))?;
    tracing::info!(
      %entity,
      enrolled = rollup.metrics.enrolled,
      active = rollup.metrics.active_learners,
      objectives = lo_rollups.len(),
      "rollup stored"
    );

    Ok(RollupOutcome { rollup, lo_rollups })
  }
}

fn checkpoint(token: &CancellationToken, entity: EntityRef) -> Result<()> {
  if token.is_cancelled() {
    tracing::warn!(%entity, "cancelled, discarding partial work");
    return Err(EngineError::Cancelled { entity });
  }
  Ok(())
}
