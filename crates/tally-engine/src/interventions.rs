//! Intervention lifecycle: detect, dedup, schedule, and evaluate.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use tally_core::{
  EntityRef,
  ids::{CourseId, InterventionId},
  intervention::{
    CourseIntervention, DedupKey, InterventionResult, InterventionStatus, NewInterventionResult,
    detect_breaches,
  },
  store::{CasOutcome, GradeStore},
};

use crate::{
  Engine,
  error::{EngineError, Result, store_err},
};

impl<S: GradeStore> Engine<S> {
  /// Bring a course's interventions in line with its latest rollup.
  ///
  /// In order: pending interventions whose breach has cleared are cancelled;
  /// new breaches create pending interventions unless one is already open
  /// for the same `(course, objective, target group)`, in which case a
  /// pending one takes the newer trigger and confidence; pending ones whose
  /// kind is enabled and whose rollup was not low-confidence are scheduled;
  /// executed ones past their observation window are evaluated against the
  /// first rollup at or after the window's end.
  ///
  /// Returns every intervention that changed.
  pub async fn evaluate_interventions(
    &self,
    course_id: CourseId,
  ) -> Result<Vec<CourseIntervention>> {
    self
      .guarded(EntityRef::Course { id: course_id }, || {
        self.sync_interventions(course_id)
      })
      .await
  }

  /// Record that a scheduled intervention was carried out at `at`, which may
  /// not precede its scheduling or lie in the future.
  pub async fn mark_intervention_executed(
    &self,
    id: InterventionId,
    at: DateTime<Utc>,
  ) -> Result<CourseIntervention> {
    self
      .guarded(EntityRef::Intervention { id }, || {
        self.move_intervention(id, InterventionStatus::Executed, at)
      })
      .await
  }

  /// Withdraw a pending or scheduled intervention.
  pub async fn cancel_intervention(&self, id: InterventionId) -> Result<CourseIntervention> {
    let at = self.now();
    self
      .guarded(EntityRef::Intervention { id }, || {
        self.move_intervention(id, InterventionStatus::Cancelled, at)
      })
      .await
  }

  pub async fn intervention_results(
    &self,
    id: InterventionId,
  ) -> Result<Vec<InterventionResult>> {
    self
      .store
      .intervention_results(id)
      .await
      .map_err(store_err(EntityRef::Intervention { id }))
  }

  async fn move_intervention(
    &self,
    id: InterventionId,
    to: InterventionStatus,
    at: DateTime<Utc>,
  ) -> Result<CourseIntervention> {
    let entity = EntityRef::Intervention { id };
    let course_id = self.load_intervention(id).await?.course_id;
    let _guard = self.locks.lock(EntityRef::Course { id: course_id }).await;

    let mut intervention = self.load_intervention(id).await?;
    let from = intervention.status;
    if to == InterventionStatus::Executed {
      if at > self.now() {
        return Err(EngineError::DataIntegrity {
          entity,
          detail: format!("execution time {at} is in the future"),
        });
      }
      if let Some(scheduled_at) = intervention.scheduled_at
        && at < scheduled_at
      {
        return Err(EngineError::DataIntegrity {
          entity,
          detail: format!("execution time {at} precedes scheduling at {scheduled_at}"),
        });
      }
    }
    intervention.transition(to, at)?;
    let stored = self.persist_transition(intervention, from).await?;
    tracing::info!(%entity, %from, %to, "intervention transitioned");
    Ok(stored)
  }

  async fn sync_interventions(&self, course_id: CourseId) -> Result<Vec<CourseIntervention>> {
    let entity = EntityRef::Course { id: course_id };
    let _guard = self.locks.lock(entity).await;

    let token = self.course_token(course_id);
    let course = self
      .store
      .course(course_id)
      .await
      .map_err(store_err(entity))?
      .ok_or(EngineError::NotFound(entity))?;
    if course.deleted {
      self.cancel_course(course_id);
      return Err(EngineError::Cancelled { entity });
    }
    if token.is_cancelled() {
      return Err(EngineError::Cancelled { entity });
    }

    let Some(rollup) = self
      .store
      .latest_rollup(course_id)
      .await
      .map_err(store_err(entity))?
    else {
      tracing::debug!(%entity, "no rollup yet, nothing to evaluate");
      return Ok(Vec::new());
    };
    let lo_rollups = self
      .store
      .lo_rollups(course_id, rollup.snapshot_date)
      .await
      .map_err(store_err(entity))?;
    let config = self
      .store
      .analytics_config(course_id)
      .await
      .map_err(store_err(entity))?
      .unwrap_or_default();
    let mut interventions = self
      .store
      .interventions(course_id)
      .await
      .map_err(store_err(entity))?;

    let now = self.now();
    let breaches = detect_breaches(&config, &rollup, &lo_rollups);
    let breached: BTreeSet<DedupKey> = breaches.iter().map(|b| b.dedup_key()).collect();
    let mut changed = Vec::new();

    // Cleared breaches.
    for intervention in interventions
      .iter_mut()
      .filter(|iv| iv.status == InterventionStatus::Pending)
    {
      if breached.contains(&intervention.dedup_key()) {
        continue;
      }
      intervention.transition(InterventionStatus::Cancelled, now)?;
      let stored = self
        .persist_transition(intervention.clone(), InterventionStatus::Pending)
        .await?;
      tracing::info!(
        entity = %EntityRef::Intervention { id: stored.intervention_id },
        kind = %stored.kind,
        "breach cleared, pending intervention cancelled"
      );
      changed.push(stored);
    }

    // New breaches.
    let open: BTreeSet<DedupKey> = interventions
      .iter()
      .filter(|iv| iv.status.is_open())
      .map(CourseIntervention::dedup_key)
      .collect();
    for breach in breaches {
      if token.is_cancelled() {
        return Err(EngineError::Cancelled { entity });
      }
      if open.contains(&breach.dedup_key()) {
        let pending = interventions.iter_mut().find(|iv| {
          iv.status == InterventionStatus::Pending && iv.dedup_key() == breach.dedup_key()
        });
        if let Some(intervention) = pending
          && intervention.refresh(&breach)
        {
          let stored = self
            .persist_transition(intervention.clone(), InterventionStatus::Pending)
            .await?;
          tracing::info!(
            entity = %EntityRef::Intervention { id: stored.intervention_id },
            trigger_date = %stored.trigger_date,
            low_confidence = stored.low_confidence,
            "pending intervention refreshed from latest rollup"
          );
          upsert(&mut changed, stored);
        } else {
          tracing::debug!(%entity, kind = %breach.kind, "open intervention exists, suppressed");
        }
        continue;
      }
      let created = self
        .store
        .insert_intervention(breach.into_new(now))
        .await
        .map_err(store_err(entity))?;
      tracing::info!(
        entity = %EntityRef::Intervention { id: created.intervention_id },
        kind = %created.kind,
        objective_id = ?created.objective_id,
        low_confidence = created.low_confidence,
        "intervention created"
      );
      interventions.push(created.clone());
      changed.push(created);
    }

    // Scheduling.
    for intervention in interventions
      .iter_mut()
      .filter(|iv| iv.status == InterventionStatus::Pending)
    {
      let iv_entity = EntityRef::Intervention { id: intervention.intervention_id };
      if intervention.low_confidence {
        tracing::debug!(entity = %iv_entity, "low-confidence trigger, held pending");
        continue;
      }
      if !config.is_enabled(intervention.kind) {
        tracing::debug!(entity = %iv_entity, kind = %intervention.kind, "kind disabled, held pending");
        continue;
      }
      intervention.transition(InterventionStatus::Scheduled, now)?;
      let stored = self
        .persist_transition(intervention.clone(), InterventionStatus::Pending)
        .await?;
      tracing::info!(entity = %iv_entity, kind = %stored.kind, "intervention scheduled");
      upsert(&mut changed, stored);
    }

    // Evaluation.
    let window = TimeDelta::days(i64::from(config.observation_window_days));
    for intervention in interventions
      .iter()
      .filter(|iv| iv.status == InterventionStatus::Executed)
    {
      let iv_entity = EntityRef::Intervention { id: intervention.intervention_id };
      let Some(executed_at) = intervention.executed_at else {
        tracing::warn!(entity = %iv_entity, "executed intervention has no execution time");
        continue;
      };
      let due = executed_at + window;
      if now < due {
        continue;
      }
      let Some(after) = self
        .store
        .first_rollup_on_or_after(course_id, self.config.zone.date_of(due))
        .await
        .map_err(store_err(iv_entity))?
      else {
        tracing::debug!(entity = %iv_entity, "window elapsed, waiting for a later rollup");
        continue;
      };
      let metrics_after = match intervention.objective_id {
        None => after.metric_values(),
        Some(objective_id) => {
          let lo = self
            .store
            .lo_rollups(course_id, after.snapshot_date)
            .await
            .map_err(store_err(iv_entity))?
            .into_iter()
            .find(|lo| lo.objective_id == objective_id);
          match lo {
            Some(lo) => lo.metric_values(),
            None => {
              tracing::warn!(
                entity = %iv_entity,
                objective_id,
                date = %after.snapshot_date,
                "no objective rollup to evaluate against"
              );
              continue;
            }
          }
        }
      };

      let mut evaluated = intervention.clone();
      evaluated.transition(InterventionStatus::Evaluated, now)?;
      let result = NewInterventionResult::new(intervention, metrics_after, after.snapshot_date, now);
      match self
        .store
        .record_intervention_result(evaluated.clone(), result)
        .await
        .map_err(store_err(iv_entity))?
      {
        CasOutcome::Committed(result) => {
          tracing::info!(
            entity = %iv_entity,
            after_date = %result.after_date,
            improvement = ?result.improvement,
            "intervention evaluated"
          );
          changed.push(evaluated);
        }
        CasOutcome::Conflict => {
          return Err(EngineError::ConcurrencyConflict { entity: iv_entity });
        }
      }
    }

    Ok(changed)
  }

  async fn load_intervention(&self, id: InterventionId) -> Result<CourseIntervention> {
    let entity = EntityRef::Intervention { id };
    self
      .store
      .intervention(id)
      .await
      .map_err(store_err(entity))?
      .ok_or(EngineError::NotFound(entity))
  }

  async fn persist_transition(
    &self,
    intervention: CourseIntervention,
    expected: InterventionStatus,
  ) -> Result<CourseIntervention> {
    let entity = EntityRef::Intervention { id: intervention.intervention_id };
    match self
      .store
      .update_intervention(intervention, expected)
      .await
      .map_err(store_err(entity))?
    {
      CasOutcome::Committed(stored) => Ok(stored),
      CasOutcome::Conflict => Err(EngineError::ConcurrencyConflict { entity }),
    }
  }
}

/// Replace an earlier entry for the same intervention, or append.
fn upsert(changed: &mut Vec<CourseIntervention>, intervention: CourseIntervention) {
  match changed
    .iter_mut()
    .find(|c| c.intervention_id == intervention.intervention_id)
  {
    Some(slot) => *slot = intervention,
    None => changed.push(intervention),
  }
}
