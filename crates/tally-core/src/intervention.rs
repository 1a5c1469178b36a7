//! Threshold rules, intervention kinds, and the intervention lifecycle.
//!
//! ```text
//! pending ──► scheduled ──► executed ──► evaluated
//!    │            │
//!    └────────────┴──► cancelled
//! ```
//!
//! An intervention is opened when a rollup metric breaches a configured
//! threshold, and is evaluated by comparing the triggering rollup against a
//! later one taken after the observation window.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  ids::{CourseId, InterventionId, LearnerId, ObjectiveId},
  rollup::{CourseAnalyticsRollup, CourseLORollup, CourseMetrics, MetricKey, MetricValues, ObjectiveMetrics},
  Error, Result,
};

// ─── Kinds and target groups ─────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InterventionKind {
  /// Extra practice on a weak learning objective.
  Remediation,
  /// Nudge learners who have not completed anything yet.
  Reminder,
  /// One-on-one help for learners with a low course grade.
  Tutoring,
  /// Notify the course's instructors.
  InstructorAlert,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TargetGroup {
  AllLearners,
  InactiveLearners,
  BelowMastery,
  LowScorers,
}

/// The learners an intervention is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "learners", rename_all = "snake_case")]
pub enum Cohort {
  Everyone,
  Learners(Vec<LearnerId>),
}

impl InterventionKind {
  pub fn target_group(self) -> TargetGroup {
    match self {
      Self::Remediation => TargetGroup::BelowMastery,
      Self::Reminder => TargetGroup::InactiveLearners,
      Self::Tutoring => TargetGroup::LowScorers,
      Self::InstructorAlert => TargetGroup::AllLearners,
    }
  }

  /// Resolve the cohort from the breaching rollup. An objective-scoped
  /// breach narrows remediation to that objective's struggling learners.
  pub fn cohort(self, course: &CourseMetrics, objective: Option<&ObjectiveMetrics>) -> Cohort {
    match self.target_group() {
      TargetGroup::AllLearners => Cohort::Everyone,
      TargetGroup::InactiveLearners => Cohort::Learners(course.inactive_learners.clone()),
      TargetGroup::LowScorers => Cohort::Learners(course.low_scorers.clone()),
      TargetGroup::BelowMastery => Cohort::Learners(
        objective
          .map(|o| o.struggling_learners.clone())
          .unwrap_or_else(|| course.struggling_learners.clone()),
      ),
    }
  }
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
  Below,
  Above,
}

impl Comparison {
  pub fn breached(self, value: f64, threshold: f64) -> bool {
    match self {
      Self::Below => value < threshold,
      Self::Above => value > threshold,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
  /// Checked against the course rollup.
  #[default]
  Course,
  /// Checked against every learning-objective rollup of the course.
  Objectives,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
  pub kind:       InterventionKind,
  pub metric:     MetricKey,
  pub comparison: Comparison,
  pub threshold:  f64,
  #[serde(default)]
  pub scope:      RuleScope,
}

/// Per-course analytics configuration. Missing values take the defaults;
/// a course with no configuration has no rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourseAnalyticsConfig {
  pub thresholds:              Vec<ThresholdRule>,
  /// Kinds absent from the map are disabled.
  pub feature_flags:           BTreeMap<InterventionKind, bool>,
  pub observation_window_days: u32,
  pub min_sample_size:         u32,
  pub mastery_threshold:       f64,
  pub low_score_threshold:     f64,
}

impl Default for CourseAnalyticsConfig {
  fn default() -> Self {
    Self {
      thresholds:              Vec::new(),
      feature_flags:           BTreeMap::new(),
      observation_window_days: 7,
      min_sample_size:         5,
      mastery_threshold:       0.7,
      low_score_threshold:     0.5,
    }
  }
}

impl CourseAnalyticsConfig {
  pub fn is_enabled(&self, kind: InterventionKind) -> bool {
    self.feature_flags.get(&kind).copied().unwrap_or(false)
  }
}

// ─── Breaches ────────────────────────────────────────────────────────────────

/// Identifies "the same" intervention for duplicate suppression.
pub type DedupKey = (CourseId, Option<ObjectiveId>, TargetGroup);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionParameters {
  pub metric:     MetricKey,
  pub comparison: Comparison,
  pub threshold:  f64,
  pub observed:   f64,
  pub cohort:     Cohort,
}

/// A threshold rule that fired against a rollup.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
  pub course_id:      CourseId,
  pub objective_id:   Option<ObjectiveId>,
  pub kind:           InterventionKind,
  pub parameters:     InterventionParameters,
  pub metrics_before: MetricValues,
  pub trigger_date:   NaiveDate,
  pub low_confidence: bool,
}

impl Breach {
  pub fn dedup_key(&self) -> DedupKey {
    (self.course_id, self.objective_id, self.kind.target_group())
  }

  pub fn into_new(self, created_at: DateTime<Utc>) -> NewIntervention {
    NewIntervention {
      course_id: self.course_id,
      objective_id: self.objective_id,
      kind: self.kind,
      target_group: self.kind.target_group(),
      parameters: self.parameters,
      metrics_before: self.metrics_before,
      trigger_date: self.trigger_date,
      low_confidence: self.low_confidence,
      created_at,
    }
  }
}

/// Check every rule against a course rollup and its objective rollups.
/// When several rules fire for the same key, the first one wins.
pub fn detect_breaches(
  config:     &CourseAnalyticsConfig,
  rollup:     &CourseAnalyticsRollup,
  lo_rollups: &[CourseLORollup],
) -> Vec<Breach> {
  let mut seen = BTreeSet::new();
  let mut breaches = Vec::new();

  for rule in &config.thresholds {
    let candidates: Vec<Breach> = match rule.scope {
      RuleScope::Course => rollup
        .metric(rule.metric)
        .filter(|v| rule.comparison.breached(*v, rule.threshold))
        .map(|observed| Breach {
          course_id:      rollup.course_id,
          objective_id:   None,
          kind:           rule.kind,
          parameters:     parameters(rule, observed, rule.kind.cohort(&rollup.metrics, None)),
          metrics_before: rollup.metric_values(),
          trigger_date:   rollup.snapshot_date,
          low_confidence: rollup.low_confidence,
        })
        .into_iter()
        .collect(),
      RuleScope::Objectives => lo_rollups
        .iter()
        .filter_map(|lo| {
          let observed = lo
            .metric(rule.metric)
            .filter(|v| rule.comparison.breached(*v, rule.threshold))?;
          Some(Breach {
            course_id:      rollup.course_id,
            objective_id:   Some(lo.objective_id),
            kind:           rule.kind,
            parameters:     parameters(
              rule,
              observed,
              rule.kind.cohort(&rollup.metrics, Some(&lo.metrics)),
            ),
            metrics_before: lo.metric_values(),
            trigger_date:   lo.snapshot_date,
            low_confidence: lo.low_confidence,
          })
        })
        .collect(),
    };

    for breach in candidates {
      if seen.insert(breach.dedup_key()) {
        breaches.push(breach);
      }
    }
  }
  breaches
}

fn parameters(rule: &ThresholdRule, observed: f64, cohort: Cohort) -> InterventionParameters {
  InterventionParameters {
    metric: rule.metric,
    comparison: rule.comparison,
    threshold: rule.threshold,
    observed,
    cohort,
  }
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

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
pub enum InterventionStatus {
  Pending,
  Scheduled,
  Executed,
  Evaluated,
  Cancelled,
}

impl InterventionStatus {
  pub fn can_transition_to(self, to: Self) -> bool {
    use InterventionStatus::*;
    matches!(
      (self, to),
      (Pending, Scheduled)
        | (Pending, Cancelled)
        | (Scheduled, Executed)
        | (Scheduled, Cancelled)
        | (Executed, Evaluated)
    )
  }

  /// Open interventions block new ones for the same key.
  pub fn is_open(self) -> bool {
    matches!(self, Self::Pending | Self::Scheduled | Self::Executed)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIntervention {
  pub course_id:      CourseId,
  pub objective_id:   Option<ObjectiveId>,
  pub kind:           InterventionKind,
  pub target_group:   TargetGroup,
  pub parameters:     InterventionParameters,
  pub metrics_before: MetricValues,
  pub trigger_date:   NaiveDate,
  pub low_confidence: bool,
  pub created_at:     DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseIntervention {
  pub intervention_id: InterventionId,
  pub course_id:       CourseId,
  pub objective_id:    Option<ObjectiveId>,
  pub kind:            InterventionKind,
  pub target_group:    TargetGroup,
  pub status:          InterventionStatus,
  pub parameters:      InterventionParameters,
  /// Metrics of the rollup that triggered the intervention.
  pub metrics_before:  MetricValues,
  pub trigger_date:    NaiveDate,
  pub low_confidence:  bool,
  pub created_at:      DateTime<Utc>,
  pub scheduled_at:    Option<DateTime<Utc>>,
  pub executed_at:     Option<DateTime<Utc>>,
  pub evaluated_at:    Option<DateTime<Utc>>,
  pub cancelled_at:    Option<DateTime<Utc>>,
}

impl CourseIntervention {
  pub fn dedup_key(&self) -> DedupKey {
    (self.course_id, self.objective_id, self.target_group)
  }

  /// Move to `to`, stamping the matching timestamp.
  pub fn transition(&mut self, to: InterventionStatus, at: DateTime<Utc>) -> Result<()> {
    if !self.status.can_transition_to(to) {
      return Err(Error::InvalidTransition { id: self.intervention_id, from: self.status, to });
    }
    match to {
      InterventionStatus::Scheduled => self.scheduled_at = Some(at),
      InterventionStatus::Executed => self.executed_at = Some(at),
      InterventionStatus::Evaluated => self.evaluated_at = Some(at),
      InterventionStatus::Cancelled => self.cancelled_at = Some(at),
      InterventionStatus::Pending => {}
    }
    self.status = to;
    Ok(())
  }

  /// Carry a later breach of the same key onto a pending intervention.
  /// Returns whether anything changed.
  pub fn refresh(&mut self, breach: &Breach) -> bool {
    if self.status != InterventionStatus::Pending || breach.dedup_key() != self.dedup_key() {
      return false;
    }
    let changed = self.parameters != breach.parameters
      || self.metrics_before != breach.metrics_before
      || self.trigger_date != breach.trigger_date
      || self.low_confidence != breach.low_confidence;
    if changed {
      self.parameters = breach.parameters.clone();
      self.metrics_before = breach.metrics_before.clone();
      self.trigger_date = breach.trigger_date;
      self.low_confidence = breach.low_confidence;
    }
    changed
  }
}

// ─── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInterventionResult {
  pub intervention_id: InterventionId,
  pub metrics_before:  MetricValues,
  pub metrics_after:   MetricValues,
  pub improvement:     MetricValues,
  /// Snapshot date of the rollup used as `metrics_after`.
  pub after_date:      NaiveDate,
  pub evaluated_at:    DateTime<Utc>,
}

impl NewInterventionResult {
  pub fn new(
    intervention:  &CourseIntervention,
    metrics_after: MetricValues,
    after_date:    NaiveDate,
    evaluated_at:  DateTime<Utc>,
  ) -> Self {
    Self {
      intervention_id: intervention.intervention_id,
      improvement: improvement(&intervention.metrics_before, &metrics_after),
      metrics_before: intervention.metrics_before.clone(),
      metrics_after,
      after_date,
      evaluated_at,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionResult {
  pub result_id:       i64,
  pub intervention_id: InterventionId,
  pub metrics_before:  MetricValues,
  pub metrics_after:   MetricValues,
  pub improvement:     MetricValues,
  pub after_date:      NaiveDate,
  pub evaluated_at:    DateTime<Utc>,
}

/// `after − before` for every metric present in both.
pub fn improvement(before: &MetricValues, after: &MetricValues) -> MetricValues {
  before
    .iter()
    .filter_map(|(k, b)| after.get(k).map(|a| (k.clone(), a - b)))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::rollup::{build_rollups, LearnerSnapshot, ObjectiveProgress, RollupInput};

  fn rollups(config: &CourseAnalyticsConfig) -> (CourseAnalyticsRollup, Vec<CourseLORollup>) {
    let learners: Vec<LearnerSnapshot> = (1..=6)
      .map(|id| {
        let mut objectives = BTreeMap::new();
        let earned = if id <= 4 { 2.0 } else { 9.0 };
        objectives.insert(7, ObjectiveProgress { earned, max: 10.0 });
        LearnerSnapshot {
          learner_id: id,
          grade: Some(if id == 1 { 0.2 } else { 0.8 }),
          completed_quizzes: u32::from(id != 6),
          objectives,
        }
      })
      .collect();
    let input = RollupInput {
      course_id: 3,
      snapshot_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
      quiz_count: 1,
      learners: &learners,
      open_interventions: 0,
      evaluated_interventions: 0,
      computed_at: Utc::now(),
    };
    build_rollups(&input, config)
  }

  fn rule(kind: InterventionKind, metric: MetricKey, threshold: f64, scope: RuleScope) -> ThresholdRule {
    ThresholdRule { kind, metric, comparison: Comparison::Below, threshold, scope }
  }

  #[test]
  fn transitions_follow_state_machine() {
    use InterventionStatus::*;
    assert!(Pending.can_transition_to(Scheduled));
    assert!(Scheduled.can_transition_to(Cancelled));
    assert!(Executed.can_transition_to(Evaluated));
    assert!(!Pending.can_transition_to(Executed));
    assert!(!Executed.can_transition_to(Cancelled));
    assert!(!Evaluated.can_transition_to(Pending));
    assert!(!Cancelled.is_open());
    assert!(Executed.is_open());
  }

  #[test]
  fn objective_rule_targets_struggling_learners() {
    let mut config = CourseAnalyticsConfig::default();
    config.thresholds = vec![rule(
      InterventionKind::Remediation,
      MetricKey::MasteredShare,
      0.5,
      RuleScope::Objectives,
    )];
    let (rollup, los) = rollups(&config);
    let breaches = detect_breaches(&config, &rollup, &los);

    assert_eq!(breaches.len(), 1);
    let b = &breaches[0];
    assert_eq!(b.objective_id, Some(7));
    assert_eq!(b.dedup_key(), (3, Some(7), TargetGroup::BelowMastery));
    assert_eq!(b.parameters.cohort, Cohort::Learners(vec![1, 2, 3, 4]));
    assert!(b.metrics_before.contains_key("mastered_share"));
  }

  #[test]
  fn course_mastered_share_rule_fires() {
    let mut config = CourseAnalyticsConfig::default();
    config.thresholds = vec![rule(
      InterventionKind::Remediation,
      MetricKey::MasteredShare,
      0.5,
      RuleScope::Course,
    )];
    let (rollup, los) = rollups(&config);
    let breaches = detect_breaches(&config, &rollup, &los);

    assert_eq!(breaches.len(), 1);
    let b = &breaches[0];
    assert_eq!(b.objective_id, None);
    assert!((b.parameters.observed - 2.0 / 6.0).abs() < 1e-12);
    assert_eq!(b.parameters.cohort, Cohort::Learners(vec![1, 2, 3, 4]));
  }

  #[test]
  fn course_rule_only_fires_when_breached() {
    let mut config = CourseAnalyticsConfig::default();
    config.thresholds = vec![
      rule(InterventionKind::Tutoring, MetricKey::MeanScore, 0.5, RuleScope::Course),
      rule(InterventionKind::Reminder, MetricKey::CompletionRate, 0.9, RuleScope::Course),
    ];
    let (rollup, los) = rollups(&config);
    let breaches = detect_breaches(&config, &rollup, &los);

    assert_eq!(breaches.len(), 1);
    assert_eq!(breaches[0].kind, InterventionKind::Reminder);
    assert_eq!(breaches[0].parameters.cohort, Cohort::Learners(vec![6]));
  }

  #[test]
  fn duplicate_rules_collapse_to_one_breach() {
    let mut config = CourseAnalyticsConfig::default();
    config.thresholds = vec![
      rule(InterventionKind::Reminder, MetricKey::CompletionRate, 0.9, RuleScope::Course),
      rule(InterventionKind::Reminder, MetricKey::CompletionRate, 0.95, RuleScope::Course),
    ];
    let (rollup, los) = rollups(&config);
    assert_eq!(detect_breaches(&config, &rollup, &los).len(), 1);
  }

  #[test]
  fn invalid_transition_is_rejected() {
    let (rollup, los) = rollups(&CourseAnalyticsConfig::default());
    let breach = Breach {
      course_id:      rollup.course_id,
      objective_id:   None,
      kind:           InterventionKind::InstructorAlert,
      parameters:     parameters(
        &rule(InterventionKind::InstructorAlert, MetricKey::MeanScore, 1.0, RuleScope::Course),
        0.7,
        Cohort::Everyone,
      ),
      metrics_before: rollup.metric_values(),
      trigger_date:   rollup.snapshot_date,
      low_confidence: los.is_empty(),
    };
    let new = breach.into_new(Utc::now());
    let mut iv = CourseIntervention {
      intervention_id: 1,
      course_id:       new.course_id,
      objective_id:    new.objective_id,
      kind:            new.kind,
      target_group:    new.target_group,
      status:          InterventionStatus::Pending,
      parameters:      new.parameters,
      metrics_before:  new.metrics_before,
      trigger_date:    new.trigger_date,
      low_confidence:  new.low_confidence,
      created_at:      new.created_at,
      scheduled_at:    None,
      executed_at:     None,
      evaluated_at:    None,
      cancelled_at:    None,
    };

    let err = iv.transition(InterventionStatus::Executed, Utc::now()).unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { id: 1, .. }));
    iv.transition(InterventionStatus::Scheduled, Utc::now()).unwrap();
    assert!(iv.scheduled_at.is_some());
  }

  #[test]
  fn later_confident_breach_refreshes_pending_intervention() {
    let mut config = CourseAnalyticsConfig::default();
    config.thresholds = vec![rule(
      InterventionKind::Reminder,
      MetricKey::CompletionRate,
      0.9,
      RuleScope::Course,
    )];
    let (rollup, los) = rollups(&config);
    let mut breach = detect_breaches(&config, &rollup, &los).remove(0);
    breach.low_confidence = true;
    let new = breach.clone().into_new(Utc::now());
    let mut iv = CourseIntervention {
      intervention_id: 1,
      course_id:       new.course_id,
      objective_id:    new.objective_id,
      kind:            new.kind,
      target_group:    new.target_group,
      status:          InterventionStatus::Pending,
      parameters:      new.parameters,
      metrics_before:  new.metrics_before,
      trigger_date:    new.trigger_date,
      low_confidence:  new.low_confidence,
      created_at:      new.created_at,
      scheduled_at:    None,
      executed_at:     None,
      evaluated_at:    None,
      cancelled_at:    None,
    };
    assert!(!iv.refresh(&breach));

    breach.low_confidence = false;
    breach.trigger_date = breach.trigger_date.succ_opt().unwrap();
    assert!(iv.refresh(&breach));
    assert!(!iv.low_confidence);
    assert_eq!(iv.trigger_date, breach.trigger_date);

    iv.transition(InterventionStatus::Scheduled, Utc::now()).unwrap();
    breach.low_confidence = true;
    assert!(!iv.refresh(&breach));
    assert!(!iv.low_confidence);
  }

  #[test]
  fn improvement_is_after_minus_before() {
    let before: MetricValues = [("mean_score".to_string(), 0.4), ("x".to_string(), 1.0)].into();
    let after: MetricValues = [("mean_score".to_string(), 0.55)].into();
    let diff = improvement(&before, &after);
    assert_eq!(diff.len(), 1);
    assert!((diff["mean_score"] - 0.15).abs() < 1e-12);
  }
}
