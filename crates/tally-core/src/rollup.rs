//! Confidence-scored course and learning-objective snapshots.
//!
//! A rollup is a pure function of per-learner inputs captured "as of" a
//! calendar date. The engine gathers those inputs; this module turns them
//! into metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{
  authoring::Question,
  ids::{CourseId, LearnerId, ObjectiveId, QuestionId, QuizId},
  intervention::CourseAnalyticsConfig,
  quiz_result::QuizResult,
  scoring::QuestionAttempt,
};

const DISTRIBUTION_BUCKETS: usize = 10;

/// `1 - 1/sqrt(n + 1)`: zero with no samples, approaching 1.
pub fn confidence(sample_size: u32) -> f64 {
  (1.0 - 1.0 / (f64::from(sample_size) + 1.0).sqrt()).clamp(0.0, 1.0)
}

// ─── Learner inputs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveProgress {
  pub earned: f64,
  pub max:    f64,
}

impl ObjectiveProgress {
  pub fn mastery(&self) -> Option<f64> {
    (self.max > 0.0).then(|| (self.earned / self.max).clamp(0.0, 1.0))
  }
}

/// One enrolled learner's standing at a rollup cut-off.
#[derive(Debug, Clone, PartialEq)]
pub struct LearnerSnapshot {
  pub learner_id:        LearnerId,
  /// The course grade in effect at the cut-off; `None` when incomplete.
  pub grade:             Option<f64>,
  pub completed_quizzes: u32,
  pub objectives:        BTreeMap<ObjectiveId, ObjectiveProgress>,
}

impl LearnerSnapshot {
  /// Build a learner's inputs from records filtered to before `cutoff`.
  ///
  /// Attempts are reduced to the latest per `(quiz, question)`; questions
  /// without an objective do not contribute to mastery.
  pub fn capture(
    learner_id: LearnerId,
    grade:      Option<f64>,
    results:    &[QuizResult],
    attempts:   &[QuestionAttempt],
    questions:  &BTreeMap<QuestionId, Question>,
    cutoff:     DateTime<Utc>,
  ) -> Self {
    let completed_quizzes = results
      .iter()
      .filter(|r| r.learner_id == learner_id && r.is_scored())
      .filter(|r| r.completion_time.is_some_and(|t| t < cutoff))
      .count();

    let mut latest: BTreeMap<(QuizId, QuestionId), &QuestionAttempt> = BTreeMap::new();
    for attempt in attempts
      .iter()
      .filter(|a| a.learner_id == learner_id && a.created_at < cutoff)
    {
      latest
        .entry((attempt.quiz_id, attempt.question_id))
        .and_modify(|current| {
          if (attempt.attempt_index, attempt.attempt_id)
            > (current.attempt_index, current.attempt_id)
          {
            *current = attempt;
          }
        })
        .or_insert(attempt);
    }

    let mut objectives: BTreeMap<ObjectiveId, ObjectiveProgress> = BTreeMap::new();
    for ((_, question_id), attempt) in latest {
      let Some(question) = questions.get(&question_id) else { continue };
      let Some(objective) = question.objective_id else { continue };
      let max = question.max_points.max(0.0);
      let progress = objectives.entry(objective).or_default();
      progress.earned += attempt.points_earned.clamp(0.0, max);
      progress.max += max;
    }

    Self {
      learner_id,
      grade,
      completed_quizzes: u32::try_from(completed_quizzes).unwrap_or(u32::MAX),
      objectives,
    }
  }

  pub fn is_active(&self) -> bool { self.completed_quizzes > 0 }

  /// Mastery over all objectives combined.
  pub fn overall_mastery(&self) -> Option<f64> {
    let total = self.objectives.values().fold(
      ObjectiveProgress::default(),
      |acc, p| ObjectiveProgress { earned: acc.earned + p.earned, max: acc.max + p.max },
    );
    total.mastery()
  }
}

// ─── Metrics ─────────────────────────────────────────────────────────────────

/// Named scalar metrics that threshold rules can refer to.
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
  strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MetricKey {
  CompletionRate,
  MeanScore,
  MedianScore,
  MeanMastery,
  MasteredShare,
  InactiveShare,
  LowScorerShare,
}

/// A flat `metric name → value` bundle, as recorded on interventions.
pub type MetricValues = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseMetrics {
  pub enrolled:                u32,
  /// Learners with at least one completed quiz.
  pub active_learners:         u32,
  pub graded_learners:         u32,
  pub completion_rate:         f64,
  pub mean_score:              Option<f64>,
  pub median_score:            Option<f64>,
  /// Graded learners per 0.1-wide grade bucket; 1.0 falls in the last one.
  pub score_distribution:      Vec<u32>,
  pub objective_mastery:       BTreeMap<ObjectiveId, f64>,
  pub inactive_learners:       Vec<LearnerId>,
  pub low_scorers:             Vec<LearnerId>,
  /// Learners whose combined objective mastery is below the threshold.
  pub struggling_learners:     Vec<LearnerId>,
  /// Share of learners with objective data whose combined mastery meets the
  /// threshold.
  #[serde(default)]
  pub mastered_share:          Option<f64>,
  pub open_interventions:      u32,
  pub evaluated_interventions: u32,
}

impl CourseMetrics {
  pub fn metric(&self, key: MetricKey) -> Option<f64> {
    match key {
      MetricKey::CompletionRate => Some(self.completion_rate),
      MetricKey::MeanScore => self.mean_score,
      MetricKey::MedianScore => self.median_score,
      MetricKey::MeanMastery => mean(self.objective_mastery.values().copied()),
      MetricKey::MasteredShare => self.mastered_share,
      MetricKey::InactiveShare => {
        share(self.inactive_learners.len(), self.enrolled as usize)
      }
      MetricKey::LowScorerShare => {
        share(self.low_scorers.len(), self.graded_learners as usize)
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveMetrics {
  pub sample_size:         u32,
  pub mean_mastery:        Option<f64>,
  pub mastered_share:      Option<f64>,
  pub struggling_learners: Vec<LearnerId>,
}

impl ObjectiveMetrics {
  pub fn metric(&self, key: MetricKey) -> Option<f64> {
    match key {
      MetricKey::MeanMastery => self.mean_mastery,
      MetricKey::MasteredShare => self.mastered_share,
      _ => None,
    }
  }
}

// ─── Rollups ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseAnalyticsRollup {
  pub course_id:      CourseId,
  pub snapshot_date:  NaiveDate,
  pub metrics:        CourseMetrics,
  pub sample_size:    u32,
  pub confidence:     f64,
  /// Stored regardless, but below the configured minimum sample size.
  pub low_confidence: bool,
  pub computed_at:    DateTime<Utc>,
}

impl CourseAnalyticsRollup {
  pub fn metric(&self, key: MetricKey) -> Option<f64> { self.metrics.metric(key) }

  pub fn metric_values(&self) -> MetricValues {
    MetricKey::iter()
      .filter_map(|k| self.metric(k).map(|v| (k.to_string(), v)))
      .collect()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseLORollup {
  pub course_id:      CourseId,
  pub objective_id:   ObjectiveId,
  pub snapshot_date:  NaiveDate,
  pub metrics:        ObjectiveMetrics,
  pub sample_size:    u32,
  pub confidence:     f64,
  pub low_confidence: bool,
  pub computed_at:    DateTime<Utc>,
}

impl CourseLORollup {
  pub fn metric(&self, key: MetricKey) -> Option<f64> { self.metrics.metric(key) }

  pub fn metric_values(&self) -> MetricValues {
    MetricKey::iter()
      .filter_map(|k| self.metric(k).map(|v| (k.to_string(), v)))
      .collect()
  }
}

/// Everything a rollup is computed from.
#[derive(Debug, Clone)]
pub struct RollupInput<'a> {
  pub course_id:               CourseId,
  pub snapshot_date:           NaiveDate,
  /// Quizzes of the course, for the completion-rate denominator.
  pub quiz_count:              usize,
  /// One snapshot per enrolled learner.
  pub learners:                &'a [LearnerSnapshot],
  pub open_interventions:      u32,
  pub evaluated_interventions: u32,
  pub computed_at:             DateTime<Utc>,
}

pub fn build_rollups(
  input:  &RollupInput<'_>,
  config: &CourseAnalyticsConfig,
) -> (CourseAnalyticsRollup, Vec<CourseLORollup>) {
  let learners = input.learners;
  let enrolled = learners.len();

  let mut grades: Vec<f64> = learners
    .iter()
    .filter_map(|l| l.grade)
    .filter(|g| g.is_finite())
    .map(|g| g.clamp(0.0, 1.0))
    .collect();
  grades.sort_by(f64::total_cmp);

  let mut score_distribution = vec![0u32; DISTRIBUTION_BUCKETS];
  for g in &grades {
    let bucket = ((g * DISTRIBUTION_BUCKETS as f64) as usize).min(DISTRIBUTION_BUCKETS - 1);
    score_distribution[bucket] += 1;
  }

  let completed: usize = learners.iter().map(|l| l.completed_quizzes as usize).sum();
  let possible = enrolled * input.quiz_count;
  let completion_rate = if possible == 0 {
    0.0
  } else {
    (completed as f64 / possible as f64).min(1.0)
  };

  let inactive_learners = learners
    .iter()
    .filter(|l| !l.is_active())
    .map(|l| l.learner_id)
    .collect();
  let low_scorers = learners
    .iter()
    .filter(|l| l.grade.is_some_and(|g| g < config.low_score_threshold))
    .map(|l| l.learner_id)
    .collect();
  let overall: Vec<(LearnerId, f64)> = learners
    .iter()
    .filter_map(|l| l.overall_mastery().map(|m| (l.learner_id, m)))
    .collect();
  let struggling_learners = overall
    .iter()
    .filter(|(_, m)| *m < config.mastery_threshold)
    .map(|(id, _)| *id)
    .collect::<Vec<_>>();
  let mastered_share = share(overall.len() - struggling_learners.len(), overall.len());

  // Per-objective mastery samples.
  let mut by_objective: BTreeMap<ObjectiveId, Vec<(LearnerId, f64)>> = BTreeMap::new();
  for learner in learners {
    for (objective, progress) in &learner.objectives {
      if let Some(m) = progress.mastery() {
        by_objective.entry(*objective).or_default().push((learner.learner_id, m));
      }
    }
  }

  let lo_rollups: Vec<CourseLORollup> = by_objective
    .iter()
    .map(|(&objective_id, samples)| {
      let sample_size = count(samples.len());
      let mastered = samples.iter().filter(|(_, m)| *m >= config.mastery_threshold).count();
      CourseLORollup {
        course_id: input.course_id,
        objective_id,
        snapshot_date: input.snapshot_date,
        metrics: ObjectiveMetrics {
          sample_size,
          mean_mastery: mean(samples.iter().map(|(_, m)| *m)),
          mastered_share: share(mastered, samples.len()),
          struggling_learners: samples
            .iter()
            .filter(|(_, m)| *m < config.mastery_threshold)
            .map(|(id, _)| *id)
            .collect(),
        },
        sample_size,
        confidence: confidence(sample_size),
        low_confidence: sample_size < config.min_sample_size,
        computed_at: input.computed_at,
      }
    })
    .collect();

  let objective_mastery = lo_rollups
    .iter()
    .filter_map(|r| r.metrics.mean_mastery.map(|m| (r.objective_id, m)))
    .collect();

  let active = count(learners.iter().filter(|l| l.is_active()).count());
  let metrics = CourseMetrics {
    enrolled: count(enrolled),
    active_learners: active,
    graded_learners: count(grades.len()),
    completion_rate,
    mean_score: mean(grades.iter().copied()),
    median_score: median(&grades),
    score_distribution,
    objective_mastery,
    inactive_learners,
    low_scorers,
    struggling_learners,
    mastered_share,
    open_interventions: input.open_interventions,
    evaluated_interventions: input.evaluated_interventions,
  };

  let rollup = CourseAnalyticsRollup {
    course_id: input.course_id,
    snapshot_date: input.snapshot_date,
    metrics,
    sample_size: active,
    confidence: confidence(active),
    low_confidence: active < config.min_sample_size,
    computed_at: input.computed_at,
  };

  (rollup, lo_rollups)
}

fn count(n: usize) -> u32 { u32::try_from(n).unwrap_or(u32::MAX) }

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
  let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
  (n > 0).then(|| sum / n as f64)
}

fn share(part: usize, whole: usize) -> Option<f64> {
  (whole > 0).then(|| part as f64 / whole as f64)
}

/// Median of an already sorted slice.
fn median(sorted: &[f64]) -> Option<f64> {
  let n = sorted.len();
  match n {
    0 => None,
    _ if n % 2 == 1 => Some(sorted[n / 2]),
    _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn learner(id: LearnerId, grade: Option<f64>, completed: u32) -> LearnerSnapshot {
    LearnerSnapshot {
      learner_id: id,
      grade,
      completed_quizzes: completed,
      objectives: BTreeMap::new(),
    }
  }

  fn input(learners: &[LearnerSnapshot]) -> RollupInput<'_> {
    RollupInput {
      course_id: 1,
      snapshot_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
      quiz_count: 2,
      learners,
      open_interventions: 0,
      evaluated_interventions: 0,
      computed_at: Utc::now(),
    }
  }

  #[test]
  fn confidence_grows_with_sample_size() {
    assert_eq!(confidence(0), 0.0);
    assert!((confidence(3) - 0.5).abs() < 1e-12);
    assert!(confidence(100) > confidence(99));
    assert!(confidence(u32::MAX) <= 1.0);
  }

  #[test]
  fn three_completions_are_low_confidence() {
    let learners = vec![
      learner(1, Some(0.9), 1),
      learner(2, Some(0.4), 2),
      learner(3, Some(0.7), 1),
      learner(4, None, 0),
    ];
    let (rollup, _) = build_rollups(&input(&learners), &CourseAnalyticsConfig::default());

    assert_eq!(rollup.sample_size, 3);
    assert!((rollup.confidence - 0.5).abs() < 1e-12);
    assert!(rollup.low_confidence);
    assert_eq!(rollup.metrics.enrolled, 4);
    assert!((rollup.metrics.completion_rate - 4.0 / 8.0).abs() < 1e-12);
    assert_eq!(rollup.metrics.median_score, Some(0.7));
    assert_eq!(rollup.metrics.inactive_learners, vec![4]);
    assert_eq!(rollup.metrics.low_scorers, vec![2]);
  }

  #[test]
  fn distribution_puts_perfect_scores_in_last_bucket() {
    let learners = vec![learner(1, Some(1.0), 1), learner(2, Some(0.05), 1)];
    let (rollup, _) = build_rollups(&input(&learners), &CourseAnalyticsConfig::default());
    assert_eq!(rollup.metrics.score_distribution[9], 1);
    assert_eq!(rollup.metrics.score_distribution[0], 1);
    assert_eq!(rollup.metrics.score_distribution.iter().sum::<u32>(), 2);
  }

  #[test]
  fn objective_rollups_measure_mastery() {
    let mut a = learner(1, Some(0.8), 1);
    a.objectives.insert(5, ObjectiveProgress { earned: 9.0, max: 10.0 });
    let mut b = learner(2, Some(0.3), 1);
    b.objectives.insert(5, ObjectiveProgress { earned: 3.0, max: 10.0 });
    let learners = vec![a, b];

    let (rollup, los) = build_rollups(&input(&learners), &CourseAnalyticsConfig::default());
    assert_eq!(los.len(), 1);
    let lo = &los[0];
    assert_eq!(lo.sample_size, 2);
    assert!((lo.metrics.mean_mastery.unwrap() - 0.6).abs() < 1e-12);
    assert_eq!(lo.metrics.mastered_share, Some(0.5));
    assert_eq!(lo.metrics.struggling_learners, vec![2]);
    assert_eq!(rollup.metrics.struggling_learners, vec![2]);
    assert_eq!(rollup.metrics.mastered_share, Some(0.5));
    assert_eq!(rollup.metrics.metric(MetricKey::MasteredShare), Some(0.5));
    assert!(rollup.metric_values().contains_key("mean_mastery"));
    assert!(rollup.metric_values().contains_key("mastered_share"));
  }

  #[test]
  fn empty_course_has_no_scores() {
    let (rollup, los) = build_rollups(&input(&[]), &CourseAnalyticsConfig::default());
    assert_eq!(rollup.sample_size, 0);
    assert_eq!(rollup.metrics.mean_score, None);
    assert_eq!(rollup.metrics.completion_rate, 0.0);
    assert_eq!(rollup.metrics.metric(MetricKey::MasteredShare), None);
    assert!(los.is_empty());
  }
}
