//! Streaks, experience, levels, and the answer-streak bonus.
//!
//! Stats only move in response to a completed quiz result. Each completion is
//! credited once per `(learner, quiz, synced_at)`; the [`CompletionMarker`]
//! written alongside the stats is what makes replays harmless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  ids::{LearnerId, QuizId},
  quiz_result::QuizResult,
};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GamificationConfig {
  /// Minimum normalized score for a completion to extend the streak.
  pub success_threshold:    f64,
  /// Experience awarded per raw point earned.
  pub xp_per_point:         f64,
  /// `threshold(level) = level_base * level^1.5`.
  pub level_base:           f64,
  /// Consecutive correct answers needed before the bonus kicks in.
  pub streak_bonus_min_run: u32,
  /// Bonus points per correct answer at or past the minimum run.
  pub streak_bonus_points:  f64,
}

impl Default for GamificationConfig {
  fn default() -> Self {
    Self {
      success_threshold:    0.6,
      xp_per_point:         1.0,
      level_base:           100.0,
      streak_bonus_min_run: 3,
      streak_bonus_points:  1.0,
    }
  }
}

impl GamificationConfig {
  /// Experience needed to advance from `level` to `level + 1`.
  pub fn level_threshold(&self, level: u32) -> f64 {
    self.level_base * f64::from(level.max(1)).powf(1.5)
  }

  /// Bonus earned by a sequence of answers in the order they were given.
  pub fn streak_bonus(&self, answers: impl IntoIterator<Item = bool>) -> f64 {
    let min_run = self.streak_bonus_min_run.max(1);
    let mut run = 0u32;
    let mut bonus = 0.0;
    for correct in answers {
      if correct {
        run = run.saturating_add(1);
        if run >= min_run {
          bonus += self.streak_bonus_points.max(0.0);
        }
      } else {
        run = 0;
      }
    }
    bonus
  }
}

// ─── Stats ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerStats {
  pub learner_id:        LearnerId,
  pub total_points:      f64,
  pub current_level:     u32,
  /// Experience accumulated towards the next level.
  pub experience_points: f64,
  pub current_streak:    u32,
  pub best_streak:       u32,
  pub perfect_scores:    u32,
  pub quizzes_completed: u32,
  pub avg_response_secs: f64,
  pub responses_counted: u32,
  pub updated_at:        Option<DateTime<Utc>>,
}

impl LearnerStats {
  pub fn new(learner_id: LearnerId) -> Self {
    Self {
      learner_id,
      total_points: 0.0,
      current_level: 1,
      experience_points: 0.0,
      current_streak: 0,
      best_streak: 0,
      perfect_scores: 0,
      quizzes_completed: 0,
      avg_response_secs: 0.0,
      responses_counted: 0,
      updated_at: None,
    }
  }

  /// Add (or, for a negative delta, remove) experience and level up as many
  /// times as the curve allows. Levels never go down. Returns levels gained.
  fn add_experience(&mut self, xp: f64, config: &GamificationConfig) -> u32 {
    self.experience_points = (self.experience_points + xp).max(0.0);
    let mut gained = 0;
    loop {
      let threshold = config.level_threshold(self.current_level);
      if threshold <= 0.0 || self.experience_points < threshold {
        break;
      }
      self.experience_points -= threshold;
      self.current_level += 1;
      gained += 1;
    }
    gained
  }

  fn record_responses(&mut self, response_times: &[f64]) {
    for &t in response_times.iter().filter(|t| t.is_finite() && **t >= 0.0) {
      self.responses_counted += 1;
      self.avg_response_secs +=
        (t - self.avg_response_secs) / f64::from(self.responses_counted);
    }
  }
}

/// Records that a quiz completion has been credited to a learner's stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMarker {
  pub learner_id:     LearnerId,
  pub quiz_id:        QuizId,
  /// `synced_at` of the quiz result that was credited.
  pub synced_at:      DateTime<Utc>,
  pub credited_raw:   f64,
  pub credited_bonus: f64,
}

// ─── Applying a completion ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum GamificationUpdate {
  /// The result is still in progress; nothing to credit.
  NotCompleted,
  /// This exact result was already credited.
  AlreadyProcessed,
  Applied {
    stats:         LearnerStats,
    marker:        CompletionMarker,
    levels_gained: u32,
  },
}

/// Fold one completed quiz result into a learner's stats.
///
/// A first completion extends or resets the streak and counts towards
/// perfect scores and response time. A re-synced result for a quiz that was
/// already credited only adjusts points and experience by the difference.
pub fn apply_completion(
  config:         &GamificationConfig,
  mut stats:      LearnerStats,
  previous:       Option<&CompletionMarker>,
  result:         &QuizResult,
  response_times: &[f64],
  now:            DateTime<Utc>,
) -> GamificationUpdate {
  if !result.is_scored() {
    return GamificationUpdate::NotCompleted;
  }
  if previous.is_some_and(|m| m.synced_at == result.synced_at) {
    return GamificationUpdate::AlreadyProcessed;
  }

  let (raw_delta, bonus_delta) = match previous {
    Some(m) => (
      result.raw_total_points - m.credited_raw,
      result.bonuses_total - m.credited_bonus,
    ),
    None => (result.raw_total_points, result.bonuses_total),
  };

  if previous.is_none() {
    stats.quizzes_completed += 1;
    if result.score >= config.success_threshold {
      stats.current_streak += 1;
    } else {
      stats.current_streak = 0;
    }
    stats.best_streak = stats.best_streak.max(stats.current_streak);
    if result.is_perfect() {
      stats.perfect_scores += 1;
    }
    stats.record_responses(response_times);
  }

  stats.total_points = (stats.total_points + raw_delta + bonus_delta).max(0.0);
  let levels_gained = stats.add_experience(raw_delta * config.xp_per_point, config);
  stats.updated_at = Some(now);

  let marker = CompletionMarker {
    learner_id:     result.learner_id,
    quiz_id:        result.quiz_id,
    synced_at:      result.synced_at,
    credited_raw:   result.raw_total_points,
    credited_bonus: result.bonuses_total,
  };

  GamificationUpdate::Applied { stats, marker, levels_gained }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;
  use crate::quiz_result::QuizStatus;

  fn completed(raw: f64, max: f64, synced_at: DateTime<Utc>) -> QuizResult {
    QuizResult {
      learner_id: 1,
      quiz_id: 5,
      status: QuizStatus::Completed,
      raw_total_points: raw,
      max_points: max,
      bonuses_total: 0.0,
      score: raw / max,
      completion_time: Some(synced_at),
      synced_at,
      attempt_count: 1,
      last_attempt_id: Some(1),
      version: 1,
    }
  }

  fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, hour, 0, 0).unwrap()
  }

  #[test]
  fn streak_bonus_counts_answers_past_min_run() {
    let cfg = GamificationConfig::default();
    assert_eq!(cfg.streak_bonus([true, true, false]), 0.0);
    assert_eq!(cfg.streak_bonus([true, true, true, true]), 2.0);
    assert_eq!(cfg.streak_bonus([true, true, false, true, true, true]), 1.0);
  }

  #[test]
  fn level_threshold_follows_curve() {
    let cfg = GamificationConfig::default();
    assert!((cfg.level_threshold(1) - 100.0).abs() < 1e-9);
    assert!((cfg.level_threshold(4) - 800.0).abs() < 1e-9);
  }

  #[test]
  fn first_completion_extends_streak_and_levels_up() {
    let cfg = GamificationConfig { level_base: 10.0, ..Default::default() };
    let update = apply_completion(
      &cfg,
      LearnerStats::new(1),
      None,
      &completed(30.0, 30.0, at(9)),
      &[4.0, 6.0],
      at(9),
    );
    let GamificationUpdate::Applied { stats, marker, levels_gained } = update else {
      panic!("expected Applied");
    };
    assert_eq!(stats.current_streak, 1);
    assert_eq!(stats.best_streak, 1);
    assert_eq!(stats.perfect_scores, 1);
    assert_eq!(stats.total_points, 30.0);
    // 30 xp: level 1 costs 10, level 2 costs 10 * 2^1.5 ≈ 28.28.
    assert_eq!(levels_gained, 1);
    assert_eq!(stats.current_level, 2);
    assert!((stats.experience_points - 20.0).abs() < 1e-9);
    assert!((stats.avg_response_secs - 5.0).abs() < 1e-9);
    assert_eq!(marker.synced_at, at(9));
  }

  #[test]
  fn replaying_same_sync_is_noop() {
    let cfg = GamificationConfig::default();
    let result = completed(10.0, 30.0, at(9));
    let marker = CompletionMarker {
      learner_id:     1,
      quiz_id:        5,
      synced_at:      at(9),
      credited_raw:   10.0,
      credited_bonus: 0.0,
    };
    let update =
      apply_completion(&cfg, LearnerStats::new(1), Some(&marker), &result, &[], at(10));
    assert_eq!(update, GamificationUpdate::AlreadyProcessed);
  }

  #[test]
  fn resync_credits_only_delta() {
    let cfg = GamificationConfig::default();
    let mut stats = LearnerStats::new(1);
    stats.total_points = 10.0;
    stats.experience_points = 10.0;
    stats.current_streak = 4;
    stats.quizzes_completed = 1;
    let marker = CompletionMarker {
      learner_id:     1,
      quiz_id:        5,
      synced_at:      at(9),
      credited_raw:   10.0,
      credited_bonus: 0.0,
    };
    let update =
      apply_completion(&cfg, stats, Some(&marker), &completed(25.0, 30.0, at(11)), &[], at(11));
    let GamificationUpdate::Applied { stats, .. } = update else {
      panic!("expected Applied");
    };
    assert_eq!(stats.total_points, 25.0);
    assert_eq!(stats.experience_points, 25.0);
    assert_eq!(stats.current_streak, 4);
    assert_eq!(stats.quizzes_completed, 1);
  }

  #[test]
  fn failing_score_resets_streak_but_keeps_best() {
    let cfg = GamificationConfig::default();
    let mut stats = LearnerStats::new(1);
    stats.current_streak = 3;
    stats.best_streak = 3;
    let update = apply_completion(&cfg, stats, None, &completed(5.0, 30.0, at(9)), &[], at(9));
    let GamificationUpdate::Applied { stats, .. } = update else {
      panic!("expected Applied");
    };
    assert_eq!(stats.current_streak, 0);
    assert_eq!(stats.best_streak, 3);
  }

  #[test]
  fn in_progress_result_is_not_credited() {
    let cfg = GamificationConfig::default();
    let mut result = completed(5.0, 30.0, at(9));
    result.status = QuizStatus::InProgress;
    let update = apply_completion(&cfg, LearnerStats::new(1), None, &result, &[], at(9));
    assert_eq!(update, GamificationUpdate::NotCompleted);
  }
}
