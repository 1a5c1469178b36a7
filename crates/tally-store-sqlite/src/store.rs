//! [`SqliteStore`], the SQLite implementation of [`GradeStore`].

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::OptionalExtension as _;

use tally_core::{
  authoring::{Course, Question, Quiz, QuizQuestion},
  columns::{ColumnQuizMapping, GradeColumn},
  course_grade::{CourseGradeHistory, CourseGradeResult, GradeConfig, NewGradeHistory},
  gamification::{CompletionMarker, LearnerStats},
  ids::{CourseId, InterventionId, LearnerId, QuestionId, QuizId},
  intervention::{
    CourseAnalyticsConfig, CourseIntervention, InterventionResult, InterventionStatus,
    NewIntervention, NewInterventionResult,
  },
  quiz_result::QuizResult,
  rollup::{CourseAnalyticsRollup, CourseLORollup},
  scoring::{NewAttempt, QuestionAttempt},
  store::{CasOutcome, GradeStore},
};

use crate::{
  encode::{
    encode_date, encode_dt, RawAttempt, RawColumn, RawCourseGrade, RawGradeHistory,
    RawIntervention, RawInterventionResult, RawLORollup, RawMarker, RawQuiz, RawQuizQuestion,
    RawQuizResult, RawRollup, RawStats, ATTEMPT_COLUMNS, COURSE_GRADE_COLUMNS, HISTORY_COLUMNS,
    INTERVENTION_COLUMNS, INTERVENTION_RESULT_COLUMNS, LO_ROLLUP_COLUMNS, QUIZ_COLUMNS,
    QUIZ_RESULT_COLUMNS, ROLLUP_COLUMNS,
  },
  schema::SCHEMA,
  Result,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Tally grade store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

/// `?, ?, ?` for an `IN (...)` list of `n` values.
fn placeholders(n: usize) -> String { vec!["?"; n].join(", ") }

// ─── CAS writes ──────────────────────────────────────────────────────────────

/// Insert-if-absent or update-if-version-matches. Returns whether a row was
/// written.
fn cas_write_quiz_result(
  conn: &rusqlite::Connection,
  r: &QuizResult,
  expected_version: Option<i64>,
) -> rusqlite::Result<bool> {
  let status = r.status.as_ref();
  let completion_time = r.completion_time.map(encode_dt);
  let synced_at = encode_dt(r.synced_at);

  let changed = match expected_version {
    None => conn.execute(
      &format!(
        "INSERT INTO quiz_results ({QUIZ_RESULT_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1)
         ON CONFLICT (learner_id, quiz_id) DO NOTHING"
      ),
      rusqlite::params![
        r.learner_id,
        r.quiz_id,
        status,
        r.raw_total_points,
        r.max_points,
        r.bonuses_total,
        r.score,
        completion_time,
        synced_at,
        r.attempt_count,
        r.last_attempt_id,
      ],
    )?,
    Some(version) => conn.execute(
      "UPDATE quiz_results SET
         status = ?3, raw_total_points = ?4, max_points = ?5, bonuses_total = ?6,
         score = ?7, completion_time = ?8, synced_at = ?9, attempt_count = ?10,
         last_attempt_id = ?11, version = version + 1
       WHERE learner_id = ?1 AND quiz_id = ?2 AND version = ?12",
      rusqlite::params![
        r.learner_id,
        r.quiz_id,
        status,
        r.raw_total_points,
        r.max_points,
        r.bonuses_total,
        r.score,
        completion_time,
        synced_at,
        r.attempt_count,
        r.last_attempt_id,
        version,
      ],
    )?,
  };
  Ok(changed == 1)
}

struct EncodedGrade {
  learner_id:   i64,
  course_id:    i64,
  grade_json:   String,
  columns_json: String,
  computed_at:  String,
  value_since:  String,
  last_error:   Option<String>,
}

impl EncodedGrade {
  fn new(r: &CourseGradeResult) -> Result<Self> {
    Ok(Self {
      learner_id:   r.learner_id,
      course_id:    r.course_id,
      grade_json:   serde_json::to_string(&r.grade)?,
      columns_json: serde_json::to_string(&r.columns)?,
      computed_at:  encode_dt(r.computed_at),
      value_since:  encode_dt(r.value_since),
      last_error:   r.last_error.clone(),
    })
  }
}

struct EncodedHistory {
  learner_id:         i64,
  course_id:          i64,
  prior_grade_json:   String,
  prior_columns_json: String,
  prior_value_since:  String,
  prior_computed_at:  String,
  changed_at:         String,
}

impl EncodedHistory {
  fn new(h: &NewGradeHistory) -> Result<Self> {
    Ok(Self {
      learner_id:         h.learner_id,
      course_id:          h.course_id,
      prior_grade_json:   serde_json::to_string(&h.prior_grade)?,
      prior_columns_json: serde_json::to_string(&h.prior_columns)?,
      prior_value_since:  encode_dt(h.prior_value_since),
      prior_computed_at:  encode_dt(h.prior_computed_at),
      changed_at:         encode_dt(h.changed_at),
    })
  }
}

struct EncodedRollup {
  objective_id:   Option<i64>,
  snapshot_date:  String,
  metrics_json:   String,
  sample_size:    u32,
  confidence:     f64,
  low_confidence: bool,
  computed_at:    String,
}

// ─── GradeStore impl ─────────────────────────────────────────────────────────

impl GradeStore for SqliteStore {
  type Error = crate::Error;

  // ── Authoring data ────────────────────────────────────────────────────────

  async fn course(&self, course_id: CourseId) -> Result<Option<Course>> {
    let course = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT course_id, name, deleted FROM courses WHERE course_id = ?1",
            rusqlite::params![course_id],
            |row| {
              Ok(Course {
                course_id: row.get(0)?,
                name:      row.get(1)?,
                deleted:   row.get(2)?,
              })
            },
          )
          .optional()?)
      })
      .await?;
    Ok(course)
  }

  async fn list_courses(&self) -> Result<Vec<Course>> {
    let courses = self
      .conn
      .call(|conn| {
        let mut stmt =
          conn.prepare("SELECT course_id, name, deleted FROM courses ORDER BY course_id")?;
        let rows = stmt
          .query_map([], |row| {
            Ok(Course {
              course_id: row.get(0)?,
              name:      row.get(1)?,
              deleted:   row.get(2)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(courses)
  }

  async fn course_learners(&self, course_id: CourseId) -> Result<Vec<LearnerId>> {
    let learners = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT learner_id FROM enrollments WHERE course_id = ?1 ORDER BY learner_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![course_id], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(learners)
  }

  async fn quiz(&self, quiz_id: QuizId) -> Result<Option<Quiz>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {QUIZ_COLUMNS} FROM quizzes WHERE quiz_id = ?1"),
            rusqlite::params![quiz_id],
            RawQuiz::from_row,
          )
          .optional()?)
      })
      .await?;
    raw.map(RawQuiz::into_quiz).transpose()
  }

  async fn course_quizzes(&self, course_id: CourseId) -> Result<Vec<Quiz>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {QUIZ_COLUMNS} FROM quizzes WHERE course_id = ?1 ORDER BY quiz_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![course_id], RawQuiz::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawQuiz::into_quiz).collect()
  }

  async fn quiz_questions(&self, quiz_id: QuizId) -> Result<Vec<QuizQuestion>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT quiz_id, question_id, added_at, removed_at
           FROM quiz_questions WHERE quiz_id = ?1
           ORDER BY question_id, added_at",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![quiz_id], |row| {
            Ok(RawQuizQuestion {
              quiz_id:     row.get(0)?,
              question_id: row.get(1)?,
              added_at:    row.get(2)?,
              removed_at:  row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawQuizQuestion::into_quiz_question).collect()
  }

  async fn questions(&self, ids: Vec<QuestionId>) -> Result<Vec<Question>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let questions = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT question_id, max_points, objective_id, time_limit_secs
           FROM questions WHERE question_id IN ({})
           ORDER BY question_id",
          placeholders(ids.len())
        ))?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            Ok(Question {
              question_id:     row.get(0)?,
              max_points:      row.get(1)?,
              objective_id:    row.get(2)?,
              time_limit_secs: row.get(3)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(questions)
  }

  async fn grade_columns(&self, course_id: CourseId) -> Result<Vec<GradeColumn>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT column_id, course_id, name, category, weight, aggregation_json, required
           FROM grade_columns WHERE course_id = ?1 ORDER BY column_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![course_id], |row| {
            Ok(RawColumn {
              column_id:        row.get(0)?,
              course_id:        row.get(1)?,
              name:             row.get(2)?,
              category:         row.get(3)?,
              weight:           row.get(4)?,
              aggregation_json: row.get(5)?,
              required:         row.get(6)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawColumn::into_column).collect()
  }

  async fn column_mappings(&self, course_id: CourseId) -> Result<Vec<ColumnQuizMapping>> {
    let mappings = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT m.column_id, m.quiz_id
           FROM column_quiz_mappings m
           JOIN grade_columns c ON c.column_id = m.column_id
           WHERE c.course_id = ?1
           ORDER BY m.quiz_id, m.column_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![course_id], |row| {
            Ok(ColumnQuizMapping { column_id: row.get(0)?, quiz_id: row.get(1)? })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(mappings)
  }

  async fn grade_config(&self, course_id: CourseId) -> Result<Option<GradeConfig>> {
    let config = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT course_id, process_weight, midterm_weight, final_exam_weight
             FROM grade_configs WHERE course_id = ?1",
            rusqlite::params![course_id],
            |row| {
              Ok(GradeConfig {
                course_id:         row.get(0)?,
                process_weight:    row.get(1)?,
                midterm_weight:    row.get(2)?,
                final_exam_weight: row.get(3)?,
              })
            },
          )
          .optional()?)
      })
      .await?;
    Ok(config)
  }

  async fn analytics_config(&self, course_id: CourseId) -> Result<Option<CourseAnalyticsConfig>> {
    let json: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT config_json FROM analytics_configs WHERE course_id = ?1",
            rusqlite::params![course_id],
            |row| row.get(0),
          )
          .optional()?)
      })
      .await?;
    Ok(json.as_deref().map(serde_json::from_str).transpose()?)
  }

  // ── Attempts (append-only) ────────────────────────────────────────────────

  async fn insert_attempt(
    &self,
    attempt:       NewAttempt,
    points_earned: f64,
    created_at:    DateTime<Utc>,
  ) -> Result<Option<QuestionAttempt>> {
    let created_at_str = encode_dt(created_at);
    let a = attempt.clone();

    let attempt_id: Option<i64> = self
      .conn
      .call(move |conn| {
        let changed = conn.execute(
          "INSERT INTO question_attempts (
             learner_id, quiz_id, question_id, answer_id, is_correct,
             time_spent_secs, attempt_index, points_earned, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
           ON CONFLICT (learner_id, quiz_id, question_id, attempt_index) DO NOTHING",
          rusqlite::params![
            a.learner_id,
            a.quiz_id,
            a.question_id,
            a.answer_id,
            a.is_correct,
            a.time_spent_secs,
            a.attempt_index,
            points_earned,
            created_at_str,
          ],
        )?;
        Ok((changed == 1).then(|| conn.last_insert_rowid()))
      })
      .await?;

    Ok(attempt_id.map(|attempt_id| QuestionAttempt {
      attempt_id,
      learner_id: attempt.learner_id,
      quiz_id: attempt.quiz_id,
      question_id: attempt.question_id,
      answer_id: attempt.answer_id,
      is_correct: attempt.is_correct,
      time_spent_secs: attempt.time_spent_secs,
      attempt_index: attempt.attempt_index,
      points_earned,
      created_at,
    }))
  }

  async fn attempts(&self, learner_id: LearnerId, quiz_id: QuizId) -> Result<Vec<QuestionAttempt>> {
    self.learner_attempts(learner_id, vec![quiz_id]).await
  }

  async fn learner_attempts(
    &self,
    learner_id: LearnerId,
    quiz_ids:   Vec<QuizId>,
  ) -> Result<Vec<QuestionAttempt>> {
    if quiz_ids.is_empty() {
      return Ok(Vec::new());
    }
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {ATTEMPT_COLUMNS} FROM question_attempts
           WHERE learner_id = ? AND quiz_id IN ({})
           ORDER BY attempt_id",
          placeholders(quiz_ids.len())
        ))?;
        let params = std::iter::once(learner_id).chain(quiz_ids);
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawAttempt::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawAttempt::into_attempt).collect()
  }

  // ── Quiz results ──────────────────────────────────────────────────────────

  async fn quiz_result(&self, learner_id: LearnerId, quiz_id: QuizId) -> Result<Option<QuizResult>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!(
              "SELECT {QUIZ_RESULT_COLUMNS} FROM quiz_results
               WHERE learner_id = ?1 AND quiz_id = ?2"
            ),
            rusqlite::params![learner_id, quiz_id],
            RawQuizResult::from_row,
          )
          .optional()?)
      })
      .await?;
    raw.map(RawQuizResult::into_result).transpose()
  }

  async fn quiz_results(&self, learner_id: LearnerId, quiz_ids: Vec<QuizId>) -> Result<Vec<QuizResult>> {
    if quiz_ids.is_empty() {
      return Ok(Vec::new());
    }
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {QUIZ_RESULT_COLUMNS} FROM quiz_results
           WHERE learner_id = ? AND quiz_id IN ({})
           ORDER BY quiz_id",
          placeholders(quiz_ids.len())
        ))?;
        let params = std::iter::once(learner_id).chain(quiz_ids);
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawQuizResult::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawQuizResult::into_result).collect()
  }

  async fn save_quiz_result(
    &self,
    result:           QuizResult,
    expected_version: Option<i64>,
  ) -> Result<CasOutcome<QuizResult>> {
    let row = result.clone();
    let written = self
      .conn
      .call(move |conn| Ok(cas_write_quiz_result(conn, &row, expected_version)?))
      .await?;

    Ok(if written {
      CasOutcome::Committed(QuizResult {
        version: expected_version.map_or(1, |v| v + 1),
        ..result
      })
    } else {
      CasOutcome::Conflict
    })
  }

  // ── Course grades ─────────────────────────────────────────────────────────

  async fn course_grade(
    &self,
    learner_id: LearnerId,
    course_id:  CourseId,
  ) -> Result<Option<CourseGradeResult>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!(
              "SELECT {COURSE_GRADE_COLUMNS} FROM course_grade_results
               WHERE learner_id = ?1 AND course_id = ?2"
            ),
            rusqlite::params![learner_id, course_id],
            RawCourseGrade::from_row,
          )
          .optional()?)
      })
      .await?;
    raw.map(RawCourseGrade::into_grade).transpose()
  }

  async fn course_grades(&self, course_id: CourseId) -> Result<Vec<CourseGradeResult>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {COURSE_GRADE_COLUMNS} FROM course_grade_results
           WHERE course_id = ?1 ORDER BY learner_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![course_id], RawCourseGrade::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawCourseGrade::into_grade).collect()
  }

  async fn save_course_grade(
    &self,
    result:           CourseGradeResult,
    expected_version: Option<i64>,
    history:          Option<NewGradeHistory>,
  ) -> Result<CasOutcome<CourseGradeResult>> {
    let g = EncodedGrade::new(&result)?;
    let h = history.as_ref().map(EncodedHistory::new).transpose()?;

    let written = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let changed = match expected_version {
          None => tx.execute(
            &format!(
              "INSERT INTO course_grade_results ({COURSE_GRADE_COLUMNS})
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
               ON CONFLICT (learner_id, course_id) DO NOTHING"
            ),
            rusqlite::params![
              g.learner_id,
              g.course_id,
              g.grade_json,
              g.columns_json,
              g.computed_at,
              g.value_since,
              g.last_error,
            ],
          )?,
          Some(version) => tx.execute(
            "UPDATE course_grade_results SET
               grade_json = ?3, columns_json = ?4, computed_at = ?5, value_since = ?6,
               last_error = ?7, version = version + 1
             WHERE learner_id = ?1 AND course_id = ?2 AND version = ?8",
            rusqlite::params![
              g.learner_id,
              g.course_id,
              g.grade_json,
              g.columns_json,
              g.computed_at,
              g.value_since,
              g.last_error,
              version,
            ],
          )?,
        };
        if changed != 1 {
          // Dropping the transaction rolls it back.
          return Ok(false);
        }

        if let Some(h) = h {
          tx.execute(
            &format!(
              "INSERT INTO course_grade_history ({HISTORY_COLUMNS})
               VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            rusqlite::params![
              h.learner_id,
              h.course_id,
              h.prior_grade_json,
              h.prior_columns_json,
              h.prior_value_since,
              h.prior_computed_at,
              h.changed_at,
            ],
          )?;
        }
        tx.commit()?;
        Ok(true)
      })
      .await?;

    Ok(if written {
      CasOutcome::Committed(CourseGradeResult {
        version: expected_version.map_or(1, |v| v + 1),
        ..result
      })
    } else {
      CasOutcome::Conflict
    })
  }

  async fn course_grade_history(
    &self,
    learner_id: LearnerId,
    course_id:  CourseId,
  ) -> Result<Vec<CourseGradeHistory>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {HISTORY_COLUMNS} FROM course_grade_history
           WHERE learner_id = ?1 AND course_id = ?2
           ORDER BY changed_at, history_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![learner_id, course_id], RawGradeHistory::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawGradeHistory::into_history).collect()
  }

  async fn course_grade_history_for_course(
    &self,
    course_id: CourseId,
  ) -> Result<Vec<CourseGradeHistory>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {HISTORY_COLUMNS} FROM course_grade_history
           WHERE course_id = ?1
           ORDER BY changed_at, history_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![course_id], RawGradeHistory::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawGradeHistory::into_history).collect()
  }

  // ── Rollups ───────────────────────────────────────────────────────────────

  async fn save_rollups(
    &self,
    rollup:     CourseAnalyticsRollup,
    lo_rollups: Vec<CourseLORollup>,
  ) -> Result<()> {
    let course_id = rollup.course_id;
    let course_row = EncodedRollup {
      objective_id:   None,
      snapshot_date:  encode_date(rollup.snapshot_date),
      metrics_json:   serde_json::to_string(&rollup.metrics)?,
      sample_size:    rollup.sample_size,
      confidence:     rollup.confidence,
      low_confidence: rollup.low_confidence,
      computed_at:    encode_dt(rollup.computed_at),
    };
    let lo_rows = lo_rollups
      .iter()
      .map(|lo| {
        Ok(EncodedRollup {
          objective_id:   Some(lo.objective_id),
          snapshot_date:  encode_date(lo.snapshot_date),
          metrics_json:   serde_json::to_string(&lo.metrics)?,
          sample_size:    lo.sample_size,
          confidence:     lo.confidence,
          low_confidence: lo.low_confidence,
          computed_at:    encode_dt(lo.computed_at),
        })
      })
      .collect::<Result<Vec<_>>>()?;

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let r = &course_row;
        tx.execute(
          &format!(
            "INSERT INTO course_rollups ({ROLLUP_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (course_id, snapshot_date) DO UPDATE SET
               metrics_json = excluded.metrics_json,
               sample_size = excluded.sample_size,
               confidence = excluded.confidence,
               low_confidence = excluded.low_confidence,
               computed_at = excluded.computed_at"
          ),
          rusqlite::params![
            course_id,
            r.snapshot_date,
            r.metrics_json,
            r.sample_size,
            r.confidence,
            r.low_confidence,
            r.computed_at,
          ],
        )?;
        tx.execute(
          "DELETE FROM course_lo_rollups WHERE course_id = ?1 AND snapshot_date = ?2",
          rusqlite::params![course_id, r.snapshot_date],
        )?;
        {
          let mut stmt = tx.prepare(&format!(
            "INSERT INTO course_lo_rollups ({LO_ROLLUP_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
          ))?;
          for lo in &lo_rows {
            stmt.execute(rusqlite::params![
              course_id,
              lo.objective_id,
              lo.snapshot_date,
              lo.metrics_json,
              lo.sample_size,
              lo.confidence,
              lo.low_confidence,
              lo.computed_at,
            ])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn rollup(&self, course_id: CourseId, date: NaiveDate) -> Result<Option<CourseAnalyticsRollup>> {
    let date_str = encode_date(date);
    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!(
              "SELECT {ROLLUP_COLUMNS} FROM course_rollups
               WHERE course_id = ?1 AND snapshot_date = ?2"
            ),
            rusqlite::params![course_id, date_str],
            RawRollup::from_row,
          )
          .optional()?)
      })
      .await?;
    raw.map(RawRollup::into_rollup).transpose()
  }

  async fn latest_rollup(&self, course_id: CourseId) -> Result<Option<CourseAnalyticsRollup>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!(
              "SELECT {ROLLUP_COLUMNS} FROM course_rollups
               WHERE course_id = ?1
               ORDER BY snapshot_date DESC LIMIT 1"
            ),
            rusqlite::params![course_id],
            RawRollup::from_row,
          )
          .optional()?)
      })
      .await?;
    raw.map(RawRollup::into_rollup).transpose()
  }

  async fn first_rollup_on_or_after(
    &self,
    course_id: CourseId,
    date:      NaiveDate,
  ) -> Result<Option<CourseAnalyticsRollup>> {
    let date_str = encode_date(date);
    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!(
              "SELECT {ROLLUP_COLUMNS} FROM course_rollups
               WHERE course_id = ?1 AND snapshot_date >= ?2
               ORDER BY snapshot_date ASC LIMIT 1"
            ),
            rusqlite::params![course_id, date_str],
            RawRollup::from_row,
          )
          .optional()?)
      })
      .await?;
    raw.map(RawRollup::into_rollup).transpose()
  }

  async fn lo_rollups(&self, course_id: CourseId, date: NaiveDate) -> Result<Vec<CourseLORollup>> {
    let date_str = encode_date(date);
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {LO_ROLLUP_COLUMNS} FROM course_lo_rollups
           WHERE course_id = ?1 AND snapshot_date = ?2
           ORDER BY objective_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![course_id, date_str], RawLORollup::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawLORollup::into_rollup).collect()
  }

  // ── Gamification ──────────────────────────────────────────────────────────

  async fn learner_stats(&self, learner_id: LearnerId) -> Result<Option<LearnerStats>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT learner_id, total_points, current_level, experience_points,
                    current_streak, best_streak, perfect_scores, quizzes_completed,
                    avg_response_secs, responses_counted, updated_at
             FROM learner_stats WHERE learner_id = ?1",
            rusqlite::params![learner_id],
            |row| {
              Ok(RawStats {
                learner_id:        row.get(0)?,
                total_points:      row.get(1)?,
                current_level:     row.get(2)?,
                experience_points: row.get(3)?,
                current_streak:    row.get(4)?,
                best_streak:       row.get(5)?,
                perfect_scores:    row.get(6)?,
                quizzes_completed: row.get(7)?,
                avg_response_secs: row.get(8)?,
                responses_counted: row.get(9)?,
                updated_at:        row.get(10)?,
              })
            },
          )
          .optional()?)
      })
      .await?;
    raw.map(RawStats::into_stats).transpose()
  }

  async fn completion_marker(
    &self,
    learner_id: LearnerId,
    quiz_id:    QuizId,
  ) -> Result<Option<CompletionMarker>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT learner_id, quiz_id, synced_at, credited_raw, credited_bonus
             FROM completion_markers WHERE learner_id = ?1 AND quiz_id = ?2",
            rusqlite::params![learner_id, quiz_id],
            |row| {
              Ok(RawMarker {
                learner_id:     row.get(0)?,
                quiz_id:        row.get(1)?,
                synced_at:      row.get(2)?,
                credited_raw:   row.get(3)?,
                credited_bonus: row.get(4)?,
              })
            },
          )
          .optional()?)
      })
      .await?;
    raw.map(RawMarker::into_marker).transpose()
  }

  async fn save_gamification(&self, stats: LearnerStats, marker: CompletionMarker) -> Result<()> {
    let updated_at = stats.updated_at.map(encode_dt);
    let synced_at = encode_dt(marker.synced_at);

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO learner_stats (
             learner_id, total_points, current_level, experience_points,
             current_streak, best_streak, perfect_scores, quizzes_completed,
             avg_response_secs, responses_counted, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
           ON CONFLICT (learner_id) DO UPDATE SET
             total_points = excluded.total_points,
             current_level = excluded.current_level,
             experience_points = excluded.experience_points,
             current_streak = excluded.current_streak,
             best_streak = excluded.best_streak,
             perfect_scores = excluded.perfect_scores,
             quizzes_completed = excluded.quizzes_completed,
             avg_response_secs = excluded.avg_response_secs,
             responses_counted = excluded.responses_counted,
             updated_at = excluded.updated_at",
          rusqlite::params![
            stats.learner_id,
            stats.total_points,
            stats.current_level,
            stats.experience_points,
            stats.current_streak,
            stats.best_streak,
            stats.perfect_scores,
            stats.quizzes_completed,
            stats.avg_response_secs,
            stats.responses_counted,
            updated_at,
          ],
        )?;
        tx.execute(
          "INSERT INTO completion_markers (
             learner_id, quiz_id, synced_at, credited_raw, credited_bonus
           ) VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT (learner_id, quiz_id) DO UPDATE SET
             synced_at = excluded.synced_at,
             credited_raw = excluded.credited_raw,
             credited_bonus = excluded.credited_bonus",
          rusqlite::params![
            marker.learner_id,
            marker.quiz_id,
            synced_at,
            marker.credited_raw,
            marker.credited_bonus,
          ],
        )?;
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Interventions ─────────────────────────────────────────────────────────

  async fn interventions(&self, course_id: CourseId) -> Result<Vec<CourseIntervention>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {INTERVENTION_COLUMNS} FROM interventions
           WHERE course_id = ?1 ORDER BY intervention_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![course_id], RawIntervention::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawIntervention::into_intervention).collect()
  }

  async fn intervention(&self, id: InterventionId) -> Result<Option<CourseIntervention>> {
    let raw = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE intervention_id = ?1"),
            rusqlite::params![id],
            RawIntervention::from_row,
          )
          .optional()?)
      })
      .await?;
    raw.map(RawIntervention::into_intervention).transpose()
  }

  async fn insert_intervention(&self, new: NewIntervention) -> Result<CourseIntervention> {
    let parameters_json = serde_json::to_string(&new.parameters)?;
    let metrics_json = serde_json::to_string(&new.metrics_before)?;
    let kind = new.kind.as_ref().to_owned();
    let target_group = new.target_group.as_ref().to_owned();
    let status = InterventionStatus::Pending.as_ref().to_owned();
    let trigger_date = encode_date(new.trigger_date);
    let created_at = encode_dt(new.created_at);
    let (course_id, objective_id, low_confidence) =
      (new.course_id, new.objective_id, new.low_confidence);

    let intervention_id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO interventions (
             course_id, objective_id, kind, target_group, status, parameters_json,
             metrics_before_json, trigger_date, low_confidence, created_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
          rusqlite::params![
            course_id,
            objective_id,
            kind,
            target_group,
            status,
            parameters_json,
            metrics_json,
            trigger_date,
            low_confidence,
            created_at,
          ],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await?;

    Ok(CourseIntervention {
      intervention_id,
      course_id: new.course_id,
      objective_id: new.objective_id,
      kind: new.kind,
      target_group: new.target_group,
      status: InterventionStatus::Pending,
      parameters: new.parameters,
      metrics_before: new.metrics_before,
      trigger_date: new.trigger_date,
      low_confidence: new.low_confidence,
      created_at: new.created_at,
      scheduled_at: None,
      executed_at: None,
      evaluated_at: None,
      cancelled_at: None,
    })
  }

  async fn update_intervention(
    &self,
    intervention:    CourseIntervention,
    expected_status: InterventionStatus,
  ) -> Result<CasOutcome<CourseIntervention>> {
    let id = intervention.intervention_id;
    let status = intervention.status.as_ref().to_owned();
    let expected = expected_status.as_ref().to_owned();
    let scheduled_at = intervention.scheduled_at.map(encode_dt);
    let executed_at = intervention.executed_at.map(encode_dt);
    let evaluated_at = intervention.evaluated_at.map(encode_dt);
    let cancelled_at = intervention.cancelled_at.map(encode_dt);
    let parameters_json = serde_json::to_string(&intervention.parameters)?;
    let metrics_json = serde_json::to_string(&intervention.metrics_before)?;
    let trigger_date = encode_date(intervention.trigger_date);
    let low_confidence = intervention.low_confidence;

    let changed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE interventions SET
             status = ?2, scheduled_at = ?3, executed_at = ?4,
             evaluated_at = ?5, cancelled_at = ?6, parameters_json = ?8,
             metrics_before_json = ?9, trigger_date = ?10, low_confidence = ?11
           WHERE intervention_id = ?1 AND status = ?7",
          rusqlite::params![
            id,
            status,
            scheduled_at,
            executed_at,
            evaluated_at,
            cancelled_at,
            expected,
            parameters_json,
            metrics_json,
            trigger_date,
            low_confidence,
          ],
        )?)
      })
      .await?;

    Ok(if changed == 1 {
      CasOutcome::Committed(intervention)
    } else {
      CasOutcome::Conflict
    })
  }

  async fn record_intervention_result(
    &self,
    intervention: CourseIntervention,
    result:       NewInterventionResult,
  ) -> Result<CasOutcome<InterventionResult>> {
    let id = intervention.intervention_id;
    let evaluated = InterventionStatus::Evaluated.as_ref().to_owned();
    let executed = InterventionStatus::Executed.as_ref().to_owned();
    let evaluated_at = encode_dt(result.evaluated_at);
    let before_json = serde_json::to_string(&result.metrics_before)?;
    let after_json = serde_json::to_string(&result.metrics_after)?;
    let improvement_json = serde_json::to_string(&result.improvement)?;
    let after_date = encode_date(result.after_date);

    let result_id: Option<i64> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(
          "UPDATE interventions SET status = ?2, evaluated_at = ?3
           WHERE intervention_id = ?1 AND status = ?4",
          rusqlite::params![id, evaluated, evaluated_at, executed],
        )?;
        if changed != 1 {
          return Ok(None);
        }
        tx.execute(
          &format!(
            "INSERT INTO intervention_results ({INTERVENTION_RESULT_COLUMNS})
             VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6)"
          ),
          rusqlite::params![id, before_json, after_json, improvement_json, after_date, evaluated_at],
        )?;
        let result_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(result_id))
      })
      .await?;

    Ok(match result_id {
      Some(result_id) => CasOutcome::Committed(InterventionResult {
        result_id,
        intervention_id: result.intervention_id,
        metrics_before: result.metrics_before,
        metrics_after: result.metrics_after,
        improvement: result.improvement,
        after_date: result.after_date,
        evaluated_at: result.evaluated_at,
      }),
      None => CasOutcome::Conflict,
    })
  }

  async fn intervention_results(&self, intervention_id: InterventionId) -> Result<Vec<InterventionResult>> {
    let raws = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {INTERVENTION_RESULT_COLUMNS} FROM intervention_results
           WHERE intervention_id = ?1 ORDER BY result_id"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![intervention_id], RawInterventionResult::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawInterventionResult::into_result).collect()
  }

  async fn evaluated_intervention_count(
    &self,
    course_id: CourseId,
    before:    DateTime<Utc>,
  ) -> Result<u32> {
    let before_str = encode_dt(before);
    let count = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COUNT(DISTINCT r.intervention_id)
           FROM intervention_results r
           JOIN interventions i ON i.intervention_id = r.intervention_id
           WHERE i.course_id = ?1 AND r.evaluated_at < ?2",
          rusqlite::params![course_id, before_str],
          |row| row.get::<_, u32>(0),
        )?)
      })
      .await?;
    Ok(count)
  }
}
