//! SQL schema for the Tally SQLite store.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.

/// Full schema DDL; idempotent thanks to `CREATE ... IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- ── Authoring data (read-only to the engine) ──────────────────────────────

CREATE TABLE IF NOT EXISTS courses (
    course_id  INTEGER PRIMARY KEY,
    name       TEXT    NOT NULL,
    deleted    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS enrollments (
    course_id  INTEGER NOT NULL REFERENCES courses(course_id),
    learner_id INTEGER NOT NULL,
    PRIMARY KEY (course_id, learner_id)
);

CREATE TABLE IF NOT EXISTS questions (
    question_id     INTEGER PRIMARY KEY,
    max_points      REAL    NOT NULL,
    objective_id    INTEGER,
    time_limit_secs REAL
);

CREATE TABLE IF NOT EXISTS quizzes (
    quiz_id      INTEGER PRIMARY KEY,
    course_id    INTEGER NOT NULL REFERENCES courses(course_id),
    title        TEXT    NOT NULL,
    penalty_json TEXT    NOT NULL DEFAULT '{}'
);

-- Removing a question from a quiz closes its assignment window.
CREATE TABLE IF NOT EXISTS quiz_questions (
    quiz_id     INTEGER NOT NULL REFERENCES quizzes(quiz_id),
    question_id INTEGER NOT NULL,
    added_at    TEXT    NOT NULL,
    removed_at  TEXT,
    PRIMARY KEY (quiz_id, question_id, added_at)
);

CREATE TABLE IF NOT EXISTS grade_columns (
    column_id        INTEGER PRIMARY KEY,
    course_id        INTEGER NOT NULL REFERENCES courses(course_id),
    name             TEXT    NOT NULL,
    category         TEXT    NOT NULL,   -- 'process' | 'midterm' | 'final' | 'other'
    weight           REAL,
    aggregation_json TEXT    NOT NULL DEFAULT '{\"mode\":\"average\"}',
    required         INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS column_quiz_mappings (
    column_id INTEGER NOT NULL REFERENCES grade_columns(column_id),
    quiz_id   INTEGER NOT NULL,
    UNIQUE (column_id, quiz_id)
);

CREATE TABLE IF NOT EXISTS grade_configs (
    course_id         INTEGER PRIMARY KEY REFERENCES courses(course_id),
    process_weight    REAL NOT NULL,
    midterm_weight    REAL NOT NULL DEFAULT 0,
    final_exam_weight REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS analytics_configs (
    course_id   INTEGER PRIMARY KEY REFERENCES courses(course_id),
    config_json TEXT NOT NULL
);

-- ── Attempts (append-only) ────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS question_attempts (
    attempt_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    learner_id      INTEGER NOT NULL,
    quiz_id         INTEGER NOT NULL,
    question_id     INTEGER NOT NULL,
    answer_id       INTEGER,
    is_correct      INTEGER NOT NULL,
    time_spent_secs REAL    NOT NULL,
    attempt_index   INTEGER NOT NULL CHECK (attempt_index >= 1),
    points_earned   REAL    NOT NULL,
    created_at      TEXT    NOT NULL,
    UNIQUE (learner_id, quiz_id, question_id, attempt_index)
);

CREATE TRIGGER IF NOT EXISTS question_attempts_no_update
BEFORE UPDATE ON question_attempts
BEGIN SELECT RAISE(ABORT, 'question attempts are immutable'); END;

CREATE TRIGGER IF NOT EXISTS question_attempts_no_delete
BEFORE DELETE ON question_attempts
BEGIN SELECT RAISE(ABORT, 'question attempts are immutable'); END;

-- ── Derived records (written by the engine only) ──────────────────────────

CREATE TABLE IF NOT EXISTS quiz_results (
    learner_id       INTEGER NOT NULL,
    quiz_id          INTEGER NOT NULL,
    status           TEXT    NOT NULL,   -- 'in_progress' | 'completed'
    raw_total_points REAL    NOT NULL,
    max_points       REAL    NOT NULL,
    bonuses_total    REAL    NOT NULL,
    score            REAL    NOT NULL CHECK (score >= 0 AND score <= 1),
    completion_time  TEXT,
    synced_at        TEXT    NOT NULL,
    attempt_count    INTEGER NOT NULL,
    last_attempt_id  INTEGER,
    version          INTEGER NOT NULL,
    PRIMARY KEY (learner_id, quiz_id)
);

CREATE TABLE IF NOT EXISTS course_grade_results (
    learner_id   INTEGER NOT NULL,
    course_id    INTEGER NOT NULL,
    grade_json   TEXT    NOT NULL,
    columns_json TEXT    NOT NULL,
    computed_at  TEXT    NOT NULL,
    value_since  TEXT    NOT NULL,
    last_error   TEXT,
    version      INTEGER NOT NULL,
    PRIMARY KEY (learner_id, course_id)
);

-- Grade history is strictly append-only.
CREATE TABLE IF NOT EXISTS course_grade_history (
    history_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    learner_id         INTEGER NOT NULL,
    course_id          INTEGER NOT NULL,
    prior_grade_json   TEXT    NOT NULL,
    prior_columns_json TEXT    NOT NULL,
    prior_value_since  TEXT    NOT NULL,
    prior_computed_at  TEXT    NOT NULL,
    changed_at         TEXT    NOT NULL
);

CREATE TRIGGER IF NOT EXISTS course_grade_history_no_update
BEFORE UPDATE ON course_grade_history
BEGIN SELECT RAISE(ABORT, 'grade history is append-only'); END;

CREATE TRIGGER IF NOT EXISTS course_grade_history_no_delete
BEFORE DELETE ON course_grade_history
BEGIN SELECT RAISE(ABORT, 'grade history is append-only'); END;

-- Rollups overwrite in place per (course[, objective], date).
CREATE TABLE IF NOT EXISTS course_rollups (
    course_id      INTEGER NOT NULL,
    snapshot_date  TEXT    NOT NULL,
    metrics_json   TEXT    NOT NULL,
    sample_size    INTEGER NOT NULL,
    confidence     REAL    NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
    low_confidence INTEGER NOT NULL,
    computed_at    TEXT    NOT NULL,
    PRIMARY KEY (course_id, snapshot_date)
);

CREATE TABLE IF NOT EXISTS course_lo_rollups (
    course_id      INTEGER NOT NULL,
    objective_id   INTEGER NOT NULL,
    snapshot_date  TEXT    NOT NULL,
    metrics_json   TEXT    NOT NULL,
    sample_size    INTEGER NOT NULL,
    confidence     REAL    NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
    low_confidence INTEGER NOT NULL,
    computed_at    TEXT    NOT NULL,
    PRIMARY KEY (course_id, objective_id, snapshot_date)
);

CREATE TABLE IF NOT EXISTS learner_stats (
    learner_id        INTEGER PRIMARY KEY,
    total_points      REAL    NOT NULL,
    current_level     INTEGER NOT NULL,
    experience_points REAL    NOT NULL,
    current_streak    INTEGER NOT NULL,
    best_streak       INTEGER NOT NULL,
    perfect_scores    INTEGER NOT NULL,
    quizzes_completed INTEGER NOT NULL,
    avg_response_secs REAL    NOT NULL,
    responses_counted INTEGER NOT NULL,
    updated_at        TEXT
);

-- One row per credited (learner, quiz) completion.
CREATE TABLE IF NOT EXISTS completion_markers (
    learner_id     INTEGER NOT NULL,
    quiz_id        INTEGER NOT NULL,
    synced_at      TEXT    NOT NULL,
    credited_raw   REAL    NOT NULL,
    credited_bonus REAL    NOT NULL,
    PRIMARY KEY (learner_id, quiz_id)
);

CREATE TABLE IF NOT EXISTS interventions (
    intervention_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    course_id           INTEGER NOT NULL,
    objective_id        INTEGER,
    kind                TEXT    NOT NULL,
    target_group        TEXT    NOT NULL,
    status              TEXT    NOT NULL,
    parameters_json     TEXT    NOT NULL,
    metrics_before_json TEXT    NOT NULL,
    trigger_date        TEXT    NOT NULL,
    low_confidence      INTEGER NOT NULL,
    created_at          TEXT    NOT NULL,
    scheduled_at        TEXT,
    executed_at         TEXT,
    evaluated_at        TEXT,
    cancelled_at        TEXT
);

CREATE TABLE IF NOT EXISTS intervention_results (
    result_id           INTEGER PRIMARY KEY AUTOINCREMENT,
    intervention_id     INTEGER NOT NULL REFERENCES interventions(intervention_id),
    metrics_before_json TEXT    NOT NULL,
    metrics_after_json  TEXT    NOT NULL,
    improvement_json    TEXT    NOT NULL,
    after_date          TEXT    NOT NULL,
    evaluated_at        TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS attempts_learner_quiz_idx ON question_attempts(learner_id, quiz_id);
CREATE INDEX IF NOT EXISTS quizzes_course_idx        ON quizzes(course_id);
CREATE INDEX IF NOT EXISTS columns_course_idx        ON grade_columns(course_id);
CREATE INDEX IF NOT EXISTS grades_course_idx         ON course_grade_results(course_id);
CREATE INDEX IF NOT EXISTS history_key_idx           ON course_grade_history(course_id, learner_id, changed_at);
CREATE INDEX IF NOT EXISTS interventions_course_idx  ON interventions(course_id, status);

PRAGMA user_version = 1;
";
