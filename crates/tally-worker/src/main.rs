//! tally-worker binary.
//!
//! Reads `tally.toml` (or the path given with `--config`), opens the SQLite
//! grade store, and either runs the background worker or performs a single
//! operation and prints the result as JSON.
//!
//! ```
//! cargo run -p tally-worker -- run
//! cargo run -p tally-worker -- rollup --course 1 --date 2024-09-02
//! ```

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tally_core::{
  ids::{CourseId, InterventionId, LearnerId, QuestionId, QuizId},
  scoring::NewAttempt,
};
use tally_engine::Engine;
use tally_store_sqlite::SqliteStore;
use tally_worker::{JobQueue, Scheduler, WorkerConfig, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Tally grade and analytics worker")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "tally.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Run the worker pool and rollup scheduler until interrupted.
  Run,
  /// Score and store one answer.
  Record {
    #[arg(long)]
    learner:  LearnerId,
    #[arg(long)]
    quiz:     QuizId,
    #[arg(long)]
    question: QuestionId,
    #[arg(long)]
    correct:  bool,
    #[arg(long)]
    answer:   Option<i64>,
    /// Seconds spent on the question.
    #[arg(long, default_value_t = 0.0)]
    time:     f64,
    #[arg(long, default_value_t = 1)]
    index:    u32,
  },
  /// Recompute one learner's quiz result.
  Quiz {
    #[arg(long)]
    learner: LearnerId,
    #[arg(long)]
    quiz:    QuizId,
  },
  /// Recompute one learner's course grade.
  Grade {
    #[arg(long)]
    learner: LearnerId,
    #[arg(long)]
    course:  CourseId,
  },
  /// Snapshot a course's analytics. Defaults to today.
  Rollup {
    #[arg(long)]
    course: CourseId,
    #[arg(long)]
    date:   Option<NaiveDate>,
  },
  /// Evaluate a course's interventions against its latest rollup.
  Interventions {
    #[arg(long)]
    course: CourseId,
  },
  /// Record that a scheduled intervention was carried out.
  Executed {
    #[arg(long)]
    intervention: InterventionId,
    /// Defaults to now.
    #[arg(long)]
    at:           Option<DateTime<Utc>>,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let worker_cfg = WorkerConfig::load(&cli.config)?;
  let engine_cfg = worker_cfg.engine_config().context("invalid configuration")?;

  let store_path = worker_cfg.resolved_store_path();
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  let shutdown = CancellationToken::new();
  let engine = Engine::new(Arc::new(store), engine_cfg).with_shutdown(shutdown.clone());

  match cli.command {
    Command::Run => run(engine, &worker_cfg, shutdown).await?,
    Command::Record { learner, quiz, question, correct, answer, time, index } => {
      let recorded = engine
        .record_attempt(NewAttempt {
          learner_id:      learner,
          quiz_id:         quiz,
          question_id:     question,
          answer_id:       answer,
          is_correct:      correct,
          time_spent_secs: time,
          attempt_index:   index,
        })
        .await?;
      print_json(&serde_json::json!({
        "attempt": recorded.attempt,
        "points_earned": recorded.points_earned,
        "quiz_result": recorded.quiz_result,
      }))?;
    }
    Command::Quiz { learner, quiz } => {
      print_json(&engine.recompute_quiz_result(learner, quiz).await?)?;
    }
    Command::Grade { learner, course } => {
      let outcome = engine.recompute_course_grade(learner, course).await?;
      print_json(&serde_json::json!({
        "result": outcome.result,
        "unmapped_quizzes": outcome.unmapped_quizzes,
        "history_appended": outcome.history_appended,
      }))?;
    }
    Command::Rollup { course, date } => {
      let date = date.unwrap_or_else(|| engine.today());
      let outcome = engine.run_rollup(course, date).await?;
      print_json(&serde_json::json!({
        "rollup": outcome.rollup,
        "lo_rollups": outcome.lo_rollups,
      }))?;
    }
    Command::Interventions { course } => {
      print_json(&engine.evaluate_interventions(course).await?)?;
    }
    Command::Executed { intervention, at } => {
      let at = at.unwrap_or_else(Utc::now);
      print_json(&engine.mark_intervention_executed(intervention, at).await?)?;
    }
  }

  Ok(())
}

async fn run(
  engine: Engine<SqliteStore>,
  worker_cfg: &WorkerConfig,
  shutdown: CancellationToken,
) -> anyhow::Result<()> {
  let (queue, rx) = JobQueue::new(worker_cfg.queue_capacity);
  let pool = WorkerPool::spawn(engine.clone(), worker_cfg.workers, rx, shutdown.clone());
  let scheduler = Scheduler::new(engine, queue, worker_cfg.courses.clone(), worker_cfg.tick());
  let scheduler = tokio::spawn(scheduler.run(shutdown.clone()));

  tracing::info!(workers = worker_cfg.workers, "tally worker running");
  tokio::signal::ctrl_c()
    .await
    .context("failed to listen for ctrl-c")?;

  tracing::info!("shutting down");
  shutdown.cancel();
  pool.join().await;
  scheduler.await.context("scheduler task panicked")?;
  Ok(())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
