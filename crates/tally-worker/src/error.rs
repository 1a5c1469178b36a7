use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
  #[error("job queue is closed")]
  QueueClosed,

  #[error("job queue is full")]
  QueueFull,

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T, E = WorkerError> = std::result::Result<T, E>;
