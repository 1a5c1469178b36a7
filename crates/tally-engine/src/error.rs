//! Engine error taxonomy.
//!
//! Every variant names the [`EntityRef`] it concerns so that an operator can
//! re-run exactly that unit of work.

use std::time::Duration;

use tally_core::{
  EntityRef,
  ids::{CourseId, InterventionId},
  intervention::InterventionStatus,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
  /// A referenced record is missing or inconsistent. Not retried.
  #[error("data integrity error on {entity}: {detail}")]
  DataIntegrity { entity: EntityRef, detail: String },

  /// A compare-and-swap write lost the race.
  #[error("concurrent update of {entity}")]
  ConcurrencyConflict { entity: EntityRef },

  /// Conflicts persisted past the retry budget.
  #[error("{entity} still conflicting after {attempts} attempts")]
  Transient {
    entity:   EntityRef,
    attempts: u32,
    #[source]
    source:   Box<EngineError>,
  },

  /// Grading or analytics configuration cannot be applied. Not retried.
  #[error("configuration error on {entity}: {detail}")]
  Configuration { entity: EntityRef, detail: String },

  #[error("{entity} timed out after {after:?}")]
  Timeout { entity: EntityRef, after: Duration },

  #[error("{entity} was cancelled")]
  Cancelled { entity: EntityRef },

  #[error("intervention {id} cannot move from {from} to {to}")]
  InvalidTransition {
    id:   InterventionId,
    from: InterventionStatus,
    to:   InterventionStatus,
  },

  #[error("{0} not found")]
  NotFound(EntityRef),

  #[error("store error on {entity}: {source}")]
  Store {
    entity: EntityRef,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },
}

impl EngineError {
  /// Whether running the same unit again later may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::ConcurrencyConflict { .. }
        | Self::Transient { .. }
        | Self::Timeout { .. }
        | Self::Store { .. }
    )
  }

  /// The unit of work this error refers to.
  pub fn entity(&self) -> EntityRef {
    match self {
      Self::DataIntegrity { entity, .. }
      | Self::ConcurrencyConflict { entity }
      | Self::Transient { entity, .. }
      | Self::Configuration { entity, .. }
      | Self::Timeout { entity, .. }
      | Self::Cancelled { entity }
      | Self::Store { entity, .. } => *entity,
      Self::InvalidTransition { id, .. } => EntityRef::Intervention { id: *id },
      Self::NotFound(entity) => *entity,
    }
  }

  pub(crate) fn course_config(course_id: CourseId, detail: impl Into<String>) -> Self {
    Self::Configuration {
      entity: EntityRef::Course { id: course_id },
      detail: detail.into(),
    }
  }
}

impl From<tally_core::Error> for EngineError {
  fn from(err: tally_core::Error) -> Self {
    match err {
      tally_core::Error::DataIntegrity { entity, detail } => {
        Self::DataIntegrity { entity, detail }
      }
      tally_core::Error::Configuration { course_id, detail } => {
        Self::course_config(course_id, detail)
      }
      tally_core::Error::InvalidTransition { id, from, to } => {
        Self::InvalidTransition { id, from, to }
      }
    }
  }
}

/// Wrap a backend error, attributing it to `entity`.
pub(crate) fn store_err<E>(entity: EntityRef) -> impl FnOnce(E) -> EngineError
where
  E: std::error::Error + Send + Sync + 'static,
{
  move |e| EngineError::Store { entity, source: Box::new(e) }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn retryable_classification() {
    let entity = EntityRef::QuizResult { learner: 3, quiz: 9 };
    assert!(EngineError::ConcurrencyConflict { entity }.is_retryable());
    assert!(
      EngineError::Timeout { entity, after: Duration::from_secs(1) }.is_retryable()
    );
    assert!(!EngineError::course_config(1, "weights sum to 90").is_retryable());
    assert!(!EngineError::Cancelled { entity }.is_retryable());
    assert!(
      !EngineError::DataIntegrity { entity, detail: "missing".into() }.is_retryable()
    );
  }

  #[test]
  fn messages_name_the_entity() {
    let err = EngineError::ConcurrencyConflict {
      entity: EntityRef::QuizResult { learner: 3, quiz: 9 },
    };
    let text = err.to_string();
    assert!(text.contains("learner=3"), "{text}");
    assert!(text.contains("quiz=9"), "{text}");
  }

  #[test]
  fn core_configuration_maps_to_course() {
    let err: EngineError = tally_core::Error::configuration(4, "no columns").into();
    assert_eq!(err.entity(), EntityRef::Course { id: 4 });
  }
}
