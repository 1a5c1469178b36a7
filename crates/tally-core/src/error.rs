//! Error types for `tally-core`.

use thiserror::Error;

use crate::{
  ids::{CourseId, EntityRef, InterventionId},
  intervention::InterventionStatus,
};

#[derive(Debug, Error)]
pub enum Error {
  /// A referenced record is missing or inconsistent.
  #[error("data integrity error on {entity}: {detail}")]
  DataIntegrity { entity: EntityRef, detail: String },

  /// Course grading configuration cannot be applied as written.
  #[error("configuration error for course {course_id}: {detail}")]
  Configuration { course_id: CourseId, detail: String },

  #[error("intervention {id} cannot move from {from} to {to}")]
  InvalidTransition {
    id:   InterventionId,
    from: InterventionStatus,
    to:   InterventionStatus,
  },
}

impl Error {
  pub fn integrity(entity: EntityRef, detail: impl Into<String>) -> Self {
    Self::DataIntegrity { entity, detail: detail.into() }
  }

  pub fn configuration(course_id: CourseId, detail: impl Into<String>) -> Self {
    Self::Configuration { course_id, detail: detail.into() }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
