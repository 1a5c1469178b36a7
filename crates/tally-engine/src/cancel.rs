//! Per-course cancellation.
//!
//! Every course gets a child of the engine-wide shutdown token. Cancelling a
//! course (for example after it was deleted) stops its in-flight rollups and
//! intervention evaluations at the next checkpoint; shutting the engine down
//! cancels all of them. Tokens no run holds any more are dropped.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, PoisonError},
};

use tally_core::ids::CourseId;
use tokio_util::sync::CancellationToken;

pub(crate) struct CourseCancellations {
  root:    CancellationToken,
  courses: Mutex<HashMap<CourseId, Arc<CancellationToken>>>,
}

impl CourseCancellations {
  pub(crate) fn new(root: CancellationToken) -> Self {
    Self { root, courses: Mutex::new(HashMap::new()) }
  }

  /// The token for current work on `course_id`. Hold it for the whole run.
  pub(crate) fn token(&self, course_id: CourseId) -> Arc<CancellationToken> {
    let mut courses = self.courses.lock().unwrap_or_else(PoisonError::into_inner);
    courses.retain(|_, token| Arc::strong_count(token) > 1);
    Arc::clone(
      courses
        .entry(course_id)
        .or_insert_with(|| Arc::new(self.root.child_token())),
    )
  }

  /// Cancel current work for `course_id`. Later runs get a fresh token.
  pub(crate) fn cancel(&self, course_id: CourseId) {
    let mut courses = self.courses.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(token) = courses.remove(&course_id) {
      token.cancel();
    }
  }

  pub(crate) fn shutdown(&self) { self.root.cancel(); }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cancelling_one_course_leaves_others() {
    let c = CourseCancellations::new(CancellationToken::new());
    let one = c.token(1);
    let two = c.token(2);
    c.cancel(1);
    assert!(one.is_cancelled());
    assert!(!two.is_cancelled());
    assert!(!c.token(1).is_cancelled());
  }

  #[test]
  fn finished_runs_release_their_tokens() {
    let c = CourseCancellations::new(CancellationToken::new());
    for course_id in 0..100 {
      drop(c.token(course_id));
    }
    let held = c.token(100);
    assert_eq!(c.courses.lock().unwrap().len(), 1);

    c.cancel(100);
    assert!(held.is_cancelled());
    drop(held);
    let _next = c.token(101);
    assert_eq!(c.courses.lock().unwrap().len(), 1);
  }

  #[test]
  fn shutdown_reaches_every_course() {
    let c = CourseCancellations::new(CancellationToken::new());
    let one = c.token(1);
    c.shutdown();
    assert!(one.is_cancelled());
    assert!(c.token(2).is_cancelled());
  }
}
