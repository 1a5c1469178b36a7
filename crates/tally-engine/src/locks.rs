//! Per-key mutual exclusion.
//!
//! Each derived record has one writer at a time inside this process. Keys are
//! [`EntityRef`](tally_core::EntityRef)s: quiz results, course grades,
//! `(course, date)` rollups, learner stats, and a course's interventions
//! (keyed by the course itself). Waiters queue in FIFO order.

use std::{
  collections::HashMap,
  hash::Hash,
  sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub struct KeyedLocks<K> {
  slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
  fn default() -> Self { Self { slots: Mutex::new(HashMap::new()) } }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
  pub fn new() -> Self { Self::default() }

  /// Wait for exclusive access to `key`. Released when the guard drops.
  pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
    let slot = {
      let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
      // Slots nobody holds or waits on are dropped on the way in.
      slots.retain(|_, slot| Arc::strong_count(slot) > 1);
      Arc::clone(slots.entry(key).or_default())
    };
    slot.lock_owned().await
  }

  /// Number of keys currently held or waited on.
  pub fn active(&self) -> usize {
    let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    slots.values().filter(|slot| Arc::strong_count(slot) > 1).count()
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::atomic::{AtomicU32, Ordering}, time::Duration};

  use super::*;

  #[tokio::test]
  async fn same_key_is_serialized() {
    let locks = Arc::new(KeyedLocks::new());
    let inside = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
      let locks = Arc::clone(&locks);
      let inside = Arc::clone(&inside);
      let peak = Arc::clone(&peak);
      handles.push(tokio::spawn(async move {
        let _guard = locks.lock("quiz").await;
        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2)).await;
        inside.fetch_sub(1, Ordering::SeqCst);
      }));
    }
    for handle in handles {
      handle.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn different_keys_do_not_block() {
    let locks = KeyedLocks::new();
    let _a = locks.lock(1).await;
    let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(2)).await;
    assert!(b.is_ok());
    assert_eq!(locks.active(), 2);
  }

  #[tokio::test]
  async fn released_slots_are_pruned() {
    let locks = KeyedLocks::new();
    drop(locks.lock(1).await);
    drop(locks.lock(2).await);
    assert_eq!(locks.active(), 0);
    let _c = locks.lock(3).await;
    assert_eq!(locks.slots.lock().unwrap().len(), 1);
  }
}
