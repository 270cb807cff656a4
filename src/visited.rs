//! Pooled visited sets for graph traversal.
//!
//! Each set is a tag array sized to the index capacity. Acquiring a set bumps
//! its generation tag instead of clearing the array; the array is only
//! zero-filled when the tag wraps.

use parking_lot::Mutex;

pub type VisitTag = u16;

#[derive(Debug)]
pub struct VisitedSet {
  tag: VisitTag,
  slots: Vec<VisitTag>,
}

impl VisitedSet {
  fn new(capacity: usize) -> Self {
    Self {
      tag: VisitTag::MAX,
      slots: vec![0; capacity],
    }
  }

  fn advance(&mut self) -> VisitTag {
    self.tag = self.tag.wrapping_add(1);
    if self.tag == 0 {
      self.slots.fill(0);
      self.tag = 1;
    }
    self.tag
  }
}

/// Free list of [`VisitedSet`]s. Acquire pops an existing set (or allocates
/// one) and release pushes it back; a set is held only for the duration of a
/// single search or insert.
#[derive(Debug)]
pub struct VisitedSetPool {
  free: Mutex<Vec<VisitedSet>>,
  capacity: usize,
}

impl VisitedSetPool {
  pub fn new(initial_sets: usize, capacity: usize) -> Self {
    let mut free = Vec::with_capacity(initial_sets);
    for _ in 0..initial_sets {
      free.push(VisitedSet::new(capacity));
    }
    Self {
      free: Mutex::new(free),
      capacity,
    }
  }

  pub fn acquire(&self) -> VisitedGuard<'_> {
    let mut set = self
      .free
      .lock()
      .pop()
      .unwrap_or_else(|| VisitedSet::new(self.capacity));
    let tag = set.advance();
    VisitedGuard {
      pool: &self.free,
      set: Some(set),
      tag,
    }
  }
}

pub struct VisitedGuard<'a> {
  pool: &'a Mutex<Vec<VisitedSet>>,
  set: Option<VisitedSet>,
  tag: VisitTag,
}

impl VisitedGuard<'_> {
  /// Mark `id` visited. Returns true if it had not been visited under the
  /// current tag.
  #[inline]
  pub fn insert(&mut self, id: u32) -> bool {
    let slots = &mut self.set.as_mut().unwrap().slots;
    if slots[id as usize] == self.tag {
      return false;
    }
    slots[id as usize] = self.tag;
    true
  }
}

impl Drop for VisitedGuard<'_> {
  fn drop(&mut self) {
    if let Some(set) = self.set.take() {
      self.pool.lock().push(set);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn insert_reports_first_visit_only() {
    let pool = VisitedSetPool::new(1, 8);
    let mut v = pool.acquire();
    assert!(v.insert(3));
    assert!(!v.insert(3));
    assert!(v.insert(4));
  }

  #[test]
  fn reacquired_set_starts_clean() {
    let pool = VisitedSetPool::new(1, 8);
    {
      let mut v = pool.acquire();
      assert!(v.insert(5));
    }
    let mut v = pool.acquire();
    assert!(v.insert(5));
  }

  #[test]
  fn tag_wraparound_refills_slots() {
    let mut set = VisitedSet::new(4);
    set.slots[2] = VisitTag::MAX;
    // First advance moves MAX -> 0 -> refill -> 1.
    let tag = set.advance();
    assert_eq!(tag, 1);
    assert!(set.slots.iter().all(|&s| s == 0));
  }

  #[test]
  fn pool_hands_out_distinct_sets_concurrently() {
    let pool = VisitedSetPool::new(1, 8);
    let mut a = pool.acquire();
    let mut b = pool.acquire();
    assert!(a.insert(1));
    assert!(b.insert(1));
  }
}
