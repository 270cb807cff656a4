//! Graph storage: link words, vector slots, labels, levels, node locks.
//!
//! Level-0 neighbor lists live in one contiguous array of atomic words,
//! `1 + max_m0` words per node. Word 0 is the header: the low 16 bits hold
//! the neighbor count and bit 16 the tombstone flag. Upper-layer lists are
//! allocated lazily per node as `level * (1 + max_m)` words with the same
//! header-then-ids layout per level. All writes to a node's lists on any
//! layer require that node's mutex; reads go through the atomics.

use crate::error::Error;
use crate::error::Result;
use crate::InternalId;
use crate::Label;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

const TOMBSTONE: u32 = 1 << 16;
const COUNT_MASK: u32 = 0xffff;

#[inline]
fn header_count(header: u32) -> usize {
  (header & COUNT_MASK) as usize
}

/// Read-only view of one neighbor list.
#[derive(Clone, Copy)]
pub(crate) struct Links<'a> {
  words: &'a [AtomicU32],
  len: usize,
}

impl Links<'_> {
  pub fn len(&self) -> usize {
    self.len
  }
}

pub(crate) struct LinksIter<'a> {
  words: &'a [AtomicU32],
  idx: usize,
  end: usize,
}

impl Iterator for LinksIter<'_> {
  type Item = InternalId;

  fn next(&mut self) -> Option<InternalId> {
    if self.idx >= self.end {
      return None;
    }
    let id = self.words[self.idx].load(Ordering::Relaxed);
    self.idx += 1;
    Some(id)
  }
}

impl<'a> IntoIterator for Links<'a> {
  type Item = InternalId;
  type IntoIter = LinksIter<'a>;

  fn into_iter(self) -> LinksIter<'a> {
    LinksIter {
      words: self.words,
      idx: 0,
      end: self.len,
    }
  }
}

pub(crate) struct GraphStore {
  max_elements: usize,
  max_m: usize,
  max_m0: usize,
  level0: Vec<AtomicU32>,
  upper: Vec<OnceLock<Box<[AtomicU32]>>>,
  levels: Vec<AtomicI32>,
  labels: Vec<AtomicU64>,
  vectors: Vec<ArcSwapOption<Vec<f32>>>,
  node_locks: Vec<Mutex<()>>,
}

impl GraphStore {
  pub fn new(max_elements: usize, max_m: usize, max_m0: usize) -> Self {
    let level0_words = max_elements * (1 + max_m0);
    let mut level0 = Vec::with_capacity(level0_words);
    level0.resize_with(level0_words, || AtomicU32::new(0));

    let mut upper = Vec::with_capacity(max_elements);
    upper.resize_with(max_elements, OnceLock::new);

    let mut levels = Vec::with_capacity(max_elements);
    levels.resize_with(max_elements, || AtomicI32::new(0));

    let mut labels = Vec::with_capacity(max_elements);
    labels.resize_with(max_elements, || AtomicU64::new(0));

    let mut vectors = Vec::with_capacity(max_elements);
    vectors.resize_with(max_elements, ArcSwapOption::empty);

    let mut node_locks = Vec::with_capacity(max_elements);
    node_locks.resize_with(max_elements, || Mutex::new(()));

    Self {
      max_elements,
      max_m,
      max_m0,
      level0,
      upper,
      levels,
      labels,
      vectors,
      node_locks,
    }
  }

  pub fn max_m(&self) -> usize {
    self.max_m
  }

  pub fn max_m0(&self) -> usize {
    self.max_m0
  }

  pub fn link_capacity(&self, layer: usize) -> usize {
    if layer == 0 {
      self.max_m0
    } else {
      self.max_m
    }
  }

  pub fn lock_node(&self, id: InternalId) -> MutexGuard<'_, ()> {
    self.node_locks[id as usize].lock()
  }

  pub fn level0_block(&self, id: InternalId) -> Result<&[AtomicU32]> {
    let words = 1 + self.max_m0;
    let start = id as usize * words;
    let end = start + words;
    if end > self.level0.len() {
      return Err(Error::InvariantViolation(format!(
        "internal id {id} out of bounds"
      )));
    }
    Ok(&self.level0[start..end])
  }

  pub fn upper_block(&self, id: InternalId, layer: usize) -> Result<&[AtomicU32]> {
    debug_assert!(layer > 0);
    let Some(raw) = self.upper.get(id as usize).and_then(|c| c.get()) else {
      return Err(Error::InvariantViolation(format!(
        "node {id} has no upper-layer links"
      )));
    };
    let words = 1 + self.max_m;
    let start = (layer - 1) * words;
    let end = start + words;
    if end > raw.len() {
      return Err(Error::InvariantViolation(format!(
        "layer {layer} out of bounds for node {id}"
      )));
    }
    Ok(&raw[start..end])
  }

  pub fn block(&self, id: InternalId, layer: usize) -> Result<&[AtomicU32]> {
    if layer == 0 {
      self.level0_block(id)
    } else {
      self.upper_block(id, layer)
    }
  }

  /// Raw upper-layer words of one node, all layers concatenated.
  pub fn upper_raw(&self, id: InternalId) -> Option<&[AtomicU32]> {
    self
      .upper
      .get(id as usize)
      .and_then(|c| c.get())
      .map(|b| &b[..])
  }

  pub fn init_upper(&self, id: InternalId, level: usize) -> Result<()> {
    debug_assert!(level > 0);
    let words = level * (1 + self.max_m);
    let mut raw = Vec::with_capacity(words);
    raw.resize_with(words, || AtomicU32::new(0));
    self
      .upper
      .get(id as usize)
      .ok_or_else(|| Error::InvariantViolation(format!("internal id {id} out of bounds")))?
      .set(raw.into_boxed_slice())
      .map_err(|_| Error::InvariantViolation(format!("upper links of node {id} already set")))
  }

  pub fn set_upper_raw(&self, id: InternalId, words: Box<[AtomicU32]>) -> Result<()> {
    self
      .upper
      .get(id as usize)
      .ok_or_else(|| Error::InvariantViolation(format!("internal id {id} out of bounds")))?
      .set(words)
      .map_err(|_| Error::InvariantViolation(format!("upper links of node {id} already set")))
  }

  pub fn links(&self, id: InternalId, layer: usize) -> Result<Links<'_>> {
    let block = self.block(id, layer)?;
    let count = header_count(block[0].load(Ordering::Acquire));
    if count > self.link_capacity(layer) {
      return Err(Error::InvariantViolation(format!(
        "node {id} has {count} neighbors on layer {layer}"
      )));
    }
    Ok(Links {
      words: &block[1..],
      len: count,
    })
  }

  /// Overwrite the neighbor list in `block`. Caller holds the node mutex.
  pub fn write_links(&self, block: &[AtomicU32], ids: &[InternalId]) -> Result<()> {
    for (word, &id) in block[1..].iter().zip(ids) {
      word.store(id, Ordering::Relaxed);
    }
    self.set_link_count(&block[0], ids.len())
  }

  /// Publish a new neighbor count, preserving the tombstone bit.
  pub fn set_link_count(&self, header: &AtomicU32, count: usize) -> Result<()> {
    if count > COUNT_MASK as usize {
      return Err(Error::InvariantViolation(format!(
        "neighbor count {count} does not fit the header"
      )));
    }
    let mut cur = header.load(Ordering::Relaxed);
    loop {
      let next = (cur & !COUNT_MASK) | count as u32;
      match header.compare_exchange_weak(cur, next, Ordering::Release, Ordering::Relaxed) {
        Ok(_) => return Ok(()),
        Err(actual) => cur = actual,
      }
    }
  }

  pub fn is_deleted(&self, id: InternalId) -> bool {
    match self.level0_block(id) {
      Ok(block) => block[0].load(Ordering::Acquire) & TOMBSTONE != 0,
      Err(_) => false,
    }
  }

  /// Set the tombstone bit. Returns false if it was already set.
  pub fn mark_deleted(&self, id: InternalId) -> Result<bool> {
    let prev = self.level0_block(id)?[0].fetch_or(TOMBSTONE, Ordering::AcqRel);
    Ok(prev & TOMBSTONE == 0)
  }

  /// Clear the tombstone bit. Returns false if it was not set.
  pub fn clear_deleted(&self, id: InternalId) -> Result<bool> {
    let prev = self.level0_block(id)?[0].fetch_and(!TOMBSTONE, Ordering::AcqRel);
    Ok(prev & TOMBSTONE != 0)
  }

  pub fn level(&self, id: InternalId) -> i32 {
    self.levels[id as usize].load(Ordering::Acquire)
  }

  pub fn set_level(&self, id: InternalId, level: i32) {
    self.levels[id as usize].store(level, Ordering::Release);
  }

  pub fn label(&self, id: InternalId) -> Label {
    self.labels[id as usize].load(Ordering::Acquire)
  }

  pub fn set_label(&self, id: InternalId, label: Label) {
    self.labels[id as usize].store(label, Ordering::Release);
  }

  pub fn vector_guard(
    &self,
    id: InternalId,
  ) -> Result<arc_swap::Guard<Option<Arc<Vec<f32>>>>> {
    self
      .vectors
      .get(id as usize)
      .ok_or_else(|| Error::InvariantViolation(format!("internal id {id} out of bounds")))
      .map(|slot| slot.load())
  }

  pub fn set_vector(&self, id: InternalId, vector: Vec<f32>) -> Result<()> {
    self
      .vectors
      .get(id as usize)
      .ok_or_else(|| Error::InvariantViolation(format!("internal id {id} out of bounds")))?
      .store(Some(Arc::new(vector)));
    Ok(())
  }

  /// Zero the level-0 block of a freshly allocated node.
  pub fn reset_level0(&self, id: InternalId) -> Result<()> {
    for word in self.level0_block(id)? {
      word.store(0, Ordering::Relaxed);
    }
    Ok(())
  }

  pub fn max_elements(&self) -> usize {
    self.max_elements
  }
}
