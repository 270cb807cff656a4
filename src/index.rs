//! The HNSW index: concurrent insertion and approximate k-NN search over a
//! multi-layer proximity graph.
//!
//! Layout and locking follow the classic design: a dense internal-id arena
//! (see [`crate::graph`]), a single entry point at the top layer, per-node
//! link locks, a striped lock per label for insert/delete serialization, and
//! a global mutex that protects entry-point updates. An insert that raises
//! the apex holds the global mutex until the new entry point is published.

use crate::error::Error;
use crate::error::Result;
use crate::graph::GraphStore;
use crate::space::Space;
use crate::stats::CounterSnapshot;
use crate::stats::SearchCounters;
use crate::visited::VisitedSetPool;
use crate::InternalId;
use crate::Label;
use ahash::HashMap;
use ahash::HashMapExt;
use ahash::HashSet;
use ahash::HashSetExt;
use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::cmp::max;
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::warn;

const LABEL_LOCK_STRIPES: usize = 65_536;
const ENTRY_POINT_NONE: InternalId = InternalId::MAX;
const DEFAULT_EF: usize = 10;

/// Max-heap entries keyed by distance; negate the key to get min-heap order.
type DistHeap = BinaryHeap<(OrderedFloat<f32>, InternalId)>;

pub struct HnswIndex<S: Space> {
  pub(crate) space: S,

  pub(crate) max_elements: usize,
  pub(crate) m: usize,
  pub(crate) ef_construction: usize,
  pub(crate) mult: f64,

  pub(crate) ef: AtomicUsize,
  pub(crate) cur_element_count: AtomicUsize,
  pub(crate) num_deleted: AtomicUsize,
  pub(crate) max_level: AtomicI32,
  /// `ENTRY_POINT_NONE` means empty.
  pub(crate) entry_point: AtomicU32,

  /// Protects entry-point and max-level updates.
  pub(crate) global: Mutex<()>,
  /// Lookup-or-allocate is atomic under this lock.
  pub(crate) label_map: Mutex<HashMap<Label, InternalId>>,
  /// Serializes operations on the same label (hashed stripe).
  label_locks: Vec<Mutex<()>>,

  pub(crate) graph: GraphStore,
  pub(crate) visited_pool: VisitedSetPool,
  counters: SearchCounters,

  level_rng: Mutex<StdRng>,
}

impl<S: Space> HnswIndex<S> {
  pub fn new(space: S, max_elements: usize, m: usize, ef_construction: usize, seed: u64) -> Self {
    assert!(max_elements <= InternalId::MAX as usize);
    assert!(space.dim() > 0, "dim must be > 0");
    assert!(m >= 2, "M must be >= 2");

    let m = if m <= 10_000 {
      m
    } else {
      warn!("M parameter exceeds 10000; capping to 10000");
      10_000
    };

    let max_m = m;
    let max_m0 = m * 2;
    let ef_construction = ef_construction.max(m);
    let mult = 1.0 / (m as f64).ln();

    let mut label_locks = Vec::with_capacity(LABEL_LOCK_STRIPES);
    label_locks.resize_with(LABEL_LOCK_STRIPES, || Mutex::new(()));

    Self {
      space,
      max_elements,
      m,
      ef_construction,
      mult,
      ef: AtomicUsize::new(DEFAULT_EF),
      cur_element_count: AtomicUsize::new(0),
      num_deleted: AtomicUsize::new(0),
      max_level: AtomicI32::new(-1),
      entry_point: AtomicU32::new(ENTRY_POINT_NONE),
      global: Mutex::new(()),
      label_map: Mutex::new(HashMap::new()),
      label_locks,
      graph: GraphStore::new(max_elements, max_m, max_m0),
      visited_pool: VisitedSetPool::new(1, max_elements),
      counters: SearchCounters::default(),
      level_rng: Mutex::new(StdRng::seed_from_u64(seed)),
    }
  }

  pub fn space(&self) -> &S {
    &self.space
  }

  pub fn dim(&self) -> usize {
    self.space.dim()
  }

  pub fn len(&self) -> usize {
    self.cur_element_count.load(Ordering::Acquire)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn capacity(&self) -> usize {
    self.max_elements
  }

  pub fn deleted_count(&self) -> usize {
    self.num_deleted.load(Ordering::Acquire)
  }

  pub fn set_ef(&self, ef: usize) {
    self.ef.store(ef, Ordering::Release);
  }

  pub fn counters(&self) -> CounterSnapshot {
    self.counters.snapshot()
  }

  pub(crate) fn entry_point(&self) -> Option<InternalId> {
    let raw = self.entry_point.load(Ordering::Acquire);
    if raw == ENTRY_POINT_NONE {
      None
    } else {
      Some(raw)
    }
  }

  fn label_lock(&self, label: Label) -> &Mutex<()> {
    &self.label_locks[label as usize & (LABEL_LOCK_STRIPES - 1)]
  }

  fn random_level(&self) -> i32 {
    let mut u: f64 = self.level_rng.lock().gen();
    if u == 0.0 {
      u = f64::MIN_POSITIVE;
    }
    (-u.ln() * self.mult) as i32
  }

  fn distance_to(&self, query: &[f32], id: InternalId) -> Result<f32> {
    let guard = self.graph.vector_guard(id)?;
    let v = guard
      .as_ref()
      .ok_or_else(|| Error::InvariantViolation(format!("node {id} has no vector")))?;
    self.counters.record_distance_calls(1);
    Ok(self.space.distance(query, v.as_slice()))
  }

  fn distance_between(&self, a: InternalId, b: InternalId) -> Result<f32> {
    let ga = self.graph.vector_guard(a)?;
    let va = ga
      .as_ref()
      .ok_or_else(|| Error::InvariantViolation(format!("node {a} has no vector")))?;
    let gb = self.graph.vector_guard(b)?;
    let vb = gb
      .as_ref()
      .ok_or_else(|| Error::InvariantViolation(format!("node {b} has no vector")))?;
    self.counters.record_distance_calls(1);
    Ok(self.space.distance(va.as_slice(), vb.as_slice()))
  }

  /// Insert `vector` under `label`, or replace the stored vector if the
  /// label is already present. Safe to call from multiple threads.
  pub fn add_point(&self, vector: &[f32], label: Label) -> Result<InternalId> {
    if vector.len() != self.space.dim() {
      return Err(Error::DimensionMismatch {
        expected: self.space.dim(),
        actual: vector.len(),
      });
    }
    let _op_guard = self.label_lock(label).lock();
    self.insert(vector, label, None)
  }

  fn insert(&self, vector: &[f32], label: Label, forced_level: Option<i32>) -> Result<InternalId> {
    let (cur_c, cur_level) = {
      let mut label_map = self.label_map.lock();
      if let Some(&existing) = label_map.get(&label) {
        drop(label_map);
        return self.replace_vector(existing, vector);
      }

      let count = self.cur_element_count.load(Ordering::Acquire);
      if count >= self.max_elements {
        return Err(Error::IndexFull {
          max_elements: self.max_elements,
        });
      }
      let cur_c = count as InternalId;

      let cur_level = forced_level.unwrap_or_else(|| self.random_level());

      // Fully initialize the node before the id becomes visible.
      self.graph.reset_level0(cur_c)?;
      self.graph.set_level(cur_c, cur_level);
      self.graph.set_label(cur_c, label);
      self.graph.set_vector(cur_c, vector.to_vec())?;
      if cur_level > 0 {
        self.graph.init_upper(cur_c, cur_level as usize)?;
      }

      self
        .cur_element_count
        .store(count + 1, Ordering::Release);
      label_map.insert(label, cur_c);
      (cur_c, cur_level)
    };

    // Hold the apex lock only when this insert may raise the entry point.
    let mut apex_guard = Some(self.global.lock());
    let max_level_snapshot = self.max_level.load(Ordering::Acquire);
    if cur_level <= max_level_snapshot {
      drop(apex_guard.take());
    }

    let Some(entry) = self.entry_point() else {
      // First element becomes the apex.
      self.entry_point.store(cur_c, Ordering::Release);
      self.max_level.store(cur_level, Ordering::Release);
      return Ok(cur_c);
    };

    let mut cur_best = entry;
    if cur_level < max_level_snapshot {
      let cur_dist = self.distance_to(vector, entry)?;
      (cur_best, _) = self.greedy_descent(
        vector,
        entry,
        cur_dist,
        max_level_snapshot as usize,
        (cur_level + 1) as usize,
      )?;
    }

    let entry_deleted = self.graph.is_deleted(entry);
    let top_layer = cur_level.min(max_level_snapshot).max(0) as usize;
    for layer in (0..=top_layer).rev() {
      let mut candidates = self.search_layer(cur_best, vector, self.ef_construction, layer)?;
      if entry_deleted {
        let d = self.distance_to(vector, entry)?;
        candidates.push((OrderedFloat(d), entry));
        if candidates.len() > self.ef_construction {
          candidates.pop();
        }
      }
      cur_best = self.connect_new_element(cur_c, candidates, layer)?;
    }

    if cur_level > max_level_snapshot {
      debug_assert!(apex_guard.is_some());
      self.entry_point.store(cur_c, Ordering::Release);
      self.max_level.store(cur_level, Ordering::Release);
    }
    drop(apex_guard);

    Ok(cur_c)
  }

  /// Update path for a re-inserted label: clear any tombstone and swap the
  /// vector in place. The graph structure is left untouched.
  fn replace_vector(&self, id: InternalId, vector: &[f32]) -> Result<InternalId> {
    if self.graph.is_deleted(id) && self.graph.clear_deleted(id)? {
      self.num_deleted.fetch_sub(1, Ordering::AcqRel);
    }
    let _node_guard = self.graph.lock_node(id);
    self.graph.set_vector(id, vector.to_vec())?;
    Ok(id)
  }

  /// Greedy 1-nearest walk from `cur` down through layers
  /// `top_layer..=bottom_layer` (descending).
  fn greedy_descent(
    &self,
    query: &[f32],
    mut cur: InternalId,
    mut cur_dist: f32,
    top_layer: usize,
    bottom_layer: usize,
  ) -> Result<(InternalId, f32)> {
    let mut neighbors: Vec<InternalId> = Vec::with_capacity(self.graph.max_m() + 1);
    for layer in (bottom_layer..=top_layer).rev() {
      let mut changed = true;
      while changed {
        changed = false;
        self.counters.record_hop();
        neighbors.clear();
        {
          let _node_guard = self.graph.lock_node(cur);
          neighbors.extend(self.graph.links(cur, layer)?);
        }
        for &cand in &neighbors {
          let d = self.distance_to(query, cand)?;
          if d < cur_dist {
            cur_dist = d;
            cur = cand;
            changed = true;
          }
        }
      }
    }
    Ok((cur, cur_dist))
  }

  /// Bounded beam search on one layer. Returns a max-heap of at most `ef`
  /// non-tombstoned nodes; tombstoned nodes are traversed but never entered
  /// into the result heap.
  fn search_layer(
    &self,
    entry: InternalId,
    query: &[f32],
    ef: usize,
    layer: usize,
  ) -> Result<DistHeap> {
    let mut visited = self.visited_pool.acquire();

    let mut results: DistHeap = BinaryHeap::new();
    let mut candidates: DistHeap = BinaryHeap::new();

    let mut lower_bound = f32::INFINITY;
    if !self.graph.is_deleted(entry) {
      let d = self.distance_to(query, entry)?;
      lower_bound = d;
      results.push((OrderedFloat(d), entry));
      candidates.push((OrderedFloat(-d), entry));
    } else {
      candidates.push((OrderedFloat(-lower_bound), entry));
    }
    visited.insert(entry);

    let mut neighbors: Vec<InternalId> = Vec::with_capacity(self.graph.max_m0() + 1);
    while let Some((neg_dist, cur)) = candidates.pop() {
      let cur_dist = -neg_dist.0;
      if cur_dist > lower_bound && results.len() >= ef {
        break;
      }
      self.counters.record_hop();

      // Snapshot the neighbor list under the node lock, then release.
      neighbors.clear();
      {
        let _node_guard = self.graph.lock_node(cur);
        neighbors.extend(self.graph.links(cur, layer)?);
      }

      for &cand in &neighbors {
        if !visited.insert(cand) {
          continue;
        }
        let d = self.distance_to(query, cand)?;
        if results.len() < ef || d < lower_bound {
          candidates.push((OrderedFloat(-d), cand));
          if !self.graph.is_deleted(cand) {
            results.push((OrderedFloat(d), cand));
            if results.len() > ef {
              results.pop();
            }
          }
          if let Some((worst, _)) = results.peek() {
            lower_bound = worst.0;
          }
        }
      }
    }

    Ok(results)
  }

  /// Diversity-preserving neighbor selection: keep a candidate only if no
  /// already-kept neighbor is closer to it than the query is. `candidates`
  /// is reduced in place to at most `m` entries.
  fn select_neighbors(&self, candidates: &mut DistHeap, m: usize) -> Result<()> {
    if candidates.len() < m {
      return Ok(());
    }

    let mut nearest_first: DistHeap = BinaryHeap::with_capacity(candidates.len());
    while let Some((dist, id)) = candidates.pop() {
      nearest_first.push((OrderedFloat(-dist.0), id));
    }

    let mut kept: Vec<(OrderedFloat<f32>, InternalId)> = Vec::with_capacity(m);
    while let Some((neg_dist, cand)) = nearest_first.pop() {
      if kept.len() >= m {
        break;
      }
      let dist_to_query = -neg_dist.0;
      let mut diverse = true;
      for &(_, kept_id) in &kept {
        if self.distance_between(kept_id, cand)? < dist_to_query {
          diverse = false;
          break;
        }
      }
      if diverse {
        kept.push((neg_dist, cand));
      }
    }

    for (neg_dist, id) in kept {
      candidates.push((OrderedFloat(-neg_dist.0), id));
    }
    Ok(())
  }

  /// Write the new node's neighbor list on `layer` and attempt the
  /// reciprocal edge on every chosen neighbor, re-running the selection
  /// heuristic on any list that would overflow. Returns the closest chosen
  /// neighbor as the entry for the next layer down.
  fn connect_new_element(
    &self,
    cur_c: InternalId,
    mut candidates: DistHeap,
    layer: usize,
  ) -> Result<InternalId> {
    self.select_neighbors(&mut candidates, self.m)?;
    if candidates.len() > self.m {
      return Err(Error::InvariantViolation(
        "heuristic kept more than M candidates".to_string(),
      ));
    }

    let mut selected: Vec<InternalId> = Vec::with_capacity(self.m);
    while let Some((_, id)) = candidates.pop() {
      selected.push(id);
    }
    // Popped farthest-first, so the last entry is the closest.
    let next_entry = *selected
      .last()
      .ok_or_else(|| Error::InvariantViolation("empty neighbor selection".to_string()))?;

    for &neighbor in &selected {
      if neighbor == cur_c {
        return Err(Error::InvariantViolation(
          "attempted self-edge".to_string(),
        ));
      }
      if layer > self.graph.level(neighbor).max(0) as usize {
        return Err(Error::InvariantViolation(format!(
          "neighbor {neighbor} does not exist on layer {layer}"
        )));
      }
    }

    {
      let _own_guard = self.graph.lock_node(cur_c);
      let block = self.graph.block(cur_c, layer)?;
      if self.graph.links(cur_c, layer)?.len() != 0 {
        return Err(Error::InvariantViolation(
          "new node already has links".to_string(),
        ));
      }
      self.graph.write_links(block, &selected)?;
    }

    let capacity = self.graph.link_capacity(layer);
    for &neighbor in &selected {
      let _neighbor_guard = self.graph.lock_node(neighbor);
      let existing = self.graph.links(neighbor, layer)?;
      let existing_len = existing.len();

      if existing_len < capacity {
        let block = self.graph.block(neighbor, layer)?;
        block[1 + existing_len].store(cur_c, Ordering::Relaxed);
        self.graph.set_link_count(&block[0], existing_len + 1)?;
        continue;
      }

      // Full list: reselect over the enlarged neighborhood.
      let mut enlarged: DistHeap = BinaryHeap::with_capacity(existing_len + 1);
      enlarged.push((OrderedFloat(self.distance_between(cur_c, neighbor)?), cur_c));
      for other in existing {
        enlarged.push((OrderedFloat(self.distance_between(other, neighbor)?), other));
      }
      self.select_neighbors(&mut enlarged, capacity)?;

      let mut reselected: Vec<InternalId> = Vec::with_capacity(enlarged.len());
      while let Some((_, id)) = enlarged.pop() {
        reselected.push(id);
      }
      let block = self.graph.block(neighbor, layer)?;
      self.graph.write_links(block, &reselected)?;
    }

    Ok(next_entry)
  }

  /// k nearest neighbors of `query`, ascending by distance. Tombstoned
  /// nodes are excluded. Returns fewer than `k` entries when the index
  /// holds fewer than `k` live nodes in the explored region.
  pub fn search_knn(&self, query: &[f32], k: usize) -> Result<Vec<(Label, f32)>> {
    if query.len() != self.space.dim() {
      return Err(Error::DimensionMismatch {
        expected: self.space.dim(),
        actual: query.len(),
      });
    }
    if self.len() == 0 {
      return Ok(Vec::new());
    }

    // Read the max level before the entry point: the publishing order on an
    // apex-raising insert (entry first, level second) then guarantees the
    // observed entry exists on every layer the descent touches.
    let top_layer = self.max_level.load(Ordering::Acquire).max(0) as usize;
    let entry = self.entry_point().ok_or(Error::EmptyIndex)?;
    let entry_dist = self.distance_to(query, entry)?;
    let (cur_best, _) = self.greedy_descent(query, entry, entry_dist, top_layer, 1)?;

    let ef = max(self.ef.load(Ordering::Acquire), k);
    let mut results = self.search_layer(cur_best, query, ef, 0)?;

    while results.len() > k {
      results.pop();
    }
    let mut out = Vec::with_capacity(results.len());
    while let Some((dist, id)) = results.pop() {
      out.push((self.graph.label(id), dist.0));
    }
    out.reverse();
    Ok(out)
  }

  /// Tombstone `label`. The node stays in the graph and keeps routing
  /// searches; it is only excluded from results.
  pub fn mark_deleted(&self, label: Label) -> Result<()> {
    let _op_guard = self.label_lock(label).lock();
    let id = self.lookup(label)?;
    if !self.graph.mark_deleted(id)? {
      return Err(Error::AlreadyDeleted(label));
    }
    self.num_deleted.fetch_add(1, Ordering::AcqRel);
    Ok(())
  }

  /// Reverse [`HnswIndex::mark_deleted`].
  pub fn unmark_deleted(&self, label: Label) -> Result<()> {
    let _op_guard = self.label_lock(label).lock();
    let id = self.lookup(label)?;
    if !self.graph.clear_deleted(id)? {
      return Err(Error::NotDeleted(label));
    }
    self.num_deleted.fetch_sub(1, Ordering::AcqRel);
    Ok(())
  }

  /// The stored vector for `label`, if present and not tombstoned.
  pub fn get_vector(&self, label: Label) -> Result<Arc<Vec<f32>>> {
    let id = self.lookup(label)?;
    if self.graph.is_deleted(id) {
      return Err(Error::LabelNotFound(label));
    }
    let guard = self.graph.vector_guard(id)?;
    guard
      .as_ref()
      .map(Arc::clone)
      .ok_or_else(|| Error::InvariantViolation(format!("node {id} has no vector")))
  }

  fn lookup(&self, label: Label) -> Result<InternalId> {
    self
      .label_map
      .lock()
      .get(&label)
      .copied()
      .ok_or(Error::LabelNotFound(label))
  }

  /// Quiescent validation of the structural invariants: list lengths within
  /// capacity, edges within bounds and within-layer, no self-loops or
  /// duplicates, the entry point at the top level, and the label map a
  /// bijection onto the live id range.
  pub fn check_integrity(&self) -> Result<()> {
    let count = self.len();
    let max_level = self.max_level.load(Ordering::Acquire);

    let mut inbound = vec![0usize; count];
    for i in 0..count {
      let id = i as InternalId;
      let level = self.graph.level(id);
      if level < 0 {
        return Err(Error::InvariantViolation(format!(
          "node {id} has negative level"
        )));
      }
      if level > max_level {
        return Err(Error::InvariantViolation(format!(
          "node {id} above the max level"
        )));
      }
      for layer in 0..=level as usize {
        let links = self.graph.links(id, layer)?;
        let mut seen = HashSet::new();
        for to in links {
          if to as usize >= count {
            return Err(Error::InvariantViolation(format!(
              "edge {id}->{to} points outside the index"
            )));
          }
          if to == id {
            return Err(Error::InvariantViolation(format!("self-loop at {id}")));
          }
          if layer > self.graph.level(to).max(0) as usize {
            return Err(Error::InvariantViolation(format!(
              "edge {id}->{to} crosses below {to}'s level"
            )));
          }
          inbound[to as usize] += 1;
          if !seen.insert(to) {
            return Err(Error::InvariantViolation(format!(
              "duplicate edge {id}->{to}"
            )));
          }
        }
      }
    }

    if count > 1 {
      for (i, &n) in inbound.iter().enumerate() {
        if n == 0 {
          return Err(Error::InvariantViolation(format!(
            "node {i} has no inbound edges"
          )));
        }
      }
    }

    match self.entry_point() {
      Some(entry) => {
        if entry as usize >= count {
          return Err(Error::InvariantViolation(
            "entry point outside the index".to_string(),
          ));
        }
        if self.graph.level(entry) != max_level {
          return Err(Error::InvariantViolation(
            "entry point is not at the max level".to_string(),
          ));
        }
      }
      None => {
        if count > 0 {
          return Err(Error::InvariantViolation(
            "non-empty index without an entry point".to_string(),
          ));
        }
      }
    }

    let label_map = self.label_map.lock();
    if label_map.len() != count {
      return Err(Error::InvariantViolation(format!(
        "label map holds {} entries for {count} nodes",
        label_map.len()
      )));
    }
    let mut ids = HashSet::new();
    for (&label, &id) in label_map.iter() {
      if id as usize >= count || !ids.insert(id) {
        return Err(Error::InvariantViolation(format!(
          "label map entry {label}->{id} is not a bijection"
        )));
      }
      if self.graph.label(id) != label {
        return Err(Error::InvariantViolation(format!(
          "node {id} stores a different label than the map"
        )));
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bruteforce::BruteforceIndex;
  use crate::space::normalize_in_place;
  use crate::space::InnerProductSpace;
  use crate::space::L2Space;
  use approx::assert_relative_eq;
  use proptest::prelude::*;
  use std::thread;

  fn random_unit_vector(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    normalize_in_place(&mut v);
    v
  }

  fn brute_force_knn<S: Space>(
    space: &S,
    points: &[(Label, Vec<f32>)],
    query: &[f32],
    k: usize,
  ) -> Vec<(Label, f32)> {
    let mut all: Vec<(Label, f32)> = points
      .iter()
      .map(|(l, v)| (*l, space.distance(query, v)))
      .collect();
    all.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
    all.truncate(k);
    all
  }

  fn three_unit_vectors() -> HnswIndex<InnerProductSpace> {
    let idx = HnswIndex::new(InnerProductSpace::new(4), 10, 16, 200, 42);
    let s = std::f32::consts::FRAC_1_SQRT_2;
    idx.add_point(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
    idx.add_point(&[0.0, 1.0, 0.0, 0.0], 2).unwrap();
    idx.add_point(&[s, s, 0.0, 0.0], 3).unwrap();
    idx.set_ef(10);
    idx
  }

  #[test]
  fn inner_product_ranking_of_unit_vectors() {
    let idx = three_unit_vectors();
    let res = idx.search_knn(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
    let labels: Vec<Label> = res.iter().map(|(l, _)| *l).collect();
    assert_eq!(labels, vec![1, 3]);
    assert_relative_eq!(res[0].1, 0.0, epsilon = 1e-6);
  }

  #[test]
  fn tombstoned_node_is_skipped_but_still_routes() {
    let idx = three_unit_vectors();
    idx.mark_deleted(1).unwrap();
    let res = idx.search_knn(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
    let labels: Vec<Label> = res.iter().map(|(l, _)| *l).collect();
    assert_eq!(labels, vec![3, 2]);

    idx.unmark_deleted(1).unwrap();
    let res = idx.search_knn(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
    assert_eq!(res[0].0, 1);
  }

  #[test]
  fn double_delete_and_spurious_undelete_error() {
    let idx = three_unit_vectors();
    idx.mark_deleted(2).unwrap();
    assert!(matches!(idx.mark_deleted(2), Err(Error::AlreadyDeleted(2))));
    idx.unmark_deleted(2).unwrap();
    assert!(matches!(idx.unmark_deleted(2), Err(Error::NotDeleted(2))));
    assert!(matches!(idx.mark_deleted(99), Err(Error::LabelNotFound(99))));
  }

  #[test]
  fn reinserting_a_label_replaces_the_vector_in_place() {
    let idx = HnswIndex::new(L2Space::new(2), 10, 8, 64, 42);
    idx.add_point(&[0.0, 0.0], 1).unwrap();
    idx.add_point(&[10.0, 10.0], 2).unwrap();
    assert_eq!(idx.len(), 2);

    idx.add_point(&[100.0, 100.0], 1).unwrap();
    assert_eq!(idx.len(), 2);
    let v = idx.get_vector(1).unwrap();
    assert_relative_eq!(v[0], 100.0);
    assert_relative_eq!(v[1], 100.0);

    let res = idx.search_knn(&[100.0, 100.0], 1).unwrap();
    assert_eq!(res[0].0, 1);
    assert_relative_eq!(res[0].1, 0.0);
  }

  #[test]
  fn reinserting_a_deleted_label_revives_it() {
    let idx = HnswIndex::new(L2Space::new(2), 10, 8, 64, 42);
    idx.add_point(&[0.0, 0.0], 1).unwrap();
    idx.add_point(&[5.0, 5.0], 2).unwrap();
    idx.mark_deleted(1).unwrap();
    assert_eq!(idx.deleted_count(), 1);

    idx.add_point(&[1.0, 1.0], 1).unwrap();
    assert_eq!(idx.deleted_count(), 0);
    assert_eq!(idx.len(), 2);
    let res = idx.search_knn(&[1.0, 1.0], 1).unwrap();
    assert_eq!(res[0].0, 1);
  }

  #[test]
  fn k_beyond_len_returns_exactly_len_results() {
    let idx = three_unit_vectors();
    let res = idx.search_knn(&[1.0, 0.0, 0.0, 0.0], 10).unwrap();
    assert_eq!(res.len(), 3);
  }

  #[test]
  fn ef_below_k_is_raised_to_k() {
    let idx = HnswIndex::new(L2Space::new(2), 40, 8, 64, 42);
    for i in 0..30u64 {
      idx.add_point(&[i as f32, 0.0], i).unwrap();
    }
    idx.set_ef(1);
    let res = idx.search_knn(&[0.0, 0.0], 5).unwrap();
    assert_eq!(res.len(), 5);
    assert_eq!(res[0].0, 0);
  }

  #[test]
  fn fully_deleted_index_returns_no_results() {
    let idx = three_unit_vectors();
    for label in 1..=3 {
      idx.mark_deleted(label).unwrap();
    }
    assert!(idx.search_knn(&[1.0, 0.0, 0.0, 0.0], 2).unwrap().is_empty());
  }

  #[test]
  fn searching_an_empty_index_returns_nothing() {
    let idx = HnswIndex::new(L2Space::new(3), 10, 8, 64, 42);
    assert!(idx.search_knn(&[0.0, 0.0, 0.0], 5).unwrap().is_empty());
  }

  #[test]
  fn capacity_overflow_is_reported() {
    let idx = HnswIndex::new(L2Space::new(2), 20, 8, 64, 42);
    for i in 0..20u64 {
      idx.add_point(&[i as f32, 0.0], i).unwrap();
    }
    assert!(matches!(
      idx.add_point(&[99.0, 0.0], 20),
      Err(Error::IndexFull { max_elements: 20 })
    ));
    // Updating an existing label is still allowed at capacity.
    idx.add_point(&[50.0, 0.0], 3).unwrap();
    assert_eq!(idx.len(), 20);
  }

  #[test]
  fn dimension_mismatch_is_rejected() {
    let idx = HnswIndex::new(L2Space::new(4), 10, 8, 64, 42);
    assert!(matches!(
      idx.add_point(&[1.0, 2.0], 1),
      Err(Error::DimensionMismatch {
        expected: 4,
        actual: 2
      })
    ));
    idx.add_point(&[1.0, 2.0, 3.0, 4.0], 1).unwrap();
    assert!(matches!(
      idx.search_knn(&[1.0], 1),
      Err(Error::DimensionMismatch {
        expected: 4,
        actual: 1
      })
    ));
  }

  #[test]
  fn seeded_build_passes_integrity_checks() {
    let mut rng = StdRng::seed_from_u64(99);
    let idx = HnswIndex::new(L2Space::new(8), 400, 16, 100, 99);
    for label in 0..400u64 {
      let v: Vec<f32> = (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect();
      idx.add_point(&v, label).unwrap();
    }
    idx.check_integrity().unwrap();
  }

  #[test]
  fn counters_grow_with_work() {
    let idx = three_unit_vectors();
    let after_build = idx.counters();
    assert!(after_build.distance_calls > 0);

    idx.search_knn(&[0.0, 1.0, 0.0, 0.0], 2).unwrap();
    let after_search = idx.counters();
    assert!(after_search.distance_calls > after_build.distance_calls);
    assert!(after_search.hops > 0);
  }

  fn recall_run(n: usize, num_queries: usize) -> f64 {
    let dim = 16;
    let k = 10;
    let mut rng = StdRng::seed_from_u64(7777);
    let space = InnerProductSpace::new(dim);

    let idx = HnswIndex::new(space.clone(), n, 16, 200, 7777);
    let mut truth = BruteforceIndex::new(space, n);
    for label in 0..n as Label {
      let v = random_unit_vector(&mut rng, dim);
      idx.add_point(&v, label).unwrap();
      truth.add_point(&v, label).unwrap();
    }
    idx.set_ef(50);

    let mut hits = 0usize;
    for _ in 0..num_queries {
      let q = random_unit_vector(&mut rng, dim);
      let expected: HashSet<Label> = truth
        .search_knn(&q, k)
        .unwrap()
        .into_iter()
        .map(|(l, _)| l)
        .collect();
      let got = idx.search_knn(&q, k).unwrap();
      hits += got.iter().filter(|(l, _)| expected.contains(l)).count();
    }
    hits as f64 / (num_queries * k) as f64
  }

  #[test]
  fn recall_against_brute_force() {
    let recall = recall_run(1_000, 200);
    assert!(recall >= 0.95, "recall {recall} below 0.95");
  }

  #[test]
  #[ignore = "full-size recall run; minutes in debug builds"]
  fn recall_against_brute_force_full_size() {
    let recall = recall_run(10_000, 1_000);
    assert!(recall >= 0.95, "recall {recall} below 0.95");
  }

  #[test]
  fn parallel_inserts_preserve_invariants() {
    let dim = 4;
    let n = 256u64;
    let threads = 8u64;
    let idx = Arc::new(HnswIndex::new(L2Space::new(dim), n as usize, 16, 200, 42));

    let mut handles = Vec::new();
    for t in 0..threads {
      let idx = Arc::clone(&idx);
      handles.push(thread::spawn(move || {
        let mut label = t;
        while label < n {
          let v = [
            label as f32,
            label as f32 * 0.25,
            label as f32 * -0.5,
            1.0,
          ];
          idx.add_point(&v, label).unwrap();
          label += threads;
        }
      }));
    }
    for h in handles {
      h.join().unwrap();
    }

    assert_eq!(idx.len(), n as usize);
    idx.check_integrity().unwrap();
    idx.set_ef(n as usize);

    for label in [0u64, 1, 2, 17, 63, 128, 255] {
      let v = [
        label as f32,
        label as f32 * 0.25,
        label as f32 * -0.5,
        1.0,
      ];
      assert_eq!(idx.get_vector(label).unwrap().as_slice(), &v);
      let res = idx.search_knn(&v, 1).unwrap();
      assert_eq!(res[0].0, label);
      assert_relative_eq!(res[0].1, 0.0);
    }
  }

  #[test]
  fn parallel_tombstoning_is_safe() {
    let n = 128u64;
    let threads = 8u64;
    let idx = Arc::new(HnswIndex::new(L2Space::new(2), n as usize, 16, 200, 42));
    for label in 0..n {
      idx.add_point(&[label as f32, 0.0], label).unwrap();
    }
    idx.set_ef(n as usize);

    let mut handles = Vec::new();
    for t in 0..threads {
      let idx = Arc::clone(&idx);
      handles.push(thread::spawn(move || {
        let mut label = t;
        while label < n {
          if label % 2 == 0 {
            idx.mark_deleted(label).unwrap();
          }
          label += threads;
        }
      }));
    }
    for h in handles {
      h.join().unwrap();
    }

    assert_eq!(idx.deleted_count(), n as usize / 2);
    for label in 0..n {
      let res = idx.search_knn(&[label as f32, 0.0], 1).unwrap();
      if label % 2 == 0 {
        assert!(matches!(
          idx.get_vector(label),
          Err(Error::LabelNotFound(l)) if l == label
        ));
        assert_ne!(res[0].0, label);
      } else {
        assert_eq!(res[0].0, label);
      }
    }
    idx.check_integrity().unwrap();
  }

  #[test]
  fn parallel_and_serial_builds_both_reach_recall() {
    let dim = 8;
    let n = 500usize;
    let k = 5;
    let num_queries = 50;
    let mut rng = StdRng::seed_from_u64(4242);
    let space = InnerProductSpace::new(dim);

    let mut truth = BruteforceIndex::new(space.clone(), n);
    let mut points: Vec<Vec<f32>> = Vec::with_capacity(n);
    for label in 0..n as Label {
      let v = random_unit_vector(&mut rng, dim);
      truth.add_point(&v, label).unwrap();
      points.push(v);
    }

    let serial = HnswIndex::new(space.clone(), n, 16, 200, 4242);
    for (label, v) in points.iter().enumerate() {
      serial.add_point(v, label as Label).unwrap();
    }

    let parallel = Arc::new(HnswIndex::new(space, n, 16, 200, 4242));
    let points = Arc::new(points);
    let mut handles = Vec::new();
    for t in 0..8usize {
      let parallel = Arc::clone(&parallel);
      let points = Arc::clone(&points);
      handles.push(thread::spawn(move || {
        let mut label = t;
        while label < n {
          parallel.add_point(&points[label], label as Label).unwrap();
          label += 8;
        }
      }));
    }
    for h in handles {
      h.join().unwrap();
    }

    for idx in [&serial, &*parallel] {
      idx.check_integrity().unwrap();
      idx.set_ef(50);
      let mut hits = 0usize;
      let mut qrng = StdRng::seed_from_u64(17);
      for _ in 0..num_queries {
        let q = random_unit_vector(&mut qrng, dim);
        let expected: HashSet<Label> = truth
          .search_knn(&q, k)
          .unwrap()
          .into_iter()
          .map(|(l, _)| l)
          .collect();
        let got = idx.search_knn(&q, k).unwrap();
        hits += got.iter().filter(|(l, _)| expected.contains(l)).count();
      }
      let recall = hits as f64 / (num_queries * k) as f64;
      assert!(recall >= 0.95, "recall {recall} below 0.95");
    }
  }

  #[test]
  fn racing_inserts_of_one_new_label_allocate_one_slot() {
    let idx = Arc::new(HnswIndex::new(L2Space::new(2), 16, 8, 64, 42));
    let mut handles = Vec::new();
    for t in 0..8u64 {
      let idx = Arc::clone(&idx);
      handles.push(thread::spawn(move || {
        idx.add_point(&[t as f32, 1.0], 7).unwrap();
      }));
    }
    for h in handles {
      h.join().unwrap();
    }
    assert_eq!(idx.len(), 1);
    idx.check_integrity().unwrap();
  }

  proptest! {
    #[test]
    fn exact_recall_on_flat_graphs(
      dim in 2usize..12,
      n in 2usize..64,
      k in 1usize..8,
      seed in any::<u64>(),
    ) {
      let k = k.min(n);
      let mut rng = StdRng::seed_from_u64(seed);
      let space = L2Space::new(dim);

      let idx = HnswIndex::new(space.clone(), n, n, n, seed);
      idx.set_ef(n);

      let mut points: Vec<(Label, Vec<f32>)> = Vec::with_capacity(n);
      for label in 0..n as Label {
        let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        // Pin every node to layer 0 so the beam covers the whole graph.
        idx.insert(&v, label, Some(0)).unwrap();
        points.push((label, v));
      }

      let query: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
      let expected = brute_force_knn(&space, &points, &query, k);
      let mut got = idx.search_knn(&query, k).unwrap();
      got.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
      prop_assert_eq!(got, expected);
    }
  }
}
