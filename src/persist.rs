//! Single-file binary snapshots.
//!
//! The stream is positional: no magic number, no version field, native
//! endianness. Header fields in order: `offset_level0` (reserved, 0),
//! `max_elements`, `cur_element_count`, `size_data_per_element`,
//! `label_offset`, `offset_data` (all `usize`), `max_level` (`i32`),
//! `entry_point` (`u32`), `max_m`, `max_m0`, `m` (`usize`), `mult` (`f64`),
//! `ef_construction` (`usize`). Then `cur_element_count` level-0 records of
//! `[header word][max_m0 ids][dim f32][label u64]`, then per node a `usize`
//! byte length followed by the raw upper-layer words.

use crate::error::Error;
use crate::error::Result;
use crate::index::HnswIndex;
use crate::space::Space;
use crate::InternalId;
use crate::Label;
use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Seed for the level RNG of a reloaded index.
const LOAD_SEED: u64 = 100;

fn take<const N: usize>(rd: &mut &[u8]) -> Result<[u8; N]> {
  if rd.len() < N {
    return Err(Error::InvalidSnapshot(
      "unexpected end of snapshot".to_string(),
    ));
  }
  let (bytes, rest) = rd.split_at(N);
  *rd = rest;
  Ok(bytes.try_into().unwrap())
}

fn take_usize(rd: &mut &[u8]) -> Result<usize> {
  Ok(usize::from_le_bytes(take::<{ size_of::<usize>() }>(rd)?))
}

fn take_u32(rd: &mut &[u8]) -> Result<u32> {
  Ok(u32::from_le_bytes(take::<4>(rd)?))
}

fn take_i32(rd: &mut &[u8]) -> Result<i32> {
  Ok(i32::from_le_bytes(take::<4>(rd)?))
}

fn take_f64(rd: &mut &[u8]) -> Result<f64> {
  Ok(f64::from_le_bytes(take::<8>(rd)?))
}

fn take_bytes<'a>(rd: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
  if rd.len() < n {
    return Err(Error::InvalidSnapshot(
      "unexpected end of snapshot".to_string(),
    ));
  }
  let (bytes, rest) = rd.split_at(n);
  *rd = rest;
  Ok(bytes)
}

fn words_from_bytes(bytes: &[u8], out: &mut [u32]) {
  debug_assert_eq!(bytes.len(), out.len() * 4);
  if let Ok(src) = bytemuck::try_cast_slice::<u8, u32>(bytes) {
    out.copy_from_slice(src);
  } else {
    for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
      *dst = u32::from_le_bytes(chunk.try_into().unwrap());
    }
  }
}

impl<S: Space> HnswIndex<S> {
  fn size_links_level0(&self) -> usize {
    (1 + self.graph.max_m0()) * size_of::<u32>()
  }

  fn size_links_per_element(&self) -> usize {
    (1 + self.graph.max_m()) * size_of::<u32>()
  }

  fn size_data_per_element(&self) -> usize {
    self.size_links_level0() + self.space.dim() * size_of::<f32>() + size_of::<Label>()
  }

  /// Exact byte length [`HnswIndex::save_to_writer`] will produce.
  pub fn snapshot_size(&self) -> usize {
    let cur_element_count = self.len();
    let mut size = 6 * size_of::<usize>(); // offset_level0 .. offset_data
    size += size_of::<i32>() + size_of::<u32>(); // max_level, entry point
    size += 3 * size_of::<usize>() + size_of::<f64>() + size_of::<usize>();
    size += cur_element_count * self.size_data_per_element();
    for i in 0..cur_element_count {
      size += size_of::<usize>();
      let level = self.graph.level(i as InternalId);
      if level > 0 {
        size += level as usize * self.size_links_per_element();
      }
    }
    size
  }

  /// Serialize the whole index. The caller must guarantee quiescence:
  /// inserts concurrent with a save produce an undefined suffix. Only the
  /// global mutex is taken, briefly, to snapshot the shape fields.
  pub fn save_to_writer(&self, mut w: impl Write) -> Result<()> {
    let (cur_element_count, max_level, entry_raw) = {
      let _shape_guard = self.global.lock();
      (
        self.cur_element_count.load(Ordering::Acquire),
        self.max_level.load(Ordering::Acquire),
        self.entry_point.load(Ordering::Acquire),
      )
    };

    let dim = self.space.dim();
    let size_links_level0 = self.size_links_level0();
    let offset_data = size_links_level0;
    let label_offset = size_links_level0 + dim * size_of::<f32>();

    w.write_all(&0usize.to_le_bytes())?;
    w.write_all(&self.max_elements.to_le_bytes())?;
    w.write_all(&cur_element_count.to_le_bytes())?;
    w.write_all(&self.size_data_per_element().to_le_bytes())?;
    w.write_all(&label_offset.to_le_bytes())?;
    w.write_all(&offset_data.to_le_bytes())?;
    w.write_all(&max_level.to_le_bytes())?;
    w.write_all(&entry_raw.to_le_bytes())?;
    w.write_all(&self.graph.max_m().to_le_bytes())?;
    w.write_all(&self.graph.max_m0().to_le_bytes())?;
    w.write_all(&self.m.to_le_bytes())?;
    w.write_all(&self.mult.to_le_bytes())?;
    w.write_all(&self.ef_construction.to_le_bytes())?;

    let words_per_node = 1 + self.graph.max_m0();
    let mut level0_buf = vec![0u32; words_per_node];
    for i in 0..cur_element_count {
      let id = i as InternalId;
      let block = self.graph.level0_block(id)?;
      for (dst, src) in level0_buf.iter_mut().zip(block) {
        *dst = src.load(Ordering::Acquire);
      }
      w.write_all(bytemuck::cast_slice(&level0_buf))?;

      let guard = self.graph.vector_guard(id)?;
      let vector = guard
        .as_ref()
        .ok_or_else(|| Error::InvariantViolation(format!("node {id} has no vector")))?;
      if vector.len() != dim {
        return Err(Error::InvariantViolation(format!(
          "node {id} stores a vector of length {}",
          vector.len()
        )));
      }
      w.write_all(bytemuck::cast_slice(vector.as_slice()))?;

      w.write_all(&self.graph.label(id).to_le_bytes())?;
    }

    let words_per_level = 1 + self.graph.max_m();
    let mut upper_buf: Vec<u32> = Vec::new();
    for i in 0..cur_element_count {
      let id = i as InternalId;
      let level = self.graph.level(id);
      let link_bytes = if level > 0 {
        level as usize * self.size_links_per_element()
      } else {
        0
      };
      w.write_all(&link_bytes.to_le_bytes())?;
      if link_bytes == 0 {
        continue;
      }
      let raw = self
        .graph
        .upper_raw(id)
        .ok_or_else(|| Error::InvariantViolation(format!("node {id} has no upper links")))?;
      if raw.len() != words_per_level * level as usize {
        return Err(Error::InvariantViolation(format!(
          "node {id} upper link block has the wrong size"
        )));
      }
      upper_buf.resize(raw.len(), 0);
      for (dst, src) in upper_buf.iter_mut().zip(raw) {
        *dst = src.load(Ordering::Acquire);
      }
      w.write_all(bytemuck::cast_slice(&upper_buf))?;
    }

    Ok(())
  }

  pub fn save_to_vec(&self) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(self.snapshot_size());
    self.save_to_writer(&mut out)?;
    Ok(out)
  }

  pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    self.save_to_writer(&mut w)?;
    w.flush()?;
    Ok(())
  }

  pub fn load_from_path(
    path: impl AsRef<Path>,
    space: S,
    max_elements: Option<usize>,
  ) -> Result<Self> {
    Self::load_from_reader(space, BufReader::new(File::open(path)?), max_elements)
  }

  pub fn load_from_reader(space: S, mut r: impl Read, max_elements: Option<usize>) -> Result<Self> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    Self::load_from_bytes(space, &buf, max_elements)
  }

  /// Reconstruct an index from snapshot bytes. `max_elements` overrides the
  /// stored capacity; an override smaller than the stored element count
  /// falls back to the snapshot's own capacity.
  pub fn load_from_bytes(space: S, data: &[u8], max_elements: Option<usize>) -> Result<Self> {
    let rd = &mut &*data;

    let offset_level0 = take_usize(rd)?;
    let file_max_elements = take_usize(rd)?;
    let cur_element_count = take_usize(rd)?;
    let size_data_per_element = take_usize(rd)?;
    let label_offset = take_usize(rd)?;
    let offset_data = take_usize(rd)?;
    let max_level = take_i32(rd)?;
    let entry_raw = take_u32(rd)?;
    let max_m = take_usize(rd)?;
    let max_m0 = take_usize(rd)?;
    let m = take_usize(rd)?;
    let mult = take_f64(rd)?;
    let ef_construction = take_usize(rd)?;

    if offset_level0 != 0 {
      return Err(Error::InvalidSnapshot(format!(
        "unsupported offset_level0={offset_level0}"
      )));
    }
    if m < 2 {
      return Err(Error::InvalidSnapshot(format!("invalid M={m}")));
    }
    if max_m != m || max_m0 != m.saturating_mul(2) {
      return Err(Error::InvalidSnapshot(
        "unsupported link capacities: expected max_m = M and max_m0 = 2M".to_string(),
      ));
    }

    let dim = space.dim();
    let expected_links0 = (1 + max_m0) * size_of::<u32>();
    let expected_data = dim * size_of::<f32>();
    if offset_data != expected_links0
      || label_offset != offset_data + expected_data
      || size_data_per_element != label_offset + size_of::<Label>()
    {
      return Err(Error::InvalidSnapshot(
        "snapshot shape does not match the space dimension".to_string(),
      ));
    }

    let mut capacity = max_elements.unwrap_or(0);
    if capacity < cur_element_count {
      capacity = file_max_elements;
    }
    if cur_element_count > capacity {
      return Err(Error::InvalidSnapshot(
        "cur_element_count exceeds max_elements".to_string(),
      ));
    }

    let mut idx = Self::new(space, capacity, m, ef_construction, LOAD_SEED);
    idx.mult = mult;
    idx.max_level.store(max_level, Ordering::Release);
    idx
      .cur_element_count
      .store(cur_element_count, Ordering::Release);
    if cur_element_count == 0 {
      idx.entry_point.store(InternalId::MAX, Ordering::Release);
    } else {
      if entry_raw as usize >= cur_element_count {
        return Err(Error::InvalidSnapshot(
          "entry point outside the stored elements".to_string(),
        ));
      }
      idx.entry_point.store(entry_raw, Ordering::Release);
    }

    let words_per_node = 1 + max_m0;
    let mut word_buf = vec![0u32; words_per_node];
    {
      let mut label_map = idx.label_map.lock();
      for i in 0..cur_element_count {
        let id = i as InternalId;

        let link_bytes = take_bytes(rd, words_per_node * size_of::<u32>())?;
        words_from_bytes(link_bytes, &mut word_buf);
        let block = idx.graph.level0_block(id)?;
        for (dst, &val) in block.iter().zip(&word_buf) {
          dst.store(val, Ordering::Relaxed);
        }

        let vector_bytes = take_bytes(rd, expected_data)?;
        let mut vector = vec![0.0f32; dim];
        if let Ok(src) = bytemuck::try_cast_slice::<u8, f32>(vector_bytes) {
          vector.copy_from_slice(src);
        } else {
          for (dst, chunk) in vector.iter_mut().zip(vector_bytes.chunks_exact(4)) {
            *dst = f32::from_bits(u32::from_le_bytes(chunk.try_into().unwrap()));
          }
        }
        idx.graph.set_vector(id, vector)?;

        let label = Label::from_le_bytes(take::<{ size_of::<Label>() }>(rd)?);
        idx.graph.set_label(id, label);
        if label_map.insert(label, id).is_some() {
          return Err(Error::InvalidSnapshot(format!("duplicate label {label}")));
        }
      }
    }

    let size_links_per_element = (1 + max_m) * size_of::<u32>();
    for i in 0..cur_element_count {
      let id = i as InternalId;
      let link_bytes = take_usize(rd)?;
      if link_bytes == 0 {
        idx.graph.set_level(id, 0);
        continue;
      }
      if link_bytes % size_links_per_element != 0 {
        return Err(Error::InvalidSnapshot(format!(
          "upper link block of node {id} is not a whole number of layers"
        )));
      }
      let level = link_bytes / size_links_per_element;
      idx.graph.set_level(id, level as i32);

      let bytes = take_bytes(rd, link_bytes)?;
      let words = link_bytes / size_of::<u32>();
      let mut raw = vec![0u32; words];
      words_from_bytes(bytes, &mut raw);
      let atoms: Vec<AtomicU32> = raw.into_iter().map(AtomicU32::new).collect();
      idx.graph.set_upper_raw(id, atoms.into_boxed_slice())?;
    }

    if !rd.is_empty() {
      return Err(Error::InvalidSnapshot(
        "trailing bytes after the last link block".to_string(),
      ));
    }

    // Neighbor-count and tombstone sweep; oversized lists surface here.
    let mut num_deleted = 0usize;
    for i in 0..cur_element_count {
      let id = i as InternalId;
      for layer in 0..=idx.graph.level(id).max(0) as usize {
        let links = idx.graph.links(id, layer)?;
        for to in links {
          if to as usize >= cur_element_count {
            return Err(Error::InvariantViolation(format!(
              "edge {id}->{to} points outside the stored elements"
            )));
          }
        }
      }
      if idx.graph.is_deleted(id) {
        num_deleted += 1;
      }
    }
    idx.num_deleted.store(num_deleted, Ordering::Release);

    Ok(idx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::space::L2Space;
  use rand::rngs::StdRng;
  use rand::Rng;
  use rand::SeedableRng;

  fn seeded_index(n: usize, dim: usize) -> (HnswIndex<L2Space>, Vec<Vec<f32>>) {
    let mut rng = StdRng::seed_from_u64(123);
    let idx = HnswIndex::new(L2Space::new(dim), n, 8, 64, 123);
    let mut vectors = Vec::with_capacity(n);
    for label in 0..n as Label {
      let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
      idx.add_point(&v, label).unwrap();
      vectors.push(v);
    }
    (idx, vectors)
  }

  #[test]
  fn save_load_save_is_byte_identical() {
    let (idx, _) = seeded_index(60, 4);
    idx.mark_deleted(10).unwrap();
    idx.mark_deleted(20).unwrap();

    let bytes = idx.save_to_vec().unwrap();
    assert_eq!(bytes.len(), idx.snapshot_size());

    let reloaded = HnswIndex::load_from_bytes(L2Space::new(4), &bytes, None).unwrap();
    assert_eq!(reloaded.len(), idx.len());
    assert_eq!(reloaded.deleted_count(), 2);
    assert_eq!(
      reloaded.max_level.load(Ordering::Acquire),
      idx.max_level.load(Ordering::Acquire)
    );
    assert_eq!(
      reloaded.entry_point.load(Ordering::Acquire),
      idx.entry_point.load(Ordering::Acquire)
    );

    let bytes2 = reloaded.save_to_vec().unwrap();
    assert_eq!(bytes, bytes2);
  }

  #[test]
  fn header_fields_are_written_in_order() {
    let (idx, _) = seeded_index(3, 4);
    let bytes = idx.save_to_vec().unwrap();

    let usize_at = |off: usize| usize::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
    // [links0 header+ids][vector][label] with m=8, max_m0=16, dim=4.
    let size_links_level0 = (1 + 16) * 4;
    let expected_sdpe = size_links_level0 + 4 * 4 + 8;

    assert_eq!(usize_at(0), 0); // offset_level0
    assert_eq!(usize_at(8), 3); // max_elements
    assert_eq!(usize_at(16), 3); // cur_element_count
    assert_eq!(usize_at(24), expected_sdpe);
    assert_eq!(usize_at(32), size_links_level0 + 16); // label_offset
    assert_eq!(usize_at(40), size_links_level0); // offset_data
    assert_eq!(usize_at(56), 8); // max_m
    assert_eq!(usize_at(64), 16); // max_m0
    assert_eq!(usize_at(72), 8); // m
    assert_eq!(
      f64::from_le_bytes(bytes[80..88].try_into().unwrap()),
      idx.mult
    );
    assert_eq!(usize_at(88), 64); // ef_construction
  }

  #[test]
  fn reloaded_index_answers_queries_identically() {
    let (idx, _) = seeded_index(300, 8);
    idx.set_ef(40);

    let bytes = idx.save_to_vec().unwrap();
    let reloaded = HnswIndex::load_from_bytes(L2Space::new(8), &bytes, None).unwrap();
    reloaded.set_ef(40);
    reloaded.check_integrity().unwrap();

    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..20 {
      let q: Vec<f32> = (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect();
      assert_eq!(
        idx.search_knn(&q, 10).unwrap(),
        reloaded.search_knn(&q, 10).unwrap()
      );
    }
  }

  #[test]
  fn path_roundtrip_through_a_snapshot_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.bin");

    let (idx, vectors) = seeded_index(100, 4);
    idx.save_to_path(&path).unwrap();

    let reloaded = HnswIndex::load_from_path(&path, L2Space::new(4), None).unwrap();
    assert_eq!(reloaded.len(), 100);
    for (label, v) in vectors.iter().enumerate() {
      assert_eq!(
        reloaded.get_vector(label as Label).unwrap().as_slice(),
        v.as_slice()
      );
    }
  }

  #[test]
  fn reloaded_index_accepts_further_inserts() {
    let (idx, _) = seeded_index(30, 4);
    let bytes = idx.save_to_vec().unwrap();

    let reloaded = HnswIndex::load_from_bytes(L2Space::new(4), &bytes, Some(64)).unwrap();
    assert_eq!(reloaded.capacity(), 64);
    for label in 30..64u64 {
      reloaded
        .add_point(&[label as f32, 0.0, 0.0, 0.0], label)
        .unwrap();
    }
    assert_eq!(reloaded.len(), 64);
    reloaded.check_integrity().unwrap();

    reloaded.set_ef(64);
    let res = reloaded.search_knn(&[40.0, 0.0, 0.0, 0.0], 1).unwrap();
    assert_eq!(res[0].0, 40);
  }

  #[test]
  fn capacity_override_below_count_falls_back_to_stored_capacity() {
    let (idx, _) = seeded_index(30, 4);
    let bytes = idx.save_to_vec().unwrap();
    let reloaded = HnswIndex::load_from_bytes(L2Space::new(4), &bytes, Some(10)).unwrap();
    assert_eq!(reloaded.capacity(), 30);
    assert_eq!(reloaded.len(), 30);
  }

  #[test]
  fn truncated_and_padded_snapshots_are_rejected() {
    let (idx, _) = seeded_index(10, 4);
    let bytes = idx.save_to_vec().unwrap();

    let truncated = &bytes[..bytes.len() - 10];
    assert!(matches!(
      HnswIndex::load_from_bytes(L2Space::new(4), truncated, None),
      Err(Error::InvalidSnapshot(_))
    ));

    let mut padded = bytes.clone();
    padded.push(0);
    assert!(matches!(
      HnswIndex::load_from_bytes(L2Space::new(4), &padded, None),
      Err(Error::InvalidSnapshot(_))
    ));
  }

  #[test]
  fn mismatched_space_dimension_is_rejected() {
    let (idx, _) = seeded_index(10, 4);
    let bytes = idx.save_to_vec().unwrap();
    assert!(matches!(
      HnswIndex::load_from_bytes(L2Space::new(5), &bytes, None),
      Err(Error::InvalidSnapshot(_))
    ));
  }
}
