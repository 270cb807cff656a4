//! Exact-scan baseline index, mainly used as ground truth for recall checks.

use crate::error::Error;
use crate::error::Result;
use crate::space::Space;
use crate::Label;
use ahash::HashMap;
use ahash::HashMapExt;
use ordered_float::OrderedFloat;
use std::io::Read;
use std::io::Write;
use std::mem::size_of;

#[derive(Debug, Clone)]
pub struct BruteforceIndex<S: Space> {
  space: S,
  max_elements: usize,
  cur_element_count: usize,
  vectors: Vec<f32>,
  labels: Vec<Label>,
  label_map: HashMap<Label, usize>,
}

impl<S: Space> BruteforceIndex<S> {
  pub fn new(space: S, max_elements: usize) -> Self {
    let dim = space.dim();
    Self {
      space,
      max_elements,
      cur_element_count: 0,
      vectors: vec![0.0; max_elements * dim],
      labels: vec![0; max_elements],
      label_map: HashMap::new(),
    }
  }

  pub fn len(&self) -> usize {
    self.cur_element_count
  }

  pub fn is_empty(&self) -> bool {
    self.cur_element_count == 0
  }

  pub fn add_point(&mut self, vector: &[f32], label: Label) -> Result<()> {
    if vector.len() != self.space.dim() {
      return Err(Error::DimensionMismatch {
        expected: self.space.dim(),
        actual: vector.len(),
      });
    }

    let slot = match self.label_map.get(&label) {
      Some(&existing) => existing,
      None => {
        if self.cur_element_count >= self.max_elements {
          return Err(Error::IndexFull {
            max_elements: self.max_elements,
          });
        }
        let slot = self.cur_element_count;
        self.cur_element_count += 1;
        self.label_map.insert(label, slot);
        self.labels[slot] = label;
        slot
      }
    };

    let dim = self.space.dim();
    self.vectors[slot * dim..(slot + 1) * dim].copy_from_slice(vector);
    Ok(())
  }

  /// Remove `label` by swapping the last slot into its place.
  pub fn remove_point(&mut self, label: Label) -> Result<()> {
    let slot = self
      .label_map
      .remove(&label)
      .ok_or(Error::LabelNotFound(label))?;

    let last = self.cur_element_count - 1;
    if slot != last {
      let dim = self.space.dim();
      self.vectors.copy_within(last * dim..(last + 1) * dim, slot * dim);
      let moved = self.labels[last];
      self.labels[slot] = moved;
      self.label_map.insert(moved, slot);
    }
    self.cur_element_count -= 1;
    Ok(())
  }

  pub fn search_knn(&self, query: &[f32], k: usize) -> Result<Vec<(Label, f32)>> {
    if query.len() != self.space.dim() {
      return Err(Error::DimensionMismatch {
        expected: self.space.dim(),
        actual: query.len(),
      });
    }

    let k = k.min(self.cur_element_count);
    let mut heap: BinaryHeapOf = std::collections::BinaryHeap::with_capacity(k + 1);
    let dim = self.space.dim();
    for slot in 0..self.cur_element_count {
      let v = &self.vectors[slot * dim..(slot + 1) * dim];
      let dist = self.space.distance(query, v);
      if heap.len() < k {
        heap.push((OrderedFloat(dist), self.labels[slot]));
      } else if let Some(&(worst, _)) = heap.peek() {
        if dist < worst.0 {
          heap.pop();
          heap.push((OrderedFloat(dist), self.labels[slot]));
        }
      }
    }

    let mut out = Vec::with_capacity(heap.len());
    while let Some((dist, label)) = heap.pop() {
      out.push((label, dist.0));
    }
    out.reverse();
    Ok(out)
  }

  pub fn save_to_writer(&self, mut w: impl Write) -> Result<()> {
    let size_per_element = self.space.dim() * size_of::<f32>() + size_of::<Label>();
    w.write_all(&(self.max_elements as u64).to_le_bytes())?;
    w.write_all(&(size_per_element as u64).to_le_bytes())?;
    w.write_all(&(self.cur_element_count as u64).to_le_bytes())?;

    let dim = self.space.dim();
    for slot in 0..self.max_elements {
      let v = &self.vectors[slot * dim..(slot + 1) * dim];
      w.write_all(bytemuck::cast_slice(v))?;
      w.write_all(&self.labels[slot].to_le_bytes())?;
    }
    Ok(())
  }

  pub fn load_from_reader(space: S, mut r: impl Read) -> Result<Self> {
    let mut word = [0u8; 8];
    r.read_exact(&mut word)?;
    let max_elements = u64::from_le_bytes(word) as usize;
    r.read_exact(&mut word)?;
    let size_per_element = u64::from_le_bytes(word) as usize;
    r.read_exact(&mut word)?;
    let cur_element_count = u64::from_le_bytes(word) as usize;

    let dim = space.dim();
    if size_per_element != dim * size_of::<f32>() + size_of::<Label>() {
      return Err(Error::InvalidSnapshot(
        "snapshot shape does not match the space dimension".to_string(),
      ));
    }
    if cur_element_count > max_elements {
      return Err(Error::InvalidSnapshot(
        "cur_element_count exceeds max_elements".to_string(),
      ));
    }

    let mut idx = Self::new(space, max_elements);
    idx.cur_element_count = cur_element_count;
    for slot in 0..max_elements {
      let v = &mut idx.vectors[slot * dim..(slot + 1) * dim];
      r.read_exact(bytemuck::cast_slice_mut(v))?;
      r.read_exact(&mut word)?;
      idx.labels[slot] = Label::from_le_bytes(word);
    }

    for slot in 0..cur_element_count {
      if idx.label_map.insert(idx.labels[slot], slot).is_some() {
        return Err(Error::InvalidSnapshot(format!(
          "duplicate label {}",
          idx.labels[slot]
        )));
      }
    }

    Ok(idx)
  }
}

type BinaryHeapOf = std::collections::BinaryHeap<(OrderedFloat<f32>, Label)>;

#[cfg(test)]
mod tests {
  use super::*;
  use crate::space::L2Space;
  use rand::rngs::StdRng;
  use rand::Rng;
  use rand::SeedableRng;

  #[test]
  fn returns_the_true_nearest_neighbors() {
    let mut rng = StdRng::seed_from_u64(3);
    let dim = 6;
    let n = 40;
    let space = L2Space::new(dim);
    let mut idx = BruteforceIndex::new(space.clone(), n);

    let mut points: Vec<(Label, Vec<f32>)> = Vec::new();
    for label in 0..n as Label {
      let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
      idx.add_point(&v, label).unwrap();
      points.push((label, v));
    }

    let q: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let mut expected: Vec<(Label, f32)> = points
      .iter()
      .map(|(l, v)| (*l, space.distance(&q, v)))
      .collect();
    expected.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
    expected.truncate(5);

    let mut got = idx.search_knn(&q, 5).unwrap();
    got.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| a.0.cmp(&b.0)));
    assert_eq!(got, expected);
  }

  #[test]
  fn k_larger_than_len_returns_len_entries() {
    let mut idx = BruteforceIndex::new(L2Space::new(2), 10);
    idx.add_point(&[0.0, 0.0], 1).unwrap();
    idx.add_point(&[1.0, 0.0], 2).unwrap();
    assert_eq!(idx.search_knn(&[0.0, 0.0], 5).unwrap().len(), 2);
  }

  #[test]
  fn remove_point_swaps_in_the_last_slot() {
    let mut idx = BruteforceIndex::new(L2Space::new(1), 4);
    idx.add_point(&[0.0], 10).unwrap();
    idx.add_point(&[1.0], 11).unwrap();
    idx.add_point(&[2.0], 12).unwrap();
    idx.remove_point(10).unwrap();
    assert_eq!(idx.len(), 2);

    let got = idx.search_knn(&[0.0], 2).unwrap();
    assert_eq!(got[0].0, 11);
    assert_eq!(got[1].0, 12);
    assert!(matches!(
      idx.remove_point(10),
      Err(Error::LabelNotFound(10))
    ));
  }

  #[test]
  fn save_load_preserves_contents() {
    let mut idx = BruteforceIndex::new(L2Space::new(2), 8);
    for label in 0..5u64 {
      idx.add_point(&[label as f32, 0.5], label).unwrap();
    }

    let mut bytes = Vec::new();
    idx.save_to_writer(&mut bytes).unwrap();
    let reloaded = BruteforceIndex::load_from_reader(L2Space::new(2), &bytes[..]).unwrap();

    assert_eq!(reloaded.len(), 5);
    assert_eq!(
      idx.search_knn(&[2.1, 0.5], 3).unwrap(),
      reloaded.search_knn(&[2.1, 0.5], 3).unwrap()
    );
  }
}
