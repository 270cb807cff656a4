//! Distance kernels.
//!
//! A [`Space`] pairs a fixed dimensionality with a distance function. The
//! concrete kernel is picked once at construction (best SIMD variant the CPU
//! supports, scalar otherwise), so equal inputs always produce identical
//! results within one process run.

pub trait Space: Clone + Send + Sync + 'static {
  fn dim(&self) -> usize;
  fn distance(&self, a: &[f32], b: &[f32]) -> f32;
}

type KernelFn = unsafe fn(*const f32, *const f32, usize) -> f32;

unsafe fn l2_sq_scalar(a: *const f32, b: *const f32, dim: usize) -> f32 {
  let mut acc = 0.0_f32;
  for i in 0..dim {
    let d = *a.add(i) - *b.add(i);
    acc += d * d;
  }
  acc
}

unsafe fn ip_scalar(a: *const f32, b: *const f32, dim: usize) -> f32 {
  let mut dot = 0.0_f32;
  for i in 0..dim {
    dot += *a.add(i) * *b.add(i);
  }
  1.0_f32 - dot
}

unsafe fn cosine_scalar(a: *const f32, b: *const f32, dim: usize) -> f32 {
  let mut dot = 0.0_f32;
  let mut norm_a = 0.0_f32;
  let mut norm_b = 0.0_f32;
  for i in 0..dim {
    let x = *a.add(i);
    let y = *b.add(i);
    dot += x * y;
    norm_a += x * x;
    norm_b += y * y;
  }
  let denom = (norm_a * norm_b).sqrt();
  if denom == 0.0 {
    return 1.0;
  }
  1.0_f32 - dot / denom
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod x86 {
  use super::KernelFn;
  #[cfg(target_arch = "x86")]
  use std::arch::x86::*;
  #[cfg(target_arch = "x86_64")]
  use std::arch::x86_64::*;

  #[inline]
  unsafe fn hsum128(v: __m128) -> f32 {
    let mut out = [0.0_f32; 4];
    _mm_storeu_ps(out.as_mut_ptr(), v);
    out[0] + out[1] + out[2] + out[3]
  }

  #[inline]
  unsafe fn hsum256(v: __m256) -> f32 {
    let mut out = [0.0_f32; 8];
    _mm256_storeu_ps(out.as_mut_ptr(), v);
    out.iter().sum()
  }

  #[target_feature(enable = "sse")]
  pub unsafe fn l2_sq_sse(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm_setzero_ps();
    let mut i = 0usize;
    while i + 4 <= dim {
      let d = _mm_sub_ps(_mm_loadu_ps(a.add(i)), _mm_loadu_ps(b.add(i)));
      acc = _mm_add_ps(acc, _mm_mul_ps(d, d));
      i += 4;
    }
    let mut res = hsum128(acc);
    while i < dim {
      let d = *a.add(i) - *b.add(i);
      res += d * d;
      i += 1;
    }
    res
  }

  #[target_feature(enable = "avx")]
  pub unsafe fn l2_sq_avx(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= dim {
      let d = _mm256_sub_ps(_mm256_loadu_ps(a.add(i)), _mm256_loadu_ps(b.add(i)));
      acc = _mm256_add_ps(acc, _mm256_mul_ps(d, d));
      i += 8;
    }
    let mut res = hsum256(acc);
    while i < dim {
      let d = *a.add(i) - *b.add(i);
      res += d * d;
      i += 1;
    }
    res
  }

  #[target_feature(enable = "avx512f")]
  pub unsafe fn l2_sq_avx512(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm512_setzero_ps();
    let mut i = 0usize;
    while i + 16 <= dim {
      let d = _mm512_sub_ps(_mm512_loadu_ps(a.add(i)), _mm512_loadu_ps(b.add(i)));
      acc = _mm512_add_ps(acc, _mm512_mul_ps(d, d));
      i += 16;
    }
    let mut res = _mm512_reduce_add_ps(acc);
    while i < dim {
      let d = *a.add(i) - *b.add(i);
      res += d * d;
      i += 1;
    }
    res
  }

  #[target_feature(enable = "sse")]
  pub unsafe fn ip_sse(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm_setzero_ps();
    let mut i = 0usize;
    while i + 4 <= dim {
      acc = _mm_add_ps(acc, _mm_mul_ps(_mm_loadu_ps(a.add(i)), _mm_loadu_ps(b.add(i))));
      i += 4;
    }
    let mut dot = hsum128(acc);
    while i < dim {
      dot += *a.add(i) * *b.add(i);
      i += 1;
    }
    1.0_f32 - dot
  }

  #[target_feature(enable = "avx")]
  pub unsafe fn ip_avx(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= dim {
      acc = _mm256_add_ps(
        acc,
        _mm256_mul_ps(_mm256_loadu_ps(a.add(i)), _mm256_loadu_ps(b.add(i))),
      );
      i += 8;
    }
    let mut dot = hsum256(acc);
    while i < dim {
      dot += *a.add(i) * *b.add(i);
      i += 1;
    }
    1.0_f32 - dot
  }

  #[target_feature(enable = "avx512f")]
  pub unsafe fn ip_avx512(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut acc = _mm512_setzero_ps();
    let mut i = 0usize;
    while i + 16 <= dim {
      acc = _mm512_add_ps(
        acc,
        _mm512_mul_ps(_mm512_loadu_ps(a.add(i)), _mm512_loadu_ps(b.add(i))),
      );
      i += 16;
    }
    let mut dot = _mm512_reduce_add_ps(acc);
    while i < dim {
      dot += *a.add(i) * *b.add(i);
      i += 1;
    }
    1.0_f32 - dot
  }

  #[target_feature(enable = "avx")]
  pub unsafe fn cosine_avx(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut dot_acc = _mm256_setzero_ps();
    let mut a_acc = _mm256_setzero_ps();
    let mut b_acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= dim {
      let va = _mm256_loadu_ps(a.add(i));
      let vb = _mm256_loadu_ps(b.add(i));
      dot_acc = _mm256_add_ps(dot_acc, _mm256_mul_ps(va, vb));
      a_acc = _mm256_add_ps(a_acc, _mm256_mul_ps(va, va));
      b_acc = _mm256_add_ps(b_acc, _mm256_mul_ps(vb, vb));
      i += 8;
    }
    let mut dot = hsum256(dot_acc);
    let mut norm_a = hsum256(a_acc);
    let mut norm_b = hsum256(b_acc);
    while i < dim {
      let x = *a.add(i);
      let y = *b.add(i);
      dot += x * y;
      norm_a += x * x;
      norm_b += y * y;
      i += 1;
    }
    let denom = (norm_a * norm_b).sqrt();
    if denom == 0.0 {
      return 1.0;
    }
    1.0_f32 - dot / denom
  }

  pub fn pick_l2_sq() -> Option<KernelFn> {
    if std::is_x86_feature_detected!("avx512f") {
      return Some(l2_sq_avx512);
    }
    if std::is_x86_feature_detected!("avx") {
      return Some(l2_sq_avx);
    }
    if std::is_x86_feature_detected!("sse") {
      return Some(l2_sq_sse);
    }
    None
  }

  pub fn pick_ip() -> Option<KernelFn> {
    if std::is_x86_feature_detected!("avx512f") {
      return Some(ip_avx512);
    }
    if std::is_x86_feature_detected!("avx") {
      return Some(ip_avx);
    }
    if std::is_x86_feature_detected!("sse") {
      return Some(ip_sse);
    }
    None
  }

  pub fn pick_cosine() -> Option<KernelFn> {
    if std::is_x86_feature_detected!("avx") {
      return Some(cosine_avx);
    }
    None
  }
}

/// Squared Euclidean distance. Monotone with the true L2 distance; no square
/// root is taken.
#[derive(Clone, Debug)]
pub struct L2Space {
  dim: usize,
  kernel: KernelFn,
}

impl L2Space {
  pub fn new(dim: usize) -> Self {
    let mut kernel: KernelFn = l2_sq_scalar;
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if let Some(f) = x86::pick_l2_sq() {
      kernel = f;
    }
    Self { dim, kernel }
  }
}

impl Space for L2Space {
  fn dim(&self) -> usize {
    self.dim
  }

  fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), self.dim);
    debug_assert_eq!(b.len(), self.dim);
    unsafe { (self.kernel)(a.as_ptr(), b.as_ptr(), self.dim) }
  }
}

/// Inner-product distance `1 - <a, b>`. Callers wanting cosine semantics on
/// this space must normalize their vectors first; see [`normalize_in_place`].
#[derive(Clone, Debug)]
pub struct InnerProductSpace {
  dim: usize,
  kernel: KernelFn,
}

impl InnerProductSpace {
  pub fn new(dim: usize) -> Self {
    let mut kernel: KernelFn = ip_scalar;
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if let Some(f) = x86::pick_ip() {
      kernel = f;
    }
    Self { dim, kernel }
  }
}

impl Space for InnerProductSpace {
  fn dim(&self) -> usize {
    self.dim
  }

  fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), self.dim);
    debug_assert_eq!(b.len(), self.dim);
    unsafe { (self.kernel)(a.as_ptr(), b.as_ptr(), self.dim) }
  }
}

/// Cosine distance `1 - <a, b> / (|a||b|)`. A zero-norm input yields 1.
#[derive(Clone, Debug)]
pub struct CosineSpace {
  dim: usize,
  kernel: KernelFn,
}

impl CosineSpace {
  pub fn new(dim: usize) -> Self {
    let mut kernel: KernelFn = cosine_scalar;
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if let Some(f) = x86::pick_cosine() {
      kernel = f;
    }
    Self { dim, kernel }
  }
}

impl Space for CosineSpace {
  fn dim(&self) -> usize {
    self.dim
  }

  fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), self.dim);
    debug_assert_eq!(b.len(), self.dim);
    unsafe { (self.kernel)(a.as_ptr(), b.as_ptr(), self.dim) }
  }
}

/// Scale `vector` to unit length. A zero vector is left untouched.
pub fn normalize_in_place(vector: &mut [f32]) {
  let norm_sq: f32 = vector.iter().map(|v| v * v).sum();
  if norm_sq == 0.0 {
    return;
  }
  let inv = norm_sq.sqrt().recip();
  for v in vector.iter_mut() {
    *v *= inv;
  }
}
