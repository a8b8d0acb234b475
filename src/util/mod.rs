// Copyright (c) 2017-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

/// Size of a cache line as seen by the encode engines.
pub const CACHELINE_SIZE: usize = 64;
/// log2 of [`CACHELINE_SIZE`].
pub const CACHELINE_SIZE_LOG2: usize = 6;
/// Granularity of the statistics regions.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SIZE_LOG2: usize = 12;

pub trait Fixed {
  fn floor_log2(&self, n: usize) -> usize;
  fn ceil_log2(&self, n: usize) -> usize;
  fn align_power_of_two(&self, n: usize) -> usize;
  fn align_power_of_two_and_shift(&self, n: usize) -> usize;
}

impl Fixed for usize {
  #[inline]
  fn floor_log2(&self, n: usize) -> usize {
    self & !((1 << n) - 1)
  }
  #[inline]
  fn ceil_log2(&self, n: usize) -> usize {
    (self + (1 << n) - 1).floor_log2(n)
  }
  #[inline]
  fn align_power_of_two(&self, n: usize) -> usize {
    self.ceil_log2(n)
  }
  #[inline]
  fn align_power_of_two_and_shift(&self, n: usize) -> usize {
    (self + (1 << n) - 1) >> n
  }
}

/// Rounds `v` up to the next cache line boundary.
#[inline]
pub fn align_cacheline(v: usize) -> usize {
  v.align_power_of_two(CACHELINE_SIZE_LOG2)
}

/// Rounds `v` up to the next page boundary.
#[inline]
pub fn align_page(v: usize) -> usize {
  v.align_power_of_two(PAGE_SIZE_LOG2)
}

/// Integer division rounding towards positive infinity.
#[inline]
pub const fn div_ceil(n: usize, d: usize) -> usize {
  (n + d - 1) / d
}

pub fn clamp<T: PartialOrd>(input: T, min: T, max: T) -> T {
  if input < min {
    min
  } else if input > max {
    max
  } else {
    input
  }
}
