// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Luma histograms feeding the weighted prediction kernel.

use arrayvec::ArrayVec;
use parking_lot::Mutex;

use crate::api::MAX_REF_LIST_SIZE;
use crate::stats::UNUSED_OFFSET;

pub const WEIGHT_SLOTS: usize = 6;
pub const HISTOGRAM_BINS: usize = 256;
/// One `u32` counter per bin.
pub const HISTOGRAM_SIZE: usize = HISTOGRAM_BINS * 4;
pub const LUMA_LOG2_WEIGHT_DENOM: u32 = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeightSlot {
  pub poc: Option<i32>,
  pub is_ref: bool,
  /// Frames assigned since this one.
  pub age: u32,
}

/// Explicit weight for one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightEntry {
  pub poc: i32,
  pub weight: i16,
  pub offset: i8,
}

/// Ring of histogram slots keyed by POC.
#[derive(Debug)]
pub struct WeightSlotRing {
  slots: Mutex<[WeightSlot; WEIGHT_SLOTS]>,
  histograms: Mutex<Vec<u8>>,
}

impl Default for WeightSlotRing {
  fn default() -> Self {
    Self::new()
  }
}

impl WeightSlotRing {
  pub fn new() -> Self {
    WeightSlotRing {
      slots: Mutex::new([WeightSlot::default(); WEIGHT_SLOTS]),
      histograms: Mutex::new(vec![0; WEIGHT_SLOTS * HISTOGRAM_SIZE]),
    }
  }

  pub fn slots(&self) -> [WeightSlot; WEIGHT_SLOTS] {
    *self.slots.lock()
  }

  /// Take a slot for frame `poc`.
  ///
  /// Reference slots age by one. The first free or non-reference slot is
  /// taken, otherwise the oldest reference.
  pub fn assign(&self, poc: i32, used_as_ref: bool) -> usize {
    let mut slots = self.slots.lock();
    for slot in slots.iter_mut() {
      if slot.poc.is_some() && slot.is_ref {
        slot.age += 1;
      }
    }

    let idx = slots
      .iter()
      .position(|s| s.poc.is_none() || !s.is_ref)
      .unwrap_or_else(|| {
        // every slot holds a reference here
        slots
          .iter()
          .enumerate()
          .max_by_key(|&(i, s)| (s.age, std::cmp::Reverse(i)))
          .map_or(0, |(i, _)| i)
      });
    slots[idx] = WeightSlot { poc: Some(poc), is_ref: used_as_ref, age: 0 };
    drop(slots);

    let mut histograms = self.histograms.lock();
    histograms[idx * HISTOGRAM_SIZE..(idx + 1) * HISTOGRAM_SIZE].fill(0);
    idx
  }

  pub fn find(&self, poc: i32) -> Option<usize> {
    self.slots.lock().iter().position(|s| s.poc == Some(poc))
  }

  pub fn offset(slot: usize) -> u32 {
    (slot * HISTOGRAM_SIZE) as u32
  }

  /// Histogram offsets of `refs`; references without a slot get
  /// [`UNUSED_OFFSET`].
  pub fn reference_offsets(
    &self, refs: impl Iterator<Item = i32>,
  ) -> ArrayVec<u32, MAX_REF_LIST_SIZE> {
    refs
      .take(MAX_REF_LIST_SIZE)
      .map(|poc| self.find(poc).map_or(UNUSED_OFFSET, Self::offset))
      .collect()
  }

  /// Add counts to the histogram of `slot`.
  pub fn accumulate(&self, slot: usize, bins: &[u32; HISTOGRAM_BINS]) {
    let mut histograms = self.histograms.lock();
    let base = slot * HISTOGRAM_SIZE;
    for (i, &count) in bins.iter().enumerate() {
      let at = base + i * 4;
      let mut bytes = [0u8; 4];
      bytes.copy_from_slice(&histograms[at..at + 4]);
      let sum = u32::from_le_bytes(bytes).saturating_add(count);
      histograms[at..at + 4].copy_from_slice(&sum.to_le_bytes());
    }
  }

  /// Copy of the whole ring memory.
  pub fn snapshot(&self) -> Vec<u8> {
    self.histograms.lock().clone()
  }
}

/// Read the histogram at `offset` of a ring snapshot.
pub fn histogram_at(memory: &[u8], offset: u32) -> Option<[u32; HISTOGRAM_BINS]> {
  let base = offset as usize;
  let region = memory.get(base..base + HISTOGRAM_SIZE)?;
  let mut bins = [0u32; HISTOGRAM_BINS];
  for (bin, chunk) in bins.iter_mut().zip(region.chunks_exact(4)) {
    *bin = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
  }
  Some(bins)
}

fn mean(bins: &[u32; HISTOGRAM_BINS]) -> Option<f64> {
  let total: u64 = bins.iter().map(|&c| u64::from(c)).sum();
  if total == 0 {
    return None;
  }
  let weighted: u64 =
    bins.iter().enumerate().map(|(v, &c)| v as u64 * u64::from(c)).sum();
  Some(weighted as f64 / total as f64)
}

/// Luma weight that maps the reference brightness onto the current frame.
pub fn luma_weight(
  poc: i32, current: &[u32; HISTOGRAM_BINS], reference: &[u32; HISTOGRAM_BINS],
) -> Option<WeightEntry> {
  let cur = mean(current)?;
  let refm = mean(reference)?;
  if refm <= 0. {
    return None;
  }
  let unit = f64::from(1u32 << LUMA_LOG2_WEIGHT_DENOM);
  let weight = (unit * cur / refm).round().clamp(-128., 127.) as i16;
  Some(WeightEntry { poc, weight, offset: 0 })
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn fills_free_slots_first() {
    let ring = WeightSlotRing::new();
    for poc in 0..WEIGHT_SLOTS as i32 {
      assert_eq!(ring.assign(poc, true), poc as usize);
    }
    let slots = ring.slots();
    assert_eq!(slots[0].age, 5);
    assert_eq!(slots[5].age, 0);
  }

  #[test]
  fn reuses_non_reference_before_oldest() {
    let ring = WeightSlotRing::new();
    // poc 3 is a non-reference B frame, poc 4 takes its slot
    let taken: Vec<_> =
      (0..WEIGHT_SLOTS as i32).map(|poc| ring.assign(poc, poc != 3)).collect();
    assert_eq!(taken, [0, 1, 2, 3, 3, 4]);
    assert_eq!(ring.find(3), None);
    assert_eq!(ring.find(4), Some(3));
    assert_eq!(ring.assign(6, true), 5);
    // now every slot holds a reference: the oldest one goes
    assert_eq!(ring.assign(7, true), 0);
    assert_eq!(ring.find(0), None);
    assert_eq!(ring.find(7), Some(0));
  }

  #[test]
  fn reference_offsets_by_poc() {
    let ring = WeightSlotRing::new();
    ring.assign(10, true);
    ring.assign(11, true);
    let offsets = ring.reference_offsets([11, 10, 4].into_iter());
    assert_eq!(
      offsets.as_slice(),
      &[HISTOGRAM_SIZE as u32, 0, UNUSED_OFFSET]
    );
  }

  #[test]
  fn weights_from_histograms() {
    let ring = WeightSlotRing::new();
    let dark = ring.assign(0, true);
    let bright = ring.assign(1, true);
    let mut bins = [0u32; HISTOGRAM_BINS];
    bins[50] = 100;
    ring.accumulate(dark, &bins);
    bins[50] = 0;
    bins[100] = 100;
    ring.accumulate(bright, &bins);

    let memory = ring.snapshot();
    let cur = histogram_at(&memory, WeightSlotRing::offset(bright)).unwrap();
    let refh = histogram_at(&memory, WeightSlotRing::offset(dark)).unwrap();
    let entry = luma_weight(0, &cur, &refh).unwrap();
    assert_eq!(entry.weight, 127);
    let entry = luma_weight(1, &refh, &cur).unwrap();
    assert_eq!(entry.weight, 32);
    assert!(histogram_at(&memory, UNUSED_OFFSET).is_none());
  }
}
