// Copyright (c) 2018-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use arg_enum_proc_macro::ArgEnum;
use arrayvec::ArrayVec;
use num_derive::FromPrimitive;

use crate::serialize::{Deserialize, Serialize};

/// Maximum number of entries in one reference list.
pub const MAX_REF_LIST_SIZE: usize = 15;

/// Coding type of a frame.
#[derive(
  ArgEnum,
  Copy,
  Clone,
  Debug,
  PartialEq,
  Eq,
  Hash,
  FromPrimitive,
  Serialize,
  Deserialize,
)]
#[repr(C)]
pub enum FrameType {
  /// Intra only.
  I,
  /// Forward predicted.
  P,
  /// Bidirectionally predicted.
  B,
}

/// A slice segment of the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceParams {
  /// Raster address of the first LCU of the slice in the frame.
  pub address: usize,
  /// Number of LCUs coded in the slice, in tile scan order.
  pub num_lcus: usize,
}

impl SliceParams {
  /// Slice starting at LCU `address` and spanning `num_lcus` LCUs.
  pub const fn new(address: usize, num_lcus: usize) -> Self {
    SliceParams { address, num_lcus }
  }
}

/// Per-frame parameters supplied by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameParams {
  /// Picture order count.
  pub poc: i32,
  /// Coding type.
  pub frame_type: FrameType,
  /// POCs of the forward references.
  pub ref_list0: ArrayVec<i32, MAX_REF_LIST_SIZE>,
  /// POCs of the backward references.
  pub ref_list1: ArrayVec<i32, MAX_REF_LIST_SIZE>,
  /// Other frames predict from this one.
  pub used_as_ref: bool,
  /// Slice segments. When empty the encoder codes one slice per tile.
  pub slices: Vec<SliceParams>,
  /// Insert an end of sequence after the frame.
  pub end_of_sequence: bool,
  /// Insert an end of stream after the frame.
  pub end_of_stream: bool,
  /// Ask the rate control to reset its state before this frame.
  pub brc_reset: bool,
  /// Overrides the frame size target of the rate control, in bytes.
  pub target_size: Option<u32>,
}

impl FrameParams {
  /// Frame with default flags and one slice per tile.
  pub fn new(poc: i32, frame_type: FrameType) -> Self {
    FrameParams {
      poc,
      frame_type,
      ref_list0: ArrayVec::new(),
      ref_list1: ArrayVec::new(),
      used_as_ref: frame_type != FrameType::B,
      slices: Vec::new(),
      end_of_sequence: false,
      end_of_stream: false,
      brc_reset: false,
      target_size: None,
    }
  }

  /// Set the reference lists. Entries past the list capacity are dropped.
  pub fn with_references(mut self, list0: &[i32], list1: &[i32]) -> Self {
    self.ref_list0 = list0.iter().copied().take(MAX_REF_LIST_SIZE).collect();
    self.ref_list1 = list1.iter().copied().take(MAX_REF_LIST_SIZE).collect();
    self
  }

  /// Set the slice segments.
  pub fn with_slices(mut self, slices: Vec<SliceParams>) -> Self {
    self.slices = slices;
    self
  }

  /// Whether other frames predict from this one.
  pub fn with_used_as_ref(mut self, used_as_ref: bool) -> Self {
    self.used_as_ref = used_as_ref;
    self
  }

  /// Mark the frame as the last one of the stream.
  pub fn with_end_of_stream(mut self) -> Self {
    self.end_of_sequence = true;
    self.end_of_stream = true;
    self
  }

  /// Reset the rate control state before this frame.
  pub fn with_brc_reset(mut self) -> Self {
    self.brc_reset = true;
    self
  }

  /// Frame size target in bytes.
  pub fn with_target_size(mut self, bytes: u32) -> Self {
    self.target_size = Some(bytes);
    self
  }

  /// All POCs this frame predicts from.
  pub fn references(&self) -> impl Iterator<Item = i32> + '_ {
    self.ref_list0.iter().chain(self.ref_list1.iter()).copied()
  }
}
