// Copyright (c) 2020-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use itertools::Itertools;

use crate::serialize::{Deserialize, Serialize};
use crate::tiling::FrameGeometry;

use std::fmt;

/// Largest supported LCU size (64x64).
pub const MAX_LCU_SIZE_LOG2: usize = 6;
/// Smallest supported LCU size (16x16).
pub const MIN_LCU_SIZE_LOG2: usize = 4;
/// Smallest minimum coding block (8x8).
pub const MIN_CB_SIZE_LOG2: usize = 3;

/// How the tile grid divides the frame.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TileSpacing {
  /// Columns and rows of (nearly) equal size in LCUs.
  #[default]
  Uniform,
  /// Column widths and row heights in LCUs.
  ///
  /// The sizes must add up to the frame size in LCUs.
  Explicit {
    /// Width of every tile column.
    column_widths: Vec<usize>,
    /// Height of every tile row.
    row_heights: Vec<usize>,
  },
}

/// Encoder settings which impact the frame layout and engine features.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct EncoderConfig {
  // output size
  /// Width of the frames in pixels.
  pub width: usize,
  /// Height of the frames in pixels.
  pub height: usize,
  /// log2 of the largest coding unit size.
  pub lcu_size_log2: usize,
  /// log2 of the minimum coding block size.
  pub min_cb_size_log2: usize,

  // tiling
  /// Number of tile columns.
  pub tile_cols: usize,
  /// Number of tile rows.
  pub tile_rows: usize,
  /// Column and row spacing.
  pub tile_spacing: TileSpacing,

  /// Size of the shared bitstream buffer in bytes. Also the upper bound of
  /// one encoded frame. 0 selects the size of an uncompressed 4:2:0 frame.
  pub bitstream_size: usize,

  // engine features
  /// Report the size of every slice in the status report.
  pub slice_size_report: bool,
  /// Engines stream their output directly to memory; requires one pipe per
  /// tile column.
  pub streaming_buffer: bool,
  /// Output is content protected and must not be touched by the host.
  pub content_protection: bool,
  /// Let the firmware stitch the tile fragments when the hardware allows.
  pub hw_stitch: bool,
  /// Replay tile rows under rate control when the hardware allows.
  pub tile_replay: bool,
  /// Weighted prediction statistics for the rate control.
  pub weighted_prediction: bool,
}

impl Default for EncoderConfig {
  fn default() -> Self {
    const DEFAULT_WIDTH: usize = 1920;
    const DEFAULT_HEIGHT: usize = 1080;
    EncoderConfig::with_size(DEFAULT_WIDTH, DEFAULT_HEIGHT)
  }
}

impl EncoderConfig {
  /// This is a preset which provides a single tile frame of the given size
  /// with the default engine features.
  pub fn with_size(width: usize, height: usize) -> Self {
    EncoderConfig {
      width,
      height,
      lcu_size_log2: MAX_LCU_SIZE_LOG2,
      min_cb_size_log2: MIN_CB_SIZE_LOG2,
      tile_cols: 1,
      tile_rows: 1,
      tile_spacing: TileSpacing::Uniform,
      bitstream_size: 0,
      slice_size_report: false,
      streaming_buffer: false,
      content_protection: false,
      hw_stitch: true,
      tile_replay: false,
      weighted_prediction: false,
    }
  }

  /// Uniform tile grid of `cols` x `rows`.
  pub fn with_tiles(mut self, cols: usize, rows: usize) -> Self {
    self.tile_cols = cols;
    self.tile_rows = rows;
    self.tile_spacing = TileSpacing::Uniform;
    self
  }

  /// Explicit tile grid, sizes in LCUs.
  pub fn with_explicit_tiles(
    mut self, column_widths: Vec<usize>, row_heights: Vec<usize>,
  ) -> Self {
    self.tile_cols = column_widths.len();
    self.tile_rows = row_heights.len();
    self.tile_spacing = TileSpacing::Explicit { column_widths, row_heights };
    self
  }

  /// Frame dimensions in the units the partitioner works with.
  pub const fn geometry(&self) -> FrameGeometry {
    FrameGeometry {
      width: self.width,
      height: self.height,
      lcu_size_log2: self.lcu_size_log2,
      min_cb_size_log2: self.min_cb_size_log2,
    }
  }

  /// Size of the shared bitstream buffer after applying the default.
  pub const fn bitstream_upper_bound(&self) -> usize {
    if self.bitstream_size != 0 {
      self.bitstream_size
    } else {
      self.width * self.height * 3 / 2
    }
  }

  /// Number of tiles in the grid.
  pub const fn tile_count(&self) -> usize {
    self.tile_cols * self.tile_rows
  }
}

impl fmt::Display for EncoderConfig {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let pairs = [
      ("size", format!("{}x{}", self.width, self.height)),
      ("lcu", format!("{}", 1 << self.lcu_size_log2)),
      ("tiles", format!("{}x{}", self.tile_cols, self.tile_rows)),
      ("bitstream_size", self.bitstream_upper_bound().to_string()),
      ("slice_size_report", self.slice_size_report.to_string()),
      ("streaming_buffer", self.streaming_buffer.to_string()),
      ("content_protection", self.content_protection.to_string()),
      ("hw_stitch", self.hw_stitch.to_string()),
      ("tile_replay", self.tile_replay.to_string()),
      ("weighted_prediction", self.weighted_prediction.to_string()),
    ];
    write!(
      f,
      "{}",
      pairs.iter().map(|pair| format!("{}={}", pair.0, pair.1)).join(" ")
    )
  }
}
