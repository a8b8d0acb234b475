// Copyright (c) 2020-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use thiserror::Error;

use crate::api::{FrameType, InvalidConfig};
use crate::hw::EngineError;
use crate::rate::FirmwareError;
use crate::resource::ResourceError;
use crate::serialize::{Deserialize, Serialize};
use crate::sync::SyncError;

use std::fmt;

/// Outcome of one frame as read back from the hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecStatus {
  /// Every tile completed and the bitstream was stitched.
  Successful,
  /// At least one tile reported no data. The frame must be discarded.
  Incomplete,
  /// The frame completed with an impossible size, or a tile overflowed its
  /// share of the bitstream buffer.
  Error,
}

impl fmt::Display for CodecStatus {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(match self {
      CodecStatus::Successful => "ok",
      CodecStatus::Incomplete => "incomplete",
      CodecStatus::Error => "error",
    })
  }
}

/// Where one tile's data was written by its engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileReport {
  /// Raster index of the tile.
  pub index: usize,
  /// Pipe which coded the tile.
  pub pipe: usize,
  /// Byte offset at which the engine wrote the fragment, before
  /// stitching. In the stitched frame the fragment follows the ones of the
  /// previous tiles; see [`StatusReport::stitched_offsets`].
  pub offset: usize,
  /// Fragment length in bytes.
  pub length: usize,
}

/// Per-frame report returned by the encoder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
  /// Encode order of the frame.
  pub frame_number: u64,
  /// Picture order count.
  pub poc: i32,
  /// Coding type.
  pub frame_type: FrameType,
  /// Completion status.
  pub status: CodecStatus,
  /// Size of the stitched frame in bytes. For a frame whose tile
  /// overflowed its budget this is what the engines coded, and the frame
  /// carries no data.
  pub bitstream_size: usize,
  /// Average QP over all coding units.
  pub average_qp: u8,
  /// Fragments as produced by the engines, before stitching.
  pub tiles: Vec<TileReport>,
  /// Size of every slice in bytes, when slice size reporting is enabled.
  pub slice_sizes: Option<Vec<u32>>,
  /// Frame passes executed.
  pub passes: usize,
  /// Passes executed for every tile row under tile-row replay.
  pub row_passes: Vec<usize>,
  /// The rate control missed its target on the final pass.
  pub panic: bool,
  /// Number of pipes that coded the frame.
  pub pipes: usize,
  /// The fragments were joined by the firmware.
  pub stitched_by_firmware: bool,
}

impl StatusReport {
  /// Whether the frame can be used.
  pub fn is_successful(&self) -> bool {
    self.status == CodecStatus::Successful
  }

  /// Offset of every tile fragment in the stitched frame.
  pub fn stitched_offsets(&self) -> Vec<usize> {
    self
      .tiles
      .iter()
      .scan(0, |at, tile| {
        let offset = *at;
        *at += tile.length;
        Some(offset)
      })
      .collect()
  }
}

/// A coded frame.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedFrame {
  /// Status report of the frame.
  pub report: StatusReport,
  /// The stitched bitstream. Empty unless the frame was successful.
  pub data: Vec<u8>,
}

/// Errors returned by the encoder.
///
/// Frames which run but fail in hardware are not errors; they are described
/// by the [`StatusReport`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EncoderError {
  /// The configuration or the frame parameters are invalid.
  #[error("invalid configuration: {0}")]
  Config(#[from] InvalidConfig),
  /// A buffer could not be provided.
  #[error(transparent)]
  Resource(#[from] ResourceError),
  /// An engine never reached a synchronization point.
  #[error(transparent)]
  Sync(#[from] SyncError),
  /// The firmware rejected a kernel invocation.
  #[error(transparent)]
  Firmware(#[from] FirmwareError),
  /// An engine rejected a command.
  #[error(transparent)]
  Engine(#[from] EngineError),
  /// The engine worker pool could not be created.
  #[error("cannot start engine workers: {0}")]
  WorkerPool(#[from] rayon::ThreadPoolBuildError),
  /// A pipe finished without reporting a result.
  #[error("pipe {0} did not report a result")]
  PipeLost(usize),
}
