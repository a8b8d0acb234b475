// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::api::{CodecStatus, FrameParams, StatusReport, TileReport};
use crate::stats::TileSizeRecord;
use crate::tiling::TileGrid;

/// Fragments of every tile as the engines left them: offsets are the
/// positions in the bitstream buffer before stitching.
pub fn fragments(
  grid: &TileGrid, records: &[TileSizeRecord], pipes: usize,
) -> Vec<TileReport> {
  grid
    .tiles()
    .iter()
    .zip(records)
    .map(|(tile, record)| TileReport {
      index: tile.index,
      pipe: if pipes > 1 { tile.col } else { 0 },
      offset: tile.bitstream_byte_offset(),
      length: record.length as usize,
    })
    .collect()
}

/// Status of a frame that stitched to `size` bytes. A tile that
/// `overflow`ed its budget was truncated by its engine.
pub fn frame_status(
  incomplete: bool, overflow: bool, size: usize, upper_bound: usize,
) -> CodecStatus {
  if incomplete {
    CodecStatus::Incomplete
  } else if overflow || size == 0 || size > upper_bound {
    CodecStatus::Error
  } else {
    CodecStatus::Successful
  }
}

impl StatusReport {
  /// Report of a frame that has not been coded yet.
  pub(crate) fn pending(
    frame_number: u64, frame: &FrameParams, pipes: usize,
  ) -> Self {
    StatusReport {
      frame_number,
      poc: frame.poc,
      frame_type: frame.frame_type,
      status: CodecStatus::Incomplete,
      bitstream_size: 0,
      average_qp: 0,
      tiles: Vec::new(),
      slice_sizes: None,
      passes: 0,
      row_passes: Vec::new(),
      panic: false,
      pipes,
      stitched_by_firmware: false,
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::{FrameType, TileSpacing};
  use crate::tiling::FrameGeometry;
  use pretty_assertions::assert_eq;

  #[test]
  fn fragments_follow_the_grid() {
    let geometry = FrameGeometry {
      width: 1024,
      height: 512,
      lcu_size_log2: 6,
      min_cb_size_log2: 3,
    };
    let grid =
      TileGrid::new(geometry, 2, 2, &TileSpacing::Uniform, 1 << 20).unwrap();
    let records: Vec<_> = (1..=4)
      .map(|i| TileSizeRecord { length: i * 100, slice_count: 1 })
      .collect();

    let tiles = fragments(&grid, &records, 2);
    assert_eq!(tiles.iter().map(|t| t.pipe).collect::<Vec<_>>(), [0, 1, 0, 1]);
    assert_eq!(tiles[3].length, 400);
    assert_eq!(tiles[2].offset, grid.tiles()[2].bitstream_byte_offset());
    assert!(fragments(&grid, &records, 1).iter().all(|t| t.pipe == 0));

    let frame = FrameParams::new(0, FrameType::I);
    let mut report = StatusReport::pending(0, &frame, 2);
    report.tiles = tiles;
    assert_eq!(report.stitched_offsets(), [0, 100, 300, 600]);
    assert_ne!(report.tiles[1].offset, 100);
  }

  #[test]
  fn status_from_size() {
    assert_eq!(frame_status(false, false, 100, 100), CodecStatus::Successful);
    assert_eq!(frame_status(false, false, 0, 100), CodecStatus::Error);
    assert_eq!(frame_status(false, false, 101, 100), CodecStatus::Error);
    assert_eq!(frame_status(false, true, 50, 100), CodecStatus::Error);
    assert_eq!(frame_status(true, false, 50, 100), CodecStatus::Incomplete);
  }

  #[test]
  fn pending_report() {
    let frame = FrameParams::new(7, FrameType::B);
    let report = StatusReport::pending(3, &frame, 2);
    assert_eq!(report.poc, 7);
    assert_eq!(report.pipes, 2);
    assert!(!report.is_successful());
  }
}
