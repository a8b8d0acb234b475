// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Joining the tile fragments into one contiguous frame.
//!
//! Every engine writes its tiles at the tile's own offset in the shared
//! bitstream buffer. Stitching moves the fragments, in tile order, to the
//! start of the buffer. Either the firmware does it from a copy list during
//! PAK integration, or the host copies through a scratch buffer.

use log::debug;
use thiserror::Error;

use crate::api::{EncoderConfig, InvalidConfig};
use crate::hw::Capabilities;
use crate::stats::TileSizeRecord;
use crate::tiling::Tile;

/// Who joins the fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchStrategy {
  Firmware,
  Direct,
}

/// Pick the stitch strategy for a frame.
///
/// # Errors
///
/// Content protected output of several tiles needs the firmware; without it
/// this fails with [`InvalidConfig::HostStitchForbidden`].
pub fn select_strategy(
  caps: &Capabilities, config: &EncoderConfig, tiles: usize, pipes: usize,
  tile_replay: bool,
) -> Result<StitchStrategy, InvalidConfig> {
  let strategy = if caps.hw_stitch && config.hw_stitch && (pipes > 1 || tile_replay)
  {
    StitchStrategy::Firmware
  } else {
    StitchStrategy::Direct
  };
  if strategy == StitchStrategy::Direct && config.content_protection && tiles > 1
  {
    return Err(InvalidConfig::HostStitchForbidden);
  }
  Ok(strategy)
}

/// One fragment move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyCommand {
  pub tile: usize,
  pub src: usize,
  pub dst: usize,
  pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StitchError {
  #[error("fragment of tile {tile} lies outside the bitstream buffer")]
  OutOfBounds { tile: usize },
  #[error("stitched frame of {size} bytes exceeds {upper_bound} bytes")]
  TooLarge { size: usize, upper_bound: usize },
  #[error("tile {tile} coded {length} bytes into a {budget} byte budget")]
  Overflow { tile: usize, length: usize, budget: usize },
}

/// Moves placing every tile right after the previous one.
///
/// # Errors
///
/// Fails with [`StitchError::Overflow`] when a fragment is longer than the
/// budget of its tile: the engine stopped writing at the budget, so the
/// fragment is truncated and the frame cannot be stitched.
pub fn build_copy_list(
  tiles: &[Tile], records: &[TileSizeRecord],
) -> Result<Vec<CopyCommand>, StitchError> {
  let mut dst = 0;
  tiles
    .iter()
    .zip(records)
    .map(|(tile, record)| {
      let len = record.length as usize;
      let budget = tile.offsets.bitstream_budget;
      if len > budget {
        return Err(StitchError::Overflow {
          tile: tile.index,
          length: len,
          budget,
        });
      }
      let cmd = CopyCommand {
        tile: tile.index,
        src: tile.bitstream_byte_offset(),
        dst,
        len,
      };
      dst += len;
      Ok(cmd)
    })
    .collect()
}

/// Bytes the engines coded for the frame, stitched or not.
pub fn coded_size(records: &[TileSizeRecord]) -> usize {
  records.iter().map(|r| r.length as usize).sum()
}

/// Size of the stitched frame.
pub fn stitched_size(commands: &[CopyCommand]) -> usize {
  commands.iter().map(|c| c.len).sum()
}

fn check(
  commands: &[CopyCommand], buffer: usize, upper_bound: usize,
) -> Result<usize, StitchError> {
  for c in commands {
    if c.src + c.len > buffer || c.dst + c.len > buffer {
      return Err(StitchError::OutOfBounds { tile: c.tile });
    }
  }
  let size = stitched_size(commands);
  if size > upper_bound {
    return Err(StitchError::TooLarge { size, upper_bound });
  }
  Ok(size)
}

/// Move the fragments within the buffer, the way the firmware does.
///
/// Destinations never pass their sources, so the moves can run in tile
/// order.
///
/// # Errors
///
/// Fails when a fragment lies outside the buffer or the frame exceeds
/// `upper_bound`.
pub fn apply_copy_list(
  bitstream: &mut [u8], commands: &[CopyCommand], upper_bound: usize,
) -> Result<usize, StitchError> {
  let size = check(commands, bitstream.len(), upper_bound)?;
  for c in commands.iter().filter(|c| c.src != c.dst) {
    bitstream.copy_within(c.src..c.src + c.len, c.dst);
  }
  let end = upper_bound.min(bitstream.len());
  bitstream[size.min(end)..end].fill(0);
  Ok(size)
}

/// Host stitch: gather the fragments in `scratch`, copy them back to the
/// start of the bitstream and zero the rest up to `upper_bound`.
///
/// # Errors
///
/// See [`apply_copy_list`].
pub fn stitch_direct(
  bitstream: &mut [u8], scratch: &mut [u8], commands: &[CopyCommand],
  upper_bound: usize,
) -> Result<usize, StitchError> {
  let size = check(commands, bitstream.len().min(scratch.len()), upper_bound)?;
  for c in commands {
    scratch[c.dst..c.dst + c.len]
      .copy_from_slice(&bitstream[c.src..c.src + c.len]);
  }
  bitstream[..size].copy_from_slice(&scratch[..size]);
  let end = upper_bound.min(bitstream.len());
  bitstream[size.min(end)..end].fill(0);
  debug!("stitched {} fragments into {} bytes", commands.len(), size);
  Ok(size)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::TileSpacing;
  use crate::hw::GenerationKind;
  use crate::tiling::{FrameGeometry, TileGrid};
  use pretty_assertions::assert_eq;

  fn grid(cols: usize) -> TileGrid {
    let geometry = FrameGeometry {
      width: 1280,
      height: 256,
      lcu_size_log2: 6,
      min_cb_size_log2: 3,
    };
    TileGrid::new(geometry, cols, 1, &TileSpacing::Uniform, 64 * 1024).unwrap()
  }

  fn fill(bitstream: &mut [u8], tiles: &[Tile], lengths: &[u32]) {
    for (tile, &len) in tiles.iter().zip(lengths) {
      let at = tile.bitstream_byte_offset();
      for (i, b) in bitstream[at..at + len as usize].iter_mut().enumerate() {
        *b = (tile.index as u8 + 1).wrapping_mul(31).wrapping_add(i as u8);
      }
    }
  }

  #[test]
  fn length_is_sum_of_fragments() {
    let grid = grid(4);
    let lengths = [100u32, 7, 2500, 64];
    let records: Vec<_> = lengths
      .iter()
      .map(|&length| TileSizeRecord { length, slice_count: 1 })
      .collect();
    let mut bitstream = vec![0xAA; 64 * 1024];
    fill(&mut bitstream, grid.tiles(), &lengths);
    let original = bitstream.clone();

    let commands = build_copy_list(grid.tiles(), &records).unwrap();
    assert_eq!(commands[1].dst, 100);
    assert_eq!(commands[3].dst, 2607);

    let mut scratch = vec![0; bitstream.len()];
    let size =
      stitch_direct(&mut bitstream, &mut scratch, &commands, 64 * 1024).unwrap();
    assert_eq!(size, 2671);
    for c in &commands {
      assert_eq!(&bitstream[c.dst..c.dst + c.len], &original[c.src..c.src + c.len]);
    }
    assert!(bitstream[size..].iter().all(|&b| b == 0));

    // the firmware moves in place and must produce the same bytes
    let mut in_place = original;
    assert_eq!(apply_copy_list(&mut in_place, &commands, 64 * 1024), Ok(size));
    assert_eq!(in_place, bitstream);
  }

  #[test]
  fn restitching_is_identical() {
    let grid = grid(2);
    let records = [
      TileSizeRecord { length: 300, slice_count: 1 },
      TileSizeRecord { length: 200, slice_count: 1 },
    ];
    let mut bitstream = vec![0; 64 * 1024];
    fill(&mut bitstream, grid.tiles(), &[300, 200]);
    let commands = build_copy_list(grid.tiles(), &records).unwrap();
    apply_copy_list(&mut bitstream, &commands, 64 * 1024).unwrap();
    let once = bitstream.clone();

    let compacted: Vec<_> =
      commands.iter().map(|c| CopyCommand { src: c.dst, ..*c }).collect();
    let mut scratch = vec![0; bitstream.len()];
    stitch_direct(&mut bitstream, &mut scratch, &compacted, 64 * 1024).unwrap();
    assert_eq!(bitstream, once);
    apply_copy_list(&mut bitstream, &compacted, 64 * 1024).unwrap();
    assert_eq!(bitstream, once);
  }

  #[test]
  fn oversized_frames_are_rejected() {
    let grid = grid(2);
    let records = [
      TileSizeRecord { length: 300, slice_count: 1 },
      TileSizeRecord { length: 200, slice_count: 1 },
    ];
    let commands = build_copy_list(grid.tiles(), &records).unwrap();
    let mut bitstream = vec![0; 64 * 1024];
    assert_eq!(
      apply_copy_list(&mut bitstream, &commands, 400),
      Err(StitchError::TooLarge { size: 500, upper_bound: 400 })
    );
  }

  #[test]
  fn overflowing_fragments_are_not_truncated() {
    let grid = grid(2);
    let budget = grid.tiles()[1].offsets.bitstream_budget;
    let records = [
      TileSizeRecord { length: 300, slice_count: 1 },
      TileSizeRecord { length: budget as u32 + 1, slice_count: 1 },
    ];
    assert_eq!(
      build_copy_list(grid.tiles(), &records),
      Err(StitchError::Overflow { tile: 1, length: budget + 1, budget })
    );
    assert_eq!(coded_size(&records), 300 + budget + 1);

    // exactly filling the budget is fine
    let records =
      [records[0], TileSizeRecord { length: budget as u32, slice_count: 1 }];
    let commands = build_copy_list(grid.tiles(), &records).unwrap();
    assert_eq!(stitched_size(&commands), coded_size(&records));
  }

  #[test]
  fn content_protection_needs_firmware() {
    let gen12 = GenerationKind::Gen12.capabilities();
    let mut config = EncoderConfig::with_size(1920, 1080).with_tiles(2, 1);
    config.content_protection = true;
    assert_eq!(
      select_strategy(&gen12, &config, 2, 2, false),
      Ok(StitchStrategy::Firmware)
    );
    // one pipe codes both tiles: nothing asks the firmware to stitch
    assert_eq!(
      select_strategy(&gen12, &config, 2, 1, false),
      Err(InvalidConfig::HostStitchForbidden)
    );
    config.hw_stitch = false;
    assert_eq!(
      select_strategy(&gen12, &config, 2, 2, false),
      Err(InvalidConfig::HostStitchForbidden)
    );
    config.content_protection = false;
    assert_eq!(
      select_strategy(&gen12, &config, 2, 2, false),
      Ok(StitchStrategy::Direct)
    );
    assert_eq!(
      select_strategy(&gen12, &config.with_tiles(1, 1), 1, 1, false),
      Ok(StitchStrategy::Direct)
    );
  }
}
