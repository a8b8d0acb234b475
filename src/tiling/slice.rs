// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::api::{InvalidConfig, SliceParams};
use crate::tiling::{Tile, TileGrid};

/// Position of a slice relative to one tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceClass {
  /// The slice lies entirely inside the tile.
  pub in_tile: bool,
  /// The slice ends on the bottom-right LCU of the tile.
  pub last_in_tile: bool,
}

/// Locate `slice` relative to `tile`.
///
/// Slices are coded in tile scan order, so the end of the slice is found by
/// walking `num_lcus - 1` LCUs inside the tile from its first LCU.
pub fn classify_slice(
  slice: &SliceParams, tile: &Tile, frame_width_lcu: usize,
) -> SliceClass {
  if slice.num_lcus == 0 || frame_width_lcu == 0 {
    return SliceClass::default();
  }

  let mut x = slice.address % frame_width_lcu;
  let mut y = slice.address / frame_width_lcu;
  if !tile.contains_lcu(x, y) {
    return SliceClass::default();
  }

  let remaining = slice.num_lcus - 1;
  x += remaining % tile.width_lcu;
  y += remaining / tile.width_lcu;
  if x >= tile.start_x_lcu + tile.width_lcu {
    x -= tile.width_lcu;
    y += 1;
  }
  if !tile.contains_lcu(x, y) {
    return SliceClass::default();
  }

  SliceClass {
    in_tile: true,
    last_in_tile: x + 1 == tile.start_x_lcu + tile.width_lcu
      && y + 1 == tile.start_y_lcu + tile.height_lcu,
  }
}

/// A slice scheduled on a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAssignment {
  /// Index into the frame's slice list.
  pub slice: usize,
  pub last_in_tile: bool,
}

/// Slices of every tile, in coding order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceMap {
  per_tile: Vec<Vec<SliceAssignment>>,
}

impl SliceMap {
  pub fn tile_slices(&self, tile: usize) -> &[SliceAssignment] {
    self.per_tile.get(tile).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn slice_count(&self) -> usize {
    self.per_tile.iter().map(Vec::len).sum()
  }

  /// Slice indices in the order the engines code them.
  pub fn coding_order(&self) -> impl Iterator<Item = usize> + '_ {
    self.per_tile.iter().flatten().map(|a| a.slice)
  }
}

/// One slice per tile, covering it completely.
pub fn slices_per_tile(grid: &TileGrid) -> Vec<SliceParams> {
  let width = grid.geometry().width_in_lcus();
  grid
    .tiles()
    .iter()
    .map(|t| SliceParams::new(t.first_lcu_address(width), t.lcus()))
    .collect()
}

/// Check the slice layout against the tile grid and assign every slice to
/// its tile.
///
/// # Errors
///
/// Every tile needs at least one slice and its slices must cover it.
/// A frame with more than one tile allows a single slice per tile, and no
/// slice may cross a tile boundary.
pub fn assign_slices(
  grid: &TileGrid, slices: &[SliceParams],
) -> Result<SliceMap, InvalidConfig> {
  let geometry = grid.geometry();
  let width = geometry.width_in_lcus();
  let mut per_tile = vec![Vec::new(); grid.tile_count()];
  let mut covered = vec![0usize; grid.tile_count()];

  for (idx, slice) in slices.iter().enumerate() {
    if slice.num_lcus == 0 || slice.address >= geometry.lcus() {
      return Err(InvalidConfig::InvalidSlice(idx));
    }
    let x = slice.address % width;
    let y = slice.address / width;
    let tile =
      grid.tile_at_lcu(x, y).ok_or(InvalidConfig::InvalidSlice(idx))?;
    let class = classify_slice(slice, tile, width);
    if !class.in_tile {
      return Err(InvalidConfig::SliceCrossesTiles(idx));
    }
    per_tile[tile.index]
      .push(SliceAssignment { slice: idx, last_in_tile: class.last_in_tile });
    covered[tile.index] += slice.num_lcus;
  }

  for tile in grid.tiles() {
    let assigned = &per_tile[tile.index];
    if assigned.is_empty() {
      return Err(InvalidConfig::TileWithoutSlice(tile.index));
    }
    if grid.tile_count() > 1 && assigned.len() > 1 {
      return Err(InvalidConfig::MultipleSlicesPerTile(tile.index));
    }
    if covered[tile.index] != tile.lcus()
      || !assigned.last().map_or(false, |a| a.last_in_tile)
    {
      return Err(InvalidConfig::TileNotCovered(tile.index));
    }
  }

  Ok(SliceMap { per_tile })
}
