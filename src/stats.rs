// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Per-tile statistics and their aggregation into frame statistics.

use std::ops::{AddAssign, Range};

use log::{debug, warn};

use crate::hw::MAX_ENGINES;
use crate::rate::dmem::Dmem;
use crate::rate::{
  invoke, Firmware, FirmwareError, HucMemory, Kernel, Region, RegionKind,
  RegionList,
};
use crate::resource::FrameBuffers;
use crate::stitch::{build_copy_list, stitched_size};
use crate::tiling::{SliceMap, TileGrid};
use crate::util::align_page;

pub const TILE_SIZE_RECORD_SIZE: usize = 64;
/// 8 cache lines.
pub const PAK_STATISTICS_SIZE: usize = 512;
pub const VDENC_STATISTICS_SIZE: usize = 1216;
/// Per LCU.
pub const SLICE_STREAMOUT_SIZE: usize = 64;
/// Marks an unused offset in a firmware parameter block.
pub const UNUSED_OFFSET: u32 = 0xFFFF_FFFF;

/// Size record an engine writes when it finishes a tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileSizeRecord {
  /// Bytes of the tile fragment; 0 means the tile never completed.
  pub length: u32,
  pub slice_count: u32,
}

impl TileSizeRecord {
  pub fn is_complete(&self) -> bool {
    self.length != 0
  }
}

/// PAK statistics of one tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileStatistics {
  pub bytes: u64,
  /// Sum of the QP of every minimum coding block, in quarter steps.
  pub qp_sum: u64,
  pub cu_count: u64,
  pub intra_cus: u64,
  pub skip_cus: u64,
  pub sad: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStatistics {
  pub bytes: u64,
  pub qp_sum: u64,
  pub cu_count: u64,
  pub intra_cus: u64,
  pub skip_cus: u64,
  pub sad: u64,
  pub tiles: usize,
  pub slices: usize,
}

impl AddAssign<&TileStatistics> for FrameStatistics {
  fn add_assign(&mut self, rhs: &TileStatistics) {
    self.bytes += rhs.bytes;
    self.qp_sum += rhs.qp_sum;
    self.cu_count += rhs.cu_count;
    self.intra_cus += rhs.intra_cus;
    self.skip_cus += rhs.skip_cus;
    self.sad += rhs.sad;
    self.tiles += 1;
  }
}

impl FrameStatistics {
  /// `(qp_sum / cu_count) / 4`, 0 for an empty frame.
  pub fn average_qp(&self) -> u8 {
    if self.cu_count == 0 {
      return 0;
    }
    ((self.qp_sum / self.cu_count) / 4).min(u64::from(u8::MAX)) as u8
  }
}

/// Byte offsets of the sub-regions of one statistics region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsOffsets {
  pub pak: usize,
  pub vdenc: usize,
  pub slice: usize,
  pub total: usize,
}

/// Layout of the frame-level and tile-level statistics regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsLayout {
  pub frame: StatsOffsets,
  pub tile: StatsOffsets,
  pub tile_record_size: usize,
}

impl StatsLayout {
  pub fn new(tiles: usize, lcus: usize) -> Self {
    let streamout = SLICE_STREAMOUT_SIZE * lcus;

    let vdenc = align_page(PAK_STATISTICS_SIZE);
    let slice = align_page(vdenc + VDENC_STATISTICS_SIZE);
    let frame =
      StatsOffsets { pak: 0, vdenc, slice, total: align_page(slice + streamout) };

    let vdenc = align_page(PAK_STATISTICS_SIZE * tiles);
    let slice = align_page(vdenc + VDENC_STATISTICS_SIZE * tiles);
    let tile =
      StatsOffsets { pak: 0, vdenc, slice, total: align_page(slice + streamout) };

    StatsLayout {
      frame,
      tile,
      tile_record_size: align_page(TILE_SIZE_RECORD_SIZE * tiles),
    }
  }
}

/// Parameters of the PAK-integrate kernel.
///
/// Entry 0 of the offset arrays describes the frame-level output, entry
/// `p + 1` the first tile of pipe `p`. The tiles of a pipe follow each other
/// `tile_stride` tiles apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PakIntegrateDmem {
  pub frame_number: u64,
  pub pass: usize,
  pub max_passes: usize,
  pub total_paks: usize,
  /// Tiles covered, by raster index.
  pub tiles: Range<usize>,
  pub tile_size_record_offset: [u32; MAX_ENGINES + 1],
  pub pak_stat_offset: [u32; MAX_ENGINES + 1],
  pub vdenc_stat_offset: [u32; MAX_ENGINES + 1],
  pub slice_streamout_offset: [u32; MAX_ENGINES + 1],
  pub num_tiles: [u16; MAX_ENGINES],
  pub tile_stride: [u16; MAX_ENGINES],
  /// Also run the stitch command list.
  pub stitch_enable: bool,
  pub bitstream_upper_bound: u32,
}

impl PakIntegrateDmem {
  pub fn new(
    layout: &StatsLayout, grid: &TileGrid, pipes: usize, rows: Range<usize>,
  ) -> Self {
    let cols = grid.cols();
    let mut dmem = PakIntegrateDmem {
      frame_number: 0,
      pass: 0,
      max_passes: 1,
      total_paks: pipes,
      tiles: rows.start * cols..rows.end * cols,
      tile_size_record_offset: [UNUSED_OFFSET; MAX_ENGINES + 1],
      pak_stat_offset: [UNUSED_OFFSET; MAX_ENGINES + 1],
      vdenc_stat_offset: [UNUSED_OFFSET; MAX_ENGINES + 1],
      slice_streamout_offset: [UNUSED_OFFSET; MAX_ENGINES + 1],
      num_tiles: [0; MAX_ENGINES],
      tile_stride: [0; MAX_ENGINES],
      stitch_enable: false,
      bitstream_upper_bound: 0,
    };

    dmem.tile_size_record_offset[0] = 0;
    dmem.pak_stat_offset[0] = layout.frame.pak as u32;
    dmem.vdenc_stat_offset[0] = layout.frame.vdenc as u32;
    dmem.slice_streamout_offset[0] = layout.frame.slice as u32;

    for pipe in 0..pipes.min(MAX_ENGINES) {
      // with several pipes every pipe owns one tile column
      let (first, count, stride) = if pipes > 1 {
        (rows.start * cols + pipe, rows.len(), cols)
      } else {
        (rows.start * cols, rows.len() * cols, 1)
      };
      let Some(tile) = grid.tile(first) else {
        continue;
      };
      let o = &tile.offsets;
      dmem.tile_size_record_offset[pipe + 1] =
        (o.tile_size_record * TILE_SIZE_RECORD_SIZE) as u32;
      dmem.pak_stat_offset[pipe + 1] = (layout.tile.pak + o.pak_statistics) as u32;
      dmem.vdenc_stat_offset[pipe + 1] =
        (layout.tile.vdenc + first * VDENC_STATISTICS_SIZE) as u32;
      dmem.slice_streamout_offset[pipe + 1] = (layout.tile.slice
        + o.slice_size_streamout * SLICE_STREAMOUT_SIZE)
        as u32;
      dmem.num_tiles[pipe] = count as u16;
      dmem.tile_stride[pipe] = stride as u16;
    }
    dmem
  }

  /// Raster indices of the tiles of `pipe`, decoded from the offsets.
  pub fn pipe_tiles(&self, pipe: usize) -> impl Iterator<Item = usize> {
    let base = self.pak_stat_offset.get(pipe + 1).copied().unwrap_or(UNUSED_OFFSET);
    let (count, stride) = match base {
      UNUSED_OFFSET => (0, 0),
      _ => (self.num_tiles[pipe] as usize, self.tile_stride[pipe] as usize),
    };
    let first = base as usize / PAK_STATISTICS_SIZE;
    (0..count).map(move |k| first + k * stride)
  }
}

/// Result of an aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
  /// `stitched` holds the frame size when the kernel also stitched it.
  Complete { stats: FrameStatistics, stitched: Option<usize> },
  /// The first tile without a size record.
  Incomplete { tile: usize },
}

/// First tile in `tiles` whose record is empty.
pub fn find_incomplete(
  records: &[TileSizeRecord], tiles: Range<usize>,
) -> Option<usize> {
  tiles.into_iter().find(|&t| records.get(t).map_or(true, |r| !r.is_complete()))
}

/// Host side sum of the tile statistics.
pub fn sum_tiles(
  records: &[TileSizeRecord], stats: &[TileStatistics], tiles: Range<usize>,
) -> FrameStatistics {
  let mut frame = FrameStatistics::default();
  for t in tiles {
    if let Some(s) = stats.get(t) {
      frame += s;
    }
    if let Some(r) = records.get(t) {
      frame.slices += r.slice_count as usize;
    }
  }
  frame
}

/// Turns the cumulative slice sizes written by the engines into the size of
/// every slice.
pub fn slice_sizes(map: &SliceMap, cumulative: &[u32], tiles: usize) -> Vec<u32> {
  let mut sizes = vec![0; cumulative.len()];
  for tile in 0..tiles {
    let mut prev = 0;
    for a in map.tile_slices(tile) {
      let end = cumulative.get(a.slice).copied().unwrap_or(prev);
      if let Some(size) = sizes.get_mut(a.slice) {
        *size = end.saturating_sub(prev);
      }
      prev = end;
    }
  }
  sizes
}

/// Frame pass an aggregation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassInfo {
  pub frame_number: u64,
  pub pass: usize,
  pub max_passes: usize,
}

/// Combines the statistics written by the pipes.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator<'a> {
  grid: &'a TileGrid,
  layout: StatsLayout,
  pipes: usize,
  upper_bound: usize,
}

impl<'a> Aggregator<'a> {
  pub fn new(grid: &'a TileGrid, pipes: usize, upper_bound: usize) -> Self {
    Aggregator {
      grid,
      layout: StatsLayout::new(grid.tile_count(), grid.geometry().lcus()),
      pipes,
      upper_bound,
    }
  }

  pub fn layout(&self) -> &StatsLayout {
    &self.layout
  }

  /// Whether the firmware has to combine the statistics.
  pub fn uses_firmware(&self, stitch: bool) -> bool {
    self.pipes > 1 || stitch
  }

  /// Aggregate the tile rows `rows`.
  ///
  /// When `stitch` is set the rows must cover the whole frame; the copy list
  /// is built and handed to the kernel along with the bitstream.
  ///
  /// # Errors
  ///
  /// Fails when the PAK-integrate kernel fails.
  pub fn aggregate(
    &self, firmware: &mut dyn Firmware, buffers: &FrameBuffers,
    rows: Range<usize>, pass: PassInfo, mut stitch: bool,
  ) -> Result<Aggregate, FirmwareError> {
    let cols = self.grid.cols();
    let tiles = rows.start * cols..rows.end * cols;
    let records = buffers.records.lock();
    if let Some(tile) = find_incomplete(&records, tiles.clone()) {
      warn!(
        "frame {} pass {}: tile {} has no size record",
        pass.frame_number, pass.pass, tile
      );
      return Ok(Aggregate::Incomplete { tile });
    }

    let tile_stats = buffers.tile_stats.lock();
    if !self.uses_firmware(stitch) {
      let stats = sum_tiles(&records, &tile_stats, tiles);
      return Ok(Aggregate::Complete { stats, stitched: None });
    }

    let mut dmem =
      PakIntegrateDmem::new(&self.layout, self.grid, self.pipes, rows);
    dmem.frame_number = pass.frame_number;
    dmem.pass = pass.pass;
    dmem.max_passes = pass.max_passes;

    let mut regions: RegionList = [
      Region::read(RegionKind::TileSizeRecords),
      Region::read(RegionKind::TileStatistics),
      Region::write(RegionKind::FrameStatistics),
    ]
    .into_iter()
    .collect();

    let mut frame = FrameStatistics::default();
    let mut commands = buffers.stitch_commands.lock();
    let mut bitstream = buffers.bitstream.lock();
    let mut memory = HucMemory {
      records: Some(records.as_slice()),
      tile_stats: Some(tile_stats.as_slice()),
      frame_stats: Some(&mut frame),
      ..Default::default()
    };
    let mut size = 0;
    if stitch {
      match build_copy_list(self.grid.tiles(), &records) {
        Ok(list) => {
          *commands = list;
          size = stitched_size(&commands);
        }
        Err(e) => {
          warn!("frame {} pass {}: {}", pass.frame_number, pass.pass, e);
          commands.clear();
        }
      }
      if size == 0 || size > self.upper_bound {
        warn!(
          "frame {} pass {}: {} byte frame cannot be stitched (bound {})",
          pass.frame_number, pass.pass, size, self.upper_bound
        );
        stitch = false;
      }
    }
    dmem.stitch_enable = stitch;
    if stitch {
      dmem.bitstream_upper_bound = self.upper_bound.min(bitstream.len()) as u32;
      regions.push(Region::read(RegionKind::StitchCommands));
      regions.push(Region::write(RegionKind::Bitstream));
      memory.stitch = Some(commands.as_slice());
      memory.bitstream = Some(bitstream.as_mut_slice());
    }

    debug!(
      "frame {} pass {}: integrating tiles {:?} from {} pipes",
      pass.frame_number, pass.pass, dmem.tiles, self.pipes
    );
    invoke(
      firmware,
      Kernel::PakIntegrate,
      regions,
      Dmem::PakIntegrate(dmem),
      &mut memory,
    )?;
    Ok(Aggregate::Complete { stats: frame, stitched: stitch.then_some(size) })
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::{SliceParams, TileSpacing};
  use crate::tiling::{assign_slices, FrameGeometry};
  use pretty_assertions::assert_eq;

  fn grid(cols: usize, rows: usize) -> TileGrid {
    let geometry = FrameGeometry {
      width: 1920,
      height: 1080,
      lcu_size_log2: 6,
      min_cb_size_log2: 3,
    };
    TileGrid::new(geometry, cols, rows, &TileSpacing::Uniform, 1 << 20)
      .unwrap()
  }

  #[test]
  fn layout_is_page_aligned() {
    let layout = StatsLayout::new(4, 510);
    assert_eq!(
      layout.frame,
      StatsOffsets { pak: 0, vdenc: 4096, slice: 8192, total: 8192 + 32768 }
    );
    assert_eq!(layout.tile.vdenc, 4096);
    assert_eq!(layout.tile.slice, 4096 + 8192);
    assert_eq!(layout.tile_record_size, 4096);
    for o in [layout.frame, layout.tile] {
      assert!(o.pak <= o.vdenc && o.vdenc <= o.slice && o.slice <= o.total);
      assert_eq!(o.total % 4096, 0);
    }
  }

  #[test]
  fn integrate_offsets_per_pipe() {
    let grid = grid(2, 2);
    let layout = StatsLayout::new(4, grid.geometry().lcus());
    let dmem = PakIntegrateDmem::new(&layout, &grid, 2, 0..2);
    assert_eq!(dmem.pak_stat_offset[0], 0);
    assert_eq!(dmem.pak_stat_offset[1], 0);
    assert_eq!(dmem.pak_stat_offset[2], 512);
    assert_eq!(dmem.pak_stat_offset[3], UNUSED_OFFSET);
    assert_eq!(dmem.tile_size_record_offset[2], 64);
    assert_eq!(dmem.num_tiles, [2, 2, 0, 0]);
    assert_eq!(dmem.pipe_tiles(0).collect::<Vec<_>>(), vec![0, 2]);
    assert_eq!(dmem.pipe_tiles(1).collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(dmem.pipe_tiles(2).count(), 0);

    // second tile row only
    let dmem = PakIntegrateDmem::new(&layout, &grid, 2, 1..2);
    assert_eq!(dmem.tiles, 2..4);
    assert_eq!(dmem.pipe_tiles(1).collect::<Vec<_>>(), vec![3]);
  }

  #[test]
  fn incomplete_record_is_found() {
    let mut records = vec![TileSizeRecord { length: 10, slice_count: 1 }; 4];
    assert_eq!(find_incomplete(&records, 0..4), None);
    records[2].length = 0;
    assert_eq!(find_incomplete(&records, 0..4), Some(2));
    assert_eq!(find_incomplete(&records, 0..2), None);
  }

  #[test]
  fn average_qp_in_quarter_steps() {
    let mut frame = FrameStatistics::default();
    frame += &TileStatistics { qp_sum: 4 * 30 * 100, cu_count: 100, ..Default::default() };
    frame += &TileStatistics { qp_sum: 4 * 34 * 100, cu_count: 100, ..Default::default() };
    assert_eq!(frame.average_qp(), 32);
    assert_eq!(frame.tiles, 2);
    assert_eq!(FrameStatistics::default().average_qp(), 0);
  }

  #[test]
  fn cumulative_slice_sizes() {
    let grid = grid(1, 1);
    let lcus = grid.geometry().lcus();
    let slices = [SliceParams::new(0, 300), SliceParams::new(300, lcus - 300)];
    let map = assign_slices(&grid, &slices).unwrap();
    assert_eq!(slice_sizes(&map, &[1000, 1500], 1), vec![1000, 500]);
  }
}
