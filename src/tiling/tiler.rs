// Copyright (c) 2019-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::api::{InvalidConfig, Rational, TileSpacing};
use crate::stats::PAK_STATISTICS_SIZE;
use crate::util::*;

pub const MAX_TILE_COLS: usize = 20;
pub const MAX_TILE_ROWS: usize = 22;
/// Smallest tile the engines accept, in pixels.
pub const MIN_TILE_WIDTH: usize = 256;
pub const MIN_TILE_HEIGHT: usize = 128;
/// Bytes of one CU record written by the encode engine.
pub const CU_RECORD_SIZE: usize = 64;
/// Bytes of stream-in data per LCU.
pub const STREAM_IN_LCU_SIZE: usize = 64;

/// Frame dimensions and coding block sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
  pub width: usize,
  pub height: usize,
  pub lcu_size_log2: usize,
  pub min_cb_size_log2: usize,
}

impl FrameGeometry {
  pub fn width_in_lcus(&self) -> usize {
    self.width.align_power_of_two_and_shift(self.lcu_size_log2)
  }

  pub fn height_in_lcus(&self) -> usize {
    self.height.align_power_of_two_and_shift(self.lcu_size_log2)
  }

  pub fn lcus(&self) -> usize {
    self.width_in_lcus() * self.height_in_lcus()
  }

  pub fn width_in_min_cbs(&self) -> usize {
    self.width.align_power_of_two_and_shift(self.min_cb_size_log2)
  }

  pub fn height_in_min_cbs(&self) -> usize {
    self.height.align_power_of_two_and_shift(self.min_cb_size_log2)
  }

  /// Number of minimum coding blocks along one LCU edge, as a shift.
  pub const fn lcu_to_min_cb_shift(&self) -> usize {
    self.lcu_size_log2 - self.min_cb_size_log2
  }

  /// CU records written per LCU.
  pub const fn cu_records_per_lcu(&self) -> usize {
    1 << (2 * (self.lcu_size_log2 - 3))
  }

  /// Upper bound on the tile count given the minimum tile size.
  pub const fn max_tiles(&self) -> usize {
    div_ceil(self.width, MIN_TILE_WIDTH) * div_ceil(self.height, MIN_TILE_HEIGHT)
  }
}

/// Where a tile's data lives in the regions shared by all pipes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileOffsets {
  /// CU record offset, in cache lines.
  pub cu_record: usize,
  /// Bitstream offset, in cache lines.
  pub bitstream: usize,
  /// Bytes of bitstream buffer available to the tile.
  pub bitstream_budget: usize,
  /// Stream-in offset.
  pub stream_in: usize,
  /// Index of the tile-size record.
  pub tile_size_record: usize,
  /// Byte offset of the tile in the tile-level PAK statistics region.
  pub pak_statistics: usize,
  /// First LCU of the tile in tile scan order.
  pub slice_size_streamout: usize,
}

/// One rectangle of the frame, coded by exactly one pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
  /// `row * cols + col`
  pub index: usize,
  pub row: usize,
  pub col: usize,
  pub start_x_lcu: usize,
  pub start_y_lcu: usize,
  pub width_lcu: usize,
  pub height_lcu: usize,
  pub width_min_cb: usize,
  pub height_min_cb: usize,
  pub offsets: TileOffsets,
}

impl Tile {
  pub const fn lcus(&self) -> usize {
    self.width_lcu * self.height_lcu
  }

  pub const fn min_cbs(&self) -> usize {
    self.width_min_cb * self.height_min_cb
  }

  /// Whether LCU `(x, y)` of the frame lies in the tile.
  pub const fn contains_lcu(&self, x: usize, y: usize) -> bool {
    x >= self.start_x_lcu
      && x < self.start_x_lcu + self.width_lcu
      && y >= self.start_y_lcu
      && y < self.start_y_lcu + self.height_lcu
  }

  /// Raster address of the first LCU of the tile.
  pub const fn first_lcu_address(&self, frame_width_lcu: usize) -> usize {
    self.start_y_lcu * frame_width_lcu + self.start_x_lcu
  }

  /// Byte offset of the tile's bitstream fragment.
  pub const fn bitstream_byte_offset(&self) -> usize {
    self.offsets.bitstream * CACHELINE_SIZE
  }
}

/// Total size of each region shared by the pipes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSizes {
  pub cu_records: usize,
  pub bitstream: usize,
  pub stream_in: usize,
}

/// The tile partition of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
  geometry: FrameGeometry,
  cols: usize,
  rows: usize,
  col_widths: Vec<usize>,
  row_heights: Vec<usize>,
  bitstream_active: usize,
  tiles: Vec<Tile>,
}

impl TileGrid {
  /// Partition the frame into `cols` x `rows` tiles.
  ///
  /// `bitstream_active` is the part of the bitstream buffer shared out
  /// between the tiles, proportionally to their LCU count.
  ///
  /// # Errors
  ///
  /// Fails when the grid has more tiles than the minimum tile size allows,
  /// when a column or row would be empty, or when explicit sizes do not
  /// cover the frame.
  pub fn new(
    geometry: FrameGeometry, cols: usize, rows: usize, spacing: &TileSpacing,
    bitstream_active: usize,
  ) -> Result<Self, InvalidConfig> {
    let max = geometry.max_tiles();
    if cols * rows > max {
      return Err(InvalidConfig::TooManyTiles { actual: cols * rows, max });
    }

    let frame_width_lcu = geometry.width_in_lcus();
    let frame_height_lcu = geometry.height_in_lcus();

    let (col_widths, row_heights) = match spacing {
      TileSpacing::Uniform => {
        if cols == 0 || cols > frame_width_lcu {
          return Err(InvalidConfig::InvalidTileCols {
            actual: cols,
            max: frame_width_lcu.min(MAX_TILE_COLS),
          });
        }
        if rows == 0 || rows > frame_height_lcu {
          return Err(InvalidConfig::InvalidTileRows {
            actual: rows,
            max: frame_height_lcu.min(MAX_TILE_ROWS),
          });
        }
        (
          Self::uniform_sizes(frame_width_lcu, cols),
          Self::uniform_sizes(frame_height_lcu, rows),
        )
      }
      TileSpacing::Explicit { column_widths, row_heights } => {
        let valid = |sizes: &[usize], count: usize, total: usize| {
          sizes.len() == count
            && sizes.iter().all(|&s| s > 0)
            && sizes.iter().sum::<usize>() == total
        };
        if !valid(column_widths, cols, frame_width_lcu)
          || !valid(row_heights, rows, frame_height_lcu)
        {
          return Err(InvalidConfig::InvalidTileSpacing);
        }
        (column_widths.clone(), row_heights.clone())
      }
    };

    let shift = geometry.lcu_to_min_cb_shift();
    let frame_width_cb = geometry.width_in_min_cbs();
    let frame_height_cb = geometry.height_in_min_cbs();
    let lcus_in_frame = geometry.lcus();
    let cu_records = geometry.cu_records_per_lcu();

    let col_starts = Self::starts(&col_widths);
    let row_starts = Self::starts(&row_heights);

    let mut tiles = Vec::with_capacity(cols * rows);
    let mut lcus_before = 0;
    let mut bitstream = 0;
    for row in 0..rows {
      for col in 0..cols {
        let index = row * cols + col;
        let start_x_lcu = col_starts[col];
        let start_y_lcu = row_starts[row];
        let width_lcu = col_widths[col];
        let height_lcu = row_heights[row];
        // the last column and row absorb the partial LCUs at the frame edge
        let width_min_cb = if col == cols - 1 {
          frame_width_cb - (start_x_lcu << shift)
        } else {
          width_lcu << shift
        };
        let height_min_cb = if row == rows - 1 {
          frame_height_cb - (start_y_lcu << shift)
        } else {
          height_lcu << shift
        };
        let lcus = width_lcu * height_lcu;
        let bitstream_budget =
          align_cacheline(div_ceil(bitstream_active * lcus, lcus_in_frame));

        let offsets = TileOffsets {
          cu_record: align_cacheline(cu_records * lcus_before * CU_RECORD_SIZE)
            / CACHELINE_SIZE,
          bitstream,
          bitstream_budget,
          stream_in: 4
            * (start_y_lcu * frame_width_lcu + start_x_lcu * height_lcu),
          tile_size_record: index,
          pak_statistics: PAK_STATISTICS_SIZE * index,
          slice_size_streamout: lcus_before,
        };

        tiles.push(Tile {
          index,
          row,
          col,
          start_x_lcu,
          start_y_lcu,
          width_lcu,
          height_lcu,
          width_min_cb,
          height_min_cb,
          offsets,
        });

        lcus_before += lcus;
        bitstream += bitstream_budget / CACHELINE_SIZE;
      }
    }

    Ok(TileGrid {
      geometry,
      cols,
      rows,
      col_widths,
      row_heights,
      bitstream_active,
      tiles,
    })
  }

  /// HEVC uniform spacing: `(i + 1) * n / k - i * n / k`.
  fn uniform_sizes(n: usize, k: usize) -> Vec<usize> {
    (0..k).map(|i| (i + 1) * n / k - i * n / k).collect()
  }

  fn starts(sizes: &[usize]) -> Vec<usize> {
    sizes
      .iter()
      .scan(0, |acc, &s| {
        let start = *acc;
        *acc += s;
        Some(start)
      })
      .collect()
  }

  pub fn geometry(&self) -> FrameGeometry {
    self.geometry
  }

  #[inline(always)]
  pub fn cols(&self) -> usize {
    self.cols
  }

  #[inline(always)]
  pub fn rows(&self) -> usize {
    self.rows
  }

  #[inline(always)]
  pub fn tile_count(&self) -> usize {
    self.cols * self.rows
  }

  pub fn col_widths(&self) -> &[usize] {
    &self.col_widths
  }

  pub fn row_heights(&self) -> &[usize] {
    &self.row_heights
  }

  pub fn bitstream_active(&self) -> usize {
    self.bitstream_active
  }

  pub fn tiles(&self) -> &[Tile] {
    &self.tiles
  }

  pub fn tile(&self, index: usize) -> Option<&Tile> {
    self.tiles.get(index)
  }

  /// Tiles of one tile row, left to right.
  pub fn row_tiles(&self, row: usize) -> &[Tile] {
    let start = (row * self.cols).min(self.tiles.len());
    let end = ((row + 1) * self.cols).min(self.tiles.len());
    &self.tiles[start..end]
  }

  /// The tile containing LCU `(x, y)` of the frame.
  pub fn tile_at_lcu(&self, x: usize, y: usize) -> Option<&Tile> {
    self.tiles.iter().find(|t| t.contains_lcu(x, y))
  }

  /// LCUs of the rows before `row`.
  pub fn lcus_before_row(&self, row: usize) -> usize {
    self.row_heights.iter().take(row).sum::<usize>()
      * self.geometry.width_in_lcus()
  }

  /// Sizes of the regions the tile offsets point into.
  pub fn region_sizes(&self) -> RegionSizes {
    let lcus = self.geometry.lcus();
    let bitstream = self
      .tiles
      .last()
      .map(|t| t.bitstream_byte_offset() + t.offsets.bitstream_budget)
      .unwrap_or(0);
    RegionSizes {
      cu_records: align_page(
        self.geometry.cu_records_per_lcu() * lcus * CU_RECORD_SIZE,
      ),
      bitstream: align_page(bitstream),
      stream_in: align_page(lcus * STREAM_IN_LCU_SIZE),
    }
  }
}

/// Bytes withheld from the tile budgets under constant bitrate.
///
/// The reserve is one average frame in bytes, `bitrate / 8 * den / num` for
/// a `bitrate` in bits per second and a frame rate of `num / den`, capped to
/// a tenth of the buffer.
///
/// # Errors
///
/// Fails on a zero frame rate or when one average frame does not fit in the
/// buffer.
pub fn cbr_reserve(
  bitrate: u64, frame_rate: Rational, buffer: usize,
) -> Result<usize, InvalidConfig> {
  if frame_rate.den == 0 {
    return Err(InvalidConfig::InvalidFrameRateDen(frame_rate.den));
  }
  if frame_rate.num == 0 {
    return Err(InvalidConfig::InvalidFrameRateNum(frame_rate.num));
  }
  let bytes = u128::from(bitrate / 8) * u128::from(frame_rate.den)
    / u128::from(frame_rate.num);
  let reserve = usize::try_from(bytes).unwrap_or(usize::MAX);
  if reserve > buffer {
    return Err(InvalidConfig::CbrReserveExceedsBuffer { reserve, buffer });
  }
  Ok(reserve.min(buffer / 10))
}

#[cfg(test)]
pub mod test {
  use super::*;
  use interpolate_name::interpolate_test;

  fn geometry(width: usize, height: usize) -> FrameGeometry {
    FrameGeometry { width, height, lcu_size_log2: 6, min_cb_size_log2: 3 }
  }

  fn uniform(
    width: usize, height: usize, cols: usize, rows: usize,
  ) -> Result<TileGrid, InvalidConfig> {
    TileGrid::new(
      geometry(width, height),
      cols,
      rows,
      &TileSpacing::Uniform,
      width * height * 3 / 2,
    )
  }

  fn assert_exact_cover(grid: &TileGrid) {
    let g = grid.geometry();
    let shift = g.lcu_to_min_cb_shift();
    let (w, h) = (g.width_in_min_cbs(), g.height_in_min_cbs());
    let mut covered = vec![0u8; w * h];
    for tile in grid.tiles() {
      let x0 = tile.start_x_lcu << shift;
      let y0 = tile.start_y_lcu << shift;
      for y in y0..y0 + tile.height_min_cb {
        for x in x0..x0 + tile.width_min_cb {
          assert!(x < w && y < h, "tile {} leaves the frame", tile.index);
          covered[y * w + x] += 1;
        }
      }
    }
    assert!(covered.iter().all(|&c| c == 1), "tiles overlap or leave gaps");
  }

  #[test]
  fn every_grid_covers_the_frame() {
    for &(width, height) in
      &[(1920, 1080), (1000, 700), (3840, 2160), (640, 480)]
    {
      let g = geometry(width, height);
      for cols in 1..=g.width_in_lcus().min(MAX_TILE_COLS) {
        for rows in 1..=g.height_in_lcus().min(MAX_TILE_ROWS) {
          if cols * rows > g.max_tiles() {
            continue;
          }
          let grid = uniform(width, height, cols, rows).unwrap();
          assert_eq!(grid.tile_count(), cols * rows);
          assert_exact_cover(&grid);
        }
      }
    }
  }

  #[interpolate_test(two_columns, 2, 1)]
  #[interpolate_test(four_columns, 4, 1)]
  #[interpolate_test(two_by_two, 2, 2)]
  #[interpolate_test(three_by_four, 3, 4)]
  fn offsets_are_monotonic(cols: usize, rows: usize) {
    let grid = uniform(1920, 1080, cols, rows).unwrap();
    for pair in grid.tiles().windows(2) {
      let (a, b) = (&pair[0].offsets, &pair[1].offsets);
      assert!(a.cu_record <= b.cu_record);
      assert!(a.bitstream < b.bitstream);
      assert!(a.stream_in <= b.stream_in);
      assert!(a.tile_size_record < b.tile_size_record);
      assert!(a.pak_statistics < b.pak_statistics);
      assert!(a.slice_size_streamout < b.slice_size_streamout);
      assert_eq!(
        pair[0].bitstream_byte_offset() + a.bitstream_budget,
        pair[1].bitstream_byte_offset()
      );
    }
    for tile in grid.tiles() {
      assert_eq!(tile.offsets.bitstream_budget % CACHELINE_SIZE, 0);
      assert_eq!(tile.index, tile.row * cols + tile.col);
    }
    let sizes = grid.region_sizes();
    assert_eq!(sizes.bitstream % PAGE_SIZE, 0);
    assert!(sizes.bitstream >= grid.bitstream_active());
  }

  #[test]
  fn uniform_spacing() {
    let grid = uniform(1920, 1080, 4, 3).unwrap();
    // 30 x 17 LCUs
    assert_eq!(grid.col_widths(), &[7, 8, 7, 8]);
    assert_eq!(grid.row_heights(), &[5, 6, 6]);
    assert_eq!(grid.tile(5).unwrap().start_x_lcu, 7);
    assert_eq!(grid.tile(5).unwrap().start_y_lcu, 5);
    assert_eq!(grid.lcus_before_row(2), 11 * 30);
  }

  #[test]
  fn last_column_takes_the_remainder() {
    // 1000 pixels: 125 min CBs, 16 LCUs
    let grid = uniform(1000, 256, 2, 1).unwrap();
    let tiles = grid.tiles();
    assert_eq!(tiles[0].width_min_cb, 64);
    assert_eq!(tiles[1].width_min_cb, 61);
    assert_eq!(tiles[0].height_min_cb, 32);
  }

  #[test]
  fn region_offsets() {
    let grid = uniform(1920, 1080, 2, 1).unwrap();
    let tiles = grid.tiles();
    // 15 x 17 LCUs before the second tile, 64 records of 64 bytes each
    assert_eq!(tiles[1].offsets.cu_record, 15 * 17 * 64);
    assert_eq!(tiles[1].offsets.stream_in, 4 * 15 * 17);
    assert_eq!(tiles[1].offsets.slice_size_streamout, 15 * 17);
    assert_eq!(tiles[1].offsets.pak_statistics, 512);
    let budget = align_cacheline(div_ceil(1920 * 1080 * 3 / 2 * 255, 510));
    assert_eq!(tiles[0].offsets.bitstream_budget, budget);
    assert_eq!(tiles[1].offsets.bitstream, budget / CACHELINE_SIZE);
  }

  #[test]
  fn too_many_tiles() {
    // at most 2 x 2 tiles of 256x128 fit
    assert_eq!(
      uniform(512, 256, 3, 2).unwrap_err(),
      InvalidConfig::TooManyTiles { actual: 6, max: 4 }
    );
    assert!(uniform(512, 256, 2, 2).is_ok());
  }

  #[test]
  fn explicit_spacing() {
    let spacing = TileSpacing::Explicit {
      column_widths: vec![10, 20],
      row_heights: vec![17],
    };
    let grid =
      TileGrid::new(geometry(1920, 1080), 2, 1, &spacing, 1 << 20).unwrap();
    assert_eq!(grid.tile(1).unwrap().start_x_lcu, 10);
    assert_exact_cover(&grid);

    let short = TileSpacing::Explicit {
      column_widths: vec![10, 19],
      row_heights: vec![17],
    };
    assert_eq!(
      TileGrid::new(geometry(1920, 1080), 2, 1, &short, 1 << 20),
      Err(InvalidConfig::InvalidTileSpacing)
    );
    let empty = TileSpacing::Explicit {
      column_widths: vec![0, 30],
      row_heights: vec![17],
    };
    assert_eq!(
      TileGrid::new(geometry(1920, 1080), 2, 1, &empty, 1 << 20),
      Err(InvalidConfig::InvalidTileSpacing)
    );
  }

  #[test]
  fn cbr_reserve_rules() {
    let fps = Rational::new(30, 1);
    assert_eq!(cbr_reserve(2_400_000, fps, 1_000_000), Ok(10_000));
    // capped to a tenth of the buffer
    assert_eq!(cbr_reserve(240_000_000, fps, 2_000_000), Ok(200_000));
    assert_eq!(
      cbr_reserve(240_000_000, fps, 500_000),
      Err(InvalidConfig::CbrReserveExceedsBuffer {
        reserve: 1_000_000,
        buffer: 500_000
      })
    );
    assert_eq!(
      cbr_reserve(1000, Rational::new(30, 0), 1000),
      Err(InvalidConfig::InvalidFrameRateDen(0))
    );
  }

  #[test]
  fn cbr_reserve_with_a_large_denominator() {
    // 30000/1001 fps
    let ntsc = Rational::new(30_000, 1001);
    assert_eq!(cbr_reserve(24_000_000, ntsc, 1_000_000), Ok(100_000));
    assert_eq!(cbr_reserve(2_400_000, ntsc, 1_000_000), Ok(10_010));

    // bitrate / 8 * den does not fit in 64 bits
    let fine = Rational::new(u64::MAX / 2, u64::MAX / 4);
    assert_eq!(cbr_reserve(8_000_000, fine, 10_000_000), Ok(499_999));
    assert_eq!(
      cbr_reserve(u64::MAX, Rational::new(1, u64::MAX), 1 << 20),
      Err(InvalidConfig::CbrReserveExceedsBuffer {
        reserve: usize::MAX,
        buffer: 1 << 20
      })
    );
  }
}
