// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;

use crate::api::FrameType;
use crate::executor::EncodeContext;
use crate::hw::{Engine, EngineCommand, EngineError, PassKind};
use crate::rate::wp::HISTOGRAM_BINS;
use crate::sim::SimModel;
use crate::stats::{TileSizeRecord, TileStatistics};
use crate::tiling::Tile;

/// Bytes of a 64x64 LCU of a P frame at QP 26 and unit complexity.
pub const BASE_LCU_BYTES: f64 = 40.0;

/// Status an engine reports when it faults.
pub const FAULT_STATUS: u32 = 0xdead;

/// Relative size of the frame types.
pub fn frame_type_factor(frame_type: FrameType) -> f64 {
  match frame_type {
    FrameType::I => 4.0,
    FrameType::P => 1.0,
    FrameType::B => 0.5,
  }
}

/// Coded size of `lcus` LCUs. Halves every 6 QP steps.
pub fn coded_bytes(
  lcus: usize, lcu_size_log2: usize, qp: u8, frame_type: FrameType,
  complexity: f64,
) -> usize {
  let area = (1usize << (2 * lcu_size_log2)) as f64 / 4096.;
  let scale = 2f64.powf((26. - f64::from(qp)) / 6.);
  let bytes = BASE_LCU_BYTES
    * area
    * complexity
    * frame_type_factor(frame_type)
    * scale
    * lcus as f64;
  (bytes.round() as usize).max(1)
}

#[derive(Debug, Clone, Copy)]
struct TileWork {
  index: usize,
  qp: u8,
  complexity: f64,
  bytes: usize,
  slices: u32,
}

#[derive(Debug, Default)]
struct PipeWork {
  kind: Option<PassKind>,
  tile: Option<TileWork>,
  /// Last tile whose record was written.
  last_tile: Option<usize>,
}

/// One encode engine of the model.
#[derive(Debug)]
pub struct SimEngine {
  pipe: usize,
  model: Arc<SimModel>,
  work: Mutex<PipeWork>,
}

impl SimEngine {
  pub fn new(pipe: usize, model: Arc<SimModel>) -> Self {
    SimEngine { pipe, model, work: Mutex::new(PipeWork::default()) }
  }

  /// Content complexity of a tile, constant over the passes of a frame.
  fn complexity(&self, frame: u64, tile: usize) -> f64 {
    let seed = self.model.seed
      ^ frame.wrapping_mul(0x9e37_79b9_7f4a_7c15)
      ^ ((tile as u64) << 40);
    ChaChaRng::seed_from_u64(seed).gen_range(0.6..1.4)
  }

  fn tile<'a>(
    &self, ctx: &EncodeContext<'a>, index: usize, command: &EngineCommand,
  ) -> Result<&'a Tile, EngineError> {
    ctx.grid.tile(index).ok_or(EngineError::UnknownTarget {
      pipe: self.pipe,
      command: command.name(),
      target: index,
    })
  }

  /// Write `len` bytes of tile `work` at its current end.
  fn emit(ctx: &EncodeContext<'_>, tile: &Tile, work: &TileWork, len: usize) {
    let budget = tile.offsets.bitstream_budget;
    let start = work.bytes.min(budget);
    let end = (work.bytes + len).min(budget);
    let base = tile.bitstream_byte_offset();
    let mut bitstream = ctx.buffers.bitstream.lock();
    if let Some(out) = bitstream.get_mut(base + start..base + end) {
      for (i, b) in out.iter_mut().enumerate() {
        *b = (work.index as u8).wrapping_mul(17) ^ ((start + i) as u8);
      }
    }
  }

  fn histogram(ctx: &EncodeContext<'_>, tile: &Tile) {
    let Some((ring, slot)) = ctx.weights else {
      return;
    };
    let mut bins = [0u32; HISTOGRAM_BINS];
    let mean = 64 + (ctx.frame.poc.rem_euclid(16) as usize) * 8;
    bins[mean.min(HISTOGRAM_BINS - 1)] = tile.min_cbs() as u32;
    ring.accumulate(slot, &bins);
  }

  fn flush(
    &self, ctx: &EncodeContext<'_>, work: &mut PipeWork,
  ) -> Result<(), EngineError> {
    let Some(done) = work.tile.take() else {
      return Ok(());
    };
    if self.model.drops_record(ctx.frame_number, done.index) {
      trace!("pipe {}: dropping record of tile {}", self.pipe, done.index);
      return Ok(());
    }
    let tile = ctx.grid.tile(done.index).ok_or(EngineError::UnknownTarget {
      pipe: self.pipe,
      command: "flush",
      target: done.index,
    })?;

    let cus = tile.min_cbs() as u64;
    let (intra, skip) = match ctx.frame.frame_type {
      FrameType::I => (cus, 0),
      FrameType::P => (cus / 4, cus / 4),
      FrameType::B => (cus / 8, cus / 2),
    };
    if let Some(s) = ctx.buffers.tile_stats.lock().get_mut(done.index) {
      *s = TileStatistics {
        bytes: done.bytes as u64,
        qp_sum: u64::from(done.qp) * 4 * cus,
        cu_count: cus,
        intra_cus: intra,
        skip_cus: skip,
        sad: (done.complexity * 1000.) as u64 * tile.lcus() as u64,
      };
    }
    if let Some(r) = ctx.buffers.records.lock().get_mut(done.index) {
      *r = TileSizeRecord { length: done.bytes as u32, slice_count: done.slices };
    }
    if ctx.pass == 0 && work.kind == Some(PassKind::Full) {
      Self::histogram(ctx, tile);
    }
    work.last_tile = Some(done.index);
    Ok(())
  }

  /// Append an end-of-sequence or end-of-stream unit to the last tile.
  fn end_unit(&self, ctx: &EncodeContext<'_>, work: &PipeWork) {
    let Some(index) = work.last_tile else {
      return;
    };
    let Some(tile) = ctx.grid.tile(index) else {
      return;
    };
    let mut records = ctx.buffers.records.lock();
    let Some(record) = records.get_mut(index) else {
      return;
    };
    let len = self.model.end_of_stream_size;
    let at = TileWork {
      index,
      qp: 0,
      complexity: 0.,
      bytes: record.length as usize,
      slices: 0,
    };
    record.length += len as u32;
    drop(records);
    Self::emit(ctx, tile, &at, len);
  }
}

impl Engine for SimEngine {
  fn execute(
    &self, pipe: usize, command: &EngineCommand, ctx: &EncodeContext<'_>,
  ) -> Result<(), EngineError> {
    let mut work = self.work.lock();
    match *command {
      EngineCommand::PipeModeSelect { kind, .. } => {
        work.kind = Some(kind);
        work.tile = None;
      }
      EngineCommand::CodeTile { tile } => {
        if work.kind.is_none() {
          return Err(EngineError::OutOfOrder { pipe, command: command.name() });
        }
        if self.model.engine_faults(ctx.frame_number, pipe) {
          return Err(EngineError::Fault { pipe, status: FAULT_STATUS });
        }
        let t = self.tile(ctx, tile, command)?;
        work.tile = Some(TileWork {
          index: tile,
          qp: ctx.tile_qp(t),
          complexity: self.complexity(ctx.frame_number, tile),
          bytes: 0,
          slices: 0,
        });
      }
      EngineCommand::CodeSlice { tile, slice, .. } => {
        let t = self.tile(ctx, tile, command)?;
        let params = ctx.slices.get(slice).ok_or(EngineError::UnknownTarget {
          pipe,
          command: command.name(),
          target: slice,
        })?;
        let current = match work.tile.as_mut() {
          Some(w) if w.index == tile => w,
          _ => {
            return Err(EngineError::OutOfOrder { pipe, command: command.name() })
          }
        };
        let len = coded_bytes(
          params.num_lcus,
          ctx.grid.geometry().lcu_size_log2,
          current.qp,
          ctx.frame.frame_type,
          current.complexity,
        );
        Self::emit(ctx, t, current, len);
        current.bytes += len;
        current.slices += 1;
        if let Some(end) = ctx.buffers.slice_sizes.lock().get_mut(slice) {
          *end = current.bytes as u32;
        }
      }
      EngineCommand::Flush => self.flush(ctx, &mut work)?,
      EngineCommand::EndOfSequence | EngineCommand::EndOfStream => {
        self.end_unit(ctx, &work);
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn size_halves_every_six_qp() {
    let a = coded_bytes(100, 6, 26, FrameType::P, 1.0);
    let b = coded_bytes(100, 6, 32, FrameType::P, 1.0);
    assert_eq!(a, 4000);
    assert_eq!(b, 2000);
    assert!(coded_bytes(100, 6, 26, FrameType::I, 1.0) > a);
    // 32x32 LCUs carry a quarter of the data
    assert_eq!(coded_bytes(100, 5, 26, FrameType::P, 1.0), 1000);
    assert_eq!(coded_bytes(1, 6, 51, FrameType::B, 0.6), 1);
  }
}
