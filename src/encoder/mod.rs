// Copyright (c) 2018-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Frame level coordination: pipe decision, the pass loop and the
//! cross-pipe steps run between passes.

pub mod pipe;
pub mod report;

use std::fmt;
use std::sync::Arc;

use arrayvec::ArrayVec;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::api::{
  AcceptancePolicy, Config, EncodedFrame, EncoderError, FrameParams,
  InvalidConfig, SliceParams, StatusReport, MAX_REF_LIST_SIZE,
};
use crate::executor::{
  dispatch, CrossPipe, EncodeContext, PassResult, StreamParams,
};
use crate::hw::{Backend, Capabilities, Generation, PassKind, MAX_ENGINES};
use crate::rate::dmem::{BrcUpdateDmem, OpMode, RowScope};
use crate::rate::wp::WeightSlotRing;
use crate::rate::{BrcHistory, RateControl};
use crate::resource::{
  BufferRequest, FrameBuffers, ResourceError, SlotArena, RECYCLED_BUFFER_NUM,
};
use crate::stats::{
  slice_sizes, Aggregate, Aggregator, PassInfo, UNUSED_OFFSET,
};
use crate::stitch::{
  build_copy_list, coded_size, select_strategy, stitch_direct, stitched_size,
  CopyCommand, StitchStrategy,
};
use crate::sync::SyncTrace;
use crate::tiling::{assign_slices, slices_per_tile, SliceMap, Tile, TileGrid};

use self::pipe::{decide_pipe_count, PipeState};
use self::report::{fragments, frame_status};

/// Drives one hardware encoder through the passes of every frame.
pub struct Encoder {
  config: Config,
  grid: TileGrid,
  generation: Box<dyn Generation>,
  caps: Capabilities,
  backend: Arc<dyn Backend>,
  rate: Mutex<RateControl>,
  weights: WeightSlotRing,
  slots: SlotArena<FrameBuffers>,
  pipes: Option<PipeState>,
  engines: usize,
  frame_count: u64,
}

impl fmt::Debug for Encoder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Encoder")
      .field("generation", &self.generation)
      .field("engines", &self.engines)
      .field("pipes", &self.pipes)
      .field("frame_count", &self.frame_count)
      .finish()
  }
}

/// What one frame is coded with once its layout is settled.
struct FramePlan {
  slices: Vec<SliceParams>,
  slice_map: SliceMap,
  strategy: StitchStrategy,
  tile_replay: bool,
}

impl Encoder {
  /// # Errors
  ///
  /// Fails when the configuration is invalid.
  pub fn new<B: Backend>(config: Config, backend: B) -> Result<Self, EncoderError> {
    config.validate()?;
    let grid = config.tile_grid()?;
    let generation = config.generation().create();
    let caps = generation.capabilities();
    let enc = config.encoder_config();
    let rate =
      RateControl::new(*config.rate_control(), enc.width, enc.height);
    info!("{} on {}", enc, generation.kind());

    Ok(Encoder {
      engines: config.engine_count(),
      grid,
      generation,
      caps,
      backend: Arc::new(backend),
      rate: Mutex::new(rate),
      weights: WeightSlotRing::new(),
      slots: SlotArena::new(RECYCLED_BUFFER_NUM),
      pipes: None,
      frame_count: 0,
      config,
    })
  }

  /// Change the number of engines available from the next frame on.
  ///
  /// # Errors
  ///
  /// Fails when the count is out of range or cannot code the tile grid.
  pub fn set_engines(&mut self, engines: usize) -> Result<(), InvalidConfig> {
    let max = self.caps.engines.min(MAX_ENGINES);
    if engines == 0 || engines > max {
      return Err(InvalidConfig::InvalidEngineCount { actual: engines, max });
    }
    let enc = self.config.encoder_config();
    let pipes = decide_pipe_count(
      enc.tile_cols,
      enc.tile_rows,
      engines,
      enc.streaming_buffer,
    )?;
    select_strategy(
      &self.caps,
      enc,
      self.grid.tile_count(),
      pipes,
      self.config.tile_replay_active(),
    )?;
    self.engines = engines;
    Ok(())
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn capabilities(&self) -> &Capabilities {
    &self.caps
  }

  pub fn grid(&self) -> &TileGrid {
    &self.grid
  }

  /// Pipes of the last frame, 0 before the first one.
  pub fn pipes(&self) -> usize {
    self.pipes.as_ref().map_or(0, PipeState::pipes)
  }

  pub fn frames_encoded(&self) -> u64 {
    self.frame_count
  }

  /// Synchronization events of the last frame, when tracing is enabled.
  pub fn sync_trace(&self) -> Option<&SyncTrace> {
    self.pipes.as_ref().and_then(|p| p.fabric().trace())
  }

  /// Rate-control state of the current pipe count.
  pub fn rate_history(&self) -> Option<BrcHistory> {
    self.rate.lock().history().cloned()
  }

  /// Pipe count of the next frame.
  fn next_pipe_count(&self) -> Result<usize, InvalidConfig> {
    let enc = self.config.encoder_config();
    decide_pipe_count(
      enc.tile_cols,
      enc.tile_rows,
      self.engines,
      enc.streaming_buffer,
    )
  }

  /// Rebuild what depends on the pipe count. The previous workers are
  /// stopped before the new ones start.
  fn prepare_pipes(&mut self, pipes: usize) -> Result<(), EncoderError> {
    if self.pipes.as_ref().map(PipeState::pipes) != Some(pipes) {
      if let Some(old) = self.pipes.take() {
        info!("pipe count changes from {} to {}", old.pipes(), pipes);
      }
      self.pipes = Some(PipeState::new(
        pipes,
        self.backend.as_ref(),
        self.config.watchdog,
        self.config.trace_sync,
      )?);
    }
    self.rate.lock().rehook(pipes);
    Ok(())
  }

  fn plan(
    &self, frame: &FrameParams, pipes: usize,
  ) -> Result<FramePlan, InvalidConfig> {
    let slices = if frame.slices.is_empty() {
      slices_per_tile(&self.grid)
    } else {
      frame.slices.clone()
    };
    let slice_map = assign_slices(&self.grid, &slices)?;
    let tile_replay = self.config.tile_replay_active();
    let strategy = select_strategy(
      &self.caps,
      self.config.encoder_config(),
      self.grid.tile_count(),
      pipes,
      tile_replay,
    )?;
    Ok(FramePlan { slices, slice_map, strategy, tile_replay })
  }

  /// Code one frame.
  ///
  /// Frames the hardware could not complete are returned with an
  /// `Incomplete` or `Error` status rather than as errors.
  ///
  /// # Errors
  ///
  /// Fails on invalid frame parameters, when buffers cannot be provided,
  /// when an engine or the firmware rejects its work or a pipe stalls.
  pub fn encode_frame(
    &mut self, frame: &FrameParams,
  ) -> Result<EncodedFrame, EncoderError> {
    let frame_number = self.frame_count;
    let pipes = self.next_pipe_count()?;
    let plan = self.plan(frame, pipes)?;
    self.prepare_pipes(pipes)?;

    let slot = self.slots.acquire(frame_number, self.config.watchdog)?;
    match self.encode_in_slot(frame_number, frame, slot, pipes, &plan) {
      Ok(encoded) => {
        self.slots.complete(slot);
        self.frame_count += 1;
        Ok(encoded)
      }
      Err(e) => {
        warn!("frame {} failed: {}", frame_number, e);
        self.slots.abandon(slot);
        Err(e)
      }
    }
  }

  fn encode_in_slot(
    &mut self, frame_number: u64, frame: &FrameParams, slot: usize,
    pipes: usize, plan: &FramePlan,
  ) -> Result<EncodedFrame, EncoderError> {
    let request = BufferRequest::new(&self.grid, plan.slices.len());
    let covered =
      self.slots.data(slot).map_or(false, |b| b.request().covers(&request));
    if !covered {
      drop(self.slots.take_data(slot));
      let buffers = FrameBuffers::allocate(self.backend.allocator(), request)?;
      self.slots.set_data(slot, buffers);
    }
    self.run_passes(frame_number, frame, slot, pipes, plan)
  }

  fn run_passes(
    &self, frame_number: u64, frame: &FrameParams, slot: usize, pipes: usize,
    plan: &FramePlan,
  ) -> Result<EncodedFrame, EncoderError> {
    let buffers =
      self.slots.data(slot).ok_or(ResourceError::MissingBuffers(slot))?;
    let state = match &self.pipes {
      Some(state) => state,
      None => return Err(EncoderError::PipeLost(0)),
    };
    buffers.clear();
    state.fabric.reset_frame();

    let wp_slot = if self.config.weighted_prediction_active() {
      Some(self.weights.assign(frame.poc, frame.used_as_ref))
    } else {
      None
    };

    let mut qp = {
      let mut firmware = self.backend.firmware().lock();
      self.rate.lock().start_frame(&mut **firmware, frame_number, frame)?
    };
    let rc = *self.config.rate_control();
    let max_passes = if plan.tile_replay { 1 } else { rc.passes() };
    let upper_bound = self.config.encoder_config().bitstream_upper_bound();

    let driver = PassDriver {
      grid: &self.grid,
      backend: self.backend.as_ref(),
      rate: &self.rate,
      strategy: plan.strategy,
      tile_replay: plan.tile_replay,
      row_passes: self.caps.passes_per_tile_row.max(1),
      acceptance: rc.acceptance,
      upper_bound,
    };
    let params = StreamParams::new(
      &self.grid,
      &plan.slice_map,
      self.generation.as_ref(),
      pipes,
      frame,
    );

    let mut kind = PassKind::Full;
    let mut passes = 0;
    let mut result = PassResult::default();
    let mut row_passes = Vec::new();
    for pass in 0..max_passes {
      if pass > 0 {
        buffers.clear();
      }
      let mut ctx = EncodeContext::new(
        frame_number,
        frame,
        &self.grid,
        &plan.slices,
        &plan.slice_map,
        buffers,
        pipes,
      )
      .with_pass(pass, max_passes, kind, qp);
      if let Some(wp_slot) = wp_slot {
        ctx = ctx.with_weights(&self.weights, wp_slot);
      }
      let streams = if plan.tile_replay {
        ctx = ctx.with_tile_rows();
        params.row_streams(driver.row_passes)?
      } else {
        params.pass_streams(pass, kind)?
      };

      debug!(
        "frame {} pass {}: {:?} at qp {} on {} pipes",
        frame_number, pass, kind, qp, pipes
      );
      dispatch(&state.pool, &streams, &ctx, &state.fabric, &state.engines, &driver)?;
      passes = pass + 1;
      result = ctx.result();
      row_passes = ctx.row_passes();

      if let Some(tile) = result.incomplete {
        warn!("frame {}: tile {} incomplete, giving up", frame_number, tile);
        break;
      }
      match &result.brc {
        Some(out) if !out.accepted && pass + 1 < max_passes => {
          debug!(
            "frame {} pass {} rejected, next qp {} (delta {})",
            frame_number, pass, out.qp, out.qp_delta
          );
          qp = out.qp;
          kind = if out.pak_only { PassKind::PakOnly } else { PassKind::Full };
        }
        _ => break,
      }
    }

    let mut report = StatusReport::pending(frame_number, frame, pipes);
    report.passes = passes;
    report.row_passes = row_passes;
    report.panic = result.brc.as_ref().map_or(false, |b| b.panic);
    report.average_qp = result.stats.as_ref().map_or(qp, |s| s.average_qp());

    let records = buffers.records.lock().clone();
    report.tiles = fragments(&self.grid, &records, pipes);
    if self.config.encoder_config().slice_size_report {
      report.slice_sizes = Some(slice_sizes(
        &plan.slice_map,
        &buffers.slice_sizes.lock(),
        self.grid.tile_count(),
      ));
    }

    let incomplete = result.incomplete.is_some();
    let mut overflow = false;
    let mut size = 0;
    if !incomplete {
      match build_copy_list(self.grid.tiles(), &records) {
        Ok(commands) => {
          size = match (plan.strategy, result.stitched) {
            (StitchStrategy::Firmware, Some(size)) => {
              report.stitched_by_firmware = true;
              size
            }
            (StitchStrategy::Firmware, None) => stitched_size(&commands),
            (StitchStrategy::Direct, _) => {
              self.stitch_on_host(buffers, &commands)
            }
          };
        }
        Err(e) => {
          warn!("frame {}: {}", frame_number, e);
          overflow = true;
          size = coded_size(&records);
        }
      }
    }
    report.bitstream_size = size;
    report.status = frame_status(incomplete, overflow, size, upper_bound);

    let data = if report.is_successful() {
      buffers.bitstream.lock().get(..size).map_or_else(Vec::new, <[u8]>::to_vec)
    } else {
      Vec::new()
    };
    info!(
      "frame {} ({}): {} bytes, qp {}, {} passes, {}",
      frame_number,
      frame.frame_type,
      report.bitstream_size,
      report.average_qp,
      report.passes,
      report.status
    );
    Ok(EncodedFrame { report, data })
  }

  /// Join the fragments on the host. Returns the frame size, or 0 when it
  /// cannot be stitched.
  fn stitch_on_host(
    &self, buffers: &FrameBuffers, commands: &[CopyCommand],
  ) -> usize {
    let enc = self.config.encoder_config();
    if enc.content_protection {
      // a single protected tile already starts the buffer
      return stitched_size(commands);
    }
    let mut bitstream = buffers.bitstream.lock();
    let mut scratch = buffers.scratch.lock();
    match stitch_direct(
      &mut bitstream,
      &mut scratch,
      commands,
      enc.bitstream_upper_bound(),
    ) {
      Ok(size) => size,
      Err(e) => {
        warn!("cannot stitch: {}", e);
        stitched_size(commands)
      }
    }
  }
}

/// The cross-pipe steps of a frame: aggregation, stitching and the rate
/// control updates.
struct PassDriver<'a> {
  grid: &'a TileGrid,
  backend: &'a dyn Backend,
  rate: &'a Mutex<RateControl>,
  strategy: StitchStrategy,
  tile_replay: bool,
  row_passes: usize,
  acceptance: AcceptancePolicy,
  upper_bound: usize,
}

impl PassDriver<'_> {
  fn update_dmem(
    &self, ctx: &EncodeContext<'_>, pass: usize, row: Option<RowScope>,
  ) -> BrcUpdateDmem {
    let frame = ctx.frame;
    let (weight_offset, ref_weight_offsets) = match ctx.weights {
      Some((ring, slot)) => {
        (WeightSlotRing::offset(slot), ring.reference_offsets(frame.references()))
      }
      None => (UNUSED_OFFSET, ArrayVec::new()),
    };
    BrcUpdateDmem {
      frame_number: ctx.frame_number,
      poc: frame.poc,
      frame_type: frame.frame_type,
      pass,
      max_passes: ctx.max_passes,
      op_mode: OpMode::for_pass(pass, ctx.weights.is_some(), self.tile_replay),
      qp: ctx.qp(),
      target_size: frame.target_size.unwrap_or(0),
      weight_offset,
      ref_pocs: frame.references().take(MAX_REF_LIST_SIZE).collect(),
      ref_weight_offsets,
      acceptance: self.acceptance,
      row,
      frame_lcus: self.grid.geometry().lcus(),
    }
  }

  fn row_scope(&self, row: usize, row_pass: usize) -> Option<RowScope> {
    let tiles = self.grid.row_tiles(row);
    Some(RowScope {
      row,
      row_pass,
      max_row_passes: self.row_passes,
      first_tile: tiles.first()?.index,
      last_tile: tiles.last()?.index,
      first_lcu: self.grid.lcus_before_row(row),
      lcus: tiles.iter().map(Tile::lcus).sum(),
    })
  }
}

impl CrossPipe for PassDriver<'_> {
  fn finish_row(
    &self, ctx: &EncodeContext<'_>, row: usize, row_pass: usize,
  ) -> Result<(), EncoderError> {
    let last = row_pass + 1 >= self.row_passes;
    let aggregator = Aggregator::new(self.grid, ctx.pipes, self.upper_bound);
    let info = PassInfo {
      frame_number: ctx.frame_number,
      pass: row_pass,
      max_passes: self.row_passes,
    };
    let mut firmware = self.backend.firmware().lock();
    let stats = match aggregator.aggregate(
      &mut **firmware,
      ctx.buffers,
      row..row + 1,
      info,
      false,
    )? {
      Aggregate::Complete { stats, .. } => stats,
      Aggregate::Incomplete { tile } => {
        ctx.update_result(|r| {
          r.incomplete.get_or_insert(tile);
        });
        ctx.finish_row(row, row_pass, true);
        return Ok(());
      }
    };

    let mut rate = self.rate.lock();
    let scope = match self.row_scope(row, row_pass) {
      Some(scope) if rate.is_active() => scope,
      _ => {
        ctx.finish_row(row, row_pass, true);
        return Ok(());
      }
    };
    let mut dmem = self.update_dmem(ctx, 0, Some(scope));
    if let Some(tile) = self.grid.row_tiles(row).first() {
      dmem.qp = ctx.tile_qp(tile);
    }
    let out = rate.update(&mut **firmware, dmem, &stats, None)?;
    if !out.accepted && !last {
      debug!(
        "frame {} row {} pass {} rejected, next qp {}",
        ctx.frame_number, row, row_pass, out.qp
      );
      ctx.set_row_qp(row, out.qp);
    }
    ctx.finish_row(row, row_pass, out.accepted || last);
    Ok(())
  }

  fn finish_pass(
    &self, ctx: &EncodeContext<'_>, pass: usize,
  ) -> Result<(), EncoderError> {
    let aggregator = Aggregator::new(self.grid, ctx.pipes, self.upper_bound);
    let info = PassInfo {
      frame_number: ctx.frame_number,
      pass,
      max_passes: ctx.max_passes,
    };
    let mut firmware = self.backend.firmware().lock();
    let (stats, stitched) = match aggregator.aggregate(
      &mut **firmware,
      ctx.buffers,
      0..self.grid.rows(),
      info,
      self.strategy == StitchStrategy::Firmware,
    )? {
      Aggregate::Complete { stats, stitched } => (stats, stitched),
      Aggregate::Incomplete { tile } => {
        ctx.update_result(|r| {
          r.incomplete.get_or_insert(tile);
        });
        return Ok(());
      }
    };
    *ctx.buffers.frame_stats.lock() = stats.clone();

    let mut rate = self.rate.lock();
    let brc = if rate.is_active() {
      let dmem = self.update_dmem(ctx, pass, None);
      let histograms = match ctx.weights {
        Some((ring, _)) if pass > 0 => Some(ring.snapshot()),
        _ => None,
      };
      Some(rate.update(&mut **firmware, dmem, &stats, histograms.as_deref())?)
    } else {
      None
    };
    ctx.update_result(|r| {
      r.stats = Some(stats);
      r.brc = brc;
      r.stitched = stitched;
    });
    Ok(())
  }
}
