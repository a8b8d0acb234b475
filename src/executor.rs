// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Command streams of the pipes and their execution.
//!
//! Every pipe runs one stream per pass on its own worker. The streams only
//! meet at semaphores: the first pipe waits for the others at the end of a
//! pass (or tile-row pass), runs the cross-pipe step and releases them.
//!
//! Semaphore values are derived from the position in the frame so they only
//! grow: a frame pass `n` completes with `n + 1`, tile-row pass `rp` of row
//! `r` with `r * R + rp + 1` where `R` is the number of passes per row, and
//! the frame after the last row with `rows * R + 1`. Waits are "at least",
//! so a row skipped after acceptance leaves no stale value behind.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel;
use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::api::{EncoderError, FrameParams, SliceParams};
use crate::hw::{
  Command, CommandBuffer, CommandBuilder, CrossPipeStep, Engine, EngineError,
  Generation, PassKind,
};
use crate::rate::wp::WeightSlotRing;
use crate::rate::BrcOutput;
use crate::resource::FrameBuffers;
use crate::stats::FrameStatistics;
use crate::sync::{SemaphoreId, SyncError, SyncFabric, TraceEvent};
use crate::tiling::{SliceMap, Tile, TileGrid};

/// What the cross-pipe steps of a pass produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassResult {
  /// First tile found without a size record.
  pub incomplete: Option<usize>,
  pub stats: Option<FrameStatistics>,
  pub brc: Option<BrcOutput>,
  /// Size of the frame stitched by the firmware.
  pub stitched: Option<usize>,
}

/// Everything an engine and the cross-pipe steps need to know about the
/// pass being coded.
pub struct EncodeContext<'a> {
  pub frame_number: u64,
  pub frame: &'a FrameParams,
  pub grid: &'a TileGrid,
  pub slices: &'a [SliceParams],
  pub slice_map: &'a SliceMap,
  pub buffers: &'a FrameBuffers,
  pub pipes: usize,
  pub pass: usize,
  pub max_passes: usize,
  pub kind: PassKind,
  /// Histogram ring and the slot of this frame.
  pub weights: Option<(&'a WeightSlotRing, usize)>,
  frame_qp: AtomicU8,
  row_qp: Vec<AtomicU8>,
  row_done: Vec<AtomicBool>,
  row_passes: Vec<AtomicUsize>,
  result: Mutex<PassResult>,
}

impl<'a> EncodeContext<'a> {
  pub fn new(
    frame_number: u64, frame: &'a FrameParams, grid: &'a TileGrid,
    slices: &'a [SliceParams], slice_map: &'a SliceMap,
    buffers: &'a FrameBuffers, pipes: usize,
  ) -> Self {
    EncodeContext {
      frame_number,
      frame,
      grid,
      slices,
      slice_map,
      buffers,
      pipes,
      pass: 0,
      max_passes: 1,
      kind: PassKind::Full,
      weights: None,
      frame_qp: AtomicU8::new(0),
      row_qp: Vec::new(),
      row_done: Vec::new(),
      row_passes: Vec::new(),
      result: Mutex::new(PassResult::default()),
    }
  }

  pub fn with_pass(
    mut self, pass: usize, max_passes: usize, kind: PassKind, qp: u8,
  ) -> Self {
    self.pass = pass;
    self.max_passes = max_passes;
    self.kind = kind;
    self.frame_qp = AtomicU8::new(qp);
    self
  }

  /// Track QP and acceptance per tile row.
  pub fn with_tile_rows(mut self) -> Self {
    let rows = self.grid.rows();
    let qp = self.qp();
    self.row_qp = (0..rows).map(|_| AtomicU8::new(qp)).collect();
    self.row_done = (0..rows).map(|_| AtomicBool::new(false)).collect();
    self.row_passes = (0..rows).map(|_| AtomicUsize::new(0)).collect();
    self
  }

  pub fn with_weights(mut self, ring: &'a WeightSlotRing, slot: usize) -> Self {
    self.weights = Some((ring, slot));
    self
  }

  pub fn qp(&self) -> u8 {
    self.frame_qp.load(Ordering::Acquire)
  }

  /// QP the engines code `tile` with.
  pub fn tile_qp(&self, tile: &Tile) -> u8 {
    self
      .row_qp
      .get(tile.row)
      .map_or_else(|| self.qp(), |qp| qp.load(Ordering::Acquire))
  }

  pub fn set_row_qp(&self, row: usize, qp: u8) {
    if let Some(cell) = self.row_qp.get(row) {
      cell.store(qp, Ordering::Release);
    }
  }

  pub fn row_done(&self, row: usize) -> bool {
    self.row_done.get(row).map_or(false, |d| d.load(Ordering::Acquire))
  }

  pub fn finish_row(&self, row: usize, row_pass: usize, accepted: bool) {
    if let Some(passes) = self.row_passes.get(row) {
      passes.store(row_pass + 1, Ordering::Release);
    }
    if accepted {
      if let Some(done) = self.row_done.get(row) {
        done.store(true, Ordering::Release);
      }
    }
  }

  /// Passes executed by every tile row.
  pub fn row_passes(&self) -> Vec<usize> {
    self.row_passes.iter().map(|p| p.load(Ordering::Acquire)).collect()
  }

  pub fn update_result(&self, f: impl FnOnce(&mut PassResult)) {
    f(&mut self.result.lock());
  }

  pub fn result(&self) -> PassResult {
    self.result.lock().clone()
  }
}

/// The firmware work run by the first pipe at synchronization points.
pub trait CrossPipe: Sync {
  /// Aggregate a tile row and run the tile-row rate control. Must decide
  /// whether the row is done before returning.
  ///
  /// # Errors
  ///
  /// Fails when a firmware invocation fails.
  fn finish_row(
    &self, ctx: &EncodeContext<'_>, row: usize, row_pass: usize,
  ) -> Result<(), EncoderError>;

  /// Aggregate the frame and run the frame-level rate control.
  ///
  /// # Errors
  ///
  /// Fails when a firmware invocation fails.
  fn finish_pass(
    &self, ctx: &EncodeContext<'_>, pass: usize,
  ) -> Result<(), EncoderError>;
}

/// What the streams of a frame are built from.
#[derive(Clone, Copy)]
pub struct StreamParams<'a> {
  pub grid: &'a TileGrid,
  pub slice_map: &'a SliceMap,
  pub generation: &'a dyn Generation,
  pub pipes: usize,
  pub end_of_sequence: bool,
  pub end_of_stream: bool,
}

impl<'a> StreamParams<'a> {
  pub fn new(
    grid: &'a TileGrid, slice_map: &'a SliceMap,
    generation: &'a dyn Generation, pipes: usize, frame: &FrameParams,
  ) -> Self {
    StreamParams {
      grid,
      slice_map,
      generation,
      pipes,
      end_of_sequence: frame.end_of_sequence,
      end_of_stream: frame.end_of_stream,
    }
  }

  /// Tiles of `pipe` within the tile rows `rows`, in raster order.
  pub fn pipe_tiles(
    &self, pipe: usize, rows: Range<usize>,
  ) -> impl Iterator<Item = &'a Tile> + 'a {
    let (grid, pipes) = (self.grid, self.pipes);
    rows
      .flat_map(move |row| grid.row_tiles(row))
      .filter(move |t| pipes == 1 || t.col == pipe)
  }

  fn emit_tile<B: CommandBuilder>(
    &self, b: &mut B, pipe: usize, tile: &Tile, kind: PassKind,
  ) -> Result<(), EngineError> {
    let slices = self.slice_map.tile_slices(tile.index);
    if slices.is_empty() {
      return Err(EngineError::TileWithoutSlices(tile.index));
    }
    let scalable = self.pipes > 1;
    if scalable {
      b.acquire_lock();
    }
    b.pipe_mode_select(
      self.generation.multi_engine_mode(pipe, self.pipes),
      kind,
    );
    b.code_tile(tile.index);
    for a in slices {
      b.code_slice(tile.index, a.slice, a.last_in_tile);
    }
    if scalable {
      b.release_lock();
    }
    b.flush();
    Ok(())
  }

  fn emit_end_of_stream<B: CommandBuilder>(&self, b: &mut B, pipe: usize) {
    if pipe + 1 != self.pipes {
      return;
    }
    if self.end_of_sequence {
      b.end_of_sequence();
    }
    if self.end_of_stream {
      b.end_of_stream();
    }
  }

  /// Everybody reports `value` on its pipe semaphore; the first pipe
  /// collects them, runs `step` and publishes `value` on `release`.
  fn emit_sync<B: CommandBuilder>(
    &self, b: &mut B, pipe: usize, value: u32, step: CrossPipeStep,
    release: SemaphoreId, others_wait: bool,
  ) {
    b.signal(SemaphoreId::PipeDone(pipe), value);
    if pipe == 0 {
      for other in 1..self.pipes {
        b.wait(SemaphoreId::PipeDone(other), value);
      }
      b.cross_pipe(step);
      b.signal(release, value);
    } else if others_wait {
      b.wait(release, value);
    }
  }

  /// Stream of `pipe` for frame pass `pass`.
  ///
  /// # Errors
  ///
  /// Fails when a tile of the pipe has no slice.
  pub fn build_pass<B: CommandBuilder>(
    &self, b: &mut B, pipe: usize, pass: usize, kind: PassKind,
  ) -> Result<(), EngineError> {
    if pass > 0 {
      b.wait(SemaphoreId::BrcHandoff, pass as u32);
    }
    for tile in self.pipe_tiles(pipe, 0..self.grid.rows()) {
      self.emit_tile(b, pipe, tile, kind)?;
    }
    self.emit_end_of_stream(b, pipe);
    self.emit_sync(
      b,
      pipe,
      pass as u32 + 1,
      CrossPipeStep::FinishPass { pass },
      SemaphoreId::BrcHandoff,
      false,
    );
    Ok(())
  }

  /// Stream of `pipe` replaying every tile row up to `row_passes` times.
  ///
  /// # Errors
  ///
  /// Fails when a tile of the pipe has no slice.
  pub fn build_rows<B: CommandBuilder>(
    &self, b: &mut B, pipe: usize, row_passes: usize,
  ) -> Result<(), EngineError> {
    let passes = row_passes.max(1);
    let rows = self.grid.rows();
    for row in 0..rows {
      for rp in 0..passes {
        let kind = if rp == 0 {
          PassKind::Full
        } else {
          b.push(Command::SkipIfRowDone { row });
          PassKind::PakOnly
        };
        for tile in self.pipe_tiles(pipe, row..row + 1) {
          self.emit_tile(b, pipe, tile, kind)?;
        }
        self.emit_sync(
          b,
          pipe,
          (row * passes + rp + 1) as u32,
          CrossPipeStep::FinishRow { row, row_pass: rp },
          SemaphoreId::TileRowBrc,
          true,
        );
      }
      b.push(Command::RowEnd { row });
    }
    self.emit_end_of_stream(b, pipe);
    self.emit_sync(
      b,
      pipe,
      (rows * passes + 1) as u32,
      CrossPipeStep::FinishPass { pass: 0 },
      SemaphoreId::BrcHandoff,
      false,
    );
    Ok(())
  }

  /// Streams of every pipe for frame pass `pass`.
  ///
  /// # Errors
  ///
  /// See [`StreamParams::build_pass`].
  pub fn pass_streams(
    &self, pass: usize, kind: PassKind,
  ) -> Result<Vec<CommandBuffer>, EngineError> {
    (0..self.pipes)
      .map(|pipe| {
        let mut buf = CommandBuffer::new();
        self.build_pass(&mut buf, pipe, pass, kind)?;
        Ok(buf)
      })
      .collect()
  }

  /// Streams of every pipe under tile-row replay.
  ///
  /// # Errors
  ///
  /// See [`StreamParams::build_rows`].
  pub fn row_streams(
    &self, row_passes: usize,
  ) -> Result<Vec<CommandBuffer>, EngineError> {
    (0..self.pipes)
      .map(|pipe| {
        let mut buf = CommandBuffer::new();
        self.build_rows(&mut buf, pipe, row_passes)?;
        Ok(buf)
      })
      .collect()
  }
}

/// Execute the stream of `pipe`.
///
/// # Errors
///
/// Fails when a command fails; the caller aborts the fabric.
pub fn run_stream(
  pipe: usize, stream: &CommandBuffer, ctx: &EncodeContext<'_>,
  fabric: &SyncFabric, engine: &dyn Engine, cross: &dyn CrossPipe,
) -> Result<(), EncoderError> {
  let commands = stream.commands();
  let mut pc = 0;
  while let Some(&command) = commands.get(pc) {
    trace!("pipe {}: {}", pipe, command);
    match command {
      Command::Engine(ref cmd) => engine.execute(pipe, cmd, ctx)?,
      Command::WaitSemaphore { id, value } => {
        fabric.wait(pipe, id, value)?;
      }
      Command::SignalSemaphore { id, value } => fabric.signal(pipe, id, value)?,
      Command::AcquireLock => fabric.lock()?,
      Command::ReleaseLock => fabric.unlock(),
      Command::CrossPipe(CrossPipeStep::FinishRow { row, row_pass }) => {
        cross.finish_row(ctx, row, row_pass)?;
        fabric.record(TraceEvent::RowUpdated { row, row_pass });
      }
      Command::CrossPipe(CrossPipeStep::FinishPass { pass }) => {
        cross.finish_pass(ctx, pass)?;
        fabric.record(TraceEvent::PassUpdated { pass });
      }
      Command::SkipIfRowDone { row } => {
        if ctx.row_done(row) {
          if let Some(end) = stream.row_end(row, pc) {
            pc = end;
          }
        }
      }
      Command::RowEnd { .. } => {}
    }
    pc += 1;
  }
  Ok(())
}

type PipeResult = (usize, Result<(), EncoderError>);

/// Hand the result of `pipe` to the dispatcher. Returns whether it was
/// delivered.
fn send_result(
  tx: &channel::Sender<PipeResult>, pipe: usize, res: Result<(), EncoderError>,
) -> bool {
  match tx.send((pipe, res)) {
    Ok(()) => true,
    Err(channel::SendError((_, res))) => {
      warn!("pipe {}: nobody waits for its result {:?}", pipe, res.err());
      false
    }
  }
}

/// Run the streams of all pipes concurrently on `pool` and wait for them.
///
/// A failing pipe aborts the fabric so the others stop waiting. The error
/// of the pipe that failed first in cause is returned, not the aborts it
/// triggered.
///
/// # Errors
///
/// Fails when any pipe fails.
pub fn dispatch(
  pool: &rayon::ThreadPool, streams: &[CommandBuffer], ctx: &EncodeContext<'_>,
  fabric: &SyncFabric, engines: &[Arc<dyn Engine>], cross: &dyn CrossPipe,
) -> Result<(), EncoderError> {
  if engines.len() < streams.len() {
    return Err(EngineError::NoEngine(engines.len()).into());
  }
  let (tx, rx) = channel::unbounded();
  pool.scope(|s| {
    for (pipe, (stream, engine)) in streams.iter().zip(engines).enumerate() {
      let tx = tx.clone();
      s.spawn(move |_| {
        let res = run_stream(pipe, stream, ctx, fabric, engine.as_ref(), cross);
        if res.is_err() {
          fabric.abort();
        }
        send_result(&tx, pipe, res);
      });
    }
  });
  drop(tx);

  let mut first_err = None;
  let mut reported = 0;
  for (pipe, res) in rx.iter() {
    reported += 1;
    if let Err(e) = res {
      debug!("pipe {} failed: {}", pipe, e);
      let is_abort = matches!(e, EncoderError::Sync(SyncError::Aborted(_)));
      match first_err {
        None => first_err = Some(e),
        Some(EncoderError::Sync(SyncError::Aborted(_))) if !is_abort => {
          first_err = Some(e)
        }
        _ => {}
      }
    }
  }
  if let Some(e) = first_err {
    return Err(e);
  }
  if reported < streams.len() {
    return Err(EncoderError::PipeLost(reported));
  }
  Ok(())
}
