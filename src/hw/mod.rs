// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! The hardware the encoder drives: generations, engines and the command
//! streams they execute.

mod command;
mod generation;

pub use self::command::*;
pub use self::generation::*;

use std::sync::Arc;

use thiserror::Error;

use crate::executor::EncodeContext;
use crate::rate::Firmware;
use crate::resource::ResourceAllocator;

/// Most encode engines a frame can be split across.
pub const MAX_ENGINES: usize = 4;

/// Largest frame area any generation encodes.
pub const MAX_FRAME_AREA: usize = 8192 * 8192;

/// What a hardware generation can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
  /// Encode engines available for scalable encoding.
  pub engines: usize,
  /// Largest frame area in pixels.
  pub max_frame_area: usize,
  /// The firmware can stitch tile fragments.
  pub hw_stitch: bool,
  /// Tile rows can be replayed under rate control.
  pub tile_replay: bool,
  /// The firmware computes weighted prediction parameters.
  pub weighted_prediction: bool,
  /// Passes of one tile row under tile-row replay.
  pub passes_per_tile_row: usize,
}

/// Failures reported by an engine while executing a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EngineError {
  /// The backend has no engine for the pipe.
  #[error("no engine for pipe {0}")]
  NoEngine(usize),
  /// A tile was coded without any slice.
  #[error("tile {0} has no slices")]
  TileWithoutSlices(usize),
  /// A command referred to a tile or slice the frame does not have.
  #[error("pipe {pipe} received {command} for an unknown target {target}")]
  UnknownTarget { pipe: usize, command: &'static str, target: usize },
  /// A command arrived out of order.
  #[error("pipe {pipe} received {command} before pipe-mode-select")]
  OutOfOrder { pipe: usize, command: &'static str },
  /// The engine hit a hardware fault.
  #[error("pipe {pipe} faulted with status {status:#010x}")]
  Fault { pipe: usize, status: u32 },
}

/// One encode engine. Executes the encode commands of a pipe's stream;
/// synchronization commands are handled by the executor.
pub trait Engine: Send + Sync {
  /// # Errors
  ///
  /// Fails when the command cannot be executed in the current state.
  fn execute(
    &self, pipe: usize, command: &EngineCommand, ctx: &EncodeContext<'_>,
  ) -> Result<(), EngineError>;
}

/// Everything outside the control plane: engines, firmware and memory.
pub trait Backend: Send + Sync + 'static {
  /// The engine executing the streams of `pipe`.
  fn engine(&self, pipe: usize) -> Option<Arc<dyn Engine>>;

  /// The firmware co-processor. Only the first pipe's cross-pipe steps and
  /// the host use it, one invocation at a time.
  fn firmware(&self) -> &parking_lot::Mutex<Box<dyn Firmware>>;

  fn allocator(&self) -> Arc<dyn ResourceAllocator>;
}
