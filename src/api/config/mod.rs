// Copyright (c) 2020-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use thiserror::Error;

use std::time::Duration;

use crate::api::status::EncoderError;
use crate::encoder::pipe::decide_pipe_count;
use crate::encoder::Encoder;
use crate::hw::{Backend, Capabilities, GenerationKind, MAX_ENGINES};
use crate::stitch::select_strategy;
use crate::sync::DEFAULT_WATCHDOG;
use crate::tiling::{cbr_reserve, TileGrid, MAX_TILE_COLS, MAX_TILE_ROWS};

mod encoder;
pub use encoder::*;

mod rate;
pub use rate::*;

/// Enumeration of possible invalid configuration errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum InvalidConfig {
  /// The width is invalid.
  #[error("invalid width {0} (expected >= 16, <= 16384)")]
  InvalidWidth(usize),
  /// The height is invalid.
  #[error("invalid height {0} (expected >= 16, <= 16384)")]
  InvalidHeight(usize),
  /// The frame is larger than the hardware can code.
  #[error("resolution {width}x{height} exceeds the limit of {max_area} pixels")]
  ResolutionExceedsLimit {
    /// Frame width.
    width: usize,
    /// Frame height.
    height: usize,
    /// Largest frame area supported.
    max_area: usize,
  },
  /// The LCU size is invalid.
  #[error("invalid LCU size log2 {0} (expected >= 4, <= 6)")]
  InvalidLcuSize(usize),
  /// The minimum coding block size is invalid.
  #[error("invalid minimum coding block size log2 {0}")]
  InvalidMinCbSize(usize),
  /// Tile columns is invalid.
  #[error("invalid tile cols {actual} (expected >= 1, <= {max})")]
  InvalidTileCols {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// Tile rows is invalid.
  #[error("invalid tile rows {actual} (expected >= 1, <= {max})")]
  InvalidTileRows {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// More tiles than the minimum tile size allows.
  #[error("{actual} tiles exceed the maximum of {max} for this resolution")]
  TooManyTiles {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// Explicit tile sizes are zero or do not cover the frame.
  #[error("explicit tile sizes do not add up to the frame")]
  InvalidTileSpacing,
  /// A single engine cannot code a grid with several rows and columns.
  #[error("{cols}x{rows} tile grid needs more than one engine")]
  GridUnsupportedOnSingleEngine {
    /// Tile columns.
    cols: usize,
    /// Tile rows.
    rows: usize,
  },
  /// Streaming buffer output needs a pipe for every tile column.
  #[error("streaming buffer needs {cols} pipes but only {engines} engines exist")]
  StreamingBufferIncompatible {
    /// Tile columns.
    cols: usize,
    /// Available engines.
    engines: usize,
  },
  /// The engine count override is invalid.
  #[error("invalid engine count {actual} (expected >= 1, <= {max})")]
  InvalidEngineCount {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// A slice has no LCUs or starts outside the frame.
  #[error("slice {0} is empty or outside the frame")]
  InvalidSlice(usize),
  /// A tile has no slice.
  #[error("tile {0} has no slice")]
  TileWithoutSlice(usize),
  /// A tile of a multi-tile frame has more than one slice.
  #[error("tile {0} has more than one slice")]
  MultipleSlicesPerTile(usize),
  /// A slice is not contained in a single tile.
  #[error("slice {0} crosses a tile boundary")]
  SliceCrossesTiles(usize),
  /// The slices of a tile leave some of its LCUs uncoded.
  #[error("slices do not cover tile {0}")]
  TileNotCovered(usize),
  /// Maximum pass count is invalid.
  #[error("invalid max passes {actual} (expected >= 1, <= {max})")]
  InvalidMaxPasses {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// A pass index past the pass count was requested.
  #[error("pass {pass} out of range (max passes {max})")]
  PassIndexOutOfRange {
    /// The requested pass.
    pass: usize,
    /// The pass count.
    max: usize,
  },
  /// A pipe index past the pipe count was requested.
  #[error("pipe {pipe} out of range ({pipes} pipes)")]
  PipeIndexOutOfRange {
    /// The requested pipe.
    pipe: usize,
    /// The pipe count.
    pipes: usize,
  },
  /// Framerate numerator is invalid.
  #[error("invalid framerate numerator {0} (expected > 0)")]
  InvalidFrameRateNum(u64),
  /// Framerate denominator is invalid.
  #[error("invalid framerate denominator {0} (expected > 0)")]
  InvalidFrameRateDen(u64),
  /// The rate control needs a target bitrate in order to produce results
  #[error("The rate control requires a target bitrate")]
  TargetBitrateNeeded,
  /// The peak bitrate is below the target bitrate.
  #[error("peak bitrate {max} below target bitrate {target}")]
  InvalidMaxBitrate {
    /// Target bitrate.
    target: u64,
    /// Peak bitrate.
    max: u64,
  },
  /// Bitrate control without a VBV buffer.
  #[error("VBV buffer size must be non-zero under bitrate control")]
  VbvBufferSizeZero,
  /// The constant QP is out of range.
  #[error("invalid qp {0} (expected <= 51)")]
  InvalidQp(u8),
  /// The QP range is empty after clamping.
  #[error("invalid qp range {min}..={max}")]
  InvalidQpRange {
    /// Clamped minimum.
    min: u8,
    /// Clamped maximum.
    max: u8,
  },
  /// The acceptance policy thresholds are inconsistent.
  #[error("invalid acceptance policy")]
  InvalidAcceptancePolicy,
  /// The CBR reserve does not fit in the bitstream buffer.
  #[error("CBR reserve of {reserve} bytes exceeds the {buffer} byte bitstream buffer")]
  CbrReserveExceedsBuffer {
    /// Reserved bytes.
    reserve: usize,
    /// Bitstream buffer size.
    buffer: usize,
  },
  /// Content protected output cannot be stitched on the host.
  #[error("content protected output needs firmware stitching")]
  HostStitchForbidden,
}

/// Contains the encoder configuration.
#[derive(Clone, Debug)]
pub struct Config {
  /// Settings which impact the frame layout.
  pub(crate) enc: EncoderConfig,
  /// Rate control configuration
  pub(crate) rate_control: RateControlConfig,
  /// Hardware generation driven by the encoder.
  pub(crate) generation: GenerationKind,
  /// Number of encode engines, 0 for all the generation provides.
  pub(crate) engines: usize,
  /// Bound on every semaphore wait.
  pub(crate) watchdog: Duration,
  /// Record a synchronization trace.
  pub(crate) trace_sync: bool,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      enc: EncoderConfig::default(),
      rate_control: RateControlConfig::default(),
      generation: GenerationKind::default(),
      engines: 0,
      watchdog: DEFAULT_WATCHDOG,
      trace_sync: false,
    }
  }
}

impl Config {
  /// Create a default configuration
  ///
  /// same as `Default::default()`
  pub fn new() -> Self {
    Config::default()
  }

  /// Set the encoder configuration
  ///
  /// `EncoderConfig` contains the frame size, the tile grid and the
  /// engine features.
  pub fn with_encoder_config(mut self, enc: EncoderConfig) -> Self {
    self.enc = enc;
    self
  }

  /// Set the rate control configuration
  ///
  /// The default configuration is constant QP
  pub const fn with_rate_control(
    mut self, rate_control: RateControlConfig,
  ) -> Self {
    self.rate_control = rate_control;
    self
  }

  /// Select the hardware generation
  pub const fn with_generation(mut self, generation: GenerationKind) -> Self {
    self.generation = generation;
    self
  }

  /// Limit the number of encode engines
  ///
  /// If it is left unset, every engine of the generation is used.
  pub const fn with_engines(mut self, engines: usize) -> Self {
    self.engines = engines;
    self
  }

  /// Bound every semaphore wait
  pub const fn with_watchdog(mut self, watchdog: Duration) -> Self {
    self.watchdog = watchdog;
    self
  }

  /// Keep an ordered log of the synchronization events of every frame
  pub const fn with_sync_trace(mut self, trace: bool) -> Self {
    self.trace_sync = trace;
    self
  }

  /// The encoder configuration.
  pub fn encoder_config(&self) -> &EncoderConfig {
    &self.enc
  }

  /// The rate control configuration.
  pub fn rate_control(&self) -> &RateControlConfig {
    &self.rate_control
  }

  /// The selected hardware generation.
  pub fn generation(&self) -> GenerationKind {
    self.generation
  }

  /// Capabilities of the selected generation.
  pub fn capabilities(&self) -> Capabilities {
    self.generation.capabilities()
  }

  /// Number of engines the encoder may use.
  pub fn engine_count(&self) -> usize {
    match self.engines {
      0 => self.capabilities().engines,
      n => n,
    }
  }

  /// Whether tile rows are replayed under rate control.
  pub fn tile_replay_active(&self) -> bool {
    self.enc.tile_replay
      && self.capabilities().tile_replay
      && self.rate_control.mode.uses_brc()
  }

  /// Whether weighted prediction statistics feed the rate control.
  pub fn weighted_prediction_active(&self) -> bool {
    self.enc.weighted_prediction
      && self.capabilities().weighted_prediction
      && self.rate_control.mode.uses_brc()
      && !self.tile_replay_active()
  }

  /// Bytes of the bitstream buffer available to the tiles.
  ///
  /// # Errors
  ///
  /// Fails when the CBR reserve cannot be computed or does not fit.
  pub fn bitstream_active_size(&self) -> Result<usize, InvalidConfig> {
    let buffer = self.enc.bitstream_upper_bound();
    if self.rate_control.mode == RateControlMode::Cbr {
      let reserve = cbr_reserve(
        self.rate_control.bitrate,
        self.rate_control.frame_rate,
        buffer,
      )?;
      Ok(buffer - reserve)
    } else {
      Ok(buffer)
    }
  }

  /// Build the tile grid described by the configuration.
  ///
  /// # Errors
  ///
  /// Fails when the grid is invalid for the frame size.
  pub fn tile_grid(&self) -> Result<TileGrid, InvalidConfig> {
    TileGrid::new(
      self.enc.geometry(),
      self.enc.tile_cols,
      self.enc.tile_rows,
      &self.enc.tile_spacing,
      self.bitstream_active_size()?,
    )
  }

  /// Creates an encoder driving the given backend.
  ///
  /// # Errors
  ///
  /// Returns `InvalidConfig` if the config is invalid, or a resource error
  /// if the backend cannot provide the encoder's buffers.
  pub fn new_encoder<B: Backend>(
    &self, backend: B,
  ) -> Result<Encoder, EncoderError> {
    Encoder::new(self.clone(), backend)
  }

  /// Validates the configuration.
  ///
  /// # Errors
  ///
  /// Returns the first problem found.
  pub fn validate(&self) -> Result<(), InvalidConfig> {
    use InvalidConfig::*;

    let config = &self.enc;
    let caps = self.capabilities();

    if config.width < 16 || config.width > 16384 {
      return Err(InvalidWidth(config.width));
    }
    if config.height < 16 || config.height > 16384 {
      return Err(InvalidHeight(config.height));
    }
    if config.width * config.height > caps.max_frame_area {
      return Err(ResolutionExceedsLimit {
        width: config.width,
        height: config.height,
        max_area: caps.max_frame_area,
      });
    }
    if config.lcu_size_log2 < MIN_LCU_SIZE_LOG2
      || config.lcu_size_log2 > MAX_LCU_SIZE_LOG2
    {
      return Err(InvalidLcuSize(config.lcu_size_log2));
    }
    if config.min_cb_size_log2 < MIN_CB_SIZE_LOG2
      || config.min_cb_size_log2 > config.lcu_size_log2
    {
      return Err(InvalidMinCbSize(config.min_cb_size_log2));
    }
    if config.tile_cols == 0 || config.tile_cols > MAX_TILE_COLS {
      return Err(InvalidTileCols {
        actual: config.tile_cols,
        max: MAX_TILE_COLS,
      });
    }
    if config.tile_rows == 0 || config.tile_rows > MAX_TILE_ROWS {
      return Err(InvalidTileRows {
        actual: config.tile_rows,
        max: MAX_TILE_ROWS,
      });
    }

    let max_engines = caps.engines.min(MAX_ENGINES);
    if self.engines > max_engines {
      return Err(InvalidEngineCount { actual: self.engines, max: max_engines });
    }

    let rc = &self.rate_control;
    if rc.frame_rate.num == 0 {
      return Err(InvalidFrameRateNum(rc.frame_rate.num));
    }
    if rc.frame_rate.den == 0 {
      return Err(InvalidFrameRateDen(rc.frame_rate.den));
    }
    if rc.mode.uses_brc() {
      if rc.max_passes == 0 || rc.max_passes > MAX_PASSES {
        return Err(InvalidMaxPasses { actual: rc.max_passes, max: MAX_PASSES });
      }
      if rc.mode.is_bitrate_based() {
        if rc.bitrate == 0 {
          return Err(TargetBitrateNeeded);
        }
        if rc.peak_bitrate() < rc.bitrate {
          return Err(InvalidMaxBitrate {
            target: rc.bitrate,
            max: rc.max_bitrate,
          });
        }
        if rc.vbv_buffer_size == 0 {
          return Err(VbvBufferSizeZero);
        }
      }
      let (min, max) = rc.qp_range();
      if min > max {
        return Err(InvalidQpRange { min, max });
      }
      if !rc.acceptance.is_valid() {
        return Err(InvalidAcceptancePolicy);
      }
    } else if rc.qp > MAX_QP {
      return Err(InvalidQp(rc.qp));
    }

    let grid = self.tile_grid()?;
    let pipes = decide_pipe_count(
      config.tile_cols,
      config.tile_rows,
      self.engine_count(),
      config.streaming_buffer,
    )?;
    select_strategy(
      &caps,
      config,
      grid.tile_count(),
      pipes,
      self.tile_replay_active(),
    )?;

    Ok(())
  }
}
