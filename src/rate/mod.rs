// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Bitrate control. The decisions are taken by kernels running on the
//! firmware co-processor; this module builds their parameter blocks and
//! keeps their persistent state between frames.

pub mod dmem;
pub mod tables;
pub mod wp;

use std::collections::HashMap;
use std::fmt;

use arrayvec::ArrayVec;
use log::{debug, info, warn};
use thiserror::Error;

use crate::api::{
  FrameParams, FrameType, RateControlConfig, RateControlMode,
  MAX_REF_LIST_SIZE,
};
use crate::stats::{FrameStatistics, TileSizeRecord, TileStatistics};
use crate::stitch::CopyCommand;

use self::dmem::{BrcInitDmem, BrcUpdateDmem, Dmem, InitMode};
use self::tables::DeviationThresholds;
use self::wp::WeightEntry;

/// Firmware programs the encoder runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
  BrcInitReset,
  BrcUpdate,
  TileRowUpdate,
  PakIntegrate,
}

impl fmt::Display for Kernel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Kernel::BrcInitReset => "brc-init-reset",
      Kernel::BrcUpdate => "brc-update",
      Kernel::TileRowUpdate => "tile-row-update",
      Kernel::PakIntegrate => "pak-integrate",
    })
  }
}

/// Memory a kernel can be given access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
  History,
  TileSizeRecords,
  TileStatistics,
  FrameStatistics,
  Bitstream,
  StitchCommands,
  Histograms,
  Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
  pub kind: RegionKind,
  pub writable: bool,
}

impl Region {
  pub const fn read(kind: RegionKind) -> Self {
    Region { kind, writable: false }
  }

  pub const fn write(kind: RegionKind) -> Self {
    Region { kind, writable: true }
  }
}

/// Virtual address regions of one invocation.
pub const MAX_REGIONS: usize = 16;
pub type RegionList = ArrayVec<Region, MAX_REGIONS>;

/// Status register read back after a kernel finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HucStatus(pub u32);

impl HucStatus {
  pub const SUCCESS: HucStatus = HucStatus(0);

  pub fn is_success(self) -> bool {
    self == HucStatus::SUCCESS
  }
}

/// Failures of a firmware invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum FirmwareError {
  #[error("no kernel loaded")]
  NotLoaded,
  #[error("{kernel} started without its parameter block")]
  MissingDmem { kernel: Kernel },
  #[error("{kernel} cannot use the given parameter block")]
  WrongDmem { kernel: Kernel },
  #[error("{kernel} needs the {region:?} region")]
  MissingRegion { kernel: Kernel, region: RegionKind },
  #[error("{kernel} failed with status {status:#010x}")]
  Failed { kernel: Kernel, status: u32 },
}

/// Persistent rate-control state, owned by the firmware between frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrcHistory {
  pub initialized: bool,
  pub mode_flag: u8,
  pub frames: u64,
  /// Pipe count the state was last updated with.
  pub pipes: usize,
  pub bits_per_frame: f64,
  pub vbv_size: f64,
  pub fullness: f64,
  pub low_delay: bool,
  pub sliding_window: bool,
  /// QP for the first pass of the next frame of each type.
  pub qp: [u8; 3],
  pub min_qp: u8,
  pub max_qp: u8,
  pub icq_quality: u8,
  pub deviation: DeviationThresholds,
  pub total_bytes: u64,
}

impl BrcHistory {
  pub fn qp_for(&self, frame_type: FrameType) -> u8 {
    self.qp[frame_type as usize]
  }
}

/// Decisions returned by a rate-control kernel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrcOutput {
  /// QP of the next pass, or of pass 0 after init/reset.
  pub qp: u8,
  pub qp_delta: i8,
  pub accepted: bool,
  pub panic: bool,
  /// The next pass only needs to re-run entropy coding.
  pub pak_only: bool,
  /// Frame size target the decision was made against, in bytes.
  pub target_size: u32,
  pub weights: ArrayVec<WeightEntry, MAX_REF_LIST_SIZE>,
}

/// The memory attached to the regions of one invocation.
#[derive(Default)]
pub struct HucMemory<'a> {
  pub history: Option<&'a mut BrcHistory>,
  pub records: Option<&'a [TileSizeRecord]>,
  pub tile_stats: Option<&'a [TileStatistics]>,
  pub frame_stats: Option<&'a mut FrameStatistics>,
  pub bitstream: Option<&'a mut [u8]>,
  pub stitch: Option<&'a [CopyCommand]>,
  pub histograms: Option<&'a [u8]>,
  pub output: Option<&'a mut BrcOutput>,
}

impl HucMemory<'_> {
  pub fn has(&self, kind: RegionKind) -> bool {
    match kind {
      RegionKind::History => self.history.is_some(),
      RegionKind::TileSizeRecords => self.records.is_some(),
      RegionKind::TileStatistics => self.tile_stats.is_some(),
      RegionKind::FrameStatistics => self.frame_stats.is_some(),
      RegionKind::Bitstream => self.bitstream.is_some(),
      RegionKind::StitchCommands => self.stitch.is_some(),
      RegionKind::Histograms => self.histograms.is_some(),
      RegionKind::Output => self.output.is_some(),
    }
  }
}

/// The firmware co-processor.
pub trait Firmware: Send {
  /// # Errors
  ///
  /// Fails when the kernel image cannot be loaded.
  fn load(&mut self, kernel: Kernel) -> Result<(), FirmwareError>;

  /// # Errors
  ///
  /// Fails when the list does not suit the loaded kernel.
  fn set_regions(&mut self, regions: RegionList) -> Result<(), FirmwareError>;

  /// # Errors
  ///
  /// Fails when the parameter block does not suit the loaded kernel.
  fn set_dmem(&mut self, dmem: Dmem) -> Result<(), FirmwareError>;

  /// Run the loaded kernel to completion.
  ///
  /// # Errors
  ///
  /// Fails when the kernel cannot start; a kernel that ran reports
  /// problems through the status.
  fn start_and_wait(
    &mut self, memory: &mut HucMemory<'_>,
  ) -> Result<HucStatus, FirmwareError>;
}

/// Load, configure and run one kernel.
///
/// # Errors
///
/// Fails when any step fails or the kernel reports a failure status.
pub fn invoke(
  firmware: &mut dyn Firmware, kernel: Kernel, regions: RegionList, dmem: Dmem,
  memory: &mut HucMemory<'_>,
) -> Result<HucStatus, FirmwareError> {
  firmware.load(kernel)?;
  firmware.set_regions(regions)?;
  firmware.set_dmem(dmem)?;
  let status = firmware.start_and_wait(memory)?;
  if !status.is_success() {
    return Err(FirmwareError::Failed { kernel, status: status.0 });
  }
  Ok(status)
}

/// Host side of the rate control.
///
/// The persistent state is kept per pipe count. When the pipe count
/// changes the state is re-hooked: the data gathered under the old count is
/// moved over to the new one.
#[derive(Debug)]
pub struct RateControl {
  config: RateControlConfig,
  width: usize,
  height: usize,
  histories: HashMap<usize, BrcHistory>,
  pipes: usize,
}

impl RateControl {
  pub fn new(config: RateControlConfig, width: usize, height: usize) -> Self {
    RateControl { config, width, height, histories: HashMap::new(), pipes: 0 }
  }

  pub fn is_active(&self) -> bool {
    self.config.mode.uses_brc()
  }

  pub fn config(&self) -> &RateControlConfig {
    &self.config
  }

  pub fn pipes(&self) -> usize {
    self.pipes
  }

  /// State for the current pipe count.
  pub fn history(&self) -> Option<&BrcHistory> {
    self.histories.get(&self.pipes)
  }

  /// Switch to `pipes` pipes, carrying the state over. Returns whether the
  /// count changed.
  pub fn rehook(&mut self, pipes: usize) -> bool {
    if pipes == self.pipes {
      return false;
    }
    if let Some(mut history) = self.histories.remove(&self.pipes) {
      info!(
        "re-hooking rate control from {} to {} pipes after {} frames",
        self.pipes, pipes, history.frames
      );
      history.pipes = pipes;
      self.histories.insert(pipes, history);
    }
    self.pipes = pipes;
    true
  }

  fn init_mode(&self, frame: &FrameParams) -> InitMode {
    match self.history() {
      Some(h) if h.initialized => {
        if frame.brc_reset && self.config.mode != RateControlMode::Icq {
          InitMode::Reset
        } else {
          if frame.brc_reset {
            warn!("rate control reset requested in ICQ mode, ignoring");
          }
          InitMode::Refresh
        }
      }
      _ => InitMode::Init,
    }
  }

  /// Run the init/reset kernel before pass 0 of a frame. Returns the QP of
  /// pass 0.
  ///
  /// # Errors
  ///
  /// Fails when the firmware rejects the invocation.
  pub fn start_frame(
    &mut self, firmware: &mut dyn Firmware, frame_number: u64,
    frame: &FrameParams,
  ) -> Result<u8, FirmwareError> {
    if !self.is_active() {
      if frame.brc_reset {
        warn!("rate control reset requested in constant QP mode, ignoring");
      }
      return Ok(self.config.qp);
    }

    let mode = self.init_mode(frame);
    let mut dmem = BrcInitDmem::new(
      mode,
      &self.config,
      &self.config.tables,
      self.width,
      self.height,
      self.pipes,
      frame.frame_type,
    );
    dmem.frame_number = frame_number;
    debug!("frame {}: rate control {:?}", frame_number, mode);

    let history = self.histories.entry(self.pipes).or_default();
    let mut output = BrcOutput::default();
    let mut memory = HucMemory {
      history: Some(history),
      output: Some(&mut output),
      ..Default::default()
    };
    let regions = [Region::write(RegionKind::History), Region::write(RegionKind::Output)]
      .into_iter()
      .collect();
    invoke(
      firmware,
      Kernel::BrcInitReset,
      regions,
      Dmem::BrcInit(dmem),
      &mut memory,
    )?;
    Ok(output.qp)
  }

  /// Run the frame-level or, with a row scope, the tile-row update kernel.
  ///
  /// # Errors
  ///
  /// Fails when the firmware rejects the invocation.
  pub fn update(
    &mut self, firmware: &mut dyn Firmware, dmem: BrcUpdateDmem,
    stats: &FrameStatistics, histograms: Option<&[u8]>,
  ) -> Result<BrcOutput, FirmwareError> {
    let kernel = if dmem.row.is_some() {
      Kernel::TileRowUpdate
    } else {
      Kernel::BrcUpdate
    };
    let mut stats = stats.clone();
    let mut output = BrcOutput::default();
    let history = self.histories.entry(self.pipes).or_default();

    let mut regions: RegionList = [
      Region::write(RegionKind::History),
      Region::read(RegionKind::FrameStatistics),
      Region::write(RegionKind::Output),
    ]
    .into_iter()
    .collect();
    if histograms.is_some() {
      regions.push(Region::read(RegionKind::Histograms));
    }
    let mut memory = HucMemory {
      history: Some(history),
      frame_stats: Some(&mut stats),
      histograms,
      output: Some(&mut output),
      ..Default::default()
    };
    invoke(firmware, kernel, regions, Dmem::BrcUpdate(dmem), &mut memory)?;
    Ok(output)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn rehook_carries_state_over() {
    let mut rc = RateControl::new(RateControlConfig::default(), 1920, 1080);
    assert!(rc.rehook(2));
    rc.histories.insert(
      2,
      BrcHistory {
        initialized: true,
        frames: 12,
        fullness: 1234.,
        pipes: 2,
        ..Default::default()
      },
    );
    assert!(!rc.rehook(2));
    assert!(rc.rehook(1));
    let history = rc.history().unwrap();
    assert_eq!(history.frames, 12);
    assert_eq!(history.fullness, 1234.);
    assert_eq!(history.pipes, 1);
    assert!(!rc.histories.contains_key(&2));
  }

  #[test]
  fn reset_is_ignored_in_icq() {
    let config = RateControlConfig::new().with_mode(RateControlMode::Icq);
    let mut rc = RateControl::new(config, 1920, 1080);
    rc.rehook(1);
    let frame = FrameParams::new(0, FrameType::I).with_brc_reset();
    assert_eq!(rc.init_mode(&frame), InitMode::Init);
    rc.histories.insert(1, BrcHistory { initialized: true, ..Default::default() });
    assert_eq!(rc.init_mode(&frame), InitMode::Refresh);

    let config = RateControlConfig::new()
      .with_mode(RateControlMode::Cbr)
      .with_bitrate(1_000_000, 0)
      .with_vbv(1_000_000, 0);
    rc.config = config;
    assert_eq!(rc.init_mode(&frame), InitMode::Reset);
    assert_eq!(
      rc.init_mode(&FrameParams::new(1, FrameType::P)),
      InitMode::Refresh
    );
  }

  #[test]
  fn status_codes() {
    assert!(HucStatus::SUCCESS.is_success());
    assert!(!HucStatus(0x8000_0001).is_success());
  }
}
