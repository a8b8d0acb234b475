// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Parameter blocks of the rate-control kernels.

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::api::{
  AcceptancePolicy, FrameSizeTolerance, FrameType, Rational, RateControlConfig,
  RateControlMode, MAX_REF_LIST_SIZE,
};
use crate::rate::tables::{
  BrcTables, DeviationThresholds, NUM_EST_RATE_THRESHOLDS,
  NUM_INST_RATE_THRESHOLDS,
};
use crate::stats::PakIntegrateDmem;
use crate::util::clamp;

/// IP averaging coefficient outside low delay.
pub const IP_AVERAGE_COEFF: u8 = 64;

/// Rate-control flavour in the init parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BrcFlag {
  /// Constant QP and ICQ.
  Cqp = 0,
  Cbr = 1,
  Vbr = 2,
  Vcm = 3,
  LowDelay = 4,
}

impl BrcFlag {
  pub fn new(mode: RateControlMode, tolerance: FrameSizeTolerance) -> Self {
    if tolerance == FrameSizeTolerance::ExtremelyLow {
      return BrcFlag::LowDelay;
    }
    match mode {
      RateControlMode::Cqp | RateControlMode::Icq => BrcFlag::Cqp,
      RateControlMode::Cbr => BrcFlag::Cbr,
      RateControlMode::Vbr | RateControlMode::Qvbr => BrcFlag::Vbr,
      RateControlMode::Vcm => BrcFlag::Vcm,
    }
  }
}

/// What the init/reset kernel does with the persistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
  /// First frame: build the state from scratch.
  Init,
  /// The caller asked for a reset: restart the buffer model.
  Reset,
  /// Reload the parameters and keep the buffer model.
  Refresh,
}

bitflags! {
  /// Work requested from the frame-level update kernel.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct OpMode: u8 {
    const BRC = 0x1;
    const WEIGHTED_PREDICTION = 0x2;
    const TILE_REPLAY = 0x8;
  }
}

impl OpMode {
  /// Weighted prediction never runs on pass 0.
  pub fn for_pass(pass: usize, wp: bool, tile_replay: bool) -> Self {
    let mut mode = OpMode::BRC;
    if wp && pass > 0 {
      mode |= OpMode::WEIGHTED_PREDICTION;
    }
    if tile_replay {
      mode |= OpMode::TILE_REPLAY;
    }
    mode
  }
}

/// Initial QPs for intra/P frames and B frames.
///
/// Derived from the ratio of the raw frame size to the bits available per
/// frame, adjusted for the GOP structure.
pub fn initial_qp(
  width: usize, height: usize, rc: &RateControlConfig,
) -> (u8, u8) {
  let (min_qp, max_qp) = rc.qp_range();
  let (min_qp, max_qp) = (i32::from(min_qp), i32::from(max_qp));
  if rc.bitrate == 0 || rc.frame_rate.den == 0 {
    let qp = clamp(i32::from(rc.icq_quality), min_qp, max_qp) as u8;
    return (qp, qp);
  }

  let (x0, y0, x1, y1) = (0.0f64, 1.19f64, 1.75f64, 1.75f64);
  let frame_size = (width * height * 3 / 2) as f64;
  let fps = rc.frame_rate.as_f64();
  let bits_ratio = frame_size * 2. / 3. * fps / rc.bitrate as f64;
  let mut qp_ip = (1. / 1.2
    * 10f64.powf((bits_ratio.log10() - x0) * (y1 - y0) / (x1 - x0) + y0)
    + 0.5) as i32;
  qp_ip += 2;

  let gop = rc.gop_size.max(1) as i32;
  let gop_p = if rc.gop_ref_dist > 0 {
    (gop - 1) / rc.gop_ref_dist as i32
  } else {
    0
  };
  let gop_b = gop - 1 - gop_p;
  let gop_size = 1 + gop_p + gop_b;
  if gop_size == 1 {
    qp_ip += 12;
  } else if gop_size < 15 {
    qp_ip += (14 - gop_size) >> 1;
  }

  qp_ip = clamp(qp_ip, min_qp, max_qp) - 1;
  if qp_ip < 0 {
    qp_ip = 1;
  }
  let mut qp_b = clamp(((qp_ip + qp_ip) * 563 >> 10) + 1, min_qp, max_qp);

  let bias = if gop_size > 300 { 8 } else { 2 };
  qp_ip = clamp(qp_ip - bias, min_qp, max_qp);
  qp_b = clamp(qp_b - bias, min_qp, max_qp);
  (qp_ip as u8, qp_b as u8)
}

/// Parameters of the init/reset kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct BrcInitDmem {
  pub frame_number: u64,
  pub mode: InitMode,
  pub brc_flag: BrcFlag,
  pub target_bitrate: u64,
  pub max_bitrate: u64,
  pub vbv_size: u64,
  pub vbv_initial_fullness: u64,
  pub frame_rate: Rational,
  pub width: usize,
  pub height: usize,
  pub gop_size: u32,
  pub gop_ref_dist: u32,
  pub min_qp: u8,
  pub max_qp: u8,
  pub icq_quality: u8,
  /// 3 enables CU level QP adjustment.
  pub cu_qp_ctrl: u8,
  pub init_qp_ip: u8,
  pub init_qp_b: u8,
  pub low_delay: bool,
  pub sliding_window: bool,
  pub ip_average_coeff: u8,
  pub deviation: DeviationThresholds,
  pub est_rate_thresh_p: [u8; NUM_EST_RATE_THRESHOLDS],
  pub est_rate_thresh_b: [u8; NUM_EST_RATE_THRESHOLDS],
  pub est_rate_thresh_i: [u8; NUM_EST_RATE_THRESHOLDS],
  pub inst_rate_thresh_p: [i8; NUM_INST_RATE_THRESHOLDS],
  pub inst_rate_thresh_b: [i8; NUM_INST_RATE_THRESHOLDS],
  pub inst_rate_thresh_i: [i8; NUM_INST_RATE_THRESHOLDS],
  /// Pipes coding the frame.
  pub pipes: usize,
  /// Coding type of the frame about to be coded.
  pub frame_type: FrameType,
}

impl BrcInitDmem {
  pub fn new(
    mode: InitMode, rc: &RateControlConfig, tables: &BrcTables, width: usize,
    height: usize, pipes: usize, frame_type: FrameType,
  ) -> Self {
    let (min_qp, max_qp) = rc.qp_range();
    let low_delay = rc.tolerance == FrameSizeTolerance::ExtremelyLow;
    let max_bitrate = rc.peak_bitrate();
    let bits_per_frame = if rc.frame_rate.num > 0 {
      max_bitrate as f64 / rc.frame_rate.as_f64()
    } else {
      0.
    };
    let (init_qp_ip, init_qp_b) = initial_qp(width, height, rc);
    BrcInitDmem {
      frame_number: 0,
      mode,
      brc_flag: BrcFlag::new(rc.mode, rc.tolerance),
      target_bitrate: rc.bitrate,
      max_bitrate,
      vbv_size: rc.vbv_buffer_size,
      vbv_initial_fullness: rc.initial_fullness().min(rc.vbv_buffer_size),
      frame_rate: rc.frame_rate,
      width,
      height,
      gop_size: rc.gop_size,
      gop_ref_dist: rc.gop_ref_dist,
      min_qp,
      max_qp,
      icq_quality: rc.icq_quality,
      cu_qp_ctrl: 3,
      init_qp_ip,
      init_qp_b,
      low_delay,
      sliding_window: rc.tolerance == FrameSizeTolerance::Low,
      ip_average_coeff: if low_delay { 0 } else { IP_AVERAGE_COEFF },
      deviation: tables.deviation_thresholds(
        low_delay,
        bits_per_frame,
        rc.vbv_buffer_size,
      ),
      est_rate_thresh_p: tables.est_rate_thresh_p,
      est_rate_thresh_b: tables.est_rate_thresh_b,
      est_rate_thresh_i: tables.est_rate_thresh_i,
      inst_rate_thresh_p: tables.inst_rate_thresh_p,
      inst_rate_thresh_b: tables.inst_rate_thresh_b,
      inst_rate_thresh_i: tables.inst_rate_thresh_i,
      pipes,
      frame_type,
    }
  }
}

/// Tile row handled by a tile-row update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowScope {
  pub row: usize,
  pub row_pass: usize,
  pub max_row_passes: usize,
  pub first_tile: usize,
  pub last_tile: usize,
  pub first_lcu: usize,
  pub lcus: usize,
}

/// Parameters of the frame-level and tile-row update kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct BrcUpdateDmem {
  pub frame_number: u64,
  pub poc: i32,
  pub frame_type: FrameType,
  pub pass: usize,
  pub max_passes: usize,
  pub op_mode: OpMode,
  /// QP the pass was coded with.
  pub qp: u8,
  /// Frame size target in bytes, 0 lets the firmware derive it.
  pub target_size: u32,
  /// Offset of the current frame's histogram in the weight ring.
  pub weight_offset: u32,
  /// POCs of the references, list 0 first.
  pub ref_pocs: ArrayVec<i32, MAX_REF_LIST_SIZE>,
  /// Histogram offsets of the references, in the order of `ref_pocs`.
  pub ref_weight_offsets: ArrayVec<u32, MAX_REF_LIST_SIZE>,
  pub acceptance: AcceptancePolicy,
  pub row: Option<RowScope>,
  /// LCUs of the frame, for scaling a row target.
  pub frame_lcus: usize,
}

/// Parameter block of any kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum Dmem {
  BrcInit(BrcInitDmem),
  BrcUpdate(BrcUpdateDmem),
  PakIntegrate(PakIntegrateDmem),
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn op_mode_bits() {
    assert_eq!(OpMode::for_pass(0, true, false), OpMode::BRC);
    assert_eq!(OpMode::for_pass(1, true, false).bits(), 0x3);
    assert_eq!(OpMode::for_pass(0, false, true).bits(), 0x9);
  }

  #[test]
  fn brc_flags() {
    use FrameSizeTolerance::*;
    use RateControlMode::*;
    assert_eq!(BrcFlag::new(Icq, Normal), BrcFlag::Cqp);
    assert_eq!(BrcFlag::new(Cbr, Normal), BrcFlag::Cbr);
    assert_eq!(BrcFlag::new(Qvbr, Low), BrcFlag::Vbr);
    assert_eq!(BrcFlag::new(Vcm, Normal), BrcFlag::Vcm);
    assert_eq!(BrcFlag::new(Vbr, ExtremelyLow), BrcFlag::LowDelay);
  }

  #[test]
  fn initial_qp_follows_bit_budget() {
    let rc = RateControlConfig::new()
      .with_mode(RateControlMode::Cbr)
      .with_bitrate(4_000_000, 0)
      .with_vbv(4_000_000, 0);
    let (rich_ip, rich_b) = initial_qp(1920, 1080, &rc.with_bitrate(40_000_000, 0));
    let (poor_ip, poor_b) = initial_qp(1920, 1080, &rc.with_bitrate(400_000, 0));
    assert!(rich_ip < poor_ip);
    assert!(rich_b <= poor_b);
    let (ip, b) = initial_qp(1920, 1080, &rc);
    assert!((10..=51).contains(&ip));
    assert!(b >= ip);
  }

  #[test]
  fn low_delay_init_block() {
    let rc = RateControlConfig::new()
      .with_mode(RateControlMode::Cbr)
      .with_bitrate(4_000_000, 0)
      .with_vbv(4_000_000, 0)
      .with_tolerance(FrameSizeTolerance::ExtremelyLow);
    let dmem = BrcInitDmem::new(
      InitMode::Init,
      &rc,
      &BrcTables::DEFAULT,
      1920,
      1080,
      2,
      FrameType::I,
    );
    assert_eq!(dmem.brc_flag, BrcFlag::LowDelay);
    assert_eq!(dmem.ip_average_coeff, 0);
    assert_eq!(dmem.deviation.pb, BrcTables::DEFAULT.low_delay_dev_thresh_pb);
    assert_eq!(dmem.vbv_initial_fullness, 2_000_000);
  }
}
