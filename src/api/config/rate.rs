// Copyright (c) 2020-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use arg_enum_proc_macro::ArgEnum;
use num_derive::FromPrimitive;

use crate::api::Rational;
use crate::rate::tables::BrcTables;
use crate::serialize::{Deserialize, Serialize};

/// Smallest QP the rate control may pick.
pub const MIN_BRC_QP: u8 = 10;
/// Largest QP allowed by HEVC.
pub const MAX_QP: u8 = 51;
/// Upper bound on the number of passes per frame.
pub const MAX_PASSES: usize = 8;
/// Passes used by the bitrate control when nothing else is configured.
pub const DEFAULT_BRC_PASSES: usize = 2;

/// Bitrate control algorithm run by the firmware.
#[derive(
  ArgEnum, Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, Serialize, Deserialize,
)]
#[repr(C)]
pub enum RateControlMode {
  /// Constant QP, no firmware rate control.
  Cqp,
  /// Constant bitrate.
  Cbr,
  /// Variable bitrate.
  Vbr,
  /// Intelligent constant quality.
  Icq,
  /// Video conferencing mode.
  Vcm,
  /// Quality defined variable bitrate.
  Qvbr,
}

impl Default for RateControlMode {
  fn default() -> Self {
    RateControlMode::Cqp
  }
}

impl RateControlMode {
  /// Whether the firmware rate-control kernels run for this mode.
  pub const fn uses_brc(self) -> bool {
    !matches!(self, RateControlMode::Cqp)
  }

  /// Whether the mode is driven by a target bitrate and a VBV buffer.
  pub const fn is_bitrate_based(self) -> bool {
    !matches!(self, RateControlMode::Cqp | RateControlMode::Icq)
  }
}

/// How strictly frame sizes must follow the target.
#[derive(
  ArgEnum, Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, Serialize, Deserialize,
)]
#[repr(C)]
pub enum FrameSizeTolerance {
  /// Default behaviour.
  Normal,
  /// Sliding window rate control.
  Low,
  /// Low delay rate control; frames may not exceed their budget.
  ExtremelyLow,
}

impl Default for FrameSizeTolerance {
  fn default() -> Self {
    FrameSizeTolerance::Normal
  }
}

/// Decides whether a pass is good enough to keep.
///
/// Deviations are percentages of the frame target.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcceptancePolicy {
  /// A frame this much smaller than its target is still accepted.
  pub undershoot_pct: f64,
  /// A frame this much larger than its target is still accepted.
  pub overshoot_pct: f64,
  /// A final pass this much larger than its target raises the panic flag.
  pub panic_pct: f64,
}

impl Default for AcceptancePolicy {
  fn default() -> Self {
    AcceptancePolicy { undershoot_pct: 30.0, overshoot_pct: 15.0, panic_pct: 100.0 }
  }
}

impl AcceptancePolicy {
  /// Whether a deviation (in percent, positive means too large) is accepted.
  pub fn accepts(&self, deviation_pct: f64) -> bool {
    deviation_pct >= -self.undershoot_pct && deviation_pct <= self.overshoot_pct
  }

  /// Whether a deviation on the final pass must raise the panic flag.
  pub fn panics(&self, deviation_pct: f64) -> bool {
    deviation_pct > self.panic_pct
  }

  pub(crate) fn is_valid(&self) -> bool {
    self.undershoot_pct >= 0.0
      && self.overshoot_pct >= 0.0
      && self.panic_pct >= self.overshoot_pct
  }
}

/// Rate control configuration
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct RateControlConfig {
  /// Rate control algorithm.
  pub mode: RateControlMode,
  /// Quantizer used in constant QP mode.
  pub qp: u8,
  /// Target bitrate in bits per second.
  pub bitrate: u64,
  /// Peak bitrate in bits per second, 0 means equal to `bitrate`.
  pub max_bitrate: u64,
  /// VBV buffer size in bits.
  pub vbv_buffer_size: u64,
  /// Initial VBV fullness in bits, 0 means half the buffer.
  pub vbv_initial_fullness: u64,
  /// Frames per second.
  pub frame_rate: Rational,
  /// Distance between intra frames.
  pub gop_size: u32,
  /// Distance between reference frames.
  pub gop_ref_dist: u32,
  /// Smallest QP the rate control may pick.
  pub min_qp: u8,
  /// Largest QP the rate control may pick.
  pub max_qp: u8,
  /// Quality factor for ICQ and QVBR.
  pub icq_quality: u8,
  /// Frame size tolerance.
  pub tolerance: FrameSizeTolerance,
  /// Maximum number of passes per frame under bitrate control.
  pub max_passes: usize,
  /// Acceptance criterion of the software firmware.
  pub acceptance: AcceptancePolicy,
  /// Threshold tables handed to the firmware.
  #[cfg_attr(feature = "serialize", serde(skip))]
  pub tables: BrcTables,
}

impl Default for RateControlConfig {
  fn default() -> Self {
    RateControlConfig {
      mode: RateControlMode::Cqp,
      qp: 26,
      bitrate: 0,
      max_bitrate: 0,
      vbv_buffer_size: 0,
      vbv_initial_fullness: 0,
      frame_rate: Rational::new(30, 1),
      gop_size: 30,
      gop_ref_dist: 1,
      min_qp: 0,
      max_qp: MAX_QP,
      icq_quality: 26,
      tolerance: FrameSizeTolerance::Normal,
      max_passes: DEFAULT_BRC_PASSES,
      acceptance: AcceptancePolicy::default(),
      tables: BrcTables::DEFAULT,
    }
  }
}

impl RateControlConfig {
  /// Create a default rate control configuration
  ///
  /// By default the encoder runs in constant QP mode.
  pub fn new() -> Self {
    Default::default()
  }

  /// Constant QP mode with the given quantizer.
  pub const fn with_qp(mut self, qp: u8) -> Self {
    self.mode = RateControlMode::Cqp;
    self.qp = qp;
    self
  }

  /// Select the rate control algorithm.
  pub const fn with_mode(mut self, mode: RateControlMode) -> Self {
    self.mode = mode;
    self
  }

  /// Target and peak bitrate in bits per second.
  pub const fn with_bitrate(mut self, bitrate: u64, max_bitrate: u64) -> Self {
    self.bitrate = bitrate;
    self.max_bitrate = max_bitrate;
    self
  }

  /// VBV buffer size and initial fullness in bits.
  pub const fn with_vbv(mut self, size: u64, initial_fullness: u64) -> Self {
    self.vbv_buffer_size = size;
    self.vbv_initial_fullness = initial_fullness;
    self
  }

  /// Limit the QPs the rate control may pick.
  pub const fn with_qp_range(mut self, min_qp: u8, max_qp: u8) -> Self {
    self.min_qp = min_qp;
    self.max_qp = max_qp;
    self
  }

  /// Frames per second of the sequence.
  pub const fn with_frame_rate(mut self, frame_rate: Rational) -> Self {
    self.frame_rate = frame_rate;
    self
  }

  /// GOP length and distance between reference frames.
  pub const fn with_gop(mut self, size: u32, ref_dist: u32) -> Self {
    self.gop_size = size;
    self.gop_ref_dist = ref_dist;
    self
  }

  /// Quality factor for ICQ and QVBR.
  pub const fn with_icq_quality(mut self, quality: u8) -> Self {
    self.icq_quality = quality;
    self
  }

  /// How strictly frame sizes must follow their target.
  pub const fn with_tolerance(mut self, tolerance: FrameSizeTolerance) -> Self {
    self.tolerance = tolerance;
    self
  }

  /// Maximum number of passes per frame; ignored in constant QP mode.
  pub const fn with_max_passes(mut self, passes: usize) -> Self {
    self.max_passes = passes;
    self
  }

  /// Replace the acceptance criterion of the software firmware.
  pub const fn with_acceptance(mut self, acceptance: AcceptancePolicy) -> Self {
    self.acceptance = acceptance;
    self
  }

  /// Replace the threshold tables handed to the firmware.
  pub const fn with_tables(mut self, tables: BrcTables) -> Self {
    self.tables = tables;
    self
  }

  /// The QP range after the hardware clamp rule.
  ///
  /// A minimum below 10 is raised to 10. A maximum below 10 means
  /// "unset" and becomes 51, and anything above 51 is clamped to 51.
  pub const fn qp_range(&self) -> (u8, u8) {
    let min = if self.min_qp < MIN_BRC_QP { MIN_BRC_QP } else { self.min_qp };
    let max = if self.max_qp < MIN_BRC_QP || self.max_qp > MAX_QP {
      MAX_QP
    } else {
      self.max_qp
    };
    (min, max)
  }

  /// Peak bitrate with the default applied.
  pub const fn peak_bitrate(&self) -> u64 {
    if self.max_bitrate == 0 {
      self.bitrate
    } else {
      self.max_bitrate
    }
  }

  /// Initial VBV fullness with the default applied.
  pub const fn initial_fullness(&self) -> u64 {
    if self.vbv_initial_fullness == 0 {
      self.vbv_buffer_size / 2
    } else {
      self.vbv_initial_fullness
    }
  }

  /// Number of passes a frame may take.
  pub const fn passes(&self) -> usize {
    if self.mode.uses_brc() {
      self.max_passes
    } else {
      1
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn qp_clamp_rule() {
    let rc = RateControlConfig::new().with_qp_range(0, 0);
    assert_eq!(rc.qp_range(), (10, 51));
    let rc = RateControlConfig::new().with_qp_range(4, 9);
    assert_eq!(rc.qp_range(), (10, 51));
    let rc = RateControlConfig::new().with_qp_range(22, 60);
    assert_eq!(rc.qp_range(), (22, 51));
    let rc = RateControlConfig::new().with_qp_range(12, 40);
    assert_eq!(rc.qp_range(), (12, 40));
  }

  #[test]
  fn constant_qp_is_single_pass() {
    let rc = RateControlConfig::new().with_qp(30).with_max_passes(4);
    assert_eq!(rc.passes(), 1);
    let rc = rc.with_mode(RateControlMode::Cbr);
    assert_eq!(rc.passes(), 4);
  }

  #[test]
  fn acceptance_band() {
    let policy = AcceptancePolicy::default();
    assert!(policy.accepts(0.0));
    assert!(policy.accepts(-30.0));
    assert!(!policy.accepts(-30.5));
    assert!(policy.accepts(15.0));
    assert!(!policy.accepts(16.0));
    assert!(!policy.panics(99.0));
    assert!(policy.panics(101.0));
  }

  #[test]
  fn mode_parsing() {
    assert_eq!("Cbr".parse::<RateControlMode>().ok(), Some(RateControlMode::Cbr));
    assert_eq!(
      "ExtremelyLow".parse::<FrameSizeTolerance>().ok(),
      Some(FrameSizeTolerance::ExtremelyLow)
    );
    assert!("Abr".parse::<RateControlMode>().is_err());
  }
}
