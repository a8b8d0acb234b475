// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Threshold tables handed to the rate-control firmware.

use crate::util::clamp;

pub const NUM_DEV_THRESHOLDS: usize = 8;
pub const NUM_EST_RATE_THRESHOLDS: usize = 7;
pub const NUM_INST_RATE_THRESHOLDS: usize = 4;

/// Deviation thresholds of one frame class, in percent.
pub type DevThresholds = [i8; NUM_DEV_THRESHOLDS];

/// The three deviation threshold tables of the init parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviationThresholds {
  pub pb: DevThresholds,
  pub i: DevThresholds,
  pub vbr: DevThresholds,
}

/// Constant data of the rate control.
///
/// The defaults are tuned for HEVC; an encoder can inject its own tables
/// through `RateControlConfig::with_tables`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrcTables {
  /// Frame rate the deviation bases were tuned at.
  pub dev_std_fps: f64,
  pub bps_ratio_low: f64,
  pub bps_ratio_high: f64,
  pub neg_mult_pb: f64,
  pub pos_mult_pb: f64,
  pub pos_mult_vbr: f64,

  // bases raised to the bits-per-frame ratio
  pub dev_thresh_i_neg: [f64; NUM_DEV_THRESHOLDS / 2],
  pub dev_thresh_i_pos: [f64; NUM_DEV_THRESHOLDS / 2],
  pub dev_thresh_pb_neg: [f64; NUM_DEV_THRESHOLDS / 2],
  pub dev_thresh_pb_pos: [f64; NUM_DEV_THRESHOLDS / 2],
  pub dev_thresh_vbr_neg: [f64; NUM_DEV_THRESHOLDS / 2],
  pub dev_thresh_vbr_pos: [f64; NUM_DEV_THRESHOLDS / 2],

  // low delay
  pub low_delay_dev_thresh_pb: DevThresholds,
  pub low_delay_dev_thresh_vbr: DevThresholds,
  pub low_delay_dev_thresh_i: DevThresholds,

  pub est_rate_thresh_p: [u8; NUM_EST_RATE_THRESHOLDS],
  pub est_rate_thresh_b: [u8; NUM_EST_RATE_THRESHOLDS],
  pub est_rate_thresh_i: [u8; NUM_EST_RATE_THRESHOLDS],

  pub inst_rate_thresh_p: [i8; NUM_INST_RATE_THRESHOLDS],
  pub inst_rate_thresh_b: [i8; NUM_INST_RATE_THRESHOLDS],
  pub inst_rate_thresh_i: [i8; NUM_INST_RATE_THRESHOLDS],
}

impl BrcTables {
  pub const DEFAULT: BrcTables = BrcTables {
    dev_std_fps: 30.0,
    bps_ratio_low: 0.1,
    bps_ratio_high: 3.5,
    neg_mult_pb: -50.0,
    pos_mult_pb: 50.0,
    pos_mult_vbr: 100.0,

    dev_thresh_i_neg: [0.80, 0.60, 0.34, 0.2],
    dev_thresh_i_pos: [0.2, 0.4, 0.66, 0.9],
    dev_thresh_pb_neg: [0.90, 0.66, 0.46, 0.3],
    dev_thresh_pb_pos: [0.3, 0.46, 0.70, 0.90],
    dev_thresh_vbr_neg: [0.90, 0.70, 0.50, 0.3],
    dev_thresh_vbr_pos: [0.4, 0.5, 0.75, 0.90],

    low_delay_dev_thresh_pb: [-45, -33, -23, -15, -8, 0, 15, 25],
    low_delay_dev_thresh_vbr: [-45, -35, -25, -15, -8, 0, 20, 40],
    low_delay_dev_thresh_i: [-40, -30, -17, -10, -5, 0, 10, 20],

    est_rate_thresh_p: [4, 8, 12, 16, 20, 24, 28],
    est_rate_thresh_b: [4, 8, 12, 16, 20, 24, 28],
    est_rate_thresh_i: [4, 8, 12, 16, 20, 24, 28],

    inst_rate_thresh_p: [40, 60, 80, 120],
    inst_rate_thresh_b: [35, 60, 80, 120],
    inst_rate_thresh_i: [40, 60, 90, 115],
  };

  /// Ratio of the bits of one frame to the VBV share of one frame at the
  /// reference frame rate, clamped to the table range.
  pub fn bps_ratio(&self, bits_per_frame: f64, vbv_size: u64) -> f64 {
    let per_frame_vbv = vbv_size as f64 / self.dev_std_fps;
    let ratio = if per_frame_vbv > 0. {
      bits_per_frame / per_frame_vbv
    } else {
      self.bps_ratio_high
    };
    clamp(ratio, self.bps_ratio_low, self.bps_ratio_high)
  }

  /// Deviation thresholds for the init parameter block.
  ///
  /// Low delay uses the fixed tables. Otherwise the first half of each
  /// table is `neg_mult * base ^ bps_ratio` and the second half
  /// `pos_mult * base ^ bps_ratio`.
  pub fn deviation_thresholds(
    &self, low_delay: bool, bits_per_frame: f64, vbv_size: u64,
  ) -> DeviationThresholds {
    if low_delay {
      return DeviationThresholds {
        pb: self.low_delay_dev_thresh_pb,
        i: self.low_delay_dev_thresh_i,
        vbr: self.low_delay_dev_thresh_vbr,
      };
    }

    let ratio = self.bps_ratio(bits_per_frame, vbv_size);
    let half = NUM_DEV_THRESHOLDS / 2;
    let mut out = DeviationThresholds::default();
    for i in 0..half {
      let scale = |mult: f64, base: f64| (mult * base.powf(ratio)) as i8;
      out.pb[i] = scale(self.neg_mult_pb, self.dev_thresh_pb_neg[i]);
      out.pb[i + half] = scale(self.pos_mult_pb, self.dev_thresh_pb_pos[i]);
      out.i[i] = scale(self.neg_mult_pb, self.dev_thresh_i_neg[i]);
      out.i[i + half] = scale(self.pos_mult_pb, self.dev_thresh_i_pos[i]);
      out.vbr[i] = scale(self.neg_mult_pb, self.dev_thresh_vbr_neg[i]);
      out.vbr[i + half] = scale(self.pos_mult_vbr, self.dev_thresh_vbr_pos[i]);
    }
    out
  }
}

impl Default for BrcTables {
  fn default() -> Self {
    BrcTables::DEFAULT
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn low_delay_uses_fixed_tables() {
    let t = BrcTables::DEFAULT.deviation_thresholds(true, 1e6, 1);
    assert_eq!(t.pb, [-45, -33, -23, -15, -8, 0, 15, 25]);
    assert_eq!(t.i, [-40, -30, -17, -10, -5, 0, 10, 20]);
    assert_eq!(t.vbr, [-45, -35, -25, -15, -8, 0, 20, 40]);
  }

  #[test]
  fn thresholds_scale_with_bps_ratio() {
    let tables = BrcTables::DEFAULT;
    // one frame fills exactly its VBV share: ratio 1, bases are used as is
    let t = tables.deviation_thresholds(false, 100_000., 3_000_000);
    assert_eq!(t.pb, [-45, -33, -23, -15, 15, 23, 35, 45]);
    assert_eq!(t.i, [-40, -30, -17, -10, 10, 20, 33, 45]);
    assert_eq!(t.vbr, [-45, -35, -25, -15, 40, 50, 75, 90]);
  }

  #[test]
  fn bps_ratio_is_clamped() {
    let tables = BrcTables::DEFAULT;
    assert_eq!(tables.bps_ratio(1., 3_000_000), 0.1);
    assert_eq!(tables.bps_ratio(1e9, 3_000_000), 3.5);
    assert_eq!(tables.bps_ratio(1e9, 0), 3.5);
    // a tiny ratio flattens every threshold towards the multiplier
    let t = tables.deviation_thresholds(false, 1., 3_000_000);
    assert!(t.pb[0] <= -44 && t.pb[7] >= 49);
  }
}
