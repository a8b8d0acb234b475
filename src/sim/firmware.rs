// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::api::FrameType;
use crate::rate::dmem::{
  BrcFlag, BrcInitDmem, BrcUpdateDmem, Dmem, InitMode, OpMode,
};
use crate::rate::wp::{histogram_at, luma_weight};
use crate::rate::{
  BrcHistory, BrcOutput, Firmware, FirmwareError, HucMemory, HucStatus,
  Kernel, RegionKind, RegionList,
};
use crate::sim::SimModel;
use crate::stats::{FrameStatistics, PakIntegrateDmem, UNUSED_OFFSET};
use crate::stitch::apply_copy_list;
use crate::util::clamp;

/// Status of a kernel that was told to fail.
pub const INJECTED_FAILURE: u32 = 0x8000_0001;
/// Status of a PAK integration whose stitch list did not apply.
pub const STITCH_FAILURE: u32 = 0x8000_0002;

/// One kernel run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
  pub kernel: Kernel,
  pub frame_number: u64,
  pub pass: usize,
  /// Tile row of a tile-row update.
  pub row: Option<usize>,
  pub pipes: usize,
}

/// Kernel runs in order.
#[derive(Debug, Clone, Default)]
pub struct InvocationLog(Arc<Mutex<Vec<Invocation>>>);

impl InvocationLog {
  fn push(&self, invocation: Invocation) {
    self.0.lock().push(invocation);
  }

  pub fn entries(&self) -> Vec<Invocation> {
    self.0.lock().clone()
  }

  /// Runs of `kernel` for frame `frame_number`.
  pub fn count(&self, kernel: Kernel, frame_number: u64) -> usize {
    self
      .0
      .lock()
      .iter()
      .filter(|i| i.kernel == kernel && i.frame_number == frame_number)
      .count()
  }

  pub fn clear(&self) {
    self.0.lock().clear();
  }
}

/// Share of the per-frame bit budget given to each frame type.
fn target_share(frame_type: FrameType) -> f64 {
  match frame_type {
    FrameType::I => 2.5,
    FrameType::P => 1.0,
    FrameType::B => 0.75,
  }
}

fn required_regions(kernel: Kernel, dmem: &Dmem) -> &'static [RegionKind] {
  use RegionKind::*;
  match (kernel, dmem) {
    (Kernel::BrcInitReset, _) => &[History, Output],
    (Kernel::BrcUpdate | Kernel::TileRowUpdate, _) => {
      &[History, FrameStatistics, Output]
    }
    (Kernel::PakIntegrate, Dmem::PakIntegrate(d)) if d.stitch_enable => &[
      TileSizeRecords,
      TileStatistics,
      FrameStatistics,
      StitchCommands,
      Bitstream,
    ],
    (Kernel::PakIntegrate, _) => {
      &[TileSizeRecords, TileStatistics, FrameStatistics]
    }
  }
}

/// The firmware kernels, run on the host.
pub struct SoftwareFirmware {
  model: Arc<SimModel>,
  log: InvocationLog,
  kernel: Option<Kernel>,
  regions: RegionList,
  dmem: Option<Dmem>,
}

impl SoftwareFirmware {
  pub fn new(model: Arc<SimModel>, log: InvocationLog) -> Self {
    SoftwareFirmware {
      model,
      log,
      kernel: None,
      regions: RegionList::new(),
      dmem: None,
    }
  }

  fn init_reset(dmem: &BrcInitDmem, history: &mut BrcHistory) -> u8 {
    let fps = dmem.frame_rate.as_f64();
    let bits_per_frame =
      if fps > 0. { dmem.target_bitrate as f64 / fps } else { 0. };
    match dmem.mode {
      InitMode::Init | InitMode::Reset => {
        let frames = history.frames;
        let total_bytes = history.total_bytes;
        *history = BrcHistory {
          initialized: true,
          mode_flag: dmem.brc_flag as u8,
          pipes: dmem.pipes,
          bits_per_frame,
          vbv_size: dmem.vbv_size as f64,
          fullness: dmem.vbv_initial_fullness as f64,
          low_delay: dmem.low_delay,
          sliding_window: dmem.sliding_window,
          qp: [dmem.init_qp_ip, dmem.init_qp_ip, dmem.init_qp_b],
          min_qp: dmem.min_qp,
          max_qp: dmem.max_qp,
          icq_quality: dmem.icq_quality,
          deviation: dmem.deviation,
          ..Default::default()
        };
        if dmem.mode == InitMode::Reset {
          history.frames = frames;
          history.total_bytes = total_bytes;
        }
      }
      InitMode::Refresh => {
        history.pipes = dmem.pipes;
        history.bits_per_frame = bits_per_frame;
        history.vbv_size = dmem.vbv_size as f64;
        history.fullness = history.fullness.min(history.vbv_size);
        history.min_qp = dmem.min_qp;
        history.max_qp = dmem.max_qp;
        history.deviation = dmem.deviation;
      }
    }
    clamp(history.qp_for(dmem.frame_type), history.min_qp, history.max_qp)
  }

  fn update(
    dmem: &BrcUpdateDmem, history: &mut BrcHistory, stats: &FrameStatistics,
    histograms: Option<&[u8]>, out: &mut BrcOutput,
  ) {
    let mut target = match dmem.target_size {
      0 => history.bits_per_frame * target_share(dmem.frame_type),
      bytes => f64::from(bytes) * 8.,
    };
    if let Some(row) = dmem.row {
      target *= row.lcus as f64 / dmem.frame_lcus.max(1) as f64;
    }
    let actual = stats.bytes as f64 * 8.;
    let last = match dmem.row {
      Some(row) => row.row_pass + 1 >= row.max_row_passes,
      None => dmem.pass + 1 >= dmem.max_passes,
    };
    out.target_size = (target / 8.) as u32;
    out.qp = dmem.qp;

    let mut delta = 0;
    if history.mode_flag == BrcFlag::Cqp as u8 || target <= 0. {
      // quality driven: the first pass is kept
      out.accepted = true;
    } else {
      let deviation = (actual - target) / target * 100.;
      delta = clamp(
        (6. * (actual.max(1.) / target).log2()).round() as i32,
        -6,
        6,
      );
      let next = clamp(
        i32::from(dmem.qp) + delta,
        i32::from(history.min_qp),
        i32::from(history.max_qp),
      ) as u8;
      out.qp_delta = (i32::from(next) - i32::from(dmem.qp)) as i8;
      out.accepted = dmem.acceptance.accepts(deviation) || out.qp_delta == 0;
      out.panic = last && !out.accepted && dmem.acceptance.panics(deviation);
      out.pak_only = out.qp_delta.abs() <= 2;
      if !out.accepted {
        out.qp = next;
      }
      trace!(
        "frame {} pass {}: {:.0} of {:.0} bits ({:+.1}%), qp {} -> {}",
        dmem.frame_number,
        dmem.pass,
        actual,
        target,
        deviation,
        dmem.qp,
        out.qp
      );
    }

    if dmem.row.is_none() && (out.accepted || last) {
      history.frames += 1;
      history.total_bytes += stats.bytes;
      if history.vbv_size > 0. {
        history.fullness = clamp(
          history.fullness + history.bits_per_frame - actual,
          0.,
          history.vbv_size,
        );
      }
      let carried = clamp(
        i32::from(dmem.qp) + delta / 2,
        i32::from(history.min_qp),
        i32::from(history.max_qp),
      ) as u8;
      history.qp[dmem.frame_type as usize] = carried;
    }

    if dmem.op_mode.contains(OpMode::WEIGHTED_PREDICTION) {
      if let Some(memory) = histograms {
        if let Some(current) = histogram_at(memory, dmem.weight_offset) {
          for (&poc, &offset) in
            dmem.ref_pocs.iter().zip(&dmem.ref_weight_offsets)
          {
            if offset == UNUSED_OFFSET {
              continue;
            }
            let entry = histogram_at(memory, offset)
              .and_then(|r| luma_weight(poc, &current, &r));
            if let Some(entry) = entry {
              out.weights.push(entry);
            }
          }
        }
      }
    }
  }

  fn integrate(
    dmem: &PakIntegrateDmem, memory: &mut HucMemory<'_>,
  ) -> HucStatus {
    let mut frame = FrameStatistics::default();
    if let (Some(records), Some(stats)) = (memory.records, memory.tile_stats) {
      for pipe in 0..dmem.total_paks {
        for t in dmem.pipe_tiles(pipe).filter(|t| dmem.tiles.contains(t)) {
          if let Some(s) = stats.get(t) {
            frame += s;
          }
          if let Some(r) = records.get(t) {
            frame.slices += r.slice_count as usize;
          }
        }
      }
    }
    if let Some(out) = memory.frame_stats.as_deref_mut() {
      *out = frame;
    }

    if dmem.stitch_enable {
      let commands = memory.stitch.unwrap_or(&[]);
      if let Some(bitstream) = memory.bitstream.as_deref_mut() {
        let bound = dmem.bitstream_upper_bound as usize;
        if let Err(e) = apply_copy_list(bitstream, commands, bound) {
          debug!("stitch failed: {}", e);
          return HucStatus(STITCH_FAILURE);
        }
      }
    }
    HucStatus::SUCCESS
  }

  fn invocation(kernel: Kernel, dmem: &Dmem) -> Invocation {
    match dmem {
      Dmem::BrcInit(d) => Invocation {
        kernel,
        frame_number: d.frame_number,
        pass: 0,
        row: None,
        pipes: d.pipes,
      },
      Dmem::BrcUpdate(d) => Invocation {
        kernel,
        frame_number: d.frame_number,
        pass: d.row.map_or(d.pass, |r| r.row_pass),
        row: d.row.map(|r| r.row),
        pipes: 0,
      },
      Dmem::PakIntegrate(d) => Invocation {
        kernel,
        frame_number: d.frame_number,
        pass: d.pass,
        row: None,
        pipes: d.total_paks,
      },
    }
  }
}

impl Firmware for SoftwareFirmware {
  fn load(&mut self, kernel: Kernel) -> Result<(), FirmwareError> {
    self.kernel = Some(kernel);
    self.dmem = None;
    self.regions.clear();
    Ok(())
  }

  fn set_regions(&mut self, regions: RegionList) -> Result<(), FirmwareError> {
    if self.kernel.is_none() {
      return Err(FirmwareError::NotLoaded);
    }
    self.regions = regions;
    Ok(())
  }

  fn set_dmem(&mut self, dmem: Dmem) -> Result<(), FirmwareError> {
    let kernel = self.kernel.ok_or(FirmwareError::NotLoaded)?;
    let fits = matches!(
      (kernel, &dmem),
      (Kernel::BrcInitReset, Dmem::BrcInit(_))
        | (Kernel::BrcUpdate, Dmem::BrcUpdate(BrcUpdateDmem { row: None, .. }))
        | (
          Kernel::TileRowUpdate,
          Dmem::BrcUpdate(BrcUpdateDmem { row: Some(_), .. })
        )
        | (Kernel::PakIntegrate, Dmem::PakIntegrate(_))
    );
    if !fits {
      return Err(FirmwareError::WrongDmem { kernel });
    }
    self.dmem = Some(dmem);
    Ok(())
  }

  fn start_and_wait(
    &mut self, memory: &mut HucMemory<'_>,
  ) -> Result<HucStatus, FirmwareError> {
    let kernel = self.kernel.ok_or(FirmwareError::NotLoaded)?;
    let dmem = self.dmem.take().ok_or(FirmwareError::MissingDmem { kernel })?;
    for &region in required_regions(kernel, &dmem) {
      let listed = self.regions.iter().any(|r| r.kind == region);
      if !listed || !memory.has(region) {
        return Err(FirmwareError::MissingRegion { kernel, region });
      }
    }

    let invocation = Self::invocation(kernel, &dmem);
    self.log.push(invocation);
    if self.model.firmware_fails(invocation.frame_number, kernel) {
      return Ok(HucStatus(INJECTED_FAILURE));
    }

    let status = match &dmem {
      Dmem::BrcInit(d) => {
        let (Some(history), Some(out)) =
          (memory.history.as_deref_mut(), memory.output.as_deref_mut())
        else {
          return Err(FirmwareError::MissingRegion {
            kernel,
            region: RegionKind::Output,
          });
        };
        out.qp = Self::init_reset(d, history);
        debug!(
          "frame {}: {:?}, pass 0 at qp {}",
          d.frame_number, d.mode, out.qp
        );
        HucStatus::SUCCESS
      }
      Dmem::BrcUpdate(d) => {
        let histograms = memory.histograms;
        let (Some(history), Some(stats), Some(out)) = (
          memory.history.as_deref_mut(),
          memory.frame_stats.as_deref(),
          memory.output.as_deref_mut(),
        ) else {
          return Err(FirmwareError::MissingRegion {
            kernel,
            region: RegionKind::Output,
          });
        };
        Self::update(d, history, stats, histograms, out);
        HucStatus::SUCCESS
      }
      Dmem::PakIntegrate(d) => Self::integrate(d, memory),
    };
    Ok(status)
  }
}
