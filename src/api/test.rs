// Copyright (c) 2018-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::hw::EngineError;
use crate::prelude::*;
use crate::rate::{FirmwareError, Kernel};
use crate::resource::{ResourceAllocator, RECYCLED_BUFFER_NUM};
use crate::sim::{
  Fault, InvocationLog, SimBackend, FAULT_STATUS, INJECTED_FAILURE,
};
use crate::sync::{SemaphoreId, TraceEvent};

use interpolate_name::interpolate_test;

fn setup_config(cols: usize, rows: usize) -> Config {
  let enc = EncoderConfig::with_size(1920, 1080).with_tiles(cols, rows);
  Config::new().with_encoder_config(enc)
}

fn cbr() -> RateControlConfig {
  RateControlConfig::new()
    .with_mode(RateControlMode::Cbr)
    .with_bitrate(6_000_000, 0)
    .with_vbv(6_000_000, 0)
}

fn setup_encoder(
  config: Config, backend: SimBackend,
) -> (Encoder, InvocationLog) {
  let log = backend.log();
  (Encoder::new(config, backend).unwrap(), log)
}

fn gen12() -> SimBackend {
  SimBackend::new(GenerationKind::Gen12)
}

/// First byte the model writes into every tile fragment.
fn fragment_marker(tile: usize) -> u8 {
  (tile as u8).wrapping_mul(17)
}

fn assert_fragments_in_order(frame: &EncodedFrame) {
  let mut at = 0;
  for tile in &frame.report.tiles {
    assert_eq!(frame.data[at], fragment_marker(tile.index));
    at += tile.length;
  }
  assert_eq!(at, frame.data.len());
}

#[test]
fn single_tile_constant_qp() {
  let (mut enc, log) = setup_encoder(setup_config(1, 1), gen12());
  let frame = enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  let report = &frame.report;

  assert!(report.is_successful());
  assert_eq!(report.pipes, 1);
  assert_eq!(report.passes, 1);
  assert_eq!(report.average_qp, 26);
  assert!(!report.stitched_by_firmware);
  assert_eq!(frame.data.len(), report.bitstream_size);
  assert_eq!(report.bitstream_size, report.tiles[0].length);
  assert!(log.entries().is_empty());
  assert_eq!(enc.frames_encoded(), 1);
}

#[interpolate_test(one_column, 1)]
#[interpolate_test(two_columns, 2)]
#[interpolate_test(four_columns, 4)]
fn one_pipe_per_column(cols: usize) {
  let (mut enc, log) = setup_encoder(setup_config(cols, 1), gen12());
  let frame = enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  let report = &frame.report;

  assert!(report.is_successful());
  assert_eq!(enc.pipes(), cols);
  assert_eq!(report.pipes, cols);
  assert_eq!(report.stitched_by_firmware, cols > 1);
  assert_eq!(
    report.tiles.iter().map(|t| t.pipe).collect::<Vec<_>>(),
    if cols > 1 { (0..cols).collect() } else { vec![0] }
  );
  assert_eq!(
    report.bitstream_size,
    report.tiles.iter().map(|t| t.length).sum::<usize>()
  );
  assert_fragments_in_order(&frame);
  // constant QP: statistics only
  assert_eq!(log.count(Kernel::BrcInitReset, 0), 0);
  assert_eq!(log.count(Kernel::BrcUpdate, 0), 0);
  assert_eq!(log.count(Kernel::PakIntegrate, 0), usize::from(cols > 1));
}

#[test]
fn host_stitch_when_columns_exceed_engines() {
  let config = setup_config(3, 1).with_generation(GenerationKind::Gen11);
  let backend = SimBackend::new(GenerationKind::Gen11);
  let (mut enc, log) = setup_encoder(config, backend);
  let frame = enc.encode_frame(&FrameParams::new(0, FrameType::P)).unwrap();

  assert!(frame.report.is_successful());
  assert_eq!(frame.report.pipes, 1);
  assert!(!frame.report.stitched_by_firmware);
  assert_fragments_in_order(&frame);
  assert!(log.entries().is_empty());
}

#[test]
fn one_init_per_frame_and_one_update_per_pass() {
  let config = setup_config(2, 1).with_rate_control(cbr());
  let (mut enc, log) = setup_encoder(config, gen12());

  for n in 0..4u64 {
    let frame_type = if n == 0 { FrameType::I } else { FrameType::P };
    let frame =
      enc.encode_frame(&FrameParams::new(n as i32, frame_type)).unwrap();
    let passes = frame.report.passes;
    assert!((1..=2).contains(&passes));
    assert_eq!(log.count(Kernel::BrcInitReset, n), 1);
    assert_eq!(log.count(Kernel::BrcUpdate, n), passes);
    assert_eq!(log.count(Kernel::PakIntegrate, n), passes);
  }
  assert_eq!(enc.rate_history().unwrap().frames, 4);
}

#[test]
fn missed_target_runs_the_second_pass() {
  let config = setup_config(2, 1).with_rate_control(cbr());
  let (mut enc, log) = setup_encoder(config, gen12());
  let frame = FrameParams::new(0, FrameType::I).with_target_size(1000);
  let frame = enc.encode_frame(&frame).unwrap();
  let report = &frame.report;

  assert!(report.is_successful());
  assert_eq!(report.passes, 2);
  assert!(report.panic);
  assert_eq!(log.count(Kernel::BrcUpdate, 0), 2);
  assert_eq!(log.count(Kernel::PakIntegrate, 0), 2);

  // the second pass ran six steps above the first
  let history = enc.rate_history().unwrap();
  assert_eq!(report.average_qp, 32);
  assert_eq!(history.frames, 1);
  assert_fragments_in_order(&frame);
}

#[test]
fn icq_keeps_the_first_pass() {
  let rc = RateControlConfig::new().with_mode(RateControlMode::Icq);
  let (mut enc, log) =
    setup_encoder(setup_config(1, 1).with_rate_control(rc), gen12());
  enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  // a reset is turned into a refresh
  let frame = FrameParams::new(1, FrameType::P).with_brc_reset();
  let frame = enc.encode_frame(&frame).unwrap();

  assert!(frame.report.is_successful());
  assert_eq!(frame.report.passes, 1);
  assert_eq!(log.count(Kernel::BrcInitReset, 1), 1);
  assert_eq!(log.count(Kernel::BrcUpdate, 1), 1);
  assert_eq!(enc.rate_history().unwrap().frames, 2);
}

#[test]
fn constant_qp_ignores_reset() {
  let (mut enc, log) = setup_encoder(setup_config(1, 1), gen12());
  let frame = FrameParams::new(0, FrameType::I).with_brc_reset();
  assert!(enc.encode_frame(&frame).unwrap().report.is_successful());
  assert!(log.entries().is_empty());
  assert!(enc.rate_history().is_none());
}

#[test]
fn dropped_record_makes_the_frame_incomplete() {
  let backend = gen12().with_fault(Fault::DropRecord { frame: 0, tile: 1 });
  let config = setup_config(2, 1).with_rate_control(cbr());
  let (mut enc, log) = setup_encoder(config, backend);
  let frame = enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  let report = &frame.report;

  assert_eq!(report.status, CodecStatus::Incomplete);
  assert_eq!(report.passes, 1);
  assert_eq!(report.tiles[1].length, 0);
  assert!(frame.data.is_empty());
  assert_eq!(log.count(Kernel::BrcUpdate, 0), 0);

  // the next frame is coded normally
  let frame = enc.encode_frame(&FrameParams::new(1, FrameType::P)).unwrap();
  assert!(frame.report.is_successful());
}

#[test]
fn engine_fault_fails_the_frame() {
  let backend = gen12().with_fault(Fault::EngineFault { frame: 0, pipe: 1 });
  let (mut enc, _) = setup_encoder(setup_config(2, 1), backend);
  let err = enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap_err();
  assert!(matches!(
    err,
    EncoderError::Engine(EngineError::Fault { pipe: 1, status: FAULT_STATUS })
  ));
  assert_eq!(enc.frames_encoded(), 0);
}

#[test]
fn firmware_failure_fails_the_frame() {
  let backend = gen12()
    .with_fault(Fault::FirmwareFailure { frame: 0, kernel: Kernel::BrcUpdate });
  let config = setup_config(1, 1).with_rate_control(cbr());
  let (mut enc, _) = setup_encoder(config, backend);
  let err = enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap_err();
  assert!(matches!(
    err,
    EncoderError::Firmware(FirmwareError::Failed {
      kernel: Kernel::BrcUpdate,
      status: INJECTED_FAILURE
    })
  ));
  assert_eq!(enc.frames_encoded(), 0);
}

#[test]
fn pipe_change_carries_rate_control_over() {
  let config = setup_config(2, 1).with_rate_control(cbr());
  let (mut enc, log) = setup_encoder(config, gen12());
  enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  assert_eq!(enc.pipes(), 2);
  assert_eq!(enc.rate_history().unwrap().pipes, 2);

  enc.set_engines(1).unwrap();
  let frame = enc.encode_frame(&FrameParams::new(1, FrameType::P)).unwrap();
  assert!(frame.report.is_successful());
  assert_eq!(frame.report.pipes, 1);
  assert!(!frame.report.stitched_by_firmware);

  let history = enc.rate_history().unwrap();
  assert_eq!(history.pipes, 1);
  assert_eq!(history.frames, 2);
  let init: Vec<_> = log
    .entries()
    .into_iter()
    .filter(|i| i.kernel == Kernel::BrcInitReset)
    .map(|i| i.pipes)
    .collect();
  assert_eq!(init, [2, 1]);
}

#[test]
fn engine_count_is_checked() {
  let (mut enc, _) = setup_encoder(setup_config(2, 2), gen12());
  assert_eq!(
    enc.set_engines(0),
    Err(InvalidConfig::InvalidEngineCount { actual: 0, max: 4 })
  );
  assert_eq!(
    enc.set_engines(1),
    Err(InvalidConfig::GridUnsupportedOnSingleEngine { cols: 2, rows: 2 })
  );
  assert_eq!(enc.set_engines(2), Ok(()));
}

#[test]
fn streaming_buffer_needs_a_pipe_per_column() {
  let mut config = setup_config(5, 1);
  let mut enc_config = config.encoder_config().clone();
  enc_config.streaming_buffer = true;
  config = config.with_encoder_config(enc_config);
  let err = Encoder::new(config, gen12()).unwrap_err();
  assert!(matches!(
    err,
    EncoderError::Config(InvalidConfig::StreamingBufferIncompatible {
      cols: 5,
      engines: 4
    })
  ));
}

#[test]
fn content_protection() {
  let mut enc_config = setup_config(1, 1).encoder_config().clone();
  enc_config.content_protection = true;
  let config = Config::new().with_encoder_config(enc_config.clone());
  let (mut enc, _) = setup_encoder(config, gen12());
  let frame = enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  assert!(frame.report.is_successful());
  assert_eq!(frame.report.bitstream_size, frame.report.tiles[0].length);

  // several tiles cannot be joined on the host
  let enc_config = enc_config.with_tiles(2, 1);
  let mut no_firmware_stitch = enc_config;
  no_firmware_stitch.hw_stitch = false;
  let config = Config::new().with_encoder_config(no_firmware_stitch);
  let err = Encoder::new(config, gen12()).unwrap_err();
  assert!(matches!(
    err,
    EncoderError::Config(InvalidConfig::HostStitchForbidden)
  ));
}

#[test]
fn multiple_slices_per_tile_rejected() {
  let (mut enc, _) = setup_encoder(setup_config(2, 1), gen12());
  // 30 x 17 LCUs: the left tile in two slices, the right one whole
  let slices = vec![
    SliceParams::new(0, 15 * 8),
    SliceParams::new(8 * 30, 15 * 9),
    SliceParams::new(15, 15 * 17),
  ];
  let frame = FrameParams::new(0, FrameType::I).with_slices(slices);
  let err = enc.encode_frame(&frame).unwrap_err();
  assert!(matches!(
    err,
    EncoderError::Config(InvalidConfig::MultipleSlicesPerTile(0))
  ));
  assert_eq!(enc.frames_encoded(), 0);
}

#[test]
fn rejected_frame_keeps_pipes_and_rate_control() {
  let config = setup_config(2, 1).with_rate_control(cbr());
  let (mut enc, log) = setup_encoder(config, gen12());
  enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  let history = enc.rate_history();

  enc.set_engines(1).unwrap();
  let slices = vec![
    SliceParams::new(0, 15 * 8),
    SliceParams::new(8 * 30, 15 * 9),
    SliceParams::new(15, 15 * 17),
  ];
  let frame = FrameParams::new(1, FrameType::P).with_slices(slices);
  assert!(enc.encode_frame(&frame).is_err());
  assert_eq!(enc.pipes(), 2);
  assert_eq!(enc.rate_history(), history);
  assert_eq!(enc.frames_encoded(), 1);

  // the engine change applies to the next valid frame
  let frame = enc.encode_frame(&FrameParams::new(1, FrameType::P)).unwrap();
  assert_eq!(frame.report.pipes, 1);
  assert_eq!(enc.rate_history().unwrap().frames, 2);
  assert_eq!(log.count(Kernel::BrcInitReset, 1), 1);
}

#[test]
fn slot_buffers_are_swapped_within_the_memory_limit() {
  let backend = gen12();
  let allocator = backend.allocator();
  let (mut enc, _) = setup_encoder(setup_config(1, 1), backend);
  enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  let per_slot = allocator.in_use();

  let backend = gen12().with_memory_limit(RECYCLED_BUFFER_NUM * per_slot);
  let (mut enc, _) = setup_encoder(setup_config(1, 1), backend);
  for n in 0..RECYCLED_BUFFER_NUM as i32 {
    enc.encode_frame(&FrameParams::new(n, FrameType::P)).unwrap();
  }
  // more slices than the buffers of slot 0 were made for
  let slices = vec![
    SliceParams::new(0, 30 * 6),
    SliceParams::new(30 * 6, 30 * 6),
    SliceParams::new(30 * 12, 30 * 5),
  ];
  let frame = FrameParams::new(6, FrameType::P).with_slices(slices);
  let frame = enc.encode_frame(&frame).unwrap();
  assert!(frame.report.is_successful());
}

#[test]
fn slice_sizes_add_up_to_the_frame() {
  let mut enc_config = setup_config(1, 1).encoder_config().clone();
  enc_config.slice_size_report = true;
  let config = Config::new().with_encoder_config(enc_config);
  let (mut enc, _) = setup_encoder(config, gen12());
  let slices = vec![
    SliceParams::new(0, 30 * 6),
    SliceParams::new(30 * 6, 30 * 6),
    SliceParams::new(30 * 12, 30 * 5),
  ];
  let frame = FrameParams::new(0, FrameType::I).with_slices(slices);
  let frame = enc.encode_frame(&frame).unwrap();

  let sizes = frame.report.slice_sizes.clone().unwrap();
  assert_eq!(sizes.len(), 3);
  assert!(sizes.iter().all(|&s| s > 0));
  assert_eq!(
    sizes.iter().map(|&s| s as usize).sum::<usize>(),
    frame.report.bitstream_size
  );
}

#[test]
fn end_of_stream_lands_in_the_last_tile() {
  let encode = |frame: FrameParams| {
    let (mut enc, _) = setup_encoder(setup_config(2, 1), gen12());
    enc.encode_frame(&frame).unwrap()
  };
  let plain = encode(FrameParams::new(0, FrameType::P));
  let last = encode(FrameParams::new(0, FrameType::P).with_end_of_stream());

  // end of sequence and end of stream, 5 bytes each
  assert_eq!(last.report.tiles[0].length, plain.report.tiles[0].length);
  assert_eq!(last.report.tiles[1].length, plain.report.tiles[1].length + 10);
  assert_eq!(last.report.bitstream_size, plain.report.bitstream_size + 10);
}

#[test]
fn tile_rows_replayed_under_rate_control() {
  let mut enc_config = setup_config(2, 2).encoder_config().clone();
  enc_config.tile_replay = true;
  let config =
    Config::new().with_encoder_config(enc_config).with_rate_control(cbr());
  let (mut enc, log) = setup_encoder(config, gen12());
  let frame = enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  let report = &frame.report;

  assert!(report.is_successful());
  assert!(report.stitched_by_firmware);
  assert_eq!(report.passes, 1);
  assert_eq!(report.row_passes.len(), 2);
  assert!(report.row_passes.iter().all(|p| (1..=2).contains(p)));

  let row_passes: usize = report.row_passes.iter().sum();
  assert_eq!(log.count(Kernel::TileRowUpdate, 0), row_passes);
  assert_eq!(log.count(Kernel::BrcUpdate, 0), 1);
  assert_eq!(log.count(Kernel::PakIntegrate, 0), row_passes + 1);
  assert_fragments_in_order(&frame);
}

#[test]
fn frame_ends_with_the_handoff() {
  let config = setup_config(2, 1).with_sync_trace(true);
  let (mut enc, _) = setup_encoder(config, gen12());
  enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();

  let events = enc.sync_trace().unwrap().events();
  assert_eq!(
    &events[events.len() - 2..],
    &[
      TraceEvent::PassUpdated { pass: 0 },
      TraceEvent::Signalled {
        pipe: 0,
        semaphore: SemaphoreId::BrcHandoff,
        value: 1
      },
    ]
  );
}

#[test]
fn buffers_beyond_the_memory_limit() {
  let backend = gen12().with_memory_limit(4096);
  let (mut enc, _) = setup_encoder(setup_config(1, 1), backend);
  let err = enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap_err();
  assert!(matches!(err, EncoderError::Resource(_)));
  assert_eq!(enc.frames_encoded(), 0);
}

#[test]
fn slots_are_reused() {
  let (mut enc, _) = setup_encoder(setup_config(2, 1), gen12());
  for n in 0..10 {
    let frame = enc.encode_frame(&FrameParams::new(n, FrameType::P)).unwrap();
    assert_eq!(frame.report.frame_number, n as u64);
    assert!(frame.report.is_successful());
  }
  assert_eq!(enc.frames_encoded(), 10);
}

fn with_bitstream_size(cols: usize, size: usize) -> Config {
  let mut enc_config = setup_config(cols, 1).encoder_config().clone();
  enc_config.bitstream_size = size;
  Config::new().with_encoder_config(enc_config)
}

#[interpolate_test(one_tile, 1)]
#[interpolate_test(two_tiles, 2)]
fn overflowing_tile_fails_the_frame(cols: usize) {
  let (mut enc, _) = setup_encoder(with_bitstream_size(cols, 8192), gen12());
  let frame = enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  let report = &frame.report;
  let coded: usize = report.tiles.iter().map(|t| t.length).sum();

  assert!(coded > 8192);
  assert_eq!(report.status, CodecStatus::Error);
  assert_eq!(report.bitstream_size, coded);
  assert!(!report.stitched_by_firmware);
  assert!(frame.data.is_empty());
  assert_eq!(enc.frames_encoded(), 1);
}

#[test]
fn tight_buffer_holds_every_fragment() {
  let (mut enc, _) = setup_encoder(setup_config(2, 1), gen12());
  let frame = enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  let largest = frame.report.tiles.iter().map(|t| t.length).max().unwrap();

  // each of the two equal tiles gets half of the buffer
  let size = 2 * ((largest + 63) & !63);
  let (mut enc, _) = setup_encoder(with_bitstream_size(2, size), gen12());
  let tight = enc.encode_frame(&FrameParams::new(0, FrameType::I)).unwrap();
  let report = &tight.report;

  assert!(report.is_successful());
  let lengths =
    |r: &StatusReport| r.tiles.iter().map(|t| t.length).collect::<Vec<_>>();
  assert_eq!(lengths(report), lengths(&frame.report));
  assert_eq!(
    report.bitstream_size,
    report.tiles.iter().map(|t| t.length).sum::<usize>()
  );
  assert_eq!(tight.data.len(), report.bitstream_size);
  assert_eq!(tight.data, frame.data);
  assert_eq!(report.stitched_offsets(), [0, report.tiles[0].length]);
  assert_fragments_in_order(&tight);
}
