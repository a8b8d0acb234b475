// Copyright (c) 2017-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::error::*;
use clap::Parser;
use scalenc::prelude::*;
use serde::Deserialize;

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

/// Drive the scalable encoder over a session of frames
#[derive(Parser, Debug)]
#[command(name = "scalenc", version, about, long_about = None)]
pub struct CliArgs {
  /// Session description in TOML; defaults apply when absent
  #[arg(value_name = "SESSION")]
  pub session: Option<PathBuf>,
  /// Concatenated bitstream output, '-' for stdout
  #[arg(short = 'o', long, value_name = "OUTPUT")]
  pub output: Option<PathBuf>,
  /// JSON status reports, one per line, '-' for stdout
  #[arg(short = 'r', long, value_name = "REPORT")]
  pub report: Option<PathBuf>,
  /// Number of frames when the session lists none
  #[arg(short = 'l', long, value_name = "FRAMES")]
  pub limit: Option<usize>,
  /// Hardware generation (gen11, gen12)
  #[arg(long, value_parser = parse_generation)]
  pub generation: Option<GenerationKind>,
  /// Number of encode engines, 0 for all of the generation
  #[arg(short = 'e', long)]
  pub engines: Option<usize>,
  /// Tile grid as COLSxROWS
  #[arg(short = 't', long, value_parser = parse_tiles)]
  pub tiles: Option<(usize, usize)>,
  /// Constant QP
  #[arg(long, conflicts_with = "bitrate")]
  pub qp: Option<u8>,
  /// Constant bitrate target in kbps
  #[arg(short = 'b', long)]
  pub bitrate: Option<u64>,
  /// Seed of the content model
  #[arg(long)]
  pub seed: Option<u64>,
  /// Semaphore watchdog in milliseconds
  #[arg(long, value_name = "MS")]
  pub watchdog: Option<u64>,
  /// Log the synchronization events of every frame
  #[arg(long)]
  pub sync_trace: bool,
}

fn parse_generation(s: &str) -> Result<GenerationKind, String> {
  match s.to_ascii_lowercase().as_str() {
    "gen11" | "11" => Ok(GenerationKind::Gen11),
    "gen12" | "12" => Ok(GenerationKind::Gen12),
    _ => Err(format!("unknown generation `{s}`")),
  }
}

fn parse_tiles(s: &str) -> Result<(usize, usize), String> {
  let (cols, rows) =
    s.split_once(['x', 'X']).ok_or_else(|| format!("expected COLSxROWS, got `{s}`"))?;
  let cols = cols.trim().parse::<usize>().map_err(|e| e.to_string())?;
  let rows = rows.trim().parse::<usize>().map_err(|e| e.to_string())?;
  Ok((cols, rows))
}

/// One frame of a session file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameEntry {
  #[serde(rename = "type")]
  pub frame_type: FrameType,
  pub poc: Option<i32>,
  #[serde(default)]
  pub refs0: Vec<i32>,
  #[serde(default)]
  pub refs1: Vec<i32>,
  #[serde(default)]
  pub slices: Vec<SliceParams>,
  pub used_as_ref: Option<bool>,
  pub target_size: Option<u32>,
  #[serde(default)]
  pub brc_reset: bool,
  #[serde(default)]
  pub end_of_stream: bool,
  /// Engine count applied before this frame.
  pub engines: Option<usize>,
}

/// A session file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Session {
  pub encoder: EncoderConfig,
  pub rate_control: RateControlConfig,
  pub generation: GenerationKind,
  pub engines: usize,
  pub seed: u64,
  pub watchdog_ms: Option<u64>,
  /// Frames generated when `frame` is empty.
  pub frames: Option<usize>,
  #[serde(rename = "frame")]
  pub frame_list: Vec<FrameEntry>,
}

/// A frame to encode, with the engine change that precedes it.
#[derive(Debug, Clone)]
pub struct SessionFrame {
  pub params: FrameParams,
  pub engines: Option<usize>,
}

impl FrameEntry {
  fn into_frame(self, index: usize) -> SessionFrame {
    let poc = self.poc.unwrap_or(index as i32);
    let mut params = FrameParams::new(poc, self.frame_type)
      .with_references(&self.refs0, &self.refs1)
      .with_slices(self.slices);
    if let Some(used) = self.used_as_ref {
      params = params.with_used_as_ref(used);
    }
    if let Some(size) = self.target_size {
      params = params.with_target_size(size);
    }
    if self.brc_reset {
      params = params.with_brc_reset();
    }
    if self.end_of_stream {
      params = params.with_end_of_stream();
    }
    SessionFrame { params, engines: self.engines }
  }
}

/// Low-delay GOP: an I frame every `gop_size` frames, P frames in between
/// predicting from the previous frame.
pub fn generate_frames(count: usize, gop_size: u32) -> Vec<SessionFrame> {
  let gop = gop_size.max(1) as usize;
  (0..count)
    .map(|i| {
      let poc = i as i32;
      let params = if i % gop == 0 {
        FrameParams::new(poc, FrameType::I)
      } else {
        FrameParams::new(poc, FrameType::P).with_references(&[poc - 1], &[])
      };
      let params =
        if i + 1 == count { params.with_end_of_stream() } else { params };
      SessionFrame { params, engines: None }
    })
    .collect()
}

pub struct CliOptions {
  pub config: Config,
  pub seed: u64,
  pub frames: Vec<SessionFrame>,
  pub output: Option<Box<dyn Write + Send>>,
  pub report: Option<Box<dyn Write + Send>>,
}

const DEFAULT_FRAMES: usize = 30;

fn create_output(path: &PathBuf) -> Result<Box<dyn Write + Send>, CliError> {
  match path.to_str() {
    Some("-") => Ok(Box::new(io::stdout())),
    _ => File::create(path)
      .map(|f| Box::new(io::BufWriter::new(f)) as Box<dyn Write + Send>)
      .map_err(|e| e.context(&format!("Cannot create {}", path.display()))),
  }
}

fn load_session(path: &PathBuf) -> Result<Session, CliError> {
  let mut text = String::new();
  let mut file = File::open(path)
    .map_err(|e| e.context(&format!("Cannot open {}", path.display())))?;
  file
    .read_to_string(&mut text)
    .map_err(|e| e.context(&format!("Cannot read {}", path.display())))?;
  toml::from_str(&text).map_err(|e| e.context("Invalid session file"))
}

pub fn parse_cli() -> Result<CliOptions, CliError> {
  let args = CliArgs::parse();
  build_options(args)
}

fn build_options(args: CliArgs) -> Result<CliOptions, CliError> {
  let mut session = match &args.session {
    Some(path) => load_session(path)?,
    None => Session::default(),
  };

  if let Some(generation) = args.generation {
    session.generation = generation;
  }
  if let Some(engines) = args.engines {
    session.engines = engines;
  }
  if let Some((cols, rows)) = args.tiles {
    session.encoder = session.encoder.with_tiles(cols, rows);
  }
  if let Some(qp) = args.qp {
    session.rate_control = session.rate_control.with_qp(qp);
  }
  if let Some(kbps) = args.bitrate {
    let bits = kbps * 1000;
    session.rate_control = session
      .rate_control
      .with_mode(RateControlMode::Cbr)
      .with_bitrate(bits, bits)
      .with_vbv(bits, 0);
  }
  if let Some(seed) = args.seed {
    session.seed = seed;
  }
  if let Some(ms) = args.watchdog {
    session.watchdog_ms = Some(ms);
  }

  let mut config = Config::new()
    .with_encoder_config(session.encoder)
    .with_rate_control(session.rate_control)
    .with_generation(session.generation)
    .with_engines(session.engines)
    .with_sync_trace(args.sync_trace);
  if let Some(ms) = session.watchdog_ms {
    config = config.with_watchdog(Duration::from_millis(ms));
  }
  config.validate().map_err(|e| e.context("Invalid configuration"))?;

  let frames = if session.frame_list.is_empty() {
    let count = args.limit.or(session.frames).unwrap_or(DEFAULT_FRAMES);
    generate_frames(count, session.rate_control.gop_size)
  } else {
    let limit = args.limit.unwrap_or(usize::MAX);
    session
      .frame_list
      .into_iter()
      .take(limit)
      .enumerate()
      .map(|(i, entry)| entry.into_frame(i))
      .collect()
  };
  if frames.is_empty() {
    return Err(CliError::new("The session has no frames"));
  }

  Ok(CliOptions {
    config,
    seed: session.seed,
    frames,
    output: args.output.as_ref().map(create_output).transpose()?,
    report: args.report.as_ref().map(create_output).transpose()?,
  })
}
