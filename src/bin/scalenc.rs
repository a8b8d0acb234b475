// Copyright (c) 2017-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

#![deny(bare_trait_objects)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::missing_errors_doc)]

#[macro_use]
extern crate log;

mod common;
mod error;

use crate::common::*;
use crate::error::*;
use scalenc::prelude::*;
use scalenc::sim::SimBackend;

use std::io::Write;
use std::process::exit;
use std::time::Instant;

fn main() {
  init_logger();

  run().unwrap_or_else(|e| {
    error::print_error(&e);
    exit(1);
  });
}

fn init_logger() {
  use std::str::FromStr;
  fn level_colored(l: log::Level) -> console::StyledObject<&'static str> {
    use console::style;
    use log::Level;
    match l {
      Level::Trace => style("??").dim(),
      Level::Debug => style("? ").dim(),
      Level::Info => style("> ").green(),
      Level::Warn => style("! ").yellow(),
      Level::Error => style("!!").red(),
    }
  }

  let level = std::env::var("SCALENC_LOG")
    .ok()
    .and_then(|l| log::LevelFilter::from_str(&l).ok())
    .unwrap_or(log::LevelFilter::Info);

  let applied = fern::Dispatch::new()
    .format(move |out, message, record| {
      out.finish(format_args!(
        "{level} {message}",
        level = level_colored(record.level()),
        message = message,
      ));
    })
    .level(log::LevelFilter::Warn)
    .level_for("scalenc", level)
    .chain(std::io::stderr())
    .apply();
  if applied.is_err() {
    eprintln!("a logger is already installed");
  }
}

#[derive(Debug, Default)]
struct Summary {
  frames: usize,
  failed: usize,
  passes: usize,
  panics: usize,
  bytes: usize,
  qp_sum: usize,
}

impl Summary {
  fn add(&mut self, report: &StatusReport) {
    self.frames += 1;
    self.passes += report.passes;
    if report.panic {
      self.panics += 1;
    }
    if report.is_successful() {
      self.bytes += report.bitstream_size;
      self.qp_sum += usize::from(report.average_qp);
    } else {
      self.failed += 1;
    }
  }

  fn print(&self, elapsed: f64, frame_rate: f64) {
    let coded = self.frames - self.failed;
    let kbps = if coded > 0 {
      self.bytes as f64 * 8. * frame_rate / coded as f64 / 1000.
    } else {
      0.
    };
    eprintln!(
      "encoded {} frames ({} failed) in {:.3} s, {:.2} kb/s",
      self.frames, self.failed, elapsed, kbps
    );
    eprintln!(
      "average qp {:.2}, {:.2} passes per frame, {} panic frames",
      self.qp_sum as f64 / coded.max(1) as f64,
      self.passes as f64 / self.frames.max(1) as f64,
      self.panics
    );
  }
}

fn run() -> Result<(), CliError> {
  let mut cli = parse_cli()?;
  let frame_rate = cli.config.rate_control().frame_rate.as_f64();
  let backend = SimBackend::new(cli.config.generation()).with_seed(cli.seed);
  let mut encoder = Encoder::new(cli.config.clone(), backend)
    .map_err(|e| e.context("Cannot create the encoder"))?;

  info!(
    "{}x{} in {}x{} tiles on {}, {} engines, {:?}",
    cli.config.encoder_config().width,
    cli.config.encoder_config().height,
    encoder.grid().cols(),
    encoder.grid().rows(),
    cli.config.generation(),
    cli.config.engine_count(),
    cli.config.rate_control().mode,
  );

  let start = Instant::now();
  let mut summary = Summary::default();
  for frame in &cli.frames {
    if let Some(engines) = frame.engines {
      encoder
        .set_engines(engines)
        .map_err(|e| e.context("Cannot change the engine count"))?;
    }
    let encoded = encoder
      .encode_frame(&frame.params)
      .map_err(|e| e.context(&format!("Frame {} failed", frame.params.poc)))?;
    let report = &encoded.report;
    summary.add(report);

    if report.is_successful() {
      info!(
        "frame {} ({}) {} bytes, qp {}, {} passes, {} pipes",
        report.frame_number,
        report.frame_type,
        report.bitstream_size,
        report.average_qp,
        report.passes,
        report.pipes
      );
    } else {
      warn!("frame {} finished with {:?}", report.frame_number, report.status);
    }
    if let Some(trace) = encoder.sync_trace() {
      for event in trace.events() {
        debug!("{:?}", event);
      }
    }

    if let Some(output) = cli.output.as_mut() {
      output
        .write_all(&encoded.data)
        .map_err(|e| e.context("Cannot write the bitstream"))?;
    }
    if let Some(out) = cli.report.as_mut() {
      serde_json::to_writer(&mut *out, report)
        .map_err(|e| e.context("Cannot write the report"))?;
      out.write_all(b"\n").map_err(|e| e.context("Cannot write the report"))?;
    }
  }

  if let Some(output) = cli.output.as_mut() {
    output.flush().map_err(|e| e.context("Cannot write the bitstream"))?;
  }
  if let Some(out) = cli.report.as_mut() {
    out.flush().map_err(|e| e.context("Cannot write the report"))?;
  }
  summary.print(start.elapsed().as_secs_f64(), frame_rate);
  Ok(())
}
