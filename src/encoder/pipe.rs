// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! How many pipes code a frame, and what exists once per pipe count.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::api::{EncoderError, InvalidConfig};
use crate::hw::{Backend, Engine, EngineError, MAX_ENGINES};
use crate::sync::SyncFabric;

/// Number of pipes for a `cols` x `rows` grid on `engines` engines.
///
/// # Errors
///
/// A single engine cannot code a grid with several rows and columns, and a
/// streaming buffer cannot be shared by more columns than engines.
pub fn decide_pipe_count(
  cols: usize, rows: usize, engines: usize, streaming_buffer: bool,
) -> Result<usize, InvalidConfig> {
  let engines = engines.max(1);
  if engines == 1 && rows > 1 && cols > 1 {
    return Err(InvalidConfig::GridUnsupportedOnSingleEngine { cols, rows });
  }

  let pipes = if cols > engines {
    if streaming_buffer {
      return Err(InvalidConfig::StreamingBufferIncompatible { cols, engines });
    }
    1
  } else if cols < engines {
    if (1..=MAX_ENGINES).contains(&cols) {
      cols
    } else {
      1
    }
  } else {
    engines
  };
  Ok(pipes)
}

/// Resources scoped to a pipe count. Rebuilt whenever the count changes.
pub struct PipeState {
  pipes: usize,
  pub(crate) pool: rayon::ThreadPool,
  pub(crate) fabric: SyncFabric,
  pub(crate) engines: Vec<Arc<dyn Engine>>,
}

impl fmt::Debug for PipeState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PipeState").field("pipes", &self.pipes).finish()
  }
}

impl PipeState {
  /// # Errors
  ///
  /// Fails when the backend lacks an engine for one of the pipes or the
  /// worker pool cannot be started.
  pub fn new(
    pipes: usize, backend: &dyn Backend, watchdog: Duration, trace: bool,
  ) -> Result<Self, EncoderError> {
    let engines = (0..pipes)
      .map(|pipe| backend.engine(pipe).ok_or(EngineError::NoEngine(pipe)))
      .collect::<Result<Vec<_>, _>>()?;
    // one worker per pipe plus one for the scope owner
    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(pipes + 1)
      .thread_name(|i| format!("scalenc-pipe-{}", i))
      .build()?;
    let mut fabric = SyncFabric::new(pipes, watchdog);
    if trace {
      fabric = fabric.with_trace();
    }
    debug!("started {} engine workers", pipes);
    Ok(PipeState { pipes, pool, fabric, engines })
  }

  pub fn pipes(&self) -> usize {
    self.pipes
  }

  pub fn fabric(&self) -> &SyncFabric {
    &self.fabric
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use interpolate_name::interpolate_test;

  #[interpolate_test(wide_streaming, 5, 1, true, None)]
  #[interpolate_test(narrow_grid, 3, 1, false, Some(3))]
  #[interpolate_test(single_column, 1, 4, false, Some(1))]
  #[interpolate_test(wide_fallback, 5, 1, false, Some(1))]
  #[interpolate_test(matching, 4, 2, true, Some(4))]
  #[interpolate_test(too_many_columns, 6, 1, false, Some(1))]
  fn four_engines(
    cols: usize, rows: usize, streaming: bool, expected: Option<usize>,
  ) {
    assert_eq!(decide_pipe_count(cols, rows, 4, streaming).ok(), expected);
  }

  #[test]
  fn streaming_buffer_error() {
    assert_eq!(
      decide_pipe_count(5, 1, 4, true),
      Err(InvalidConfig::StreamingBufferIncompatible { cols: 5, engines: 4 })
    );
  }

  #[test]
  fn single_engine() {
    assert_eq!(decide_pipe_count(1, 3, 1, false), Ok(1));
    assert_eq!(decide_pipe_count(3, 1, 1, false), Ok(1));
    assert_eq!(
      decide_pipe_count(2, 2, 1, false),
      Err(InvalidConfig::GridUnsupportedOnSingleEngine { cols: 2, rows: 2 })
    );
    // no engine count is treated as one
    assert_eq!(decide_pipe_count(1, 1, 0, false), Ok(1));
  }

  #[test]
  fn pipes_never_exceed_engines_or_columns() {
    for engines in 1..=MAX_ENGINES {
      for cols in 1..=20 {
        for rows in 1..=3 {
          if let Ok(p) = decide_pipe_count(cols, rows, engines, false) {
            assert!(p >= 1 && p <= engines.min(cols));
            assert!(p == 1 || p == cols);
          }
        }
      }
    }
  }
}
