// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! scalenc is the control plane of a scalable hardware video encoder.
//!
//! A frame is split into a grid of tiles and coded in parallel by up to
//! [`MAX_ENGINES`](hw::MAX_ENGINES) encode engines, one per tile column.
//! The crate plans the tiles, builds the per-engine command streams,
//! synchronizes the engines through semaphores, runs the bitrate control
//! kernels on the firmware co-processor between passes and stitches the
//! tile fragments into one contiguous frame.
//!
//! The hardware is reached through the [`Backend`](hw::Backend) trait; the
//! [`sim`] module provides a deterministic software model of it.
//!
//! # Basic usage
//!
//! ```
//! use scalenc::prelude::*;
//! use scalenc::sim::SimBackend;
//!
//! # fn main() -> Result<(), EncoderError> {
//! let enc = EncoderConfig::with_size(1920, 1080).with_tiles(2, 1);
//! let config = Config::new().with_encoder_config(enc);
//! let mut encoder =
//!   Encoder::new(config, SimBackend::new(GenerationKind::Gen12))?;
//! let frame = encoder.encode_frame(&FrameParams::new(0, FrameType::I))?;
//! assert!(frame.report.is_successful());
//! assert_eq!(frame.data.len(), frame.report.bitstream_size);
//! # Ok(())
//! # }
//! ```

#![deny(bare_trait_objects)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::missing_errors_doc)]

mod serialize {
  #[cfg(feature = "serialize")]
  pub use serde::*;

  #[cfg(not(feature = "serialize"))]
  pub use noop_proc_macro::{Deserialize, Serialize};
}

mod util;

/// Configuration, frame parameters and status reports.
pub mod api;
pub mod encoder;
pub mod executor;
pub mod hw;
pub mod rate;
pub mod resource;
pub mod sim;
pub mod stats;
pub mod stitch;
pub mod sync;
pub mod tiling;

/// Commonly used types and traits.
pub mod prelude {
  pub use crate::api::*;
  pub use crate::encoder::Encoder;
  pub use crate::hw::{Backend, Capabilities, GenerationKind, MAX_ENGINES};
  pub use crate::stitch::StitchStrategy;
  pub use crate::tiling::TileGrid;
}

pub use crate::api::*;
pub use crate::encoder::Encoder;
