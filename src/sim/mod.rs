// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Deterministic software model of the engines, the firmware and the
//! memory, standing in for the hardware.

mod engine;
mod firmware;

pub use self::engine::*;
pub use self::firmware::*;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::hw::{Backend, Engine, GenerationKind, MAX_ENGINES};
use crate::rate::{Firmware, Kernel};
use crate::resource::{HeapAllocator, ResourceAllocator};

/// A failure to inject into the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
  /// The engine never writes the size record of `tile`.
  DropRecord { frame: u64, tile: usize },
  /// The engine of `pipe` faults when it starts a tile.
  EngineFault { frame: u64, pipe: usize },
  /// `kernel` returns a failure status.
  FirmwareFailure { frame: u64, kernel: Kernel },
}

/// Parameters shared by every part of the model.
#[derive(Debug, Clone)]
pub struct SimModel {
  pub seed: u64,
  /// Bytes appended by end-of-sequence and end-of-stream.
  pub end_of_stream_size: usize,
  pub faults: Vec<Fault>,
}

impl SimModel {
  fn new(generation: GenerationKind) -> Self {
    SimModel {
      seed: 0,
      end_of_stream_size: generation.create().end_of_stream_size(),
      faults: Vec::new(),
    }
  }

  pub fn drops_record(&self, frame: u64, tile: usize) -> bool {
    self.faults.contains(&Fault::DropRecord { frame, tile })
  }

  pub fn engine_faults(&self, frame: u64, pipe: usize) -> bool {
    self.faults.contains(&Fault::EngineFault { frame, pipe })
  }

  pub fn firmware_fails(&self, frame: u64, kernel: Kernel) -> bool {
    self.faults.contains(&Fault::FirmwareFailure { frame, kernel })
  }
}

/// Backend made of the software model.
pub struct SimBackend {
  model: Arc<SimModel>,
  engines: Vec<Arc<SimEngine>>,
  firmware: Mutex<Box<dyn Firmware>>,
  allocator: Arc<HeapAllocator>,
  log: InvocationLog,
}

impl SimBackend {
  pub fn new(generation: GenerationKind) -> Self {
    let model = Arc::new(SimModel::new(generation));
    let log = InvocationLog::default();
    SimBackend {
      engines: Self::engines(&model),
      firmware: Mutex::new(Box::new(SoftwareFirmware::new(
        model.clone(),
        log.clone(),
      ))),
      allocator: Arc::new(HeapAllocator::new()),
      model,
      log,
    }
  }

  fn engines(model: &Arc<SimModel>) -> Vec<Arc<SimEngine>> {
    (0..MAX_ENGINES).map(|pipe| Arc::new(SimEngine::new(pipe, model.clone()))).collect()
  }

  fn rebuild(mut self, f: impl FnOnce(&mut SimModel)) -> Self {
    f(Arc::make_mut(&mut self.model));
    self.engines = Self::engines(&self.model);
    self.firmware = Mutex::new(Box::new(SoftwareFirmware::new(
      self.model.clone(),
      self.log.clone(),
    )));
    self
  }

  /// Seed of the frame complexity model.
  pub fn with_seed(self, seed: u64) -> Self {
    self.rebuild(|m| m.seed = seed)
  }

  pub fn with_fault(self, fault: Fault) -> Self {
    self.rebuild(|m| m.faults.push(fault))
  }

  /// Bound the memory the encoder may reserve.
  pub fn with_memory_limit(mut self, bytes: usize) -> Self {
    self.allocator = Arc::new(HeapAllocator::with_limit(bytes));
    self
  }

  pub fn model(&self) -> &SimModel {
    &self.model
  }

  /// Kernels run by the firmware, shared with the backend once it is moved
  /// into an encoder.
  pub fn log(&self) -> InvocationLog {
    self.log.clone()
  }
}

impl Backend for SimBackend {
  fn engine(&self, pipe: usize) -> Option<Arc<dyn Engine>> {
    self.engines.get(pipe).map(|e| e.clone() as Arc<dyn Engine>)
  }

  fn firmware(&self) -> &Mutex<Box<dyn Firmware>> {
    &self.firmware
  }

  fn allocator(&self) -> Arc<dyn ResourceAllocator> {
    self.allocator.clone()
  }
}
