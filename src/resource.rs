// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Buffers shared by the pipes and the frame slots holding them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::stats::{
  FrameStatistics, StatsLayout, TileSizeRecord, TileStatistics,
};
use crate::stitch::CopyCommand;
use crate::sync::{Semaphore, SemaphoreId};
use crate::tiling::TileGrid;

/// Frames that may be in flight at the same time.
pub const RECYCLED_BUFFER_NUM: usize = 6;

/// Buffer provisioning failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum ResourceError {
  /// The allocator has no room left.
  #[error(
    "cannot reserve {requested} bytes for {name}: {available} bytes available"
  )]
  BudgetExceeded {
    /// Buffer name.
    name: &'static str,
    /// Requested size.
    requested: usize,
    /// Remaining budget.
    available: usize,
  },
  /// A slot was reused before its frame signalled completion.
  #[error("slot {slot} is still in flight with frame {frame}")]
  SlotInFlight {
    /// Slot index.
    slot: usize,
    /// Frame occupying the slot.
    frame: u64,
  },
  /// A slot was used before buffers were attached to it.
  #[error("slot {0} has no buffers")]
  MissingBuffers(usize),
}

/// A reservation made with a [`ResourceAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
  pub id: u64,
  pub name: &'static str,
  pub size: usize,
}

/// Provides the memory backing the shared regions.
pub trait ResourceAllocator: Send + Sync {
  /// Reserve `size` bytes for the buffer `name`.
  ///
  /// # Errors
  ///
  /// Fails when the allocator cannot provide the memory.
  fn reserve(
    &self, name: &'static str, size: usize,
  ) -> Result<BufferHandle, ResourceError>;

  /// Give a reservation back.
  fn release(&self, handle: BufferHandle);

  /// Bytes currently reserved.
  fn in_use(&self) -> usize;
}

#[derive(Debug, Default)]
struct HeapState {
  next_id: u64,
  in_use: usize,
  live: HashMap<u64, usize>,
}

/// Allocator backed by host memory with an optional budget.
#[derive(Debug, Default)]
pub struct HeapAllocator {
  limit: Option<usize>,
  state: Mutex<HeapState>,
}

impl HeapAllocator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Refuse reservations past `limit` bytes in total.
  pub fn with_limit(limit: usize) -> Self {
    HeapAllocator { limit: Some(limit), state: Mutex::default() }
  }
}

impl ResourceAllocator for HeapAllocator {
  fn reserve(
    &self, name: &'static str, size: usize,
  ) -> Result<BufferHandle, ResourceError> {
    let mut state = self.state.lock();
    if let Some(limit) = self.limit {
      let available = limit.saturating_sub(state.in_use);
      if size > available {
        return Err(ResourceError::BudgetExceeded {
          name,
          requested: size,
          available,
        });
      }
    }
    let id = state.next_id;
    state.next_id += 1;
    state.in_use += size;
    state.live.insert(id, size);
    Ok(BufferHandle { id, name, size })
  }

  fn release(&self, handle: BufferHandle) {
    let mut state = self.state.lock();
    if let Some(size) = state.live.remove(&handle.id) {
      state.in_use -= size;
    }
  }

  fn in_use(&self) -> usize {
    self.state.lock().in_use
  }
}

/// Sizes of the buffers a frame needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
  pub bitstream: usize,
  pub tiles: usize,
  pub slices: usize,
  pub stats: StatsLayout,
}

impl BufferRequest {
  pub fn new(grid: &TileGrid, slices: usize) -> Self {
    BufferRequest {
      bitstream: grid.region_sizes().bitstream,
      tiles: grid.tile_count(),
      slices,
      stats: StatsLayout::new(grid.tile_count(), grid.geometry().lcus()),
    }
  }

  /// Whether buffers sized for `self` can serve `other`.
  pub fn covers(&self, other: &BufferRequest) -> bool {
    self.bitstream >= other.bitstream
      && self.tiles >= other.tiles
      && self.slices >= other.slices
      && self.stats.tile.total >= other.stats.tile.total
      && self.stats.frame.total >= other.stats.frame.total
  }
}

/// The regions written by the engines and the firmware for one frame.
pub struct FrameBuffers {
  pub bitstream: Mutex<Vec<u8>>,
  pub scratch: Mutex<Vec<u8>>,
  pub records: Mutex<Vec<TileSizeRecord>>,
  pub tile_stats: Mutex<Vec<TileStatistics>>,
  pub frame_stats: Mutex<FrameStatistics>,
  /// Cumulative tile size at the end of every slice.
  pub slice_sizes: Mutex<Vec<u32>>,
  pub stitch_commands: Mutex<Vec<CopyCommand>>,
  request: BufferRequest,
  handles: Vec<BufferHandle>,
  allocator: Arc<dyn ResourceAllocator>,
}

impl fmt::Debug for FrameBuffers {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FrameBuffers")
      .field("request", &self.request)
      .field("handles", &self.handles)
      .finish()
  }
}

impl FrameBuffers {
  /// Reserve and create the buffers described by `request`.
  ///
  /// # Errors
  ///
  /// Fails when the allocator refuses one of the reservations; the ones
  /// already made are given back.
  pub fn allocate(
    allocator: Arc<dyn ResourceAllocator>, request: BufferRequest,
  ) -> Result<Self, ResourceError> {
    let sizes = [
      ("bitstream", request.bitstream),
      ("stitch scratch", request.bitstream),
      ("tile size records", request.stats.tile_record_size),
      ("tile statistics", request.stats.tile.total),
      ("frame statistics", request.stats.frame.total),
    ];
    let mut handles = Vec::with_capacity(sizes.len());
    for &(name, size) in &sizes {
      match allocator.reserve(name, size) {
        Ok(handle) => handles.push(handle),
        Err(e) => {
          for handle in handles {
            allocator.release(handle);
          }
          return Err(e);
        }
      }
    }
    debug!(
      "reserved {} bytes of frame buffers for {} tiles",
      sizes.iter().map(|s| s.1).sum::<usize>(),
      request.tiles
    );

    Ok(FrameBuffers {
      bitstream: Mutex::new(vec![0; request.bitstream]),
      scratch: Mutex::new(vec![0; request.bitstream]),
      records: Mutex::new(vec![TileSizeRecord::default(); request.tiles]),
      tile_stats: Mutex::new(vec![TileStatistics::default(); request.tiles]),
      frame_stats: Mutex::new(FrameStatistics::default()),
      slice_sizes: Mutex::new(vec![0; request.slices]),
      stitch_commands: Mutex::new(Vec::with_capacity(request.tiles)),
      request,
      handles,
      allocator,
    })
  }

  pub fn request(&self) -> &BufferRequest {
    &self.request
  }

  /// Zero the records and statistics before a frame uses the slot.
  pub fn clear(&self) {
    self.records.lock().iter_mut().for_each(|r| *r = TileSizeRecord::default());
    self
      .tile_stats
      .lock()
      .iter_mut()
      .for_each(|s| *s = TileStatistics::default());
    *self.frame_stats.lock() = FrameStatistics::default();
    self.slice_sizes.lock().iter_mut().for_each(|s| *s = 0);
    self.stitch_commands.lock().clear();
  }
}

impl Drop for FrameBuffers {
  fn drop(&mut self) {
    for handle in self.handles.drain(..) {
      self.allocator.release(handle);
    }
  }
}

/// Lifecycle of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
  /// Never used.
  Free,
  /// Holds a completed frame; may be reused.
  Ready,
  /// Owned by a frame being encoded.
  InFlight { frame: u64 },
}

struct Slot<T> {
  state: SlotState,
  frame_done: Arc<Semaphore>,
  data: Option<T>,
}

/// Frame-indexed ring of slots.
///
/// Frame `n` uses slot `n % len`. A slot is only handed out again once the
/// frame owning it signalled its frame-done semaphore.
pub struct SlotArena<T> {
  slots: Vec<Slot<T>>,
}

impl<T> fmt::Debug for SlotArena<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.slots.iter().map(|s| s.state)).finish()
  }
}

impl<T> SlotArena<T> {
  pub fn new(count: usize) -> Self {
    SlotArena {
      slots: (0..count.max(1))
        .map(|_| Slot {
          state: SlotState::Free,
          frame_done: Arc::new(Semaphore::new(SemaphoreId::FrameDone, 0)),
          data: None,
        })
        .collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  pub fn slot_index(&self, frame: u64) -> usize {
    (frame % self.slots.len() as u64) as usize
  }

  pub fn state(&self, slot: usize) -> Option<SlotState> {
    self.slots.get(slot).map(|s| s.state)
  }

  /// Claim the slot of `frame`, waiting up to `timeout` for its previous
  /// frame to complete.
  ///
  /// # Errors
  ///
  /// Returns [`ResourceError::SlotInFlight`] when the previous frame does
  /// not complete in time.
  pub fn acquire(
    &mut self, frame: u64, timeout: Duration,
  ) -> Result<usize, ResourceError> {
    let idx = self.slot_index(frame);
    let slot = &mut self.slots[idx];
    if let SlotState::InFlight { frame: owner } = slot.state {
      slot
        .frame_done
        .wait_at_least(1, timeout)
        .map_err(|_| ResourceError::SlotInFlight { slot: idx, frame: owner })?;
    }
    slot.frame_done.reset(0);
    slot.state = SlotState::InFlight { frame };
    Ok(idx)
  }

  /// Signal the frame-done semaphore of `slot`.
  pub fn complete(&mut self, slot: usize) {
    if let Some(slot) = self.slots.get_mut(slot) {
      slot.frame_done.set(1);
      slot.state = SlotState::Ready;
    }
  }

  /// Return a slot whose frame failed before completion.
  pub fn abandon(&mut self, slot: usize) {
    if let Some(slot) = self.slots.get_mut(slot) {
      slot.frame_done.set(1);
      slot.state = SlotState::Free;
    }
  }

  pub fn frame_done(&self, slot: usize) -> Option<Arc<Semaphore>> {
    self.slots.get(slot).map(|s| s.frame_done.clone())
  }

  pub fn data(&self, slot: usize) -> Option<&T> {
    self.slots.get(slot).and_then(|s| s.data.as_ref())
  }

  pub fn set_data(&mut self, slot: usize, data: T) {
    if let Some(slot) = self.slots.get_mut(slot) {
      slot.data = Some(data);
    }
  }

  /// Remove the data of `slot`, leaving it empty.
  pub fn take_data(&mut self, slot: usize) -> Option<T> {
    self.slots.get_mut(slot).and_then(|s| s.data.take())
  }
}
