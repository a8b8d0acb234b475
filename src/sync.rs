// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Semaphores shared by the engines of one frame.
//!
//! A semaphore is a counter in memory that command streams update and wait
//! on. Waits always run on the engine worker executing the stream, and every
//! wait is bounded by the watchdog so a lost signal turns into an error
//! instead of a hang.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Default bound on any single semaphore wait.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(5);

/// Names of the semaphores a command stream can refer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SemaphoreId {
  /// Completion of a pass (or tile-row pass) by one pipe.
  PipeDone(usize),
  /// Tile-row rate control finished for the current row pass.
  TileRowBrc,
  /// Frame-level rate control finished; holds the number of updates done.
  BrcHandoff,
  /// Binary lock around state shared by all pipes.
  PipeLock,
  /// The frame owning a resource slot has fully completed.
  FrameDone,
}

impl fmt::Display for SemaphoreId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SemaphoreId::PipeDone(pipe) => write!(f, "pipe-done[{}]", pipe),
      SemaphoreId::TileRowBrc => f.write_str("tile-row-brc"),
      SemaphoreId::BrcHandoff => f.write_str("brc-handoff"),
      SemaphoreId::PipeLock => f.write_str("pipe-lock"),
      SemaphoreId::FrameDone => f.write_str("frame-done"),
    }
  }
}

/// Synchronization failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum SyncError {
  /// A wait did not complete before the watchdog fired.
  #[error("timed out after {timeout:?} waiting on {semaphore} (value {value})")]
  Timeout {
    /// The semaphore being waited on.
    semaphore: SemaphoreId,
    /// Its value when the watchdog fired.
    value: u32,
    /// The watchdog duration.
    timeout: Duration,
  },
  /// Another engine failed and the frame was aborted.
  #[error("wait on {0} aborted")]
  Aborted(SemaphoreId),
  /// The stream referred to a semaphore the fabric does not own.
  #[error("unknown semaphore {0}")]
  UnknownSemaphore(SemaphoreId),
}

/// A counter cell with blocking waits.
pub struct Semaphore {
  id: SemaphoreId,
  value: Mutex<u32>,
  cond: Condvar,
  abort: Arc<AtomicBool>,
}

impl fmt::Debug for Semaphore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Semaphore")
      .field("id", &self.id)
      .field("value", &*self.value.lock())
      .finish()
  }
}

impl Semaphore {
  pub fn new(id: SemaphoreId, value: u32) -> Self {
    Self::with_abort(id, value, Arc::new(AtomicBool::new(false)))
  }

  fn with_abort(id: SemaphoreId, value: u32, abort: Arc<AtomicBool>) -> Self {
    Semaphore { id, value: Mutex::new(value), cond: Condvar::new(), abort }
  }

  pub fn id(&self) -> SemaphoreId {
    self.id
  }

  pub fn value(&self) -> u32 {
    *self.value.lock()
  }

  /// Forces the counter to `value`. Used by the host between frames.
  pub fn reset(&self, value: u32) {
    self.set(value);
  }

  /// Stores `value` and wakes every waiter.
  pub fn set(&self, value: u32) {
    let mut guard = self.value.lock();
    *guard = value;
    self.cond.notify_all();
  }

  /// Returns the new value.
  pub fn increment(&self) -> u32 {
    let mut guard = self.value.lock();
    *guard = guard.wrapping_add(1);
    self.cond.notify_all();
    *guard
  }

  /// Saturates at zero. Returns the new value.
  pub fn decrement(&self) -> u32 {
    let mut guard = self.value.lock();
    *guard = guard.saturating_sub(1);
    self.cond.notify_all();
    *guard
  }

  /// Blocks until `pred` holds for the counter and returns the value seen.
  ///
  /// # Errors
  ///
  /// Returns [`SyncError::Timeout`] when `timeout` elapses first and
  /// [`SyncError::Aborted`] when the owning fabric was aborted.
  pub fn wait_until<F>(&self, pred: F, timeout: Duration) -> Result<u32, SyncError>
  where
    F: Fn(u32) -> bool,
  {
    self.wait_and(pred, |_| {}, timeout)
  }

  /// Blocks until the counter is at least `target`.
  ///
  /// # Errors
  ///
  /// See [`Semaphore::wait_until`].
  pub fn wait_at_least(
    &self, target: u32, timeout: Duration,
  ) -> Result<u32, SyncError> {
    self.wait_until(|v| v >= target, timeout)
  }

  /// Takes one unit from the counter once it is non-zero.
  ///
  /// # Errors
  ///
  /// See [`Semaphore::wait_until`].
  pub fn acquire(&self, timeout: Duration) -> Result<(), SyncError> {
    self.wait_and(|v| v > 0, |v| *v -= 1, timeout).map(|_| ())
  }

  fn wait_and<F, A>(
    &self, pred: F, action: A, timeout: Duration,
  ) -> Result<u32, SyncError>
  where
    F: Fn(u32) -> bool,
    A: FnOnce(&mut u32),
  {
    let deadline = Instant::now() + timeout;
    let mut guard = self.value.lock();
    loop {
      if self.abort.load(Ordering::Acquire) {
        return Err(SyncError::Aborted(self.id));
      }
      if pred(*guard) {
        let seen = *guard;
        action(&mut *guard);
        return Ok(seen);
      }
      if self.cond.wait_until(&mut guard, deadline).timed_out() {
        if pred(*guard) {
          let seen = *guard;
          action(&mut *guard);
          return Ok(seen);
        }
        return Err(SyncError::Timeout {
          semaphore: self.id,
          value: *guard,
          timeout,
        });
      }
    }
  }

  fn wake(&self) {
    let _guard = self.value.lock();
    self.cond.notify_all();
  }
}

/// One entry of the synchronization trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
  /// `pipe` stored `value` into `semaphore`.
  Signalled { pipe: usize, semaphore: SemaphoreId, value: u32 },
  /// A wait of `pipe` on `semaphore` was satisfied with `value`.
  Observed { pipe: usize, semaphore: SemaphoreId, value: u32 },
  /// The first pipe finished the rate-control update of a tile-row pass.
  RowUpdated { row: usize, row_pass: usize },
  /// The first pipe finished the rate-control update of a frame pass.
  PassUpdated { pass: usize },
}

/// Ordered log of synchronization events, used for diagnostics and tests.
#[derive(Debug, Default)]
pub struct SyncTrace {
  events: Mutex<Vec<TraceEvent>>,
}

impl SyncTrace {
  pub fn record(&self, event: TraceEvent) {
    self.events.lock().push(event);
  }

  pub fn events(&self) -> Vec<TraceEvent> {
    self.events.lock().clone()
  }

  pub fn clear(&self) {
    self.events.lock().clear();
  }
}

/// The per-frame semaphores shared by the pipes of one encoder.
#[derive(Debug)]
pub struct SyncFabric {
  pipe_done: Vec<Semaphore>,
  tile_row_brc: Semaphore,
  brc_handoff: Semaphore,
  pipe_lock: Semaphore,
  abort: Arc<AtomicBool>,
  watchdog: Duration,
  trace: Option<SyncTrace>,
}

impl SyncFabric {
  pub fn new(pipes: usize, watchdog: Duration) -> Self {
    let abort = Arc::new(AtomicBool::new(false));
    let sem = |id, value| Semaphore::with_abort(id, value, abort.clone());
    SyncFabric {
      pipe_done: (0..pipes).map(|p| sem(SemaphoreId::PipeDone(p), 0)).collect(),
      tile_row_brc: sem(SemaphoreId::TileRowBrc, 0),
      brc_handoff: sem(SemaphoreId::BrcHandoff, 0),
      pipe_lock: sem(SemaphoreId::PipeLock, 1),
      abort,
      watchdog,
      trace: None,
    }
  }

  /// Enables the synchronization trace.
  pub fn with_trace(mut self) -> Self {
    self.trace = Some(SyncTrace::default());
    self
  }

  pub fn pipes(&self) -> usize {
    self.pipe_done.len()
  }

  pub fn watchdog(&self) -> Duration {
    self.watchdog
  }

  pub fn trace(&self) -> Option<&SyncTrace> {
    self.trace.as_ref()
  }

  pub(crate) fn record(&self, event: TraceEvent) {
    if let Some(trace) = &self.trace {
      trace.record(event);
    }
  }

  /// Looks up a semaphore by name.
  ///
  /// # Errors
  ///
  /// Frame-done semaphores belong to resource slots, and pipe indices past
  /// the pipe count do not exist; both yield
  /// [`SyncError::UnknownSemaphore`].
  pub fn semaphore(&self, id: SemaphoreId) -> Result<&Semaphore, SyncError> {
    match id {
      SemaphoreId::PipeDone(pipe) => self.pipe_done.get(pipe),
      SemaphoreId::TileRowBrc => Some(&self.tile_row_brc),
      SemaphoreId::BrcHandoff => Some(&self.brc_handoff),
      SemaphoreId::PipeLock => Some(&self.pipe_lock),
      SemaphoreId::FrameDone => None,
    }
    .ok_or(SyncError::UnknownSemaphore(id))
  }

  /// Brings every semaphore back to its initial value and clears a previous
  /// abort. Must only be called while no stream is executing.
  pub fn reset_frame(&self) {
    self.abort.store(false, Ordering::Release);
    for sem in &self.pipe_done {
      sem.reset(0);
    }
    self.tile_row_brc.reset(0);
    self.brc_handoff.reset(0);
    self.pipe_lock.reset(1);
    if let Some(trace) = &self.trace {
      trace.clear();
    }
  }

  /// Fails every pending and future wait until the next
  /// [`SyncFabric::reset_frame`].
  pub fn abort(&self) {
    self.abort.store(true, Ordering::Release);
    self
      .pipe_done
      .iter()
      .chain([&self.tile_row_brc, &self.brc_handoff, &self.pipe_lock])
      .for_each(Semaphore::wake);
  }

  pub fn is_aborted(&self) -> bool {
    self.abort.load(Ordering::Acquire)
  }

  /// Stores `value` on behalf of `pipe`.
  ///
  /// # Errors
  ///
  /// Fails for semaphores the fabric does not own.
  pub fn signal(
    &self, pipe: usize, id: SemaphoreId, value: u32,
  ) -> Result<(), SyncError> {
    let sem = self.semaphore(id)?;
    self.record(TraceEvent::Signalled { pipe, semaphore: id, value });
    sem.set(value);
    Ok(())
  }

  /// Waits on behalf of `pipe` until `id` reaches `value`.
  ///
  /// # Errors
  ///
  /// Fails on watchdog expiry, abort, or for unknown semaphores.
  pub fn wait(
    &self, pipe: usize, id: SemaphoreId, value: u32,
  ) -> Result<u32, SyncError> {
    let seen = self.semaphore(id)?.wait_at_least(value, self.watchdog)?;
    self.record(TraceEvent::Observed { pipe, semaphore: id, value: seen });
    Ok(seen)
  }

  /// Takes the cross-pipe lock.
  ///
  /// # Errors
  ///
  /// Fails on watchdog expiry or abort.
  pub fn lock(&self) -> Result<(), SyncError> {
    self.pipe_lock.acquire(self.watchdog)
  }

  pub fn unlock(&self) {
    self.pipe_lock.increment();
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::thread;

  #[test]
  fn counter_operations() {
    let sem = Semaphore::new(SemaphoreId::BrcHandoff, 0);
    assert_eq!(sem.increment(), 1);
    assert_eq!(sem.increment(), 2);
    assert_eq!(sem.decrement(), 1);
    sem.set(7);
    assert_eq!(sem.value(), 7);
    sem.reset(0);
    assert_eq!(sem.decrement(), 0);
  }

  #[test]
  fn wait_is_released_by_another_thread() {
    let sem = Arc::new(Semaphore::new(SemaphoreId::PipeDone(1), 0));
    let signaller = {
      let sem = sem.clone();
      thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        sem.set(3);
      })
    };
    let seen = sem.wait_at_least(2, Duration::from_secs(5)).unwrap();
    assert_eq!(seen, 3);
    signaller.join().unwrap();
  }

  #[test]
  fn wait_times_out() {
    let sem = Semaphore::new(SemaphoreId::TileRowBrc, 1);
    let err = sem.wait_at_least(2, Duration::from_millis(10)).unwrap_err();
    assert_eq!(
      err,
      SyncError::Timeout {
        semaphore: SemaphoreId::TileRowBrc,
        value: 1,
        timeout: Duration::from_millis(10),
      }
    );
  }

  #[test]
  fn abort_wakes_waiters() {
    let fabric = Arc::new(SyncFabric::new(2, Duration::from_secs(10)));
    let waiter = {
      let fabric = fabric.clone();
      thread::spawn(move || fabric.wait(0, SemaphoreId::PipeDone(1), 1))
    };
    thread::sleep(Duration::from_millis(20));
    fabric.abort();
    let res = waiter.join().unwrap();
    assert_eq!(res, Err(SyncError::Aborted(SemaphoreId::PipeDone(1))));

    fabric.reset_frame();
    assert!(!fabric.is_aborted());
    fabric.signal(1, SemaphoreId::PipeDone(1), 1).unwrap();
    assert_eq!(fabric.wait(0, SemaphoreId::PipeDone(1), 1), Ok(1));
  }

  #[test]
  fn lock_is_exclusive() {
    let fabric = SyncFabric::new(2, Duration::from_millis(10));
    fabric.lock().unwrap();
    assert!(matches!(fabric.lock(), Err(SyncError::Timeout { .. })));
    fabric.unlock();
    fabric.lock().unwrap();
  }

  #[test]
  fn unknown_semaphores() {
    let fabric = SyncFabric::new(2, DEFAULT_WATCHDOG);
    assert!(fabric.semaphore(SemaphoreId::PipeDone(1)).is_ok());
    assert_eq!(
      fabric.semaphore(SemaphoreId::PipeDone(2)).unwrap_err(),
      SyncError::UnknownSemaphore(SemaphoreId::PipeDone(2))
    );
    assert!(fabric.semaphore(SemaphoreId::FrameDone).is_err());
  }

  #[test]
  fn trace_records_in_order() {
    let fabric = SyncFabric::new(2, DEFAULT_WATCHDOG).with_trace();
    fabric.signal(1, SemaphoreId::PipeDone(1), 1).unwrap();
    fabric.wait(0, SemaphoreId::PipeDone(1), 1).unwrap();
    let events = fabric.trace().unwrap().events();
    assert_eq!(
      events,
      vec![
        TraceEvent::Signalled {
          pipe: 1,
          semaphore: SemaphoreId::PipeDone(1),
          value: 1
        },
        TraceEvent::Observed {
          pipe: 0,
          semaphore: SemaphoreId::PipeDone(1),
          value: 1
        },
      ]
    );
  }
}
