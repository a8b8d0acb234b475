// Copyright (c) 2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::fmt;

use crate::sync::SemaphoreId;

/// Role of an engine within a scalable encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiEngineMode {
  /// Single pipe.
  Legacy,
  Left,
  Middle,
  Right,
}

impl MultiEngineMode {
  pub fn for_pipe(pipe: usize, pipes: usize) -> Self {
    if pipes <= 1 {
      MultiEngineMode::Legacy
    } else if pipe == 0 {
      MultiEngineMode::Left
    } else if pipe + 1 == pipes {
      MultiEngineMode::Right
    } else {
      MultiEngineMode::Middle
    }
  }
}

/// What the engines do during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
  /// Motion search, mode decision and entropy coding.
  Full,
  /// Entropy coding only, reusing the previous pass's decisions.
  PakOnly,
}

/// Commands an engine executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
  PipeModeSelect { mode: MultiEngineMode, kind: PassKind },
  CodeTile { tile: usize },
  CodeSlice { tile: usize, slice: usize, last_in_tile: bool },
  Flush,
  EndOfSequence,
  EndOfStream,
}

impl EngineCommand {
  pub fn name(&self) -> &'static str {
    match self {
      EngineCommand::PipeModeSelect { .. } => "pipe-mode-select",
      EngineCommand::CodeTile { .. } => "tile-coding",
      EngineCommand::CodeSlice { .. } => "slice",
      EngineCommand::Flush => "flush",
      EngineCommand::EndOfSequence => "end-of-sequence",
      EngineCommand::EndOfStream => "end-of-stream",
    }
  }
}

/// Work run by the first pipe once every pipe reached a synchronization
/// point. Drives the firmware kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossPipeStep {
  /// Aggregate the tile row and run the tile-row rate control.
  FinishRow { row: usize, row_pass: usize },
  /// Aggregate the frame and run the frame-level rate control.
  FinishPass { pass: usize },
}

/// One entry of a pipe's command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  Engine(EngineCommand),
  WaitSemaphore { id: SemaphoreId, value: u32 },
  SignalSemaphore { id: SemaphoreId, value: u32 },
  AcquireLock,
  ReleaseLock,
  CrossPipe(CrossPipeStep),
  /// Skip to the matching [`Command::RowEnd`] once the row was accepted.
  SkipIfRowDone { row: usize },
  RowEnd { row: usize },
}

impl fmt::Display for Command {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Command::Engine(cmd) => f.write_str(cmd.name()),
      Command::WaitSemaphore { id, value } => write!(f, "wait {} >= {}", id, value),
      Command::SignalSemaphore { id, value } => write!(f, "signal {} = {}", id, value),
      Command::AcquireLock => f.write_str("lock"),
      Command::ReleaseLock => f.write_str("unlock"),
      Command::CrossPipe(step) => write!(f, "{:?}", step),
      Command::SkipIfRowDone { row } => write!(f, "skip row {} if done", row),
      Command::RowEnd { row } => write!(f, "end of row {}", row),
    }
  }
}

/// Appends commands to a stream, strictly in order.
pub trait CommandBuilder {
  fn push(&mut self, command: Command);

  fn pipe_mode_select(&mut self, mode: MultiEngineMode, kind: PassKind) {
    self.push(Command::Engine(EngineCommand::PipeModeSelect { mode, kind }));
  }
  fn code_tile(&mut self, tile: usize) {
    self.push(Command::Engine(EngineCommand::CodeTile { tile }));
  }
  fn code_slice(&mut self, tile: usize, slice: usize, last_in_tile: bool) {
    self.push(Command::Engine(EngineCommand::CodeSlice {
      tile,
      slice,
      last_in_tile,
    }));
  }
  fn flush(&mut self) {
    self.push(Command::Engine(EngineCommand::Flush));
  }
  fn end_of_sequence(&mut self) {
    self.push(Command::Engine(EngineCommand::EndOfSequence));
  }
  fn end_of_stream(&mut self) {
    self.push(Command::Engine(EngineCommand::EndOfStream));
  }
  fn wait(&mut self, id: SemaphoreId, value: u32) {
    self.push(Command::WaitSemaphore { id, value });
  }
  fn signal(&mut self, id: SemaphoreId, value: u32) {
    self.push(Command::SignalSemaphore { id, value });
  }
  fn acquire_lock(&mut self) {
    self.push(Command::AcquireLock);
  }
  fn release_lock(&mut self) {
    self.push(Command::ReleaseLock);
  }
  /// Start the firmware work of a cross-pipe step.
  fn cross_pipe(&mut self, step: CrossPipeStep) {
    self.push(Command::CrossPipe(step));
  }
}

/// A recorded command stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBuffer {
  commands: Vec<Command>,
}

impl CommandBuffer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn commands(&self) -> &[Command] {
    &self.commands
  }

  pub fn len(&self) -> usize {
    self.commands.len()
  }

  pub fn is_empty(&self) -> bool {
    self.commands.is_empty()
  }

  /// Index of the [`Command::RowEnd`] of `row` after `from`.
  pub fn row_end(&self, row: usize, from: usize) -> Option<usize> {
    self.commands[from..]
      .iter()
      .position(|c| *c == Command::RowEnd { row })
      .map(|pos| from + pos)
  }
}

impl CommandBuilder for CommandBuffer {
  fn push(&mut self, command: Command) {
    self.commands.push(command);
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn engine_roles() {
    assert_eq!(MultiEngineMode::for_pipe(0, 1), MultiEngineMode::Legacy);
    assert_eq!(MultiEngineMode::for_pipe(0, 2), MultiEngineMode::Left);
    assert_eq!(MultiEngineMode::for_pipe(1, 2), MultiEngineMode::Right);
    assert_eq!(MultiEngineMode::for_pipe(1, 4), MultiEngineMode::Middle);
    assert_eq!(MultiEngineMode::for_pipe(2, 4), MultiEngineMode::Middle);
    assert_eq!(MultiEngineMode::for_pipe(3, 4), MultiEngineMode::Right);
  }

  #[test]
  fn builder_appends_in_order() {
    let mut buf = CommandBuffer::new();
    buf.acquire_lock();
    buf.pipe_mode_select(MultiEngineMode::Left, PassKind::Full);
    buf.code_tile(0);
    buf.code_slice(0, 0, true);
    buf.release_lock();
    buf.flush();
    buf.signal(SemaphoreId::PipeDone(0), 1);
    assert_eq!(
      buf.commands(),
      &[
        Command::AcquireLock,
        Command::Engine(EngineCommand::PipeModeSelect {
          mode: MultiEngineMode::Left,
          kind: PassKind::Full
        }),
        Command::Engine(EngineCommand::CodeTile { tile: 0 }),
        Command::Engine(EngineCommand::CodeSlice {
          tile: 0,
          slice: 0,
          last_in_tile: true
        }),
        Command::ReleaseLock,
        Command::Engine(EngineCommand::Flush),
        Command::SignalSemaphore { id: SemaphoreId::PipeDone(0), value: 1 },
      ]
    );
  }

  #[test]
  fn finds_row_end() {
    let mut buf = CommandBuffer::new();
    buf.push(Command::SkipIfRowDone { row: 0 });
    buf.code_tile(0);
    buf.push(Command::RowEnd { row: 0 });
    buf.push(Command::RowEnd { row: 1 });
    assert_eq!(buf.row_end(0, 0), Some(2));
    assert_eq!(buf.row_end(1, 0), Some(3));
    assert_eq!(buf.row_end(0, 3), None);
  }
}
