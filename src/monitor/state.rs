//! The entry/exit state machine, one per monitoring session.
//!
//! Every tracee alternates between awaiting a syscall entry and awaiting the matching exit. A
//! tracee with a pending entry is awaiting its exit; the next syscall-stop for it completes the
//! pair and is the only thing that updates the stats.
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use log::debug;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use super::memory::{MemoryReader, MAX_STRING_LEN};
use super::regs::{Abi, RegisterView};
use super::stats::{StatsTable, Summary};
use super::table::{is_connect, is_exec, is_open, string_argument, SyscallName, SyscallTable};

#[derive(Debug, Clone)]
struct PendingSyscall {
  number: u64,
  name: SyscallName,
  started: Instant,
}

/// What the entry of a syscall revealed beyond its raw arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDetail {
  Open(String),
  Exec(String),
  Connect { fd: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDetail {
  Opened { fd: i64 },
  Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
  Entry {
    pid: Pid,
    number: u64,
    name: SyscallName,
    args: [u64; 6],
    detail: Option<EntryDetail>,
  },
  Exit {
    pid: Pid,
    number: u64,
    name: SyscallName,
    result: i64,
    elapsed: Duration,
    detail: Option<ExitDetail>,
  },
  /// An entry whose exit never came, because the tracee went away first (`exit_group` always
  /// ends this way).
  Unfinished {
    pid: Pid,
    number: u64,
    name: SyscallName,
  },
  Exited {
    pid: Pid,
    code: i32,
  },
  Signaled {
    pid: Pid,
    signal: Signal,
  },
}

impl fmt::Display for TraceEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TraceEvent::Entry {
        pid,
        number,
        name,
        args,
        detail,
      } => {
        write!(
          f,
          "[ENTRY] pid {pid} syscall {number} ({name}), args: {:x}, {:x}, {:x}, {:x}, {:x}, {:x}",
          args[0], args[1], args[2], args[3], args[4], args[5]
        )?;
        match detail {
          Some(EntryDetail::Open(path)) => write!(f, "\n[FILE] Attempting to open: {path}"),
          Some(EntryDetail::Exec(path)) => write!(f, "\n[EXEC] Executing: {path}"),
          Some(EntryDetail::Connect { fd }) => {
            write!(f, "\n[NET] Attempting to connect, socket fd: {fd}")
          }
          None => Ok(()),
        }
      }
      TraceEvent::Exit {
        pid,
        number,
        name,
        result,
        elapsed,
        detail,
      } => {
        write!(
          f,
          "[EXIT] pid {pid} syscall {number} ({name}), result: {result}, time: {} us",
          elapsed.as_micros()
        )?;
        match detail {
          Some(ExitDetail::Opened { fd }) => write!(f, "\n[FILE] Successfully opened file, fd: {fd}"),
          Some(ExitDetail::Connected) => write!(f, "\n[NET] Successfully connected"),
          None => Ok(()),
        }
      }
      TraceEvent::Unfinished { pid, number, name } => {
        write!(f, "[ENTRY] pid {pid} syscall {number} ({name}) <unfinished>")
      }
      TraceEvent::Exited { pid, code } => write!(f, "[INFO] pid {pid} exited with status {code}"),
      TraceEvent::Signaled { pid, signal } => {
        write!(f, "[INFO] pid {pid} killed by signal {}", *signal as i32)
      }
    }
  }
}

pub struct MonitorState {
  table: SyscallTable,
  pending: HashMap<Pid, PendingSyscall>,
  stats: StatsTable,
}

impl MonitorState {
  pub fn new(abi: Abi) -> Self {
    Self {
      table: SyscallTable::new(abi),
      pending: HashMap::new(),
      stats: StatsTable::default(),
    }
  }

  /// Whether `pid` is between the entry and exit of a syscall.
  pub fn in_syscall(&self, pid: Pid) -> bool {
    self.pending.contains_key(&pid)
  }

  /// Feed one syscall-stop of `pid`. Entry and exit are told apart by whether an entry is
  /// pending, not by the registers.
  pub fn on_syscall_stop(
    &mut self,
    pid: Pid,
    regs: &RegisterView,
    now: Instant,
    memory: &mut impl MemoryReader,
  ) -> TraceEvent {
    match self.pending.remove(&pid) {
      Some(pending) => self.complete(pid, pending, regs, now),
      None => self.begin(pid, regs, now, memory),
    }
  }

  fn begin(
    &mut self,
    pid: Pid,
    regs: &RegisterView,
    now: Instant,
    memory: &mut impl MemoryReader,
  ) -> TraceEvent {
    let number = regs.syscall_number();
    let name = self.table.lookup(number);
    let args = regs.args();
    let detail = match string_argument(name) {
      Some(slot) => match memory.read_c_string(args[slot], MAX_STRING_LEN) {
        Ok(path) if is_exec(name) => Some(EntryDetail::Exec(path)),
        Ok(path) => Some(EntryDetail::Open(path)),
        Err(err) => {
          debug!(pid:? = pid, sysno = number, error:% = format!("{err:#}"); "unreadable argument");
          None
        }
      },
      None if is_connect(name) => Some(EntryDetail::Connect { fd: args[0] }),
      None => None,
    };
    self.pending.insert(
      pid,
      PendingSyscall {
        number,
        name,
        started: now,
      },
    );
    TraceEvent::Entry {
      pid,
      number,
      name,
      args,
      detail,
    }
  }

  fn complete(
    &mut self,
    pid: Pid,
    pending: PendingSyscall,
    regs: &RegisterView,
    now: Instant,
  ) -> TraceEvent {
    let result = regs.return_value();
    let elapsed = now.saturating_duration_since(pending.started);
    self.stats.record(pending.number, pending.name, elapsed);
    let detail = if is_open(pending.name) && result >= 0 {
      Some(ExitDetail::Opened { fd: result })
    } else if is_connect(pending.name) && result == 0 {
      Some(ExitDetail::Connected)
    } else {
      None
    };
    TraceEvent::Exit {
      pid,
      number: pending.number,
      name: pending.name,
      result,
      elapsed,
      detail,
    }
  }

  /// Forget `pid`, returning its dangling entry if it died inside a syscall.
  pub fn on_gone(&mut self, pid: Pid) -> Option<TraceEvent> {
    self.pending.remove(&pid).map(|pending| TraceEvent::Unfinished {
      pid,
      number: pending.number,
      name: pending.name,
    })
  }

  /// Every entry still waiting for its exit, in pid order.
  pub fn drain_unfinished(&mut self) -> Vec<TraceEvent> {
    let mut pids: Vec<Pid> = self.pending.keys().copied().collect();
    pids.sort_by_key(|pid| pid.as_raw());
    pids.into_iter().filter_map(|pid| self.on_gone(pid)).collect()
  }

  pub fn stats(&self) -> &StatsTable {
    &self.stats
  }

  pub fn summary(&self) -> Summary {
    self.stats.summary()
  }
}
