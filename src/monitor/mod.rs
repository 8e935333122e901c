//! A ptrace-based syscall recorder.
//!
//! The target has already stopped itself (`PTRACE_TRACEME` followed by `raise(SIGSTOP)`) by the
//! time [SyscallMonitor::attach] runs. From there every tracee is resumed with `PTRACE_SYSCALL`
//! and every syscall-stop is fed through [state::MonitorState]. Children of the target are picked
//! up automatically through the fork/clone options and traced the same way.
//!
//! Nothing is ever blocked or rewritten: the monitor only observes.
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

pub mod memory;
pub mod regs;
pub mod stats;
pub mod state;
pub mod table;

use memory::TraceeMemory;
use regs::Abi;
use state::{MonitorState, TraceEvent};
use stats::Summary;

/// How the target itself ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
  Exited(i32),
  Signaled(Signal),
  /// Tracing stopped before the target was seen to end.
  Unknown,
}

#[derive(Debug)]
pub struct TraceReport {
  pub target: Pid,
  pub status: TargetStatus,
  pub summary: Summary,
  pub log_path: Option<PathBuf>,
}

/// The target ended before it could be traced. For a jailed target this means the jail could
/// not be built.
#[derive(Debug)]
pub struct TraceeGone {
  pub pid: Pid,
  pub status: WaitStatus,
}

impl std::fmt::Display for TraceeGone {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let pid = self.pid;
    match self.status {
      WaitStatus::Exited(_, code) => {
        write!(f, "process {pid} exited with status {code} before tracing began")
      }
      WaitStatus::Signaled(_, signal, _) => {
        write!(f, "process {pid} was killed by {signal} before tracing began")
      }
      status => write!(f, "process {pid} ended before tracing began: {status:?}"),
    }
  }
}

impl std::error::Error for TraceeGone {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    None
  }
}

fn trace_options() -> ptrace::Options {
  ptrace::Options::PTRACE_O_TRACESYSGOOD
    | ptrace::Options::PTRACE_O_TRACEFORK
    | ptrace::Options::PTRACE_O_TRACEVFORK
    | ptrace::Options::PTRACE_O_TRACECLONE
    | ptrace::Options::PTRACE_O_TRACEEXEC
    | ptrace::Options::PTRACE_O_EXITKILL
}

pub struct SyscallMonitor<W: Write> {
  target: Pid,
  abi: Abi,
  log: W,
  log_path: Option<PathBuf>,
  state: MonitorState,
  /// Every tracee that has stopped at least once and has not gone away yet.
  tracees: HashSet<Pid>,
  status: TargetStatus,
}

impl SyscallMonitor<BufWriter<File>> {
  /// A monitor writing its trace to a fresh file at `path`.
  ///
  /// `path` must not exist yet. Anything already there, a symlink in particular, is refused
  /// rather than written through.
  pub fn create_log(target: Pid, path: &Path) -> Result<Self> {
    let file = OpenOptions::new()
      .write(true)
      .create_new(true)
      .mode(0o644)
      .custom_flags(libc::O_NOFOLLOW)
      .open(path)
      .with_context(|| format!("create trace log {}", path.display()))?;
    let mut monitor = Self::new(target, BufWriter::new(file));
    monitor.log_path = Some(path.to_path_buf());
    Ok(monitor)
  }
}

impl<W: Write> SyscallMonitor<W> {
  pub fn new(target: Pid, log: W) -> Self {
    let abi = Abi::native();
    Self {
      target,
      abi,
      log,
      log_path: None,
      state: MonitorState::new(abi),
      tracees: HashSet::new(),
      status: TargetStatus::Unknown,
    }
  }

  /// Wait for the target's self-stop and set the tracing options.
  ///
  /// Fails with [TraceeGone] if the target exited instead of stopping.
  pub fn attach(&mut self) -> Result<()> {
    let target = self.target;
    match waitpid(target, Some(WaitPidFlag::__WALL)).with_context(|| format!("waitpid {target}"))? {
      WaitStatus::Stopped(_, signal) => {
        debug!(pid:? = target, signal:? = signal; "initial stop");
      }
      status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
        return Err(TraceeGone { pid: target, status }.into());
      }
      status => bail!("unexpected wait status for {target}: {status:?}"),
    }
    ptrace::setoptions(target, trace_options()).context("ptrace::setoptions")?;
    self.tracees.insert(target);

    writeln!(self.log, "===== malbox syscall monitor =====")
      .and_then(|_| writeln!(self.log, "target pid: {target}\n"))
      .context("write trace log")?;
    match &self.log_path {
      Some(path) => info!(pid:? = target, log:% = path.display(); "syscall monitor attached"),
      None => info!(pid:? = target; "syscall monitor attached"),
    }
    Ok(())
  }

  /// Trace until no tracee remains, then write the summary.
  ///
  /// If tracing breaks down midway, every tracee that can be is detached and left running; the
  /// caller is responsible for reaping the target.
  pub fn run(mut self) -> Result<TraceReport> {
    let outcome = self.drive();
    if let Err(err) = &outcome {
      error!(pid:? = self.target, error:% = format!("{err:#}"); "tracing aborted");
      self.detach_all();
    }

    for event in self.state.drain_unfinished() {
      self.emit(&event)?;
    }
    let summary = self.state.summary();
    write!(self.log, "\n{summary}")
      .and_then(|_| self.log.flush())
      .context("write trace log")?;
    info!(distinct = summary.distinct(); "syscall monitor finished");
    outcome?;

    Ok(TraceReport {
      target: self.target,
      status: self.status,
      summary,
      log_path: self.log_path,
    })
  }

  fn drive(&mut self) -> Result<()> {
    self.resume(self.target, None)?;

    loop {
      let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
        Ok(status) => status,
        Err(Errno::EINTR) => continue,
        Err(Errno::ECHILD) => {
          // No more tracees.
          break;
        }
        Err(err) => return Err(err).context("waitpid"),
      };

      match status {
        WaitStatus::PtraceSyscall(pid) => {
          let regs = match self.abi.read_registers(pid) {
            Ok(regs) => regs,
            Err(Errno::ESRCH) => continue,
            Err(err) => return Err(err).with_context(|| format!("ptrace::getregs {pid}")),
          };
          let event =
            self
              .state
              .on_syscall_stop(pid, &regs, Instant::now(), &mut TraceeMemory::new(pid));
          self.emit(&event)?;
          self.resume(pid, None)?;
        }

        WaitStatus::PtraceEvent(pid, _signal, event) => {
          debug!(pid:? = pid, event = event; "ptrace event");
          self.resume(pid, None)?;
        }

        WaitStatus::Stopped(pid, signal) => {
          // A freshly attached child announces itself with a SIGSTOP that it never asked for.
          if self.tracees.insert(pid) && signal == Signal::SIGSTOP {
            debug!(pid:? = pid; "new tracee");
            self.resume(pid, None)?;
          } else {
            debug!(pid:? = pid, signal:? = signal; "signal");
            self.resume(pid, Some(signal))?;
          }
        }

        WaitStatus::Exited(pid, code) => {
          debug!(pid:? = pid, exit_status = code; "exited");
          self.gone(pid)?;
          self.emit(&TraceEvent::Exited { pid, code })?;
          if pid == self.target {
            self.status = TargetStatus::Exited(code);
          }
        }

        WaitStatus::Signaled(pid, signal, _core_dump) => {
          debug!(pid:? = pid, signal:? = signal; "signaled");
          self.gone(pid)?;
          self.emit(&TraceEvent::Signaled { pid, signal })?;
          if pid == self.target {
            self.status = TargetStatus::Signaled(signal);
          }
        }

        status => {
          debug!(status:? = status; "wait");
        }
      }
    }

    Ok(())
  }

  /// Resume `pid` until its next syscall boundary. A tracee that vanished in the meantime is not
  /// an error; its exit status is still coming.
  fn resume(&self, pid: Pid, signal: Option<Signal>) -> Result<()> {
    match ptrace::syscall(pid, signal) {
      Ok(_) => Ok(()),
      Err(Errno::ESRCH) => Ok(()),
      Err(err) => Err(anyhow::Error::new(err).context(format!("failed to continue process {pid}"))),
    }
  }

  fn gone(&mut self, pid: Pid) -> Result<()> {
    self.tracees.remove(&pid);
    match self.state.on_gone(pid) {
      Some(event) => self.emit(&event),
      None => Ok(()),
    }
  }

  fn emit(&mut self, event: &TraceEvent) -> Result<()> {
    writeln!(self.log, "{event}").context("write trace log")
  }

  fn detach_all(&mut self) {
    for pid in self.tracees.drain() {
      match ptrace::detach(pid, None) {
        Ok(()) => debug!(pid:? = pid; "detached"),
        Err(Errno::ESRCH) => {}
        Err(err) => warn!(pid:? = pid, error:? = err; "failed to detach"),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::collections::HashMap;
  use std::fs::read_to_string;
  use std::os::unix::process::CommandExt;
  use std::panic::catch_unwind;
  use std::process::Command;

  use nix::sys::signal::raise;
  use nix::unistd::{fork, ForkResult};
  use tempfile::TempDir;

  /// Trace `child` from a forked tracer so that waiting on any pid cannot pick up children of
  /// other tests. Returns the tracer's exit status: the target's exit code, or 100+ on failure.
  fn trace_in_subprocess(child: fn() -> !, log_path: &Path) -> Result<i32> {
    match unsafe { fork() }.context("fork")? {
      ForkResult::Child => {
        let err = catch_unwind(|| {
          let target = match unsafe { fork() } {
            Ok(ForkResult::Child) => {
              if ptrace::traceme().is_err() || raise(Signal::SIGSTOP).is_err() {
                unsafe { libc::_exit(120) };
              }
              child()
            }
            Ok(ForkResult::Parent { child }) => child,
            Err(_) => unsafe { libc::_exit(121) },
          };
          let result = SyscallMonitor::create_log(target, log_path).and_then(|mut monitor| {
            monitor.attach()?;
            monitor.run()
          });
          let code = match result {
            Ok(report) => match report.status {
              TargetStatus::Exited(code) => code,
              TargetStatus::Signaled(_) => 102,
              TargetStatus::Unknown => 103,
            },
            Err(err) => {
              eprintln!("trace: {err:?}");
              101
            }
          };
          unsafe { libc::_exit(code) };
        });
        eprintln!("{:#?}", err);
        unsafe { libc::_exit(253) };
      }
      ForkResult::Parent { child } => match waitpid(child, None).context("waitpid tracer")? {
        WaitStatus::Exited(_, code) => Ok(code),
        status => bail!("unexpected tracer status: {status:?}"),
      },
    }
  }

  #[test]
  fn it_records_a_traced_exec() {
    fn exec_true() -> ! {
      let err = Command::new("/bin/true").exec();
      eprintln!("failed to exec: {err:#?}");
      unsafe { libc::_exit(1) };
    }

    let tmp_dir = TempDir::with_prefix("malbox-monitor-").expect("Failed to create temporary directory");
    let log_path = tmp_dir.path().join("trace.log");
    assert_eq!(trace_in_subprocess(exec_true, &log_path).expect("trace"), 0);

    let log = read_to_string(&log_path).expect("read trace log");
    assert!(log.starts_with("===== malbox syscall monitor =====\n"), "{log}");
    assert!(log.contains("[EXEC] Executing: /bin/true"), "{log}");
    assert!(log.contains("exited with status 0"), "{log}");
    assert!(log.contains("===== syscall summary ====="), "{log}");

    let counts = line_counts(&log);
    assert_eq!(counts.len(), 1, "{log}");
    let (entries, exits, unfinished) = counts.values().copied().next().expect("one tracee");
    // exit_group never returns.
    assert_eq!(unfinished, 1, "{log}");
    assert_eq!(entries, exits + unfinished, "{log}");
  }

  /// Entry, exit and unfinished line counts per pid.
  fn line_counts(log: &str) -> HashMap<String, (usize, usize, usize)> {
    let mut counts: HashMap<String, (usize, usize, usize)> = HashMap::new();
    for line in log.lines() {
      let mut words = line.split_whitespace();
      let kind = words.next();
      if !matches!(kind, Some("[ENTRY]" | "[EXIT]")) || words.next() != Some("pid") {
        continue;
      }
      let Some(pid) = words.next() else { continue };
      let count = counts.entry(pid.to_string()).or_default();
      match kind {
        Some("[EXIT]") => count.1 += 1,
        _ if line.ends_with("<unfinished>") => count.2 += 1,
        _ => count.0 += 1,
      }
    }
    counts
  }

  #[test]
  fn it_follows_forked_children() {
    fn exec_shell() -> ! {
      // Each command runs in a child of the shell; the trailing exit stops it from exec'ing the
      // last one in place.
      let err = Command::new("/bin/sh")
        .args(["-c", "/bin/true; /bin/true; exit 0"])
        .exec();
      eprintln!("failed to exec: {err:#?}");
      unsafe { libc::_exit(1) };
    }

    let tmp_dir = TempDir::with_prefix("malbox-monitor-").expect("Failed to create temporary directory");
    let log_path = tmp_dir.path().join("trace.log");
    assert_eq!(trace_in_subprocess(exec_shell, &log_path).expect("trace"), 0);

    let log = read_to_string(&log_path).expect("read trace log");
    let counts = line_counts(&log);
    assert!(counts.len() >= 3, "expected the shell and two children: {log}");
    for (pid, &(entries, exits, unfinished)) in &counts {
      assert_eq!(entries, exits + unfinished, "pid {pid}: {log}");
      assert!(entries > 0, "pid {pid}: {log}");
    }
    assert_eq!(log.matches("[EXEC] Executing: /bin/true").count(), 2, "{log}");
    assert_eq!(log.matches("exited with status 0").count(), counts.len(), "{log}");
  }

  #[test]
  fn it_refuses_a_planted_log_symlink() {
    let tmp_dir = TempDir::with_prefix("malbox-monitor-").expect("Failed to create temporary directory");
    let victim = tmp_dir.path().join("victim");
    std::fs::write(&victim, "keep me\n").expect("write victim");
    let log_path = tmp_dir.path().join("malbox_syscall_1.log");
    std::os::unix::fs::symlink(&victim, &log_path).expect("plant symlink");

    assert!(SyscallMonitor::create_log(Pid::this(), &log_path).is_err());
    assert_eq!(read_to_string(&victim).expect("read victim"), "keep me\n");

    // A dangling link is refused too, instead of creating its target.
    let dangling = tmp_dir.path().join("malbox_syscall_2.log");
    let missing = tmp_dir.path().join("missing");
    std::os::unix::fs::symlink(&missing, &dangling).expect("plant symlink");
    assert!(SyscallMonitor::create_log(Pid::this(), &dangling).is_err());
    assert!(!missing.exists());
  }

  #[test]
  fn it_creates_a_fresh_log() {
    let tmp_dir = TempDir::with_prefix("malbox-monitor-").expect("Failed to create temporary directory");
    let log_path = tmp_dir.path().join("malbox_syscall_1.log");
    let monitor = SyscallMonitor::create_log(Pid::this(), &log_path).expect("create log");
    assert_eq!(monitor.log_path.as_deref(), Some(log_path.as_path()));
    assert!(log_path.is_file());
  }

  #[test]
  fn it_reports_the_target_exit_code() {
    fn exec_false() -> ! {
      let err = Command::new("/bin/false").exec();
      eprintln!("failed to exec: {err:#?}");
      unsafe { libc::_exit(0) };
    }

    let tmp_dir = TempDir::with_prefix("malbox-monitor-").expect("Failed to create temporary directory");
    let log_path = tmp_dir.path().join("trace.log");
    assert_eq!(trace_in_subprocess(exec_false, &log_path).expect("trace"), 1);
  }

  #[test]
  fn it_detects_a_target_that_never_stopped() {
    let child = match unsafe { fork() }.expect("fork") {
      ForkResult::Child => unsafe { libc::_exit(3) },
      ForkResult::Parent { child } => child,
    };
    let mut monitor = SyscallMonitor::new(child, Vec::new());
    let err = monitor.attach().expect_err("target exited");
    let gone = err.downcast_ref::<TraceeGone>().expect("TraceeGone");
    assert!(matches!(gone.status, WaitStatus::Exited(_, 3)));
    assert_eq!(gone.to_string(), format!("process {child} exited with status 3 before tracing began"));
  }
}
