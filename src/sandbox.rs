//! Running an untrusted executable in a namespaced chroot jail under a syscall tracer.
//!
//! The sandboxed child is created with `clone` directly into fresh user, pid, ipc, uts and net
//! namespaces. It then:
//!
//! 1. waits on the ready gate until the parent has written its uid/gid maps (an unmapped process
//!    cannot create files, so nothing can be built before that);
//! 2. moves into its own mount namespace and builds the jail on a private tmpfs;
//! 3. chroots into the jail, requests tracing and stops itself;
//! 4. execs the staged binary.
//!
//! The parent maps ids, opens the gate, traces the child until every process in the sandbox is
//! gone, and finally removes the jail directory. The tmpfs needs no unmounting: it disappears with
//! the child's mount namespace.
//!
//! Note that the child must never unwind or run atexit handlers back into the parent's code: its
//! entry function always returns a status, which the clone trampoline passes to `_exit`.
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sched::{clone, CloneFlags};
use nix::sys::ptrace;
use nix::sys::signal::{kill, raise, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execv, geteuid, pipe2, Pid};

use crate::config::SandboxConfig;
use crate::idmap::IdMapper;
use crate::jail::{HostRoot, JailBuilder, JailRoot};
use crate::monitor::stats::Summary;
use crate::monitor::{SyscallMonitor, TargetStatus};

/// Stack handed to the cloned child.
pub const STACK_SIZE: usize = 1024 * 1024;

/// Namespaces the child is created in. The mount namespace is added later by the child itself.
pub fn namespace_flags() -> CloneFlags {
  CloneFlags::CLONE_NEWUSER
    | CloneFlags::CLONE_NEWPID
    | CloneFlags::CLONE_NEWIPC
    | CloneFlags::CLONE_NEWUTS
    | CloneFlags::CLONE_NEWNET
}

/// The outcome of a completed sandbox run.
#[derive(Debug)]
pub struct RunReport {
  /// Pid of the target, as seen from the host.
  pub pid: Pid,
  pub status: TargetStatus,
  pub log_path: PathBuf,
  pub summary: Summary,
}

pub fn check_privileges() -> Result<()> {
  let euid = geteuid();
  if !euid.is_root() {
    bail!("malbox must be run as root (effective uid is {euid})");
  }
  Ok(())
}

/// One-shot parent to child signal: "your id maps are in place".
///
/// Both ends are close-on-exec so the target never inherits them.
struct ReadyGate {
  reader: OwnedFd,
  writer: OwnedFd,
}

impl ReadyGate {
  fn new() -> Result<Self> {
    let (reader, writer) = pipe2(OFlag::O_CLOEXEC).context("create ready gate")?;
    Ok(Self { reader, writer })
  }

  /// Child side. Returns once the parent has opened the gate, or fails if the parent dropped it
  /// without doing so.
  fn wait(&self) -> Result<()> {
    // SAFETY: the child owns a copy of the parent's fd table, and its copy of the OwnedFd values
    // is never dropped, so this cannot double close.
    unsafe { libc::close(self.writer.as_raw_fd()) };
    wait_for_byte(&self.reader)
  }

  /// Parent side.
  fn open(self) -> Result<()> {
    let ReadyGate { reader, writer } = self;
    drop(reader);
    File::from(writer).write_all(&[1]).context("open ready gate")
  }
}

fn wait_for_byte(reader: &OwnedFd) -> Result<()> {
  let mut buf = [0u8; 1];
  loop {
    // SAFETY: reading one byte into a one byte buffer from a valid fd.
    let read = unsafe { libc::read(reader.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 1) };
    match read {
      1 => return Ok(()),
      0 => bail!("parent went away before the sandbox was ready"),
      _ => match Errno::last() {
        Errno::EINTR => continue,
        err => return Err(err).context("wait for ready gate"),
      },
    }
  }
}

/// Kills the target if the run takes longer than allowed.
struct Watchdog {
  disarm: mpsc::Sender<()>,
  handle: JoinHandle<()>,
}

impl Watchdog {
  fn arm(pid: Pid, timeout: Duration) -> Self {
    let (disarm, disarmed) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
      if let Err(RecvTimeoutError::Timeout) = disarmed.recv_timeout(timeout) {
        warn!(pid:? = pid, timeout:? = timeout; "time limit reached, killing sandboxed process");
        match kill(pid, Signal::SIGKILL) {
          Ok(()) | Err(Errno::ESRCH) => {}
          Err(err) => error!(pid:? = pid, error:? = err; "failed to kill sandboxed process"),
        }
      }
    });
    Self { disarm, handle }
  }

  fn disarm(self) {
    // The watchdog may have fired and exited already, in which case nobody is listening.
    let _ = self.disarm.send(());
    if self.handle.join().is_err() {
      warn!("watchdog thread panicked");
    }
  }
}

/// Everything the child does between `clone` and `exec`. Only returns on failure.
fn enter_sandbox(config: &SandboxConfig, root: &Path, gate: &ReadyGate) -> Result<Infallible> {
  gate.wait()?;
  let jail = JailBuilder::new(config, root).build().context("build jail")?;
  let exec_path = config.jailed_binary();
  jail.enter(&mut HostRoot, &exec_path)?;

  ptrace::traceme().context("ptrace::traceme")?;
  raise(Signal::SIGSTOP).context("raise SIGSTOP")?;

  let (program, arg0) = exec_args(config, &exec_path)?;
  info!(path:? = exec_path; "executing sandboxed program");
  execv(&program, &[arg0.as_c_str()]).with_context(|| format!("execv {}", exec_path.display()))
}

/// The path to exec and the program's `argv[0]`, which is its bare name.
fn exec_args(config: &SandboxConfig, exec_path: &Path) -> Result<(CString, CString)> {
  let program = CString::new(exec_path.as_os_str().as_bytes())
    .with_context(|| format!("invalid program path {}", exec_path.display()))?;
  let arg0 = CString::new(config.binary_name.as_str())
    .with_context(|| format!("invalid program name {}", config.binary_name))?;
  Ok((program, arg0))
}

fn child_main(config: &SandboxConfig, root: &Path, gate: &ReadyGate) -> isize {
  match enter_sandbox(config, root, gate) {
    Ok(never) => match never {},
    Err(err) => {
      error!(error:% = format!("{err:#}"); "sandbox setup failed");
      1
    }
  }
}

fn spawn(config: &SandboxConfig, root: &Path, gate: &ReadyGate) -> Result<Pid> {
  let mut stack = vec![0u8; STACK_SIZE];
  // SAFETY: the child runs on its own copy of the address space (no CLONE_VM), so the borrows
  // captured by the closure stay valid for as long as it runs.
  let child = unsafe {
    clone(
      Box::new(|| child_main(config, root, gate)),
      &mut stack,
      namespace_flags(),
      Some(libc::SIGCHLD),
    )
  }
  .context("clone sandboxed process")?;
  Ok(child)
}

/// Parent side between `clone` and the start of tracing. On success the target is stopped and
/// attached.
fn prepare(
  config: &SandboxConfig,
  child: Pid,
  gate: ReadyGate,
) -> Result<SyscallMonitor<BufWriter<File>>> {
  let mapping = IdMapper::for_current_user().configure(child);
  if !mapping.is_complete() && config.strict {
    bail!("id mapping incomplete in strict mode: {mapping:?}");
  }
  gate.open()?;

  let log_path = config.log_path(child.as_raw());
  let mut monitor = SyscallMonitor::create_log(child, &log_path)?;
  monitor.attach().context("attach to sandboxed process")?;
  Ok(monitor)
}

/// Kill the child and collect it.
fn abandon(child: Pid) {
  match kill(child, Signal::SIGKILL) {
    Ok(()) | Err(Errno::ESRCH) => {}
    Err(err) => warn!(pid:? = child, error:? = err; "failed to kill sandboxed process"),
  }
  match reap(child) {
    Ok(status) => debug!(pid:? = child, status:? = status; "reaped abandoned process"),
    Err(err) => warn!(pid:? = child, error:% = format!("{err:#}"); "failed to reap sandboxed process"),
  }
}

/// Wait for the child to end, detaching from it if it is still traced.
fn reap(child: Pid) -> Result<TargetStatus> {
  loop {
    match waitpid(child, Some(WaitPidFlag::__WALL)) {
      Ok(WaitStatus::Exited(_, code)) => return Ok(TargetStatus::Exited(code)),
      Ok(WaitStatus::Signaled(_, signal, _core_dump)) => return Ok(TargetStatus::Signaled(signal)),
      Ok(WaitStatus::Stopped(pid, signal)) => {
        // The target's own self-stop is not re-delivered.
        let signal = (signal != Signal::SIGSTOP).then_some(signal);
        match ptrace::detach(pid, signal) {
          Ok(()) | Err(Errno::ESRCH) => {}
          Err(err) => return Err(err).with_context(|| format!("ptrace::detach {pid}")),
        }
      }
      Ok(WaitStatus::PtraceSyscall(pid)) | Ok(WaitStatus::PtraceEvent(pid, _, _)) => {
        match ptrace::detach(pid, None) {
          Ok(()) | Err(Errno::ESRCH) => {}
          Err(err) => return Err(err).with_context(|| format!("ptrace::detach {pid}")),
        }
      }
      Ok(_) => {}
      Err(Errno::EINTR) => {}
      // Already collected by the monitor.
      Err(Errno::ECHILD) => return Ok(TargetStatus::Unknown),
      Err(err) => return Err(err).with_context(|| format!("waitpid {child}")),
    }
  }
}

fn trace(config: &SandboxConfig, root: &JailRoot) -> Result<RunReport> {
  let gate = ReadyGate::new()?;
  let child = spawn(config, root.path(), &gate)?;
  info!(pid:? = child, binary:? = config.binary_path; "sandboxed process created");

  let monitor = match prepare(config, child, gate) {
    Ok(monitor) => monitor,
    Err(err) => {
      abandon(child);
      return Err(err);
    }
  };

  let watchdog = config.timeout.map(|timeout| Watchdog::arm(child, timeout));
  match monitor.run() {
    Ok(report) => {
      if let Some(watchdog) = watchdog {
        watchdog.disarm();
      }
      Ok(RunReport {
        pid: child,
        status: report.status,
        log_path: report.log_path.unwrap_or_else(|| config.log_path(child.as_raw())),
        summary: report.summary,
      })
    }
    Err(err) => {
      // The monitor has let go of the target; it runs to completion untraced.
      match finish_untraced(child, watchdog) {
        Ok(status) => info!(pid:? = child, status:? = status; "sandboxed process finished untraced"),
        Err(reap_err) => warn!(error:% = format!("{reap_err:#}"); "failed to reap sandboxed process"),
      }
      Err(err)
    }
  }
}

/// Reap a target nobody traces any more. The watchdog stays armed until it is collected.
fn finish_untraced(child: Pid, watchdog: Option<Watchdog>) -> Result<TargetStatus> {
  let status = reap(child);
  if let Some(watchdog) = watchdog {
    watchdog.disarm();
  }
  status
}

/// Run `config` to completion. Requires root.
pub fn run_sandbox(config: &SandboxConfig) -> Result<RunReport> {
  check_privileges()?;
  config.validate()?;
  let root = JailRoot::reserve(&config.jail_base)?;
  let result = trace(config, &root);
  if let Err(err) = root.teardown() {
    warn!(error:% = format!("{err:#}"); "failed to remove jail directory");
  }
  result
}
