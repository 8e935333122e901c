//! Per-architecture view of a tracee's registers at a syscall stop.
//!
//! | ABI     | number     | args                        | return |
//! |---------|------------|-----------------------------|--------|
//! | x86_64  | `orig_rax` | rdi, rsi, rdx, r10, r8, r9  | rax    |
//! | aarch64 | `x8`       | x0 .. x5                    | x0     |
use nix::errno::Errno;
use nix::unistd::Pid;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
use nix::sys::ptrace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
  X86_64,
  Aarch64,
}

impl Abi {
  /// The ABI of the machine we are running on. Tracees are assumed to share it.
  pub fn native() -> Self {
    if cfg!(target_arch = "aarch64") {
      Abi::Aarch64
    } else {
      Abi::X86_64
    }
  }

  /// Fetch the registers of a stopped tracee.
  pub fn read_registers(self, pid: Pid) -> nix::Result<RegisterView> {
    match self {
      #[cfg(target_arch = "x86_64")]
      Abi::X86_64 => ptrace::getregs(pid).map(|regs| RegisterView::X86_64(regs.into())),
      #[cfg(target_arch = "aarch64")]
      Abi::Aarch64 => ptrace::getregs(pid).map(|regs| RegisterView::Aarch64(regs.into())),
      #[allow(unreachable_patterns)]
      _ => {
        let _ = pid;
        Err(Errno::ENOSYS)
      }
    }
  }
}

/// The syscall-relevant subset of `user_regs_struct` on x86_64.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct X86_64Registers {
  pub orig_rax: u64,
  pub rax: u64,
  pub rdi: u64,
  pub rsi: u64,
  pub rdx: u64,
  pub r10: u64,
  pub r8: u64,
  pub r9: u64,
}

#[cfg(target_arch = "x86_64")]
impl From<libc::user_regs_struct> for X86_64Registers {
  fn from(regs: libc::user_regs_struct) -> Self {
    Self {
      orig_rax: regs.orig_rax,
      rax: regs.rax,
      rdi: regs.rdi,
      rsi: regs.rsi,
      rdx: regs.rdx,
      r10: regs.r10,
      r8: regs.r8,
      r9: regs.r9,
    }
  }
}

/// General purpose registers `x0` to `x30` on aarch64.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Aarch64Registers {
  pub x: [u64; 31],
}

#[cfg(target_arch = "aarch64")]
impl From<libc::user_regs_struct> for Aarch64Registers {
  fn from(regs: libc::user_regs_struct) -> Self {
    Self { x: regs.regs }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterView {
  X86_64(X86_64Registers),
  Aarch64(Aarch64Registers),
}

impl RegisterView {
  pub fn abi(&self) -> Abi {
    match self {
      RegisterView::X86_64(_) => Abi::X86_64,
      RegisterView::Aarch64(_) => Abi::Aarch64,
    }
  }

  pub fn syscall_number(&self) -> u64 {
    match self {
      RegisterView::X86_64(regs) => regs.orig_rax,
      RegisterView::Aarch64(regs) => regs.x[8],
    }
  }

  /// The six argument slots. Only meaningful at syscall entry: on aarch64 `x0` is overwritten by
  /// the return value.
  pub fn args(&self) -> [u64; 6] {
    match self {
      RegisterView::X86_64(regs) => [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
      RegisterView::Aarch64(regs) => [regs.x[0], regs.x[1], regs.x[2], regs.x[3], regs.x[4], regs.x[5]],
    }
  }

  /// Only meaningful at syscall exit. Negative values in `-4095..0` are `-errno`.
  pub fn return_value(&self) -> i64 {
    match self {
      RegisterView::X86_64(regs) => regs.rax as i64,
      RegisterView::Aarch64(regs) => regs.x[0] as i64,
    }
  }
}
