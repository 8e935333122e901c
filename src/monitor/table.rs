//! Syscall number to name lookup.
use std::fmt;

use super::regs::Abi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallName {
  Known(&'static str),
  Unknown,
}

impl SyscallName {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyscallName::Known(name) => name,
      SyscallName::Unknown => "unknown",
    }
  }
}

impl fmt::Display for SyscallName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Bounded per-ABI syscall table. Numbers outside it, or in one of its holes, are
/// [SyscallName::Unknown].
#[derive(Debug, Clone, Copy)]
pub struct SyscallTable {
  abi: Abi,
}

impl SyscallTable {
  pub fn new(abi: Abi) -> Self {
    Self { abi }
  }

  pub fn lookup(&self, number: u64) -> SyscallName {
    let Ok(number) = usize::try_from(number) else {
      return SyscallName::Unknown;
    };
    let name = match self.abi {
      Abi::X86_64 => syscalls::x86_64::Sysno::new(number).map(|sysno| sysno.name()),
      Abi::Aarch64 => syscalls::aarch64::Sysno::new(number).map(|sysno| sysno.name()),
    };
    name.map_or(SyscallName::Unknown, SyscallName::Known)
  }
}

/// Syscalls that receive a path or program name as a string pointer, and the argument slot
/// holding it.
pub fn string_argument(name: SyscallName) -> Option<usize> {
  match name.as_str() {
    "open" | "creat" | "execve" => Some(0),
    "openat" | "openat2" | "execveat" => Some(1),
    _ => None,
  }
}

pub fn is_open(name: SyscallName) -> bool {
  matches!(name.as_str(), "open" | "openat" | "openat2" | "creat")
}

pub fn is_exec(name: SyscallName) -> bool {
  matches!(name.as_str(), "execve" | "execveat")
}

pub fn is_connect(name: SyscallName) -> bool {
  name.as_str() == "connect"
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_names_x86_64_syscalls() {
    let table = SyscallTable::new(Abi::X86_64);
    assert_eq!(table.lookup(0), SyscallName::Known("read"));
    assert_eq!(table.lookup(1), SyscallName::Known("write"));
    assert_eq!(table.lookup(59), SyscallName::Known("execve"));
    assert_eq!(table.lookup(257), SyscallName::Known("openat"));
  }

  #[test]
  fn it_names_aarch64_syscalls() {
    let table = SyscallTable::new(Abi::Aarch64);
    assert_eq!(table.lookup(56), SyscallName::Known("openat"));
    assert_eq!(table.lookup(64), SyscallName::Known("write"));
    assert_eq!(table.lookup(221), SyscallName::Known("execve"));
  }

  #[test]
  fn unknown_numbers_degrade() {
    let table = SyscallTable::new(Abi::X86_64);
    assert_eq!(table.lookup(9_999), SyscallName::Unknown);
    assert_eq!(table.lookup(u64::MAX), SyscallName::Unknown);
    assert_eq!(table.lookup(u64::MAX).to_string(), "unknown");
  }

  #[test]
  fn it_knows_which_arguments_are_strings() {
    assert_eq!(string_argument(SyscallName::Known("open")), Some(0));
    assert_eq!(string_argument(SyscallName::Known("execve")), Some(0));
    assert_eq!(string_argument(SyscallName::Known("openat")), Some(1));
    assert_eq!(string_argument(SyscallName::Known("write")), None);
    assert_eq!(string_argument(SyscallName::Unknown), None);
  }
}
