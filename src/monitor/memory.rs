//! Reading strings out of a tracee's address space.
//!
//! The tracer does not share an address space with the tracee, so strings are pulled one word at
//! a time with `PTRACE_PEEKDATA`.
use std::mem::size_of;

use anyhow::{bail, Context, Result};
use nix::libc::c_long;
use nix::sys::ptrace;
use nix::unistd::Pid;

/// Upper bound on strings read from the tracee, in bytes.
pub const MAX_STRING_LEN: usize = 4096;

const WORD: u64 = size_of::<c_long>() as u64;

pub trait MemoryReader {
  /// Read a NUL-terminated string starting at `addr`, keeping at most `max_len` bytes.
  fn read_c_string(&mut self, addr: u64, max_len: usize) -> Result<String>;
}

/// The memory of a stopped tracee.
pub struct TraceeMemory {
  pid: Pid,
}

impl TraceeMemory {
  pub fn new(pid: Pid) -> Self {
    Self { pid }
  }
}

impl MemoryReader for TraceeMemory {
  fn read_c_string(&mut self, addr: u64, max_len: usize) -> Result<String> {
    let pid = self.pid;
    read_c_string_with(
      |word_addr| {
        let word = ptrace::read(pid, word_addr as ptrace::AddressType)
          .with_context(|| format!("failed to read string: {pid} at 0x{word_addr:x}"))?;
        Ok(word as u64)
      },
      addr,
      max_len,
    )
  }
}

/// Assemble a string from word-sized reads. `peek` is only ever called with word-aligned
/// addresses.
pub fn read_c_string_with(
  mut peek: impl FnMut(u64) -> Result<u64>,
  addr: u64,
  max_len: usize,
) -> Result<String> {
  if addr == 0 {
    bail!("null string pointer");
  }
  let mut buf = Vec::<u8>::with_capacity(256);
  let mut offset = (addr % WORD) as usize;
  let mut word_addr = addr - offset as u64;
  while buf.len() < max_len {
    let bytes = peek(word_addr)?.to_ne_bytes();
    let chunk = &bytes[offset..];
    match chunk.iter().position(|byte| *byte == 0) {
      Some(end) => {
        buf.extend_from_slice(&chunk[..end]);
        break;
      }
      None => buf.extend_from_slice(chunk),
    }
    offset = 0;
    word_addr += WORD;
  }
  buf.truncate(max_len);
  Ok(String::from_utf8_lossy(&buf).into_owned())
}
