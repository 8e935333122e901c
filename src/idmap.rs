//! User namespace uid/gid mapping.
//!
//! The child runs as an unprivileged host user but appears as uid/gid 0 inside its own user
//! namespace. The kernel only accepts an unprivileged `gid_map` write once `setgroups` has been
//! set to `deny`, so the write order is fixed: `uid_map`, `setgroups`, `gid_map`.
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use log::{debug, warn};
use nix::unistd::{getgid, getuid, Gid, Pid, Uid};

/// One of the per-process identity control files under `/proc/<pid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFile {
  UidMap,
  SetGroups,
  GidMap,
}

impl ControlFile {
  pub fn file_name(self) -> &'static str {
    match self {
      ControlFile::UidMap => "uid_map",
      ControlFile::SetGroups => "setgroups",
      ControlFile::GidMap => "gid_map",
    }
  }
}

impl fmt::Display for ControlFile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.file_name())
  }
}

/// Sink for control file writes.
pub trait ControlFiles {
  fn write(&mut self, file: ControlFile, contents: &str) -> io::Result<()>;
}

/// The real control files of a process, rooted at `/proc/<pid>`.
pub struct ProcControlFiles {
  dir: PathBuf,
}

impl ProcControlFiles {
  pub fn for_pid(pid: Pid) -> Self {
    Self {
      dir: PathBuf::from(format!("/proc/{pid}")),
    }
  }

  pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }
}

impl ControlFiles for ProcControlFiles {
  fn write(&mut self, file: ControlFile, contents: &str) -> io::Result<()> {
    fs::write(self.dir.join(file.file_name()), contents)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingOutcome {
  Complete,
  /// At least one write failed. The remaining writes were still attempted.
  Partial { failed: Vec<ControlFile> },
}

impl MappingOutcome {
  pub fn is_complete(&self) -> bool {
    matches!(self, MappingOutcome::Complete)
  }
}

/// Maps root inside a new user namespace onto a single host uid/gid.
#[derive(Debug, Clone, Copy)]
pub struct IdMapper {
  host_uid: Uid,
  host_gid: Gid,
}

impl IdMapper {
  pub fn new(host_uid: Uid, host_gid: Gid) -> Self {
    Self { host_uid, host_gid }
  }

  /// Map onto the invoking user's real uid and gid.
  pub fn for_current_user() -> Self {
    Self::new(getuid(), getgid())
  }

  /// Write the mappings for `pid`.
  pub fn configure(&self, pid: Pid) -> MappingOutcome {
    debug!(pid:? = pid, uid:? = self.host_uid, gid:? = self.host_gid; "writing id maps");
    self.configure_with(&mut ProcControlFiles::for_pid(pid))
  }

  pub fn configure_with(&self, files: &mut impl ControlFiles) -> MappingOutcome {
    let writes = [
      (ControlFile::UidMap, format!("0 {} 1\n", self.host_uid)),
      (ControlFile::SetGroups, "deny\n".to_string()),
      (ControlFile::GidMap, format!("0 {} 1\n", self.host_gid)),
    ];
    let mut failed = Vec::new();
    for (file, contents) in writes {
      if let Err(err) = files.write(file, &contents) {
        warn!(file:% = file, error:% = err; "failed to write id map control file");
        failed.push(file);
      }
    }
    if failed.is_empty() {
      MappingOutcome::Complete
    } else {
      MappingOutcome::Partial { failed }
    }
  }
}
