//! Validated run configuration.
//!
//! A [SandboxConfig] is built in the parent before anything is spawned and is borrowed by the
//! child's entry closure. Nothing crosses the namespace boundary as a raw pointer.
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Default size of the jail's tmpfs, in megabytes.
pub const DEFAULT_TMPFS_SIZE_MB: u32 = 50;

/// Name the default program is staged under.
pub const DEFAULT_PROGRAM_NAME: &str = "hello";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
  /// Absolute, canonical host path of the target binary.
  pub binary_path: PathBuf,
  /// File name the binary is staged and executed under, i.e. `/bin/<binary_name>`.
  pub binary_name: String,
  /// Whether the target is the compiled default program.
  pub using_default: bool,
  /// Directory the randomized jail root is created in.
  pub jail_base: PathBuf,
  /// Size bound of the jail's tmpfs.
  pub tmpfs_size_mb: u32,
  /// Directory the per-run trace log is written to.
  pub log_dir: PathBuf,
  /// Turn tolerated failures (partial id mapping, missing libraries) into fatal ones.
  pub strict: bool,
  /// Kill the target if it has not finished after this long.
  pub timeout: Option<Duration>,
}

impl SandboxConfig {
  /// Validate a user-supplied binary and build a config with default settings.
  ///
  /// The binary must exist, be a regular file, and carry the owner-execute bit.
  pub fn for_binary(path: &Path) -> Result<Self> {
    let binary_path =
      fs::canonicalize(path).with_context(|| format!("resolve path {}", path.display()))?;
    if !is_executable(&binary_path)? {
      bail!("'{}' is not an executable file", binary_path.display());
    }
    let binary_name = path
      .file_name()
      .and_then(|name| name.to_str())
      .map(str::to_owned)
      .with_context(|| format!("no usable file name in {}", path.display()))?;
    Ok(Self {
      binary_path,
      binary_name,
      using_default: false,
      ..Self::defaults()
    })
  }

  /// Build a config for the compiled default program.
  pub fn for_default_program(path: &Path) -> Result<Self> {
    let binary_path =
      fs::canonicalize(path).with_context(|| format!("resolve path {}", path.display()))?;
    Ok(Self {
      binary_path,
      binary_name: DEFAULT_PROGRAM_NAME.to_string(),
      using_default: true,
      ..Self::defaults()
    })
  }

  /// Path of the trace log for a given target pid.
  pub fn log_path(&self, pid: i32) -> PathBuf {
    self.log_dir.join(format!("malbox_syscall_{pid}.log"))
  }

  /// Reject settings that would weaken the jail. Called before anything is spawned.
  pub fn validate(&self) -> Result<()> {
    // tmpfs reads size=0 as "no limit".
    if self.tmpfs_size_mb == 0 {
      bail!("tmpfs size must be at least 1 MB");
    }
    Ok(())
  }

  /// Path the binary is executed from once inside the jail.
  pub fn jailed_binary(&self) -> PathBuf {
    Path::new("/bin").join(&self.binary_name)
  }

  fn defaults() -> Self {
    Self {
      binary_path: PathBuf::new(),
      binary_name: String::new(),
      using_default: false,
      jail_base: PathBuf::from("/tmp"),
      tmpfs_size_mb: DEFAULT_TMPFS_SIZE_MB,
      log_dir: PathBuf::from("/tmp"),
      strict: false,
      timeout: None,
    }
  }
}

/// Whether `path` is a regular file with the owner-execute bit set.
pub fn is_executable(path: &Path) -> Result<bool> {
  let metadata = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
  Ok(metadata.is_file() && metadata.permissions().mode() & 0o100 != 0)
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::fs::File;

  use tempfile::TempDir;

  #[test]
  fn it_accepts_executables() {
    let tmp_dir = TempDir::with_prefix("malbox-config-").expect("create temp dir");
    let path = tmp_dir.path().join("sample");
    File::create(&path).expect("create file");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");

    let config = SandboxConfig::for_binary(&path).expect("valid config");
    assert_eq!(config.binary_name, "sample");
    assert!(config.binary_path.is_absolute());
    assert!(!config.using_default);
    assert_eq!(config.tmpfs_size_mb, DEFAULT_TMPFS_SIZE_MB);
    assert_eq!(config.jailed_binary(), PathBuf::from("/bin/sample"));
  }

  #[test]
  fn it_rejects_non_executables() {
    let tmp_dir = TempDir::with_prefix("malbox-config-").expect("create temp dir");
    let path = tmp_dir.path().join("data.txt");
    File::create(&path).expect("create file");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");

    assert!(SandboxConfig::for_binary(&path).is_err());
    assert!(SandboxConfig::for_binary(tmp_dir.path()).is_err());
    assert!(SandboxConfig::for_binary(&tmp_dir.path().join("missing")).is_err());
  }

  #[test]
  fn it_rejects_an_unbounded_tmpfs() {
    let mut config = SandboxConfig::defaults();
    config.validate().expect("defaults are valid");
    config.tmpfs_size_mb = 0;
    let err = config.validate().expect_err("size 0 is unbounded");
    assert!(err.to_string().contains("tmpfs size"));
  }

  #[test]
  fn log_path_is_keyed_by_pid() {
    let mut config = SandboxConfig::defaults();
    config.log_dir = PathBuf::from("/var/log/malbox");
    assert_eq!(
      config.log_path(4242),
      PathBuf::from("/var/log/malbox/malbox_syscall_4242.log")
    );
  }
}
