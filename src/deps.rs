//! Shared-library staging for dynamically linked targets.
//!
//! Static binaries need nothing beyond themselves. Dynamic ones need their whole library closure
//! copied into the jail at the same absolute paths, plus the dynamic linker reachable at whatever
//! canonical location the ELF interpreter field names.
use std::collections::HashSet;
use std::fs::{self, DirBuilder};
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

/// Well-known interpreter locations across distributions and architectures.
pub const CANONICAL_INTERPRETERS: &[&str] = &[
  "/lib64/ld-linux-x86-64.so.2",
  "/lib/ld-linux.so.2",
  "/lib/ld-linux-aarch64.so.1",
  "/lib/ld-musl-x86_64.so.1",
  "/lib/ld-musl-aarch64.so.1",
];

const INTERPRETER_MARKERS: &[&str] = &["/ld-linux", "/ld-musl", "/ld.so"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
  Static,
  Dynamic,
}

/// Decides whether a binary is statically or dynamically linked.
pub trait ElfClassifier {
  fn classify(&self, binary: &Path) -> Result<Linkage>;
}

/// Lists the absolute host paths of a binary's transitive shared-library closure.
pub trait DependencyLister {
  fn list(&self, binary: &Path) -> Result<Vec<PathBuf>>;
}

/// Classifies through the `file` utility.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileCommand;

impl ElfClassifier for FileCommand {
  fn classify(&self, binary: &Path) -> Result<Linkage> {
    let output = Command::new("file")
      .arg(binary)
      .output()
      .context("spawn file")?;
    if !output.status.success() {
      bail!(
        "file {} failed: {}",
        binary.display(),
        String::from_utf8_lossy(&output.stderr).trim()
      );
    }
    Ok(parse_file_output(&String::from_utf8_lossy(&output.stdout)))
  }
}

/// Lists dependencies through `ldd`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LddCommand;

impl DependencyLister for LddCommand {
  fn list(&self, binary: &Path) -> Result<Vec<PathBuf>> {
    let output = Command::new("ldd")
      .arg(binary)
      .output()
      .context("spawn ldd")?;
    if !output.status.success() {
      bail!(
        "ldd {} failed: {}",
        binary.display(),
        String::from_utf8_lossy(&output.stderr).trim()
      );
    }
    Ok(parse_ldd_output(&String::from_utf8_lossy(&output.stdout)))
  }
}

pub fn parse_file_output(output: &str) -> Linkage {
  if output.contains("statically linked") || output.contains("static-pie linked") {
    Linkage::Static
  } else {
    Linkage::Dynamic
  }
}

/// Pull every absolute path out of `ldd` output, in order, without duplicates.
///
/// ```text
///   linux-vdso.so.1 (0x00007ffd...)
///   libc.so.6 => /lib/x86_64-linux-gnu/libc.so.6 (0x00007f...)
///   /lib64/ld-linux-x86-64.so.2 (0x00007f...)
/// ```
pub fn parse_ldd_output(output: &str) -> Vec<PathBuf> {
  let mut seen = HashSet::new();
  output
    .split_whitespace()
    .filter(|token| token.starts_with('/'))
    .map(PathBuf::from)
    .filter(|path| seen.insert(path.clone()))
    .collect()
}

pub fn is_interpreter(path: &Path) -> bool {
  let path = path.to_string_lossy();
  INTERPRETER_MARKERS.iter().any(|marker| path.contains(marker))
}

/// Where `host_path` lands inside the jail.
pub fn jail_path(jail_root: &Path, host_path: &Path) -> PathBuf {
  jail_root.join(host_path.strip_prefix("/").unwrap_or(host_path))
}

#[derive(Debug)]
pub struct ResolveReport {
  pub linkage: Linkage,
  /// Number of libraries copied into the jail.
  pub staged: usize,
  /// Libraries that could not be staged, with the reason.
  pub failed: Vec<(PathBuf, String)>,
  /// Interpreter symlinks created inside the jail (jail-relative absolute paths).
  pub interpreter_links: Vec<PathBuf>,
}

impl ResolveReport {
  fn new(linkage: Linkage) -> Self {
    Self {
      linkage,
      staged: 0,
      failed: Vec::new(),
      interpreter_links: Vec::new(),
    }
  }
}

pub struct DependencyResolver<C = FileCommand, L = LddCommand> {
  classifier: C,
  lister: L,
  interpreters: Vec<PathBuf>,
}

impl Default for DependencyResolver {
  fn default() -> Self {
    Self::new(FileCommand, LddCommand)
  }
}

impl<C: ElfClassifier, L: DependencyLister> DependencyResolver<C, L> {
  pub fn new(classifier: C, lister: L) -> Self {
    Self {
      classifier,
      lister,
      interpreters: CANONICAL_INTERPRETERS.iter().map(PathBuf::from).collect(),
    }
  }

  /// Replace the list of canonical interpreter locations.
  pub fn with_interpreters(mut self, interpreters: Vec<PathBuf>) -> Self {
    self.interpreters = interpreters;
    self
  }

  /// Stage the library closure of `binary` under `jail_root`.
  ///
  /// Individual copy or symlink failures are recorded in the report and do not stop resolution.
  /// Only a failure to obtain the closure at all is an error.
  pub fn resolve(&self, binary: &Path, jail_root: &Path) -> Result<ResolveReport> {
    let linkage = match self.classifier.classify(binary) {
      Ok(linkage) => linkage,
      Err(err) => {
        warn!(binary:? = binary, error:% = err; "classification failed, assuming dynamic");
        Linkage::Dynamic
      }
    };
    let mut report = ResolveReport::new(linkage);
    if linkage == Linkage::Static {
      info!("statically linked binary, no libraries to stage");
      return Ok(report);
    }

    let dependencies = self
      .lister
      .list(binary)
      .with_context(|| format!("list dependencies of {}", binary.display()))?;
    debug!(binary:? = binary, count = dependencies.len(); "resolved dependency closure");

    for dependency in &dependencies {
      match stage_file(dependency, jail_root) {
        Ok(dest) => {
          debug!(src:? = dependency, dest:? = dest; "staged library");
          report.staged += 1;
        }
        Err(err) => {
          warn!(library:? = dependency, error:% = format!("{err:#}"); "failed to stage library");
          report.failed.push((dependency.clone(), format!("{err:#}")));
          continue;
        }
      }
      if is_interpreter(dependency) {
        info!(interpreter:? = dependency; "found dynamic linker");
        self.link_interpreter(dependency, jail_root, &mut report);
      }
    }

    info!(staged = report.staged, failed = report.failed.len(); "staged libraries into jail");
    Ok(report)
  }

  /// Make `interpreter` reachable at every other canonical location that the host has.
  fn link_interpreter(&self, interpreter: &Path, jail_root: &Path, report: &mut ResolveReport) {
    for canonical in &self.interpreters {
      if canonical == interpreter || !canonical.exists() {
        continue;
      }
      let link = jail_path(jail_root, canonical);
      let result = create_parent(&link).and_then(|()| {
        symlink(interpreter, &link).with_context(|| format!("symlink {}", link.display()))
      });
      match result {
        Ok(()) => {
          debug!(link:? = canonical, target:? = interpreter; "linked interpreter");
          report.interpreter_links.push(canonical.clone());
        }
        Err(err) => {
          warn!(link:? = canonical, error:% = format!("{err:#}"); "failed to link interpreter");
        }
      }
    }
  }
}

/// Copy `src` to the same absolute path under `jail_root`, creating directories as needed.
pub fn stage_file(src: &Path, jail_root: &Path) -> Result<PathBuf> {
  if !src.is_absolute() {
    bail!("dependency path {} is not absolute", src.display());
  }
  let dest = jail_path(jail_root, src);
  create_parent(&dest)?;
  fs::copy(src, &dest).with_context(|| format!("copy {} to {}", src.display(), dest.display()))?;
  Ok(dest)
}

fn create_parent(path: &Path) -> Result<()> {
  if let Some(parent) = path.parent() {
    DirBuilder::new()
      .recursive(true)
      .mode(0o755)
      .create(parent)
      .with_context(|| format!("create {}", parent.display()))?;
  }
  Ok(())
}
