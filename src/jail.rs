//! The chroot jail the target runs in.
//!
//! The jail root is reserved by the parent (so the parent can remove it once the child has been
//! reaped) and populated by the child inside its own mount namespace:
//!
//! ```text
//! <jail>/
//! ├── bin/      0755, holds the staged target
//! ├── lib/      0755
//! ├── lib64/    0755
//! ├── tmp/      0777
//! ├── dev/      0755
//! └── ...       shared libraries at their host paths, for dynamic targets
//! ```
use std::fs::{self, DirBuilder};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{access, chdir, chroot, AccessFlags};
use tempfile::TempDir;

use crate::config::SandboxConfig;
use crate::deps::{
  DependencyLister, DependencyResolver, ElfClassifier, FileCommand, LddCommand, ResolveReport,
};

/// Directories every jail starts with, and their modes.
pub const SKELETON: &[(&str, u32)] = &[
  ("bin", 0o755),
  ("lib", 0o755),
  ("lib64", 0o755),
  ("tmp", 0o777),
  ("dev", 0o755),
];

/// A uniquely named, not yet populated jail directory.
#[derive(Debug)]
pub struct JailRoot {
  dir: TempDir,
}

impl JailRoot {
  /// Create `<base>/sandbox-XXXXXX`.
  pub fn reserve(base: &Path) -> Result<Self> {
    let dir = tempfile::Builder::new()
      .prefix("sandbox-")
      .tempdir_in(base)
      .with_context(|| format!("create jail directory in {}", base.display()))?;
    debug!(path:? = dir.path(); "reserved jail root");
    Ok(Self { dir })
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  /// Remove the jail directory. Must only run after the child's mount namespace is gone, at
  /// which point the tmpfs has disappeared with it and only the empty host directory is left.
  pub fn teardown(self) -> Result<()> {
    let path = self.dir.path().to_path_buf();
    self
      .dir
      .close()
      .with_context(|| format!("remove jail directory {}", path.display()))?;
    debug!(path:? = path; "removed jail root");
    Ok(())
  }
}

/// Move into a new mount namespace whose mounts do not propagate to or from the host.
pub fn isolate_mounts() -> Result<()> {
  unshare(CloneFlags::CLONE_NEWNS).context("unshare mount namespace")?;
  mount(
    None::<&str>,
    "/",
    None::<&str>,
    MsFlags::MS_REC | MsFlags::MS_PRIVATE,
    None::<&str>,
  )
  .context("make / private")?;
  Ok(())
}

/// Mount a tmpfs capped at `size_mb` megabytes on `root`.
pub fn mount_tmpfs(root: &Path, size_mb: u32) -> Result<()> {
  if size_mb == 0 {
    bail!("refusing to mount an unbounded tmpfs on {}", root.display());
  }
  let options = format!("size={size_mb}M");
  mount(
    Some("none"),
    root,
    Some("tmpfs"),
    MsFlags::empty(),
    Some(options.as_str()),
  )
  .with_context(|| format!("mount tmpfs on {}", root.display()))?;
  Ok(())
}

/// Skeleton directories that could not be created. `bin` is never in here: it is fatal.
#[derive(Debug, Default)]
pub struct SkeletonReport {
  pub failed: Vec<(&'static str, String)>,
}

pub fn create_skeleton(root: &Path) -> Result<SkeletonReport> {
  let mut report = SkeletonReport::default();
  for &(name, mode) in SKELETON {
    let path = root.join(name);
    let result = DirBuilder::new()
      .mode(mode)
      .create(&path)
      // The umask applies to mkdir, so the mode is set again explicitly.
      .and_then(|()| fs::set_permissions(&path, fs::Permissions::from_mode(mode)));
    match result {
      Ok(()) => {}
      Err(err) if name == "bin" => {
        return Err(err).with_context(|| format!("create {}", path.display()));
      }
      Err(err) => {
        warn!(dir:? = path, error:% = err; "failed to create jail directory");
        report.failed.push((name, err.to_string()));
      }
    }
  }
  Ok(report)
}

/// Copy the target to `<root>/bin/<name>` and make sure it can be executed.
pub fn stage_binary(src: &Path, root: &Path, name: &str) -> Result<PathBuf> {
  let dest = root.join("bin").join(name);
  info!(src:? = src, dest:? = dest; "staging binary");
  let copied = fs::copy(src, &dest)
    .with_context(|| format!("copy {} to {}", src.display(), dest.display()))?;

  let metadata = fs::metadata(&dest).with_context(|| format!("stat {}", dest.display()))?;
  let mode = metadata.permissions().mode() & 0o7777;
  info!(size = metadata.len(), mode:% = format!("{mode:o}"); "binary staged");
  if metadata.len() != copied {
    bail!(
      "staged binary is {} bytes, expected {}",
      metadata.len(),
      copied
    );
  }
  if mode & 0o100 == 0 {
    warn!(dest:? = dest; "staged binary is not executable, fixing mode");
    fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))
      .with_context(|| format!("chmod {}", dest.display()))?;
  }
  Ok(dest)
}

/// The two process-wide operations a root switch is made of.
pub trait RootSwitch {
  fn chdir(&mut self, path: &Path) -> Result<()>;
  fn chroot(&mut self, path: &Path) -> Result<()>;
}

/// Switches the root of the calling process.
pub struct HostRoot;

impl RootSwitch for HostRoot {
  fn chdir(&mut self, path: &Path) -> Result<()> {
    chdir(path).with_context(|| format!("chdir {}", path.display()))
  }

  fn chroot(&mut self, path: &Path) -> Result<()> {
    chroot(path).with_context(|| format!("chroot {}", path.display()))
  }
}

/// Make `root` the filesystem root.
///
/// The working directory has to move inside the new root before and after the chroot: a cwd left
/// outside it stays reachable through relative paths.
pub fn enter_jail(switch: &mut impl RootSwitch, root: &Path) -> Result<()> {
  switch.chdir(root)?;
  switch.chroot(root)?;
  switch.chdir(Path::new("/"))?;
  Ok(())
}

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
  pub name: String,
  pub mode: u32,
  pub size: u64,
}

/// Directory listing, sorted by name.
pub fn list_dir(path: &Path) -> Result<Vec<ListingEntry>> {
  let mut entries = fs::read_dir(path)
    .with_context(|| format!("read {}", path.display()))?
    .map(|entry| {
      let entry = entry?;
      let metadata = entry.metadata()?;
      Ok(ListingEntry {
        name: entry.file_name().to_string_lossy().into_owned(),
        mode: metadata.permissions().mode() & 0o7777,
        size: metadata.len(),
      })
    })
    .collect::<std::io::Result<Vec<_>>>()
    .with_context(|| format!("list {}", path.display()))?;
  entries.sort_by(|a, b| a.name.cmp(&b.name));
  Ok(entries)
}

pub struct JailBuilder<'a, C, L> {
  config: &'a SandboxConfig,
  root: &'a Path,
  resolver: DependencyResolver<C, L>,
}

impl<'a> JailBuilder<'a, FileCommand, LddCommand> {
  pub fn new(config: &'a SandboxConfig, root: &'a Path) -> Self {
    Self::with_resolver(config, root, DependencyResolver::default())
  }
}

impl<'a, C: ElfClassifier, L: DependencyLister> JailBuilder<'a, C, L> {
  pub fn with_resolver(
    config: &'a SandboxConfig,
    root: &'a Path,
    resolver: DependencyResolver<C, L>,
  ) -> Self {
    Self {
      config,
      root,
      resolver,
    }
  }

  /// Build the jail. Runs in the child, inside the new user namespace.
  pub fn build(self) -> Result<Jail> {
    isolate_mounts()?;
    mount_tmpfs(self.root, self.config.tmpfs_size_mb)?;
    info!(root:? = self.root, size_mb = self.config.tmpfs_size_mb; "mounted jail tmpfs");
    self.populate()
  }

  /// Everything after the mounts: skeleton, binary, libraries.
  pub fn populate(self) -> Result<Jail> {
    let skeleton = create_skeleton(self.root)?;
    let binary = stage_binary(&self.config.binary_path, self.root, &self.config.binary_name)?;

    let deps = match self.resolver.resolve(&self.config.binary_path, self.root) {
      Ok(report) => Some(report),
      Err(err) => {
        warn!(error:% = format!("{err:#}"); "dependency resolution failed");
        if self.config.strict {
          return Err(err.context("dependency resolution failed in strict mode"));
        }
        None
      }
    };
    if self.config.strict {
      if let Some(report) = &deps {
        if let Some((library, reason)) = report.failed.first() {
          bail!("could not stage {} in strict mode: {reason}", library.display());
        }
      }
    }

    Ok(Jail {
      root: self.root.to_path_buf(),
      binary,
      skeleton,
      deps,
    })
  }
}

/// A populated jail, not yet entered.
#[derive(Debug)]
pub struct Jail {
  root: PathBuf,
  binary: PathBuf,
  skeleton: SkeletonReport,
  deps: Option<ResolveReport>,
}

impl Jail {
  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Host-side path of the staged binary.
  pub fn binary(&self) -> &Path {
    &self.binary
  }

  pub fn skeleton(&self) -> &SkeletonReport {
    &self.skeleton
  }

  pub fn dependencies(&self) -> Option<&ResolveReport> {
    self.deps.as_ref()
  }

  /// Switch the calling process's root into the jail.
  pub fn enter(self, switch: &mut impl RootSwitch, exec_path: &Path) -> Result<()> {
    info!(root:? = self.root; "entering jail");
    enter_jail(switch, &self.root)?;

    match list_dir(Path::new("/bin")) {
      Ok(entries) => {
        for entry in entries {
          debug!(name:% = entry.name, mode:% = format!("{:o}", entry.mode), size = entry.size; "/bin");
        }
      }
      Err(err) => warn!(error:% = format!("{err:#}"); "failed to list /bin"),
    }
    if let Err(err) = access(exec_path, AccessFlags::X_OK) {
      warn!(path:? = exec_path, error:% = err; "target is not executable inside the jail");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::fs::File;

  use crate::deps::Linkage;

  #[derive(Debug, PartialEq, Eq)]
  enum Call {
    Chdir(PathBuf),
    Chroot(PathBuf),
  }

  #[derive(Default)]
  struct Recorder {
    calls: Vec<Call>,
    fail_chroot: bool,
  }

  impl RootSwitch for Recorder {
    fn chdir(&mut self, path: &Path) -> Result<()> {
      self.calls.push(Call::Chdir(path.to_path_buf()));
      Ok(())
    }

    fn chroot(&mut self, path: &Path) -> Result<()> {
      self.calls.push(Call::Chroot(path.to_path_buf()));
      if self.fail_chroot {
        bail!("chroot: EPERM");
      }
      Ok(())
    }
  }

  #[test]
  fn it_changes_into_the_new_root_after_chroot() {
    let mut recorder = Recorder::default();
    let root = Path::new("/tmp/sandbox-abc123");
    enter_jail(&mut recorder, root).expect("enter jail");
    assert_eq!(
      recorder.calls,
      vec![
        Call::Chdir(root.to_path_buf()),
        Call::Chroot(root.to_path_buf()),
        Call::Chdir(PathBuf::from("/")),
      ]
    );
  }

  #[test]
  fn it_stops_when_chroot_fails() {
    let mut recorder = Recorder {
      fail_chroot: true,
      ..Default::default()
    };
    let root = Path::new("/tmp/sandbox-abc123");
    assert!(enter_jail(&mut recorder, root).is_err());
    assert_eq!(recorder.calls.len(), 2);
  }

  #[test]
  fn skeleton_has_exactly_five_directories() {
    let root = JailRoot::reserve(&std::env::temp_dir()).expect("reserve jail");
    let report = create_skeleton(root.path()).expect("create skeleton");
    assert!(report.failed.is_empty());

    let entries = list_dir(root.path()).expect("list jail");
    let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names, vec!["bin", "dev", "lib", "lib64", "tmp"]);
    for &(name, mode) in SKELETON {
      let entry = entries.iter().find(|entry| entry.name == name).expect("entry");
      assert_eq!(entry.mode, mode, "mode of {name}");
      assert!(root.path().join(name).is_dir());
    }
    root.teardown().expect("teardown");
  }

  #[test]
  fn missing_bin_is_fatal() {
    let root = JailRoot::reserve(&std::env::temp_dir()).expect("reserve jail");
    File::create(root.path().join("bin")).expect("occupy bin");
    assert!(create_skeleton(root.path()).is_err());
  }

  #[test]
  fn other_skeleton_failures_are_tolerated() {
    let root = JailRoot::reserve(&std::env::temp_dir()).expect("reserve jail");
    File::create(root.path().join("tmp")).expect("occupy tmp");
    let report = create_skeleton(root.path()).expect("create skeleton");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "tmp");
    assert!(root.path().join("bin").is_dir());
    assert!(root.path().join("dev").is_dir());
  }

  #[test]
  fn it_stages_the_binary_executable() {
    let host = JailRoot::reserve(&std::env::temp_dir()).expect("reserve host dir");
    let src = host.path().join("sample");
    fs::write(&src, b"#!/bin/sh\nexit 0\n").expect("write binary");
    fs::set_permissions(&src, fs::Permissions::from_mode(0o644)).expect("chmod");

    let root = JailRoot::reserve(&std::env::temp_dir()).expect("reserve jail");
    create_skeleton(root.path()).expect("create skeleton");
    let dest = stage_binary(&src, root.path(), "sample").expect("stage binary");

    assert_eq!(dest, root.path().join("bin/sample"));
    assert_eq!(fs::read(&dest).expect("read"), fs::read(&src).expect("read"));
    let mode = fs::metadata(&dest).expect("stat").permissions().mode();
    assert_ne!(mode & 0o100, 0);
  }

  #[test]
  fn it_refuses_an_unbounded_tmpfs() {
    let root = JailRoot::reserve(&std::env::temp_dir()).expect("reserve jail");
    let err = mount_tmpfs(root.path(), 0).expect_err("size 0 is unbounded");
    assert!(err.to_string().contains("unbounded"));
    root.teardown().expect("teardown");
  }

  #[test]
  fn staging_without_bin_fails() {
    let root = JailRoot::reserve(&std::env::temp_dir()).expect("reserve jail");
    assert!(stage_binary(Path::new("/bin/sh"), root.path(), "sh").is_err());
  }

  struct Classified(Linkage);

  impl ElfClassifier for Classified {
    fn classify(&self, _binary: &Path) -> Result<Linkage> {
      Ok(self.0)
    }
  }

  struct NoLister;

  impl DependencyLister for NoLister {
    fn list(&self, _binary: &Path) -> Result<Vec<PathBuf>> {
      bail!("ldd: not available")
    }
  }

  fn sample_config(host: &Path) -> SandboxConfig {
    let src = host.join("sample");
    fs::write(&src, b"\x7fELF sample").expect("write binary");
    fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).expect("chmod");
    SandboxConfig::for_binary(&src).expect("config")
  }

  #[test]
  fn it_populates_a_jail_for_a_static_binary() {
    let host = JailRoot::reserve(&std::env::temp_dir()).expect("reserve host dir");
    let config = sample_config(host.path());
    let root = JailRoot::reserve(&std::env::temp_dir()).expect("reserve jail");
    let resolver = DependencyResolver::new(Classified(Linkage::Static), NoLister);

    let jail = JailBuilder::with_resolver(&config, root.path(), resolver)
      .populate()
      .expect("populate jail");

    assert_eq!(jail.root(), root.path());
    assert_eq!(jail.binary(), root.path().join("bin/sample"));
    assert!(jail.skeleton().failed.is_empty());
    let deps = jail.dependencies().expect("dependency report");
    assert_eq!(deps.linkage, Linkage::Static);
    assert_eq!(deps.staged, 0);
  }

  #[test]
  fn dependency_failures_are_informational_unless_strict() {
    let host = JailRoot::reserve(&std::env::temp_dir()).expect("reserve host dir");
    let mut config = sample_config(host.path());

    let root = JailRoot::reserve(&std::env::temp_dir()).expect("reserve jail");
    let resolver = DependencyResolver::new(Classified(Linkage::Dynamic), NoLister);
    let jail = JailBuilder::with_resolver(&config, root.path(), resolver)
      .populate()
      .expect("populate jail");
    assert!(jail.dependencies().is_none());

    config.strict = true;
    let root = JailRoot::reserve(&std::env::temp_dir()).expect("reserve jail");
    let resolver = DependencyResolver::new(Classified(Linkage::Dynamic), NoLister);
    assert!(JailBuilder::with_resolver(&config, root.path(), resolver)
      .populate()
      .is_err());
  }

  #[test]
  fn teardown_removes_the_jail_root() {
    let root = JailRoot::reserve(&std::env::temp_dir()).expect("reserve jail");
    let path = root.path().to_path_buf();
    assert!(path.file_name().expect("name").to_string_lossy().starts_with("sandbox-"));
    create_skeleton(&path).expect("create skeleton");
    root.teardown().expect("teardown");
    assert!(!path.exists());
  }
}
