//! The program that runs when no binary is given: a statically linked hello world, compiled on
//! the spot.
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use log::info;
use tempfile::TempDir;

use crate::config::{SandboxConfig, DEFAULT_PROGRAM_NAME};

pub const HELLO_SOURCE: &str = r#"#include <stdio.h>

int main(void) {
  printf("Hello from inside the sandbox!\n");
  return 0;
}
"#;

/// A compiled program living in its own scratch directory, removed on drop.
#[derive(Debug)]
pub struct DefaultProgram {
  dir: TempDir,
  binary: PathBuf,
}

impl DefaultProgram {
  /// Compile [HELLO_SOURCE] with `cc -static`.
  pub fn compile() -> Result<Self> {
    Self::compile_source("cc", HELLO_SOURCE, &["-static"])
  }

  /// Compile `source` with `compiler` and the extra `flags`.
  pub fn compile_source(compiler: &str, source: &str, flags: &[&str]) -> Result<Self> {
    let dir = TempDir::with_prefix("malbox-hello-").context("create scratch directory")?;
    let source_path = dir.path().join(format!("{DEFAULT_PROGRAM_NAME}.c"));
    fs::write(&source_path, source)
      .with_context(|| format!("write {}", source_path.display()))?;
    let binary = dir.path().join(DEFAULT_PROGRAM_NAME);

    let output = Command::new(compiler)
      .args(flags)
      .arg("-o")
      .arg(&binary)
      .arg(&source_path)
      .stdin(Stdio::null())
      .output()
      .with_context(|| format!("run {compiler}"))?;
    if !output.status.success() {
      bail!(
        "{compiler} failed ({}): {}",
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
      );
    }
    info!(path:? = binary, compiler = compiler; "compiled default program");
    Ok(Self { dir, binary })
  }

  pub fn path(&self) -> &Path {
    &self.binary
  }

  pub fn config(&self) -> Result<SandboxConfig> {
    SandboxConfig::for_default_program(&self.binary)
  }

  /// Remove the scratch directory now rather than on drop, surfacing any error.
  pub fn remove(self) -> Result<()> {
    let path = self.dir.path().to_path_buf();
    self
      .dir
      .close()
      .with_context(|| format!("remove {}", path.display()))
  }
}
