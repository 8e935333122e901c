use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};
use log::{error, info};

use malbox::config::{SandboxConfig, DEFAULT_TMPFS_SIZE_MB};
use malbox::monitor::TargetStatus;
use malbox::sample::DefaultProgram;
use malbox::sandbox::{check_privileges, run_sandbox};

#[derive(Parser, Debug)]
#[command(name = "malbox")]
#[command(version, about = "Run an untrusted executable in an isolated jail and trace its syscalls", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Trace the built-in hello world
    sudo malbox

    # Trace a suspicious binary, giving up after a minute
    sudo malbox --timeout 60 ./sample.bin

    # Fail instead of warning when a library cannot be staged
    sudo malbox --strict -v ./sample.bin
")]
struct Cli {
  /// Executable to run. A statically linked hello world is compiled and run when omitted.
  #[arg(value_name = "BINARY")]
  binary: Option<PathBuf>,

  /// Directory the jail directory is created in
  #[arg(long, value_name = "DIR", default_value = "/tmp")]
  jail_base: PathBuf,

  /// Size of the jail's tmpfs, in megabytes
  #[arg(
    long,
    value_name = "MB",
    default_value_t = DEFAULT_TMPFS_SIZE_MB,
    value_parser = clap::value_parser!(u32).range(1..)
  )]
  tmpfs_size: u32,

  /// Directory the syscall trace is written to
  #[arg(long, value_name = "DIR", default_value = "/tmp")]
  log_dir: PathBuf,

  /// Treat incomplete id mapping and unstageable libraries as fatal
  #[arg(long)]
  strict: bool,

  /// Kill the sandboxed program after this many seconds
  #[arg(short, long, value_name = "SECONDS")]
  timeout: Option<u64>,

  /// Show debug output
  #[arg(short, long)]
  verbose: bool,
}

impl Cli {
  fn apply(&self, config: &mut SandboxConfig) {
    config.jail_base = self.jail_base.clone();
    config.tmpfs_size_mb = self.tmpfs_size;
    config.log_dir = self.log_dir.clone();
    config.strict = self.strict;
    config.timeout = self.timeout.map(Duration::from_secs);
  }
}

fn init_logger(verbose: bool) {
  let env = Env::default().filter_or("RUST_LOG", if verbose { "debug" } else { "info" });
  Builder::from_env(env).format_timestamp_millis().init();
}

fn run(cli: &Cli) -> Result<()> {
  check_privileges()?;

  // Kept alive until the run is over: the jail copies the binary out of it.
  let mut default_program = None;
  let mut config = match &cli.binary {
    Some(path) => SandboxConfig::for_binary(path)?,
    None => {
      let program = DefaultProgram::compile().context("compile default program")?;
      let config = program.config()?;
      default_program = Some(program);
      config
    }
  };
  cli.apply(&mut config);
  info!(binary:? = config.binary_path, using_default = config.using_default; "starting sandbox");

  let result = run_sandbox(&config);
  if let Some(program) = default_program {
    program.remove()?;
  }
  let report = result?;

  match report.status {
    TargetStatus::Exited(code) => {
      info!(pid:? = report.pid, exit_status = code; "sandboxed process exited")
    }
    TargetStatus::Signaled(signal) => {
      info!(pid:? = report.pid, signal:? = signal; "sandboxed process was killed")
    }
    TargetStatus::Unknown => info!(pid:? = report.pid; "sandboxed process finished"),
  }
  info!(
    log:% = report.log_path.display(),
    distinct = report.summary.distinct();
    "syscall trace written"
  );
  Ok(())
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logger(cli.verbose);

  match run(&cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      error!("{err:#}");
      ExitCode::FAILURE
    }
  }
}
