//! Run an untrusted executable inside fresh Linux namespaces and a tmpfs-backed chroot jail, and
//! record every syscall it makes.
//!
//! [sandbox::run_sandbox] is the entry point; the other modules are its building blocks.
pub mod config;
pub mod deps;
pub mod idmap;
pub mod jail;
pub mod monitor;
pub mod sample;
pub mod sandbox;
