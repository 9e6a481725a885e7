//! Filesystem management for container construction.
//!
//! Provides mounts, exact-mode directory creation, and the root filesystem
//! switch. Everything here mutates per-thread or per-process kernel state
//! and is expected to run on the affinity worker.

pub mod dir;
pub mod mount;
pub mod root_switch;
