//! # stockade-core
//!
//! Privileged Linux primitives for the Stockade runtime.
//!
//! This crate provides safe abstractions over:
//! - **Affinity**: a pinned worker thread for per-thread kernel state.
//! - **Identity**: fs-uid/fs-gid escalation brackets and the disk group cache.
//! - **Filesystem**: mounts, directory creation, and the three root switch
//!   strategies.
//! - **Devices**: loop device attachment and encrypted device unlocking.
//! - **Namespaces**: bracketed IPC namespace re-entry and hostname setting.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod affinity;
pub mod device;
pub mod filesystem;
pub mod identity;
pub mod namespace;
