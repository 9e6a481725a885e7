//! # stockade-common
//!
//! Shared error taxonomy, privileged request types, configuration models,
//! and constants used across the entire Stockade workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and never touches kernel state itself.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
