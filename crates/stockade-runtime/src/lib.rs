//! Privileged construction runtime for Stockade containers.
//!
//! - [`rpc`]: the framed request/response server exposing the privileged
//!   operation catalogue, and its client.
//! - [`engine`]: engine lifecycles and the registry selecting them by name.
//! - [`supervisor`]: drives one container construction from plan to exit.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod rpc;
pub mod supervisor;
