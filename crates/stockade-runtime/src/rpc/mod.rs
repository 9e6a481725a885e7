//! Privileged operation server and client.

pub mod client;
pub mod methods;
pub mod protocol;
pub mod server;

pub use client::PrivilegedClient;
pub use methods::{HostMethods, Methods};
pub use protocol::{Reply, Request, Response};
pub use server::PrivilegedServer;
