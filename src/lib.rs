//! podgate is a reverse proxy that keeps an expensive remote GPU pod
//! running only while something actually wants it.
//!
//! One always-on process serves a listener per configured application.
//! Inbound web traffic and CPU/GPU telemetry (streamed over an SSH tunnel
//! to the pod) both register demand; the lifecycle controller starts the
//! pod through the cloud control plane when demand appears and terminates
//! it when every source has been idle past its timeout. A small control
//! app exposes a status page and shutdown APIs.

pub mod client;
pub mod config;
pub mod controlplane;
pub mod error;
pub mod gateway;
pub mod idle;
pub mod lifecycle;
pub mod reporter;
pub mod sshconfig;
pub mod state;
pub mod status;
pub mod telemetry;
pub mod tunnel;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
