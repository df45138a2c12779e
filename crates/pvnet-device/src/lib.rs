//! # pvnet-device
//!
//! Device runtime for the pvnet ring engine: one worker thread per active
//! queue, lock-free producer entry points, and live reconfiguration (MTU,
//! queue count) through suspend, detach and re-attach.
//!
//! - [`runtime`] — [`DeviceRuntime`], the threaded device handle
//! - [`traffic`] — Synthetic flow generator used by the loopback driver

pub mod runtime;
pub mod traffic;

pub use runtime::DeviceRuntime;
