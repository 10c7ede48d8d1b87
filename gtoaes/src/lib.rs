//! Dispatch and observation-system control layer of the GWAC / GFT
//! observation control server.
//!
//! The binary in `main.rs` is a thin shell: CLI, configuration, logging and
//! the PID lock. Everything observable lives here so the integration tests
//! can drive a full dispatcher over real sockets.

pub mod bus;
pub mod config;
pub mod hub;
pub mod net;
pub mod obss;
pub mod pidlock;
