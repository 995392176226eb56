//! ToolGate binary crate: transports, dashboard, and CLI wiring.
//!
//! Exposed as a library so integration tests can drive the interposers over
//! in-memory pipes and routers without a running binary.

pub mod bootstrap;
pub mod cli;
pub mod dashboard;
pub mod error;
pub mod httpproxy;
pub mod stdio;
