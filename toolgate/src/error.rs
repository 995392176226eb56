//! Gateway-level error types for the transports and CLI wiring.

use toolgate_core::audit::AuditError;
use toolgate_core::config::ConfigError;
use toolgate_core::filter::FilterError;
use toolgate_core::jsonrpc::CodecError;
use toolgate_core::policy::PolicyError;

/// Failures surfaced by the interposers, the dashboard, and startup wiring.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("starting subprocess {command:?}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("invalid target URL {url:?}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("invalid arguments: {reason}")]
    InvalidArguments { reason: String },

    #[error("binding {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
