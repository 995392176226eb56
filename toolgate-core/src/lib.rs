//! ToolGate Core: the transport-agnostic gateway library.
//!
//! This library provides the shared machinery used by both ToolGate
//! interposers (stdio subprocess proxy and HTTP reverse proxy) and by the
//! dashboard: the JSON-RPC codec, the policy engines, the filter chain with
//! its secret-scanner and rate-limit stages, the approval queue, the audit
//! sink, and runtime configuration.
//!
//! The transports themselves live in the `toolgate` binary crate; everything
//! here is independent of how bytes arrive.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod approval;
pub mod audit;
pub mod config;
pub mod filter;
pub mod jsonrpc;
pub mod policy;

// ─────────────────────────────────────────────────────────────────────────────
// Shared Types
// ─────────────────────────────────────────────────────────────────────────────

/// Message direction through an interposer.
///
/// Inbound is host → tool server (requests), outbound is tool server → host
/// (responses and server-initiated notifications). Policy is only enforced on
/// the inbound path; outbound messages are audited and forwarded unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Host → tool server.
    Inbound,
    /// Tool server → host.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// The decision a policy evaluation produces for a message.
///
/// `Allow` forwards the message. `Deny` drops it and returns a JSON-RPC error
/// to the caller. `Ask` suspends the message until a reviewer resolves it.
/// `Log` forwards like `Allow` but is kept as a distinct audit verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    Ask,
    Log,
}

impl Verdict {
    /// Whether a message carrying this verdict is forwarded to the server.
    pub fn forwards(&self) -> bool {
        matches!(self, Verdict::Allow | Verdict::Log)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
            Verdict::Ask => "ask",
            Verdict::Log => "log",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Verdict::Allow),
            "deny" => Ok(Verdict::Deny),
            "ask" => Ok(Verdict::Ask),
            "log" => Ok(Verdict::Log),
            other => Err(format!("invalid verdict: {other:?}")),
        }
    }
}
