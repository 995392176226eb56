//! CLI argument types.
//!
//! Defined separately from `main.rs` so integration tests can construct them
//! directly.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// ToolGate: an interposing security gateway for MCP tool calls.
#[derive(Parser)]
#[command(name = "toolgate", version, about)]
pub struct Cli {
    /// Policy config file (YAML).
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the stdio MCP proxy around a tool server subprocess.
    Proxy(ProxyArgs),
    /// Run the HTTP reverse proxy for Streamable HTTP MCP transport.
    Httpproxy(HttpProxyArgs),
    /// Run the web dashboard on its own.
    Dashboard(DashboardArgs),
    /// Run the stdio proxy and the dashboard together.
    Serve(ProxyArgs),
    /// Dry-run a policy check without a running proxy.
    Check(CheckArgs),
    /// Print the version.
    Version,
}

/// Arguments for `toolgate proxy` and `toolgate serve`.
#[derive(Args, Debug)]
pub struct ProxyArgs {
    /// Tool server command and arguments (after `--`).
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Arguments for `toolgate httpproxy`.
#[derive(Args, Debug)]
pub struct HttpProxyArgs {
    /// Target MCP server URL.
    #[arg(long)]
    pub target: String,

    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: String,
}

/// Arguments for `toolgate dashboard`.
#[derive(Args, Debug)]
pub struct DashboardArgs {
    /// Listen address (defaults to the config's dashboard_addr).
    #[arg(long)]
    pub listen: Option<String>,
}

/// Arguments for `toolgate check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// JSON-RPC method to check.
    #[arg(long)]
    pub method: String,

    /// Tool name (for tools/call).
    #[arg(long, default_value = "")]
    pub tool: String,

    /// JSON arguments.
    #[arg(long, default_value = "")]
    pub args: String,
}
