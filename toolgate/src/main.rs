//! ToolGate CLI entry point.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use toolgate_core::policy::{CheckResponse, EvalInput, PolicyBackend};

use toolgate::bootstrap::build_runtime;
use toolgate::cli::{CheckArgs, Cli, Commands, DashboardArgs, HttpProxyArgs, ProxyArgs};
use toolgate::dashboard::{self, DashboardState};
use toolgate::error::GatewayError;
use toolgate::httpproxy::HttpInterposer;
use toolgate::stdio::StdioInterposer;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.clone();
    let result = match cli.command {
        Commands::Proxy(args) => run_proxy(config_path.as_deref(), args, false).await,
        Commands::Serve(args) => run_proxy(config_path.as_deref(), args, true).await,
        Commands::Httpproxy(args) => run_httpproxy(config_path.as_deref(), args).await,
        Commands::Dashboard(args) => run_dashboard(config_path.as_deref(), args).await,
        Commands::Check(args) => run_check(config_path.as_deref(), args),
        Commands::Version => {
            println!("toolgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "toolgate failed");
        eprintln!("toolgate: {e}");
        std::process::exit(1);
    }
}

/// Logs go to stderr: on the stdio transport, stdout belongs to the protocol.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel the returned token on SIGINT/SIGTERM.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        token.cancel();
    });

    cancel
}

fn split_command(args: &ProxyArgs) -> (&str, &[String]) {
    (args.command[0].as_str(), &args.command[1..])
}

async fn run_proxy(
    config_path: Option<&std::path::Path>,
    args: ProxyArgs,
    with_dashboard: bool,
) -> Result<(), GatewayError> {
    let runtime = build_runtime(config_path)?;
    let cancel = shutdown_token();

    if with_dashboard {
        let state = DashboardState {
            store: runtime.store.clone(),
            approvals: runtime.approvals.clone(),
            backend: runtime.backend.clone(),
        };
        let addr = runtime.config.dashboard_addr.clone();
        let dashboard_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = dashboard::serve(state, &addr, dashboard_cancel).await {
                tracing::error!(error = %e, "dashboard failed");
            }
        });
    }

    let interposer = StdioInterposer::new(
        runtime.inbound.clone(),
        runtime.outbound.clone(),
        runtime.approvals.clone(),
        runtime.store.clone(),
    );
    let (command, command_args) = split_command(&args);
    let result = interposer.run(command, command_args, cancel.clone()).await;
    cancel.cancel();
    result
}

async fn run_httpproxy(
    config_path: Option<&std::path::Path>,
    args: HttpProxyArgs,
) -> Result<(), GatewayError> {
    let runtime = build_runtime(config_path)?;
    let cancel = shutdown_token();

    let proxy = Arc::new(HttpInterposer::new(
        &args.target,
        runtime.inbound.clone(),
        runtime.store.clone(),
    )?);
    proxy.serve(&args.listen, cancel).await
}

async fn run_dashboard(
    config_path: Option<&std::path::Path>,
    args: DashboardArgs,
) -> Result<(), GatewayError> {
    let runtime = build_runtime(config_path)?;
    let cancel = shutdown_token();

    let addr = args
        .listen
        .unwrap_or_else(|| runtime.config.dashboard_addr.clone());
    let state = DashboardState {
        store: runtime.store.clone(),
        approvals: runtime.approvals.clone(),
        backend: runtime.backend.clone(),
    };
    dashboard::serve(state, &addr, cancel).await
}

/// `check` loads only the policy engine: no audit store, no side effects.
fn run_check(
    config_path: Option<&std::path::Path>,
    args: CheckArgs,
) -> Result<(), GatewayError> {
    let Some(path) = config_path else {
        return Err(GatewayError::InvalidArguments {
            reason: "--config/-c is required for check".to_string(),
        });
    };
    // Validate the full config (durations included) even though only the
    // engine is used.
    let _ = toolgate_core::config::Config::load(path)?;
    let backend = toolgate_core::policy::YamlEngine::from_path(path)?;

    let arguments = if args.args.is_empty() {
        None
    } else {
        Some(
            serde_json::from_str(&args.args).map_err(|e| GatewayError::InvalidArguments {
                reason: format!("--args is not valid JSON: {e}"),
            })?,
        )
    };

    let result = backend.evaluate(&EvalInput {
        method: args.method,
        tool: args.tool,
        arguments,
    })?;

    let response = CheckResponse::from(result);
    println!(
        "{}",
        serde_json::to_string_pretty(&response).unwrap_or_else(|_| "{}".to_string())
    );
    Ok(())
}
