//! Shared wiring: config → policy backend, audit store, approval queue, and
//! the two standard filter chains.

use std::path::Path;
use std::sync::Arc;

use toolgate_core::approval::ApprovalQueue;
use toolgate_core::audit::{AuditStore, JsonlStore};
use toolgate_core::config::Config;
use toolgate_core::filter::{build_inbound_chain, build_outbound_chain, ChainConfig, FilterChain};
use toolgate_core::policy::{PolicyBackend, YamlEngine};

use crate::error::GatewayError;

/// Everything a running gateway needs, built once at startup.
pub struct Runtime {
    pub config: Config,
    pub backend: Arc<dyn PolicyBackend>,
    pub store: Arc<dyn AuditStore>,
    pub approvals: Arc<ApprovalQueue>,
    pub inbound: Arc<FilterChain>,
    pub outbound: Arc<FilterChain>,
}

/// Build the runtime from an optional config path. Without a config file the
/// gateway runs with an empty rule list and a deny default.
pub fn build_runtime(config_path: Option<&Path>) -> Result<Runtime, GatewayError> {
    let (config, backend): (Config, Arc<dyn PolicyBackend>) = match config_path {
        Some(path) => {
            let config = Config::load(path)?;
            // Path-based engine so `reload` can re-read the file.
            (config, Arc::new(YamlEngine::from_path(path)?))
        }
        None => {
            let config = Config::default();
            let backend = Arc::new(YamlEngine::from_policy(config.policy.clone())?);
            (config, backend)
        }
    };

    let store: Arc<dyn AuditStore> = Arc::new(JsonlStore::new(&config.log_dir)?);
    let approvals = Arc::new(ApprovalQueue::new(config.approval_timeout));

    let chain_config = ChainConfig {
        backend: backend.clone(),
        store: store.clone(),
        secret_scanner: config.secret_scanner,
        rate_limit: config.rate_limit.clone(),
    };
    let inbound = Arc::new(build_inbound_chain(&chain_config));
    let outbound = Arc::new(build_outbound_chain(&chain_config));

    tracing::info!(
        policy = ?config.policy_path,
        rules = config.policy.rules.len(),
        default_action = %config.default_action,
        log_dir = %config.log_dir.display(),
        "gateway runtime initialized"
    );

    Ok(Runtime {
        config,
        backend,
        store,
        approvals,
        inbound,
        outbound,
    })
}
