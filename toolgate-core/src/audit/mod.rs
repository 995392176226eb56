//! Audit records, queries, and the append-only sink contract.

mod store;

pub use store::{JsonlStore, Subscription};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{Direction, Verdict};

/// One audited message. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Size of the original frame in bytes.
    pub raw_size: usize,
    /// Time spent in the filter pipeline, in microseconds.
    pub duration_us: u64,
}

/// Criteria for querying the in-memory tail of the audit log.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryFilter {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub verdict: Option<Verdict>,
    /// 0 means no limit.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl QueryFilter {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        if let Some(method) = self.method.as_deref() {
            if record.method != method {
                return false;
            }
        }
        if let Some(tool) = self.tool.as_deref() {
            if record.tool != tool {
                return false;
            }
        }
        if let Some(verdict) = self.verdict {
            if record.verdict != verdict {
                return false;
            }
        }
        true
    }
}

/// Aggregate statistics over the in-memory tail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub total_requests: usize,
    pub allow_count: usize,
    pub deny_count: usize,
    pub ask_count: usize,
    pub log_count: usize,
    pub by_method: HashMap<String, usize>,
    pub by_tool: HashMap<String, usize>,
}

/// Sink failures. Queries and stats scan memory and cannot fail.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("creating audit log directory {dir}: {source}")]
    CreateDir {
        dir: String,
        #[source]
        source: std::io::Error,
    },

    #[error("opening audit log file {path}: {source}")]
    OpenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("writing audit record: {0}")]
    Write(#[from] std::io::Error),

    #[error("encoding audit record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only audit sink with query, stats, and live fan-out.
pub trait AuditStore: Send + Sync {
    /// Persist one record, assigning id and timestamp if absent.
    fn write(&self, record: AuditRecord) -> Result<(), AuditError>;

    /// Scan the in-memory tail, honoring filter criteria then offset then limit.
    fn query(&self, filter: &QueryFilter) -> Vec<AuditRecord>;

    /// Aggregate the in-memory tail.
    fn stats(&self) -> AuditStats;

    /// Live stream of subsequent records. Slow subscribers lose records
    /// rather than stalling writers; dropping the [`Subscription`] detaches
    /// the channel.
    fn subscribe(&self) -> (mpsc::Receiver<AuditRecord>, Subscription);
}
