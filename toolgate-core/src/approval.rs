//! Human approval queue.
//!
//! The rendezvous between a filter path that hit an `ask` verdict and an
//! out-of-band reviewer. `submit` parks the caller on a one-shot channel and
//! races it against the configured timeout and the caller's cancellation
//! token; `approve`/`deny` resolve by id. State transition, verdict
//! assignment, and completion-signal delivery happen under one lock, so the
//! first of reviewer decision, timeout, and cancellation wins and a request
//! resolves at most once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::Verdict;

/// Per-subscriber channel capacity.
pub const SUBSCRIBER_BUFFER: usize = 50;

/// Lifecycle state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    TimedOut,
}

/// What the submitting caller should do with the suspended message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Reviewer approved: forward the message.
    Allow,
    /// Reviewer denied: reply with a policy-deny error.
    Deny,
    /// Nobody decided in time: reply with an approval-timeout error.
    TimedOut,
}

impl ApprovalDecision {
    pub fn verdict(&self) -> Verdict {
        match self {
            ApprovalDecision::Allow => Verdict::Allow,
            ApprovalDecision::Deny | ApprovalDecision::TimedOut => Verdict::Deny,
        }
    }
}

/// A request awaiting (or having received) a reviewer decision.
///
/// Retained indefinitely for history once created.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    pub message: String,
    pub rule: String,
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

/// Approval failures.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request {id:?} not found")]
    NotFound { id: String },

    #[error("approval request {id:?} already resolved: {status:?}")]
    AlreadyResolved { id: String, status: ApprovalStatus },

    #[error("approval wait cancelled")]
    Cancelled,
}

struct Entry {
    request: ApprovalRequest,
    decide_tx: Option<oneshot::Sender<ApprovalDecision>>,
}

struct QueueState {
    entries: Vec<Entry>,
    next_id: u64,
}

type SubscriberMap = Arc<Mutex<HashMap<u64, mpsc::Sender<ApprovalRequest>>>>;

/// Handle tied to one subscription; dropping it detaches the channel.
pub struct ApprovalSubscription {
    subscribers: SubscriberMap,
    id: u64,
}

impl Drop for ApprovalSubscription {
    fn drop(&mut self) {
        self.subscribers.lock().remove(&self.id);
    }
}

/// The approval coordinator.
///
/// Request state and the subscriber set are guarded by separate locks so
/// reviewer-action contention cannot block submission fan-out.
pub struct ApprovalQueue {
    state: Mutex<QueueState>,
    subscribers: SubscriberMap,
    next_subscriber: AtomicU64,
    timeout: Duration,
}

impl ApprovalQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: Vec::new(),
                next_id: 0,
            }),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(0),
            timeout,
        }
    }

    /// Enqueue a request and wait for the first of: reviewer decision,
    /// timeout, caller cancellation.
    ///
    /// Cancellation is the only path that returns an error; it leaves the
    /// request status unchanged so a reviewer decision arriving later is
    /// still recorded in history.
    pub async fn submit(
        &self,
        method: &str,
        tool: &str,
        rule: &str,
        message: &str,
        arguments: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<ApprovalDecision, ApprovalError> {
        let (decide_tx, decide_rx) = oneshot::channel();

        let request = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let request = ApprovalRequest {
                id: format!("approval-{}", state.next_id),
                created_at: Utc::now(),
                method: method.to_string(),
                tool: tool.to_string(),
                arguments,
                message: message.to_string(),
                rule: rule.to_string(),
                status: ApprovalStatus::Pending,
                verdict: None,
                decided_at: None,
            };
            state.entries.push(Entry {
                request: request.clone(),
                decide_tx: Some(decide_tx),
            });
            request
        };

        self.notify_subscribers(&request);
        tracing::info!(
            id = %request.id,
            method,
            tool,
            rule,
            "approval request pending"
        );

        tokio::select! {
            decision = decide_rx => {
                // The sender is only dropped with the entry still pending if
                // the queue itself is going away; treat that as a denial.
                Ok(decision.unwrap_or(ApprovalDecision::Deny))
            }
            _ = tokio::time::sleep(self.timeout) => {
                Ok(self.expire(&request.id))
            }
            _ = cancel.cancelled() => {
                Err(ApprovalError::Cancelled)
            }
        }
    }

    /// Mark a request timed out, unless a reviewer decision won the race.
    fn expire(&self, id: &str) -> ApprovalDecision {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.iter_mut().find(|e| e.request.id == id) else {
            return ApprovalDecision::TimedOut;
        };
        match entry.request.status {
            ApprovalStatus::Pending => {
                entry.request.status = ApprovalStatus::TimedOut;
                entry.request.verdict = Some(Verdict::Deny);
                entry.request.decided_at = Some(Utc::now());
                entry.decide_tx = None;
                ApprovalDecision::TimedOut
            }
            // A reviewer resolved between the sleep firing and this lock.
            ApprovalStatus::Approved => ApprovalDecision::Allow,
            ApprovalStatus::Denied | ApprovalStatus::TimedOut => ApprovalDecision::Deny,
        }
    }

    /// Reviewer approval.
    pub fn approve(&self, id: &str) -> Result<(), ApprovalError> {
        self.resolve(id, ApprovalStatus::Approved, ApprovalDecision::Allow)
    }

    /// Reviewer denial.
    pub fn deny(&self, id: &str) -> Result<(), ApprovalError> {
        self.resolve(id, ApprovalStatus::Denied, ApprovalDecision::Deny)
    }

    fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        decision: ApprovalDecision,
    ) -> Result<(), ApprovalError> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.request.id == id)
            .ok_or_else(|| ApprovalError::NotFound { id: id.to_string() })?;

        if entry.request.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved {
                id: id.to_string(),
                status: entry.request.status,
            });
        }

        entry.request.status = status;
        entry.request.verdict = Some(decision.verdict());
        entry.request.decided_at = Some(Utc::now());

        // Deliver the completion signal under the same lock, so the state
        // transition and the submitter's wake-up are one atomic step. The
        // send fails only when the submitter already went away (cancelled).
        if let Some(tx) = entry.decide_tx.take() {
            let _ = tx.send(decision);
        }
        Ok(())
    }

    /// Requests still awaiting a decision.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| e.request.status == ApprovalStatus::Pending)
            .map(|e| e.request.clone())
            .collect()
    }

    /// Full history in submission order.
    pub fn all(&self) -> Vec<ApprovalRequest> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| e.request.clone())
            .collect()
    }

    /// Live stream of newly submitted requests.
    pub fn subscribe(&self) -> (mpsc::Receiver<ApprovalRequest>, ApprovalSubscription) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, tx);
        (
            rx,
            ApprovalSubscription {
                subscribers: self.subscribers.clone(),
                id,
            },
        )
    }

    fn notify_subscribers(&self, request: &ApprovalRequest) {
        let subscribers = self.subscribers.lock();
        for sender in subscribers.values() {
            let _ = sender.try_send(request.clone());
        }
    }
}
