//! Stdio interposer: a man-in-the-middle between the AI host (our stdin and
//! stdout) and the real tool server (a spawned subprocess).
//!
//! Two concurrent pumps move line-framed JSON-RPC messages. The inbound pump
//! runs the full filter chain and branches on the verdict: forward, reply
//! with a synthesized JSON-RPC error, or park the message in the approval
//! queue until a reviewer decides. The outbound pump audits the server's
//! output and forwards it unchanged. Either pump ending (EOF, write failure,
//! subprocess death) tears down the whole session: the cancellation token
//! fires and the subprocess gets a best-effort kill.
//!
//! Allowed frames are forwarded byte-for-byte in arrival order; the forwarded
//! stream is a subsequence of the input stream.

use std::process::Stdio;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use toolgate_core::approval::{ApprovalDecision, ApprovalQueue};
use toolgate_core::audit::AuditStore;
use toolgate_core::filter::{FilterChain, FilterContext};
use toolgate_core::jsonrpc::{self, JsonRpcId, JsonRpcMessage};
use toolgate_core::{Direction, Verdict};

use crate::error::GatewayError;

/// Per-line cap. Longer lines are rejected before JSON parsing; the codec
/// discards the remainder of the oversized line and the stream continues.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// The stdio man-in-the-middle.
pub struct StdioInterposer {
    inbound: Arc<FilterChain>,
    outbound: Arc<FilterChain>,
    approvals: Arc<ApprovalQueue>,
    store: Arc<dyn AuditStore>,
}

impl StdioInterposer {
    pub fn new(
        inbound: Arc<FilterChain>,
        outbound: Arc<FilterChain>,
        approvals: Arc<ApprovalQueue>,
        store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            inbound,
            outbound,
            approvals,
            store,
        }
    }

    /// Spawn the tool server and bridge the process's own stdin/stdout to it.
    pub async fn run(
        &self,
        command: &str,
        args: &[String],
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        let mut child = spawn_server(command, args)?;
        tracing::info!(command, ?args, "tool server spawned");
        self.run_with_io(tokio::io::stdin(), tokio::io::stdout(), &mut child, cancel)
            .await
    }

    /// Bridge arbitrary host-side streams to an already-spawned subprocess.
    ///
    /// Split out from [`run`](Self::run) so sessions can be driven over
    /// in-memory pipes in tests.
    pub async fn run_with_io<HI, HO>(
        &self,
        host_in: HI,
        host_out: HO,
        child: &mut Child,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError>
    where
        HI: AsyncRead + Send + Unpin + 'static,
        HO: AsyncWrite + Send + Unpin + 'static,
    {
        let child_stdin = child.stdin.take().ok_or_else(|| GatewayError::Spawn {
            command: "tool server".to_string(),
            reason: "failed to capture subprocess stdin".to_string(),
        })?;
        let child_stdout = child.stdout.take().ok_or_else(|| GatewayError::Spawn {
            command: "tool server".to_string(),
            reason: "failed to capture subprocess stdout".to_string(),
        })?;

        // Both pumps write to the host: the outbound pump forwards server
        // output, the inbound pump injects synthesized error replies.
        // Serialized through a mutex so lines never interleave.
        let host_out = Arc::new(Mutex::new(host_out));

        let inbound_task = tokio::spawn(inbound_pump(
            self.inbound.clone(),
            self.approvals.clone(),
            self.store.clone(),
            host_in,
            child_stdin,
            host_out.clone(),
            cancel.clone(),
        ));
        let outbound_task = tokio::spawn(outbound_pump(
            self.outbound.clone(),
            child_stdout,
            host_out.clone(),
            cancel.clone(),
        ));

        let result = tokio::select! {
            result = inbound_task => {
                tracing::info!("inbound pump finished (host stdin closed or error)");
                flatten(result)
            }
            result = outbound_task => {
                tracing::info!("outbound pump finished (server stdout closed or error)");
                flatten(result)
            }
            status = child.wait() => {
                match status {
                    Ok(status) => tracing::info!(%status, "tool server exited"),
                    Err(ref e) => tracing::error!(error = %e, "failed to wait on tool server"),
                }
                Ok(())
            }
            _ = cancel.cancelled() => Ok(()),
        };

        // First pump out ends the session: stop the other and the server.
        cancel.cancel();
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "subprocess kill failed (already gone?)");
        }

        result
    }
}

fn spawn_server(command: &str, args: &[String]) -> Result<Child, GatewayError> {
    Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        // The server's stderr flows through to ours untouched.
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| GatewayError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })
}

fn flatten(result: Result<Result<(), GatewayError>, tokio::task::JoinError>) -> Result<(), GatewayError> {
    match result {
        Ok(inner) => inner,
        Err(e) => {
            tracing::error!(error = %e, "pump task panicked");
            Ok(())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound Pump
// ─────────────────────────────────────────────────────────────────────────────

async fn inbound_pump<HI, HO>(
    chain: Arc<FilterChain>,
    approvals: Arc<ApprovalQueue>,
    store: Arc<dyn AuditStore>,
    host_in: HI,
    mut child_in: tokio::process::ChildStdin,
    host_out: Arc<Mutex<HO>>,
    cancel: CancellationToken,
) -> Result<(), GatewayError>
where
    HI: AsyncRead + Send + Unpin + 'static,
    HO: AsyncWrite + Send + Unpin + 'static,
{
    let mut lines = FramedRead::new(host_in, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            item = lines.next() => match item {
                None => return Ok(()),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!(max_bytes = MAX_LINE_BYTES, "oversized inbound line dropped");
                    continue;
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                Some(Ok(line)) => line,
            },
        };
        if line.is_empty() {
            continue;
        }

        let mut fc = FilterContext::new(line.into_bytes(), Direction::Inbound);
        if let Err(e) = chain.process(&mut fc).await {
            tracing::error!(error = %e, "inbound filter error; dropping message");
            fc.verdict = Verdict::Deny;
            if fc.matched_rule.is_empty() {
                fc.matched_rule = "_error".to_string();
            }
            fc.verdict_message = e.to_string();
            write_audit(&store, &fc);
            continue;
        }

        match fc.verdict {
            Verdict::Deny => {
                tracing::warn!(
                    method = %fc.method,
                    tool = %fc.tool,
                    rule = %fc.matched_rule,
                    message = %fc.verdict_message,
                    "request denied"
                );
                if let Some(id) = request_id(&fc) {
                    let message = if fc.verdict_message.is_empty() {
                        "request denied by policy"
                    } else {
                        fc.verdict_message.as_str()
                    };
                    write_reply(&host_out, &jsonrpc::deny_response(Some(id), message)).await?;
                }
            }

            Verdict::Ask => {
                resolve_ask(&approvals, &store, &host_out, &mut child_in, &mut fc, &cancel)
                    .await?;
            }

            Verdict::Allow | Verdict::Log => {
                forward(&mut child_in, &fc.raw).await?;
            }
        }
    }
}

/// Park an `ask` request in the approval queue and act on the decision.
///
/// The audit record for an ask is written here, after the decision, so the
/// trail shows what actually happened to the message rather than a dangling
/// `ask`.
async fn resolve_ask<HO>(
    approvals: &ApprovalQueue,
    store: &Arc<dyn AuditStore>,
    host_out: &Arc<Mutex<HO>>,
    child_in: &mut tokio::process::ChildStdin,
    fc: &mut FilterContext,
    cancel: &CancellationToken,
) -> Result<(), GatewayError>
where
    HO: AsyncWrite + Send + Unpin + 'static,
{
    let id = request_id(fc);

    // A request we cannot answer has no business waiting on a reviewer:
    // notifications that hit an ask rule are denied outright.
    let Some(id) = id else {
        tracing::warn!(
            method = %fc.method,
            rule = %fc.matched_rule,
            "ask verdict on a message without an id; denying"
        );
        fc.verdict = Verdict::Deny;
        fc.verdict_message = "approval required but request has no id".to_string();
        write_audit(store, fc);
        return Ok(());
    };

    tracing::info!(
        method = %fc.method,
        tool = %fc.tool,
        rule = %fc.matched_rule,
        "request pending approval"
    );

    let decision = approvals
        .submit(
            &fc.method,
            &fc.tool,
            &fc.matched_rule,
            &fc.verdict_message,
            fc.arguments.clone(),
            cancel,
        )
        .await;

    match decision {
        Ok(ApprovalDecision::Allow) => {
            fc.verdict = Verdict::Allow;
            write_audit(store, fc);
            forward(child_in, &fc.raw).await?;
        }
        Ok(ApprovalDecision::Deny) => {
            fc.verdict = Verdict::Deny;
            fc.verdict_message = "request denied by approver".to_string();
            write_audit(store, fc);
            write_reply(host_out, &jsonrpc::deny_response(Some(id), &fc.verdict_message)).await?;
        }
        Ok(ApprovalDecision::TimedOut) => {
            fc.verdict = Verdict::Deny;
            fc.verdict_message = "approval request timed out".to_string();
            write_audit(store, fc);
            write_reply(host_out, &jsonrpc::approval_timeout_response(Some(id))).await?;
        }
        Err(e) => {
            fc.verdict = Verdict::Deny;
            fc.verdict_message = format!("approval error: {e}");
            write_audit(store, fc);
            write_reply(host_out, &jsonrpc::deny_response(Some(id), &fc.verdict_message)).await?;
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound Pump
// ─────────────────────────────────────────────────────────────────────────────

async fn outbound_pump<HO>(
    chain: Arc<FilterChain>,
    child_out: tokio::process::ChildStdout,
    host_out: Arc<Mutex<HO>>,
    cancel: CancellationToken,
) -> Result<(), GatewayError>
where
    HO: AsyncWrite + Send + Unpin + 'static,
{
    let mut lines = FramedRead::new(child_out, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            item = lines.next() => match item {
                None => return Ok(()),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    tracing::warn!(max_bytes = MAX_LINE_BYTES, "oversized outbound line dropped");
                    continue;
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                Some(Ok(line)) => line,
            },
        };
        if line.is_empty() {
            continue;
        }

        let mut fc = FilterContext::new(line.into_bytes(), Direction::Outbound);
        if let Err(e) = chain.process(&mut fc).await {
            // Outbound filtering is audit-only; never withhold a response.
            tracing::error!(error = %e, "outbound filter error");
        }

        let mut out = host_out.lock().await;
        out.write_all(&fc.raw).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn request_id(fc: &FilterContext) -> Option<JsonRpcId> {
    fc.message.as_ref().and_then(|m| m.id.clone())
}

fn write_audit(store: &Arc<dyn AuditStore>, fc: &FilterContext) {
    if let Err(e) = store.write(fc.to_audit_record()) {
        tracing::error!(error = %e, "audit write failed");
    }
}

async fn forward(child_in: &mut tokio::process::ChildStdin, raw: &[u8]) -> Result<(), GatewayError> {
    child_in.write_all(raw).await?;
    child_in.write_all(b"\n").await?;
    child_in.flush().await?;
    Ok(())
}

async fn write_reply<HO>(
    host_out: &Arc<Mutex<HO>>,
    message: &JsonRpcMessage,
) -> Result<(), GatewayError>
where
    HO: AsyncWrite + Send + Unpin + 'static,
{
    let bytes = jsonrpc::to_bytes(message)?;
    let mut out = host_out.lock().await;
    out.write_all(&bytes).await?;
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(())
}
