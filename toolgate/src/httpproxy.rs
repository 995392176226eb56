//! HTTP interposer: a reverse proxy for the Streamable HTTP MCP transport.
//!
//! `POST` bodies are fully buffered, run through the inbound filter chain,
//! and either forwarded with the body reattached (the upstream response is
//! streamed back unchanged, `text/event-stream` included) or short-circuited
//! with an HTTP 200 whose body is a JSON-RPC error envelope carrying the
//! preserved request id. Both `deny` and `ask` short-circuit: no reviewer
//! round-trip exists on the HTTP path, a deliberate limitation. Non-POST
//! requests bypass the chain entirely; upstream transport errors become 502.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::TryStreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use toolgate_core::audit::AuditStore;
use toolgate_core::filter::{FilterChain, FilterContext};
use toolgate_core::jsonrpc;
use toolgate_core::{Direction, Verdict};

use crate::error::GatewayError;

/// Request body cap, matching the stdio line cap.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// The HTTP reverse proxy.
pub struct HttpInterposer {
    chain: Arc<FilterChain>,
    store: Arc<dyn AuditStore>,
    client: reqwest::Client,
    target: reqwest::Url,
}

impl HttpInterposer {
    pub fn new(
        target: &str,
        chain: Arc<FilterChain>,
        store: Arc<dyn AuditStore>,
    ) -> Result<Self, GatewayError> {
        let target = reqwest::Url::parse(target).map_err(|e| GatewayError::InvalidTarget {
            url: target.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            chain,
            store,
            client: reqwest::Client::new(),
            target,
        })
    }

    /// Router handling every path and method.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new().fallback(handle).with_state(self.clone())
    }

    /// Bind and serve until the token is cancelled.
    pub async fn serve(
        self: Arc<Self>,
        addr: &str,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        tracing::info!(listen = addr, target = %self.target, "HTTP proxy listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }

    async fn intercept(&self, req: Request) -> Response {
        let (parts, body) = req.into_parts();

        let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to read request body");
                return (StatusCode::BAD_REQUEST, "failed to read request").into_response();
            }
        };

        // Only POSTed JSON-RPC is interposed; everything else passes through.
        if parts.method != Method::POST {
            return self.forward(parts.method, parts.headers, bytes).await;
        }

        let mut fc = FilterContext::new(bytes.to_vec(), Direction::Inbound);
        if let Err(e) = self.chain.process(&mut fc).await {
            tracing::error!(error = %e, "filter chain error");
            fc.verdict = Verdict::Deny;
            if fc.matched_rule.is_empty() {
                fc.matched_rule = "_error".to_string();
            }
            fc.verdict_message = e.to_string();
            self.write_audit(&fc);
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal filter error").into_response();
        }

        match fc.verdict {
            Verdict::Deny => {
                tracing::warn!(
                    method = %fc.method,
                    tool = %fc.tool,
                    rule = %fc.matched_rule,
                    "request denied"
                );
                short_circuit(&fc)
            }
            Verdict::Ask => {
                // No reviewer round-trip over HTTP: an ask is decided as a
                // denial right here, and this decision is what gets audited.
                tracing::warn!(
                    method = %fc.method,
                    tool = %fc.tool,
                    rule = %fc.matched_rule,
                    "approval required but unavailable over HTTP; denying"
                );
                fc.verdict = Verdict::Deny;
                self.write_audit(&fc);
                short_circuit(&fc)
            }
            Verdict::Allow | Verdict::Log => {
                self.forward(parts.method, parts.headers, bytes).await
            }
        }
    }

    async fn forward(&self, method: Method, headers: HeaderMap, body: bytes::Bytes) -> Response {
        let mut headers = headers;
        // The upstream client recomputes these for its own connection.
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let upstream = self
            .client
            .request(method, self.target.clone())
            .headers(headers)
            .body(body)
            .send()
            .await;

        let upstream = match upstream {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, target = %self.target, "upstream request failed");
                return (StatusCode::BAD_GATEWAY, format!("proxy error: {e}")).into_response();
            }
        };

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        // Hyper frames the streamed body itself.
        response_headers.remove(header::TRANSFER_ENCODING);
        response_headers.remove(header::CONNECTION);

        let stream = upstream.bytes_stream().map_err(std::io::Error::other);
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }

    fn write_audit(&self, fc: &FilterContext) {
        if let Err(e) = self.store.write(fc.to_audit_record()) {
            tracing::error!(error = %e, "audit write failed");
        }
    }
}

/// HTTP 200 carrying a JSON-RPC policy-deny envelope: the JSON-RPC error is
/// the payload, not an HTTP-level failure.
fn short_circuit(fc: &FilterContext) -> Response {
    let id = fc.message.as_ref().and_then(|m| m.id.clone());
    let message = if fc.verdict_message.is_empty() {
        "request denied by policy"
    } else {
        fc.verdict_message.as_str()
    };

    let body = jsonrpc::to_bytes(&jsonrpc::deny_response(id, message)).unwrap_or_default();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

async fn handle(State(proxy): State<Arc<HttpInterposer>>, req: Request) -> Response {
    proxy.intercept(req).await
}
