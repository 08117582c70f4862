//! Request forwarder

use crate::body::{self, BoxError, ProxyBody};
use crate::codec::RequestFraming;
use crate::connection::{ConnectionRef, OutboundRequest};
use crate::failure::failure_response;
use crate::headers::{self, HeaderRewrite};
use crate::pool::ConnectionPool;
use crate::stats::{ProxyStats, StatsSnapshot};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body::Body;
use sluice_core::{Error, FailureKind, PoolSettings, ProxySettings, Result, Upstream};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

/// Receives the single terminal response of a forward call.
///
/// Taken by value, so a sink can only ever be fed once.
pub trait ResponseSink: Send {
    /// Hand over the response (forwarded or translated failure)
    fn deliver(self, response: Response<ProxyBody>);
}

impl ResponseSink for oneshot::Sender<Response<ProxyBody>> {
    fn deliver(self, response: Response<ProxyBody>) {
        if self.send(response).is_err() {
            tracing::debug!("response sink dropped before delivery");
        }
    }
}

/// What a forward call ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The upstream response was delivered
    Forwarded {
        /// Upstream status, verbatim
        status: StatusCode,
    },
    /// A translated failure response was delivered
    Failed {
        /// Failure classification
        kind: FailureKind,
        /// Gateway status delivered
        status: StatusCode,
    },
}

impl ForwardOutcome {
    /// Status delivered to the sink
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardOutcome::Forwarded { status } | ForwardOutcome::Failed { status, .. } => *status,
        }
    }

    /// Whether the upstream response was delivered
    pub fn is_forwarded(&self) -> bool {
        matches!(self, ForwardOutcome::Forwarded { .. })
    }
}

/// Per-call forwarding options
#[derive(Clone, Default)]
pub struct ForwardOptions {
    request_hook: Option<Arc<dyn HeaderRewrite>>,
    response_hook: Option<Arc<dyn HeaderRewrite>>,
}

impl ForwardOptions {
    /// Options with no hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite outbound request headers after baseline normalization
    pub fn rewrite_request_headers(mut self, hook: impl HeaderRewrite + 'static) -> Self {
        self.request_hook = Some(Arc::new(hook));
        self
    }

    /// Rewrite upstream response headers after baseline normalization
    pub fn rewrite_response_headers(mut self, hook: impl HeaderRewrite + 'static) -> Self {
        self.response_hook = Some(Arc::new(hook));
        self
    }

    /// Use an already shared request hook
    pub fn with_request_hook(mut self, hook: Arc<dyn HeaderRewrite>) -> Self {
        self.request_hook = Some(hook);
        self
    }

    /// Use an already shared response hook
    pub fn with_response_hook(mut self, hook: Arc<dyn HeaderRewrite>) -> Self {
        self.response_hook = Some(hook);
        self
    }
}

impl fmt::Debug for ForwardOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardOptions")
            .field("request_hook", &self.request_hook.is_some())
            .field("response_hook", &self.response_hook.is_some())
            .finish()
    }
}

/// Forwarding proxy bound to one upstream base address.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    upstream: Upstream,
    pool: ConnectionPool,
    stats: Arc<ProxyStats>,
}

/// Create a proxy; same as [`Proxy::new`]
pub fn create_proxy(settings: ProxySettings) -> Result<Proxy> {
    Proxy::new(settings)
}

impl Proxy {
    /// Create a proxy for `settings.base`. No connection is opened until
    /// the first forward.
    pub fn new(settings: ProxySettings) -> Result<Self> {
        settings.pool.validate()?;
        let upstream = Upstream::parse(&settings.base)?;
        let stats = Arc::new(ProxyStats::new());

        tracing::info!(
            base = %settings.base,
            pipelining = settings.pool.pipelining,
            connections = settings.pool.connections,
            request_timeout = ?settings.pool.request_timeout,
            "proxy created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                upstream,
                pool: ConnectionPool::new(settings.pool, stats.clone()),
                stats,
            }),
        })
    }

    /// Upstream base address
    pub fn upstream(&self) -> &Upstream {
        &self.inner.upstream
    }

    /// Pool settings in effect
    pub fn settings(&self) -> &PoolSettings {
        self.inner.pool.settings()
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Usable pooled connections
    pub fn connection_count(&self) -> usize {
        self.inner.pool.connection_count()
    }

    /// Exchanges currently holding a pipelining slot
    pub fn in_flight(&self) -> usize {
        self.inner.pool.in_flight()
    }

    /// Close pooled connections. Later forwards fail fast with 503.
    pub fn close(&self) {
        if self.inner.pool.is_closed() {
            return;
        }
        tracing::info!(base = %self.inner.upstream.origin(), "closing proxy");
        self.inner.pool.close();
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    /// Forward `request` to `base + target` and feed the result to `sink`.
    ///
    /// The sink receives exactly one response: the upstream's (headers
    /// rewritten by the hooks, body streamed) or a translated failure.
    pub async fn forward<B, S>(
        &self,
        request: Request<B>,
        sink: S,
        target: &str,
        options: &ForwardOptions,
    ) -> ForwardOutcome
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
        S: ResponseSink,
    {
        let started = Instant::now();
        let method = request.method().clone();

        match self.exchange(request, target, options).await {
            Ok(response) => {
                let status = response.status();
                self.inner.stats.record_forwarded();
                tracing::debug!(
                    method = %method,
                    target,
                    status = status.as_u16(),
                    elapsed = ?started.elapsed(),
                    "forwarded"
                );
                sink.deliver(response);
                ForwardOutcome::Forwarded { status }
            }
            Err(error) => {
                let response = failure_response(&error);
                let kind = error.kind();
                let status = response.status();
                self.inner.stats.record_failure(kind);
                tracing::warn!(
                    method = %method,
                    target,
                    kind = %kind,
                    status = status.as_u16(),
                    error = %error,
                    "forward failed"
                );
                sink.deliver(response);
                ForwardOutcome::Failed { kind, status }
            }
        }
    }

    /// Forward and return the response directly
    pub async fn call<B>(
        &self,
        request: Request<B>,
        target: &str,
        options: &ForwardOptions,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (sink, response) = oneshot::channel();
        self.forward(request, sink, target, options).await;
        match response.await {
            Ok(response) => response,
            Err(_) => failure_response(&Error::Internal(
                "forward finished without a response".to_string(),
            )),
        }
    }

    async fn exchange<B>(
        &self,
        request: Request<B>,
        target: &str,
        options: &ForwardOptions,
    ) -> Result<Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let upstream = &self.inner.upstream;
        let path = upstream.resolve(target)?;
        let (parts, inbound) = request.into_parts();

        let mut outbound_headers =
            headers::normalize_request_headers(&parts.headers, &parts.method, upstream.origin());
        if let Some(hook) = &options.request_hook {
            outbound_headers = hook.rewrite(outbound_headers);
        }

        let body = if headers::method_has_body(&parts.method) {
            body::boxed(inbound)
        } else {
            body::empty()
        };
        let framing = RequestFraming::resolve(
            &parts.method,
            &mut outbound_headers,
            body.size_hint().exact(),
        )
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;

        let outbound = OutboundRequest {
            method: parts.method,
            path,
            headers: outbound_headers,
            framing,
            body,
        };

        let deadline = self.inner.pool.settings().request_timeout;
        let mut written: Option<ConnectionRef> = None;
        let exchanged = tokio::time::timeout(deadline, async {
            let slot = self.inner.pool.acquire(upstream.origin()).await?;
            tracing::trace!(conn = slot.connection_id(), target, "slot acquired");
            let pending = slot.send(outbound)?;
            written = Some(pending.connection());
            pending.recv().await.map_err(Error::from)
        })
        .await;

        let response = match exchanged {
            Ok(response) => response?,
            Err(_) => {
                if let Some(connection) = written {
                    connection.abandon("response deadline elapsed");
                }
                return Err(Error::Timeout(deadline));
            }
        };

        let (mut parts, body) = response.into_parts();
        parts.headers = headers::normalize_response_headers(parts.headers);
        if let Some(hook) = &options.response_hook {
            parts.headers = hook.rewrite(parts.headers);
        }

        Ok(Response::from_parts(parts, body))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.pool.close();
    }
}
