//! Gateway front server

use crate::shutdown::ShutdownSignal;
use crate::RuntimeState;
use bytes::Bytes;
use http::{Request, Response, StatusCode, Uri};
use http_body::{Body, Frame, SizeHint};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use sluice_config::{Config, GatewayConfig};
use sluice_core::{Error, Result};
use sluice_proxy::{ForwardOptions, Proxy, ProxyBody, RuleRewrite};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// HTTP/1.1 front server forwarding every request through one [`Proxy`]
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    shared: Arc<Shared>,
    state: Arc<RwLock<RuntimeState>>,
    shutdown: ShutdownSignal,
}

#[derive(Debug)]
struct Shared {
    proxy: Proxy,
    options: ForwardOptions,
    strip_prefix: Option<String>,
    active: Arc<AtomicUsize>,
    requests: AtomicU64,
}

impl Gateway {
    /// Create a new gateway builder
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Get the current state
    pub async fn state(&self) -> RuntimeState {
        *self.state.read().await
    }

    /// Get listen address
    pub fn listen_addr(&self) -> SocketAddr {
        self.config.listen
    }

    /// The proxy requests are forwarded through
    pub fn proxy(&self) -> &Proxy {
        &self.shared.proxy
    }

    /// Requests currently being forwarded
    pub fn active_requests(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Requests received since start
    pub fn request_count(&self) -> u64 {
        self.shared.requests.load(Ordering::Relaxed)
    }

    /// Get shutdown signal
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr()).await.map_err(|e| {
            Error::Runtime(format!("Failed to bind to {}: {}", self.listen_addr(), e))
        })?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown is triggered, then
    /// drain in-flight requests and close the proxy
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        *self.state.write().await = RuntimeState::Running;

        let local = listener.local_addr()?;
        tracing::info!(
            listen = %local,
            upstream = %self.shared.proxy.upstream(),
            strip_prefix = ?self.shared.strip_prefix,
            "Gateway listening"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.wait() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        tracing::trace!(%peer, "Accepted connection");
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%peer, error = %e, "set_nodelay failed");
                        }
                        tokio::spawn(serve_connection(
                            stream,
                            Arc::clone(&self.shared),
                            self.shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }
        drop(listener);

        *self.state.write().await = RuntimeState::ShuttingDown;
        self.drain().await;

        self.shared.proxy.close();
        *self.state.write().await = RuntimeState::Stopped;

        let stats = self.shared.proxy.stats();
        tracing::info!(
            requests = self.request_count(),
            forwarded = stats.forwarded,
            failures = stats.total_failures(),
            "Gateway stopped"
        );

        Ok(())
    }

    async fn drain(&self) {
        let timeout = self.config.shutdown_timeout;
        let start = Instant::now();

        tracing::info!(
            timeout_secs = timeout.as_secs(),
            "Waiting for in-flight requests to complete"
        );

        loop {
            let active = self.active_requests();

            if active == 0 {
                tracing::info!("All requests completed, shutting down cleanly");
                return;
            }

            if start.elapsed() >= timeout {
                tracing::warn!(
                    active_requests = active,
                    "Shutdown timeout reached, forcing shutdown"
                );
                return;
            }

            tracing::debug!(
                active_requests = active,
                elapsed_ms = start.elapsed().as_millis(),
                "Waiting for active requests to complete"
            );

            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, shared: Arc<Shared>, shutdown: ShutdownSignal) {
    let service = service_fn(move |request| {
        let shared = Arc::clone(&shared);
        async move { shared.handle(request).await }
    });

    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.wait() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "HTTP connection error");
    }
}

impl Shared {
    async fn handle(
        &self,
        request: Request<Incoming>,
    ) -> std::result::Result<Response<GatewayBody>, Infallible> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let active = ActiveRequest::enter(&self.active);

        let Some(target) = upstream_target(self.strip_prefix.as_deref(), request.uri()) else {
            tracing::debug!(path = request.uri().path(), "Outside mount prefix");
            let mut response = Response::new(GatewayBody::new(ProxyBody::empty(), active));
            *response.status_mut() = StatusCode::NOT_FOUND;
            return Ok(response);
        };

        let response = self.proxy.call(request, &target, &self.options).await;
        Ok(response.map(|body| GatewayBody::new(body, active)))
    }
}

/// Counts a request as active until dropped
#[derive(Debug)]
struct ActiveRequest(Arc<AtomicUsize>);

impl ActiveRequest {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Response body that keeps its request counted as active until the last
/// frame has been sent or the body is dropped
#[derive(Debug)]
struct GatewayBody {
    inner: ProxyBody,
    active: Option<ActiveRequest>,
}

impl GatewayBody {
    fn new(inner: ProxyBody, active: ActiveRequest) -> Self {
        let active = (!inner.is_end_stream()).then_some(active);
        Self { inner, active }
    }
}

impl Body for GatewayBody {
    type Data = Bytes;
    type Error = sluice_core::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => this.active = None,
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => this.active = None,
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Upstream target for an inbound URI: its path and query, with `prefix`
/// removed. `None` when the path is outside the prefix.
fn upstream_target(prefix: Option<&str>, uri: &Uri) -> Option<String> {
    let path = uri.path();
    let rest = match prefix.map(|p| p.trim_end_matches('/')) {
        None | Some("") => path,
        Some(prefix) => match path.strip_prefix(prefix) {
            Some("") => "/",
            Some(rest) if rest.starts_with('/') => rest,
            _ => return None,
        },
    };

    Some(match uri.query() {
        Some(query) => format!("{rest}?{query}"),
        None => rest.to_string(),
    })
}

/// Gateway builder
#[derive(Debug, Default)]
pub struct GatewayBuilder {
    config: Option<Config>,
    shutdown: Option<ShutdownSignal>,
}

impl GatewayBuilder {
    /// Create a new gateway builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an existing shutdown signal
    pub fn shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    /// Build the gateway: create the proxy and compile header rules
    pub fn build(self) -> Result<Gateway> {
        let config = self
            .config
            .ok_or_else(|| Error::Config("config is required".to_string()))?;

        let proxy = Proxy::new(config.proxy.clone())?;

        let mut options = ForwardOptions::new();
        if !config.headers.request.is_empty() {
            options = options.rewrite_request_headers(RuleRewrite::compile(&config.headers.request)?);
        }
        if !config.headers.response.is_empty() {
            options =
                options.rewrite_response_headers(RuleRewrite::compile(&config.headers.response)?);
        }

        Ok(Gateway {
            shared: Arc::new(Shared {
                proxy,
                options,
                strip_prefix: config.gateway.strip_prefix.clone(),
                active: Arc::new(AtomicUsize::new(0)),
                requests: AtomicU64::new(0),
            }),
            config: config.gateway,
            state: Arc::new(RwLock::new(RuntimeState::Initializing)),
            shutdown: self.shutdown.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_config::ConfigBuilder;

    fn target(prefix: Option<&str>, uri: &str) -> Option<String> {
        upstream_target(prefix, &uri.parse::<Uri>().unwrap())
    }

    #[test]
    fn test_target_without_prefix() {
        assert_eq!(target(None, "/service/get").as_deref(), Some("/service/get"));
        assert_eq!(target(None, "/a?b=1").as_deref(), Some("/a?b=1"));
        assert_eq!(target(Some("/"), "/a").as_deref(), Some("/a"));
    }

    #[test]
    fn test_target_strips_prefix() {
        assert_eq!(target(Some("/api"), "/api/service/get").as_deref(), Some("/service/get"));
        assert_eq!(target(Some("/api"), "/api").as_deref(), Some("/"));
        assert_eq!(target(Some("/api"), "/api?x=1").as_deref(), Some("/?x=1"));
        assert_eq!(target(Some("/api"), "/api/get?x=1").as_deref(), Some("/get?x=1"));
    }

    #[test]
    fn test_target_outside_prefix() {
        assert_eq!(target(Some("/api"), "/apis/get"), None);
        assert_eq!(target(Some("/api"), "/other"), None);
    }

    #[test]
    fn test_active_request_guard() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _a = ActiveRequest::enter(&counter);
            let _b = ActiveRequest::enter(&counter);
            assert_eq!(counter.load(Ordering::Acquire), 2);
        }
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_body_holds_request_active_until_sent() {
        use http_body_util::BodyExt;

        let counter = Arc::new(AtomicUsize::new(0));
        let body = GatewayBody::new(ProxyBody::full("hello"), ActiveRequest::enter(&counter));
        assert_eq!(counter.load(Ordering::Acquire), 1);

        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(bytes, "hello");
        assert_eq!(counter.load(Ordering::Acquire), 0);

        let empty = GatewayBody::new(ProxyBody::empty(), ActiveRequest::enter(&counter));
        assert_eq!(counter.load(Ordering::Acquire), 0);
        drop(empty);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_builder() {
        let config = ConfigBuilder::new()
            .base("http://127.0.0.1:3000")
            .build()
            .unwrap();

        let gateway = Gateway::builder().config(config).build().unwrap();
        assert_eq!(gateway.state().await, RuntimeState::Initializing);
        assert_eq!(gateway.listen_addr().port(), 8080);
        assert_eq!(gateway.active_requests(), 0);
    }

    #[test]
    fn test_builder_requires_config() {
        assert!(Gateway::builder().build().is_err());
    }

    #[test]
    fn test_builder_rejects_https_base() {
        let config = ConfigBuilder::new()
            .base("https://127.0.0.1:3000")
            .build()
            .unwrap();
        assert!(Gateway::builder().config(config).build().is_err());
    }
}
