//! Upstream fixtures shared by the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use sluice_core::{PoolSettings, ProxySettings};
use sluice_proxy::Proxy;
use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

/// Start the test service on an ephemeral port
pub async fn spawn_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(route))
                    .await;
            });
        }
    });

    addr
}

async fn route(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (request.method(), request.uri().path()) {
        (&Method::GET | &Method::HEAD, "/service/get") => {
            Response::new(Full::new(Bytes::from_static(b"Hello World!")))
        }
        (&Method::POST, "/service/post") => {
            let content_type = request.headers().get(CONTENT_TYPE).cloned();
            let body = request
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            let mut response = Response::new(Full::new(body));
            if let Some(content_type) = content_type {
                response.headers_mut().insert(CONTENT_TYPE, content_type);
            }
            response
        }
        (&Method::GET, "/service/headers") => {
            let mut seen: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (name, value) in request.headers() {
                seen.entry(name.to_string())
                    .or_default()
                    .push(value.to_str().unwrap_or_default().to_string());
            }
            let mut response =
                Response::new(Full::new(Bytes::from(serde_json::to_vec(&seen).unwrap())));
            response
                .headers_mut()
                .insert("x-agent", HeaderValue::from_static("fast-proxy"));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        (&Method::GET, "/service/timeout") => {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Response::new(Full::new(Bytes::new()))
        }
        _ => {
            let mut response = Response::new(Full::new(Bytes::from_static(b"Not Found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    };
    Ok(response)
}

/// Start a raw TCP upstream; `handler` owns each accepted connection
pub async fn spawn_raw<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handler(stream));
        }
    });

    addr
}

/// Read from `stream` until `count` request heads have arrived; returns their
/// request-target paths in arrival order
pub async fn read_request_paths(stream: &mut TcpStream, count: usize) -> Vec<String> {
    let mut seen = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let text = String::from_utf8_lossy(&seen).to_string();
        let heads: Vec<&str> = text
            .split("\r\n\r\n")
            .filter(|head| !head.is_empty())
            .collect();
        if text.matches("\r\n\r\n").count() >= count {
            return heads
                .iter()
                .take(count)
                .filter_map(|head| head.split(' ').nth(1))
                .map(str::to_string)
                .collect();
        }
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            return Vec::new();
        }
        seen.extend_from_slice(&chunk[..n]);
    }
}

/// Proxy for `addr` with the given depth and deadline
pub fn proxy(addr: SocketAddr, pipelining: usize, request_timeout: Duration) -> Proxy {
    proxy_with(addr, |pool| {
        pool.pipelining = pipelining;
        pool.request_timeout = request_timeout;
    })
}

/// Proxy for `addr` with custom pool settings
pub fn proxy_with(addr: SocketAddr, configure: impl FnOnce(&mut PoolSettings)) -> Proxy {
    let mut pool = PoolSettings::default();
    configure(&mut pool);
    Proxy::new(ProxySettings::new(format!("http://{addr}")).with_pool(pool)).unwrap()
}

/// Body of several frames with no size hint, sent chunked upstream
#[derive(Debug)]
pub struct Chunks(VecDeque<Bytes>);

impl Chunks {
    pub fn new(parts: &[&'static str]) -> Self {
        Self(parts.iter().map(|part| Bytes::from_static(part.as_bytes())).collect())
    }
}

impl Body for Chunks {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(self.get_mut().0.pop_front().map(|data| Ok(Frame::data(data))))
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}
