//! Pipelined HTTP/1.1 upstream connection
//!
//! Every connection runs two tasks. The writer serializes exchanges onto the
//! socket in order and queues the matching expectation for the reader before
//! it writes a single request byte. The reader parses responses strictly in
//! that order and pumps each body through a bounded channel to its
//! [`ProxyBody`].
//!
//! Any fault (reset, EOF, malformed or unsolicited data, write failure)
//! poisons the connection: both tasks stop, and every exchange still queued
//! or in flight fails with that fault.

use crate::body::{BodyEvent, ProxyBody, RequestBody};
use crate::codec::{
    self, BodyFraming, ChunkedDecoder, CodecError, Decoded, RequestFraming, ResponseHead,
};
use crate::stats::ProxyStats;
use bytes::{Bytes, BytesMut};
use http::uri::PathAndQuery;
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use sluice_core::{Error, Origin};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

const READ_BUFFER: usize = 8 * 1024;

/// Body chunks buffered between the reader and a slow consumer
const BODY_CHANNEL: usize = 16;

/// Why a connection stopped serving exchanges
#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum Fault {
    #[error("{0}")]
    Reset(String),

    #[error("{0}")]
    Protocol(String),

    #[error("connection retired: {0}")]
    Retired(&'static str),

    #[error("proxy closed")]
    Closed,

    #[error("{0}")]
    RequestBody(String),
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Reset(reason) => Error::ConnectionReset(reason),
            Fault::Protocol(reason) => Error::ProtocolViolation(reason),
            Fault::Retired(reason) => Error::ConnectionReset(format!("connection retired: {reason}")),
            Fault::Closed => Error::Closed,
            Fault::RequestBody(reason) => Error::RequestBody(reason),
        }
    }
}

impl From<CodecError> for Fault {
    fn from(err: CodecError) -> Self {
        Fault::Protocol(err.to_string())
    }
}

/// Request as it goes on the wire, headers final
#[derive(Debug)]
pub(crate) struct OutboundRequest {
    pub(crate) method: Method,
    pub(crate) path: PathAndQuery,
    pub(crate) headers: HeaderMap,
    pub(crate) framing: RequestFraming,
    pub(crate) body: RequestBody,
}

type Responder = oneshot::Sender<Result<Response<ProxyBody>, Fault>>;

#[derive(Debug)]
struct Exchange {
    request: OutboundRequest,
    head_request: bool,
    respond: Responder,
    release: Release,
}

#[derive(Debug)]
struct Expect {
    head_request: bool,
    respond: Responder,
    release: Release,
}

#[derive(Debug)]
struct ConnState {
    in_flight: usize,
    idle_since: Instant,
    retired: bool,
    fault: Option<Fault>,
}

#[derive(Debug)]
struct Shared {
    id: u64,
    origin: Origin,
    state: Mutex<ConnState>,
    cancel: CancellationToken,
    released: Arc<Notify>,
    stats: Arc<ProxyStats>,
}

impl Shared {
    fn poison(&self, fault: Fault) {
        {
            let mut state = self.state.lock();
            state.retired = true;
            if state.fault.is_none() {
                state.fault = Some(fault);
            }
        }
        self.cancel.cancel();
    }

    fn retire(&self) {
        self.state.lock().retired = true;
    }

    fn fault(&self) -> Fault {
        self.state.lock().fault.clone().unwrap_or(Fault::Closed)
    }

    fn try_close_idle(&self, keep_alive: Duration) -> bool {
        {
            let mut state = self.state.lock();
            if state.in_flight > 0 || state.idle_since.elapsed() < keep_alive {
                return false;
            }
            state.retired = true;
            if state.fault.is_none() {
                state.fault = Some(Fault::Retired("idle"));
            }
        }
        self.cancel.cancel();
        true
    }

    fn retired_and_drained(&self) -> bool {
        let state = self.state.lock();
        state.retired && state.in_flight == 0
    }
}

/// Pool-side handle to one upstream connection
#[derive(Debug)]
pub(crate) struct Connection {
    shared: Arc<Shared>,
    exchanges: mpsc::UnboundedSender<Exchange>,
}

impl Connection {
    /// Start the reader and writer tasks for an established stream
    pub(crate) fn spawn(
        stream: TcpStream,
        id: u64,
        origin: Origin,
        cancel: CancellationToken,
        released: Arc<Notify>,
        stats: Arc<ProxyStats>,
        keep_alive: Duration,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (exchanges, exchange_rx) = mpsc::unbounded_channel();
        let (expect_tx, expect_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            id,
            origin,
            state: Mutex::new(ConnState {
                in_flight: 0,
                idle_since: Instant::now(),
                retired: false,
                fault: None,
            }),
            cancel,
            released,
            stats,
        });

        tokio::spawn(write_loop(write_half, exchange_rx, expect_tx, shared.clone()));
        tokio::spawn(read_loop(read_half, expect_rx, shared.clone(), keep_alive));

        tracing::debug!(conn = id, origin = %shared.origin, "upstream connection established");

        Arc::new(Self { shared, exchanges })
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether new exchanges may still be placed on this connection
    pub(crate) fn is_usable(&self) -> bool {
        if self.shared.cancel.is_cancelled() {
            return false;
        }
        let state = self.shared.state.lock();
        !state.retired && state.fault.is_none()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    /// Reserve one pipelining slot if the connection is healthy and below `depth`
    pub(crate) fn try_reserve(self: &Arc<Self>, depth: usize) -> Option<Slot> {
        if self.shared.cancel.is_cancelled() {
            return None;
        }
        {
            let mut state = self.shared.state.lock();
            if state.retired || state.fault.is_some() || state.in_flight >= depth {
                return None;
            }
            state.in_flight += 1;
        }
        Some(Slot {
            connection: self.clone(),
            release: Release {
                shared: self.shared.clone(),
            },
        })
    }

    pub(crate) fn poison(&self, fault: Fault) {
        self.shared.poison(fault);
    }
}

/// Decrements the in-flight count of a connection when dropped
#[derive(Debug)]
struct Release {
    shared: Arc<Shared>,
}

impl Drop for Release {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if state.in_flight == 0 {
                state.idle_since = Instant::now();
            }
        }
        self.shared.released.notify_waiters();
    }
}

/// A reserved pipelining slot on a connection.
///
/// Dropping an unused slot gives the reservation back.
#[derive(Debug)]
pub(crate) struct Slot {
    connection: Arc<Connection>,
    release: Release,
}

impl Slot {
    pub(crate) fn connection_id(&self) -> u64 {
        self.connection.id()
    }

    /// Queue the request for writing. The slot stays held until the
    /// response body has been read off the connection.
    pub(crate) fn send(self, request: OutboundRequest) -> Result<PendingResponse, Fault> {
        let Slot {
            connection,
            release,
        } = self;

        if codec::wants_close(&request.headers) {
            connection.shared.retire();
        }

        let (respond, response) = oneshot::channel();
        let exchange = Exchange {
            head_request: request.method == Method::HEAD,
            request,
            respond,
            release,
        };

        connection
            .exchanges
            .send(exchange)
            .map_err(|_| connection.shared.fault())?;

        Ok(PendingResponse {
            response,
            shared: connection.shared.clone(),
        })
    }
}

/// Response head of a queued exchange, not yet arrived
#[derive(Debug)]
pub(crate) struct PendingResponse {
    response: oneshot::Receiver<Result<Response<ProxyBody>, Fault>>,
    shared: Arc<Shared>,
}

impl PendingResponse {
    pub(crate) fn connection(&self) -> ConnectionRef {
        ConnectionRef {
            shared: self.shared.clone(),
        }
    }

    pub(crate) async fn recv(self) -> Result<Response<ProxyBody>, Fault> {
        match self.response.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.fault()),
        }
    }
}

/// Handle kept by a caller whose exchange has been written
#[derive(Debug, Clone)]
pub(crate) struct ConnectionRef {
    shared: Arc<Shared>,
}

impl ConnectionRef {
    /// Give up on the exchange. The connection can no longer be trusted to
    /// line up responses with requests, so it is poisoned.
    pub(crate) fn abandon(&self, reason: &str) {
        tracing::debug!(conn = self.shared.id, reason, "abandoning upstream connection");
        self.shared
            .poison(Fault::Reset(format!("exchange abandoned: {reason}")));
    }
}

async fn write_loop(
    mut io: OwnedWriteHalf,
    mut exchanges: mpsc::UnboundedReceiver<Exchange>,
    expects: mpsc::UnboundedSender<Expect>,
    shared: Arc<Shared>,
) {
    loop {
        let exchange = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = exchanges.recv() => match next {
                Some(exchange) => exchange,
                None => break,
            },
        };

        let Exchange {
            request,
            head_request,
            respond,
            release,
        } = exchange;

        let expect = Expect {
            head_request,
            respond,
            release,
        };
        if let Err(unsent) = expects.send(expect) {
            let _ = unsent.0.respond.send(Err(shared.fault()));
            break;
        }

        let written = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            result = write_request(&mut io, request) => result,
        };

        if let Err(fault) = written {
            tracing::debug!(conn = shared.id, error = %fault, "upstream write failed");
            shared.poison(fault);
            break;
        }
    }

    exchanges.close();
    while let Ok(exchange) = exchanges.try_recv() {
        let _ = exchange.respond.send(Err(shared.fault()));
    }
    drop(expects);

    // Keep the write half open until the reader is done, so the upstream
    // never sees a FIN while responses are still owed.
    shared.cancel.cancelled().await;
    drop(io);
}

async fn write_request(io: &mut OwnedWriteHalf, request: OutboundRequest) -> Result<(), Fault> {
    let OutboundRequest {
        method,
        path,
        headers,
        framing,
        mut body,
    } = request;

    let head = codec::encode_request_head(&method, &path, &headers);
    io.write_all(&head).await.map_err(write_fault)?;

    match framing {
        RequestFraming::Empty => {}
        RequestFraming::Length(expected) => {
            let mut sent = 0u64;
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|e| Fault::RequestBody(e.to_string()))?;
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                sent += data.len() as u64;
                if sent > expected {
                    return Err(Fault::RequestBody(format!(
                        "request body exceeds content-length {expected}"
                    )));
                }
                io.write_all(&data).await.map_err(write_fault)?;
            }
            if sent != expected {
                return Err(Fault::RequestBody(format!(
                    "request body is {sent} bytes, content-length is {expected}"
                )));
            }
        }
        RequestFraming::Chunked => {
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|e| Fault::RequestBody(e.to_string()))?;
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if data.is_empty() {
                    continue;
                }
                io.write_all(&codec::chunk_header(data.len()))
                    .await
                    .map_err(write_fault)?;
                io.write_all(&data).await.map_err(write_fault)?;
                io.write_all(b"\r\n").await.map_err(write_fault)?;
            }
            io.write_all(codec::LAST_CHUNK).await.map_err(write_fault)?;
        }
    }

    io.flush().await.map_err(write_fault)
}

fn write_fault(err: std::io::Error) -> Fault {
    Fault::Reset(format!("write to upstream failed: {err}"))
}

async fn read_loop(
    mut io: OwnedReadHalf,
    mut expects: mpsc::UnboundedReceiver<Expect>,
    shared: Arc<Shared>,
    keep_alive: Duration,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER);

    let fault = loop {
        let expect = if buf.is_empty() {
            buf.reserve(READ_BUFFER);
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => break shared.fault(),
                next = expects.recv() => match next {
                    Some(expect) => expect,
                    None => break Fault::Retired("writer stopped"),
                },
                read = io.read_buf(&mut buf) => break match read {
                    Ok(0) => Fault::Reset("upstream closed the connection".to_string()),
                    Ok(_) => Fault::Protocol("unsolicited data from upstream".to_string()),
                    Err(e) => Fault::Reset(e.to_string()),
                },
                _ = tokio::time::sleep(keep_alive) => {
                    if shared.try_close_idle(keep_alive) {
                        break shared.fault();
                    }
                    continue;
                }
            }
        } else {
            // Response bytes can only follow a queued expectation.
            match expects.try_recv() {
                Ok(expect) => expect,
                Err(_) => break Fault::Protocol("unsolicited data from upstream".to_string()),
            }
        };

        match read_exchange(&mut io, &mut buf, expect, &shared).await {
            Ok(true) if shared.retired_and_drained() => break Fault::Retired("retired"),
            Ok(true) => {}
            Ok(false) => break Fault::Retired("upstream will close"),
            Err(fault) => break fault,
        }
    };

    shared.poison(fault.clone());
    expects.close();
    while let Ok(expect) = expects.try_recv() {
        let _ = expect.respond.send(Err(fault.clone()));
    }

    shared.stats.record_connection_closed();
    tracing::debug!(
        conn = shared.id,
        origin = %shared.origin,
        reason = %fault,
        "upstream connection closed"
    );
    shared.released.notify_waiters();
}

/// Read one response. Returns whether the connection may be reused.
async fn read_exchange(
    io: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    expect: Expect,
    shared: &Shared,
) -> Result<bool, Fault> {
    let Expect {
        head_request,
        respond,
        release,
    } = expect;

    let framed = async {
        let head = read_head(io, buf, shared).await?;
        let framing = head.framing(head_request)?;
        Ok::<_, Fault>((head, framing))
    }
    .await;

    let (head, framing) = match framed {
        Ok(framed) => framed,
        Err(fault) => {
            let _ = respond.send(Err(fault.clone()));
            return Err(fault);
        }
    };

    let reuse = head.keep_alive() && framing != BodyFraming::UntilClose;
    if !reuse {
        shared.retire();
    }

    let (body, events) = match framing {
        BodyFraming::None => (ProxyBody::empty(), None),
        BodyFraming::Length(length) => {
            let (tx, rx) = mpsc::channel(BODY_CHANNEL);
            (ProxyBody::streaming(rx, Some(length)), Some(tx))
        }
        BodyFraming::Chunked | BodyFraming::UntilClose => {
            let (tx, rx) = mpsc::channel(BODY_CHANNEL);
            (ProxyBody::streaming(rx, None), Some(tx))
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;

    // Nothing left on the wire for this exchange.
    let release = match framing {
        BodyFraming::None => {
            drop(release);
            None
        }
        _ => Some(release),
    };

    // A caller that has gone away still gets its body drained so the
    // responses behind it stay aligned.
    let _ = respond.send(Ok(response));

    let mut sink = BodySink { events };
    match pump_body(io, buf, framing, &mut sink, shared).await {
        Ok(()) => {
            drop(release);
            sink.end(shared).await?;
            Ok(reuse)
        }
        Err(fault) => {
            sink.abort(&fault);
            Err(fault)
        }
    }
}

async fn read_head(
    io: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    shared: &Shared,
) -> Result<ResponseHead, Fault> {
    loop {
        match codec::parse_response_head(buf)? {
            Some(head) if head.status == StatusCode::SWITCHING_PROTOCOLS => {
                return Err(Fault::Protocol(
                    "upstream switched protocols, upgrades are not supported".to_string(),
                ));
            }
            Some(head) if head.status.is_informational() => continue,
            Some(head) => return Ok(head),
            None => {
                if fill(io, buf, shared).await? == 0 {
                    return Err(Fault::Reset(
                        "upstream closed the connection before responding".to_string(),
                    ));
                }
            }
        }
    }
}

async fn pump_body(
    io: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    framing: BodyFraming,
    sink: &mut BodySink,
    shared: &Shared,
) -> Result<(), Fault> {
    match framing {
        BodyFraming::None => Ok(()),
        BodyFraming::Length(mut remaining) => {
            while remaining > 0 {
                if buf.is_empty() && fill(io, buf, shared).await? == 0 {
                    return Err(mid_body_eof());
                }
                let take = remaining.min(buf.len() as u64) as usize;
                remaining -= take as u64;
                sink.data(buf.split_to(take).freeze(), shared).await?;
            }
            Ok(())
        }
        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            loop {
                match decoder.decode(buf)? {
                    Decoded::Data(data) => sink.data(data, shared).await?,
                    Decoded::NeedMore => {
                        if fill(io, buf, shared).await? == 0 {
                            return Err(mid_body_eof());
                        }
                    }
                    Decoded::Done => return Ok(()),
                }
            }
        }
        BodyFraming::UntilClose => loop {
            if !buf.is_empty() {
                sink.data(buf.split().freeze(), shared).await?;
            }
            if fill(io, buf, shared).await? == 0 {
                return Ok(());
            }
        },
    }
}

fn mid_body_eof() -> Fault {
    Fault::Reset("upstream closed the connection mid-body".to_string())
}

async fn fill(io: &mut OwnedReadHalf, buf: &mut BytesMut, shared: &Shared) -> Result<usize, Fault> {
    buf.reserve(READ_BUFFER);
    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => Err(shared.fault()),
        read = io.read_buf(buf) => read.map_err(|e| Fault::Reset(e.to_string())),
    }
}

/// Feeds a streaming [`ProxyBody`]; switches to draining once the body is dropped
struct BodySink {
    events: Option<mpsc::Sender<BodyEvent>>,
}

impl BodySink {
    async fn data(&mut self, data: Bytes, shared: &Shared) -> Result<(), Fault> {
        let delivered = {
            let Some(events) = self.events.as_ref() else {
                return Ok(());
            };
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return Err(shared.fault()),
                sent = events.send(BodyEvent::Data(data)) => sent.is_ok(),
            }
        };
        if !delivered {
            tracing::trace!(conn = shared.id, "response body dropped, draining");
            self.events = None;
        }
        Ok(())
    }

    async fn end(&mut self, shared: &Shared) -> Result<(), Fault> {
        let Some(events) = self.events.take() else {
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(shared.fault()),
            _ = events.send(BodyEvent::End) => Ok(()),
        }
    }

    fn abort(&mut self, fault: &Fault) {
        if let Some(events) = self.events.take() {
            let _ = events.try_send(BodyEvent::Abort(fault.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connect(keep_alive: Duration) -> (Arc<Connection>, TcpStream, Arc<ProxyStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let (upstream, _) = listener.accept().await.unwrap();
        let stats = Arc::new(ProxyStats::new());
        let connection = Connection::spawn(
            stream,
            1,
            Origin::new("127.0.0.1", addr.port()),
            CancellationToken::new(),
            Arc::new(Notify::new()),
            stats.clone(),
            keep_alive,
        );
        (connection, upstream, stats)
    }

    fn get(path: &'static str) -> OutboundRequest {
        OutboundRequest {
            method: Method::GET,
            path: PathAndQuery::from_static(path),
            headers: HeaderMap::new(),
            framing: RequestFraming::Empty,
            body: body::empty(),
        }
    }

    async fn read_requests(upstream: &mut TcpStream, count: usize) -> String {
        let mut seen = Vec::new();
        let mut chunk = [0u8; 1024];
        while String::from_utf8_lossy(&seen).matches("\r\n\r\n").count() < count {
            let n = upstream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed early");
            seen.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(seen).unwrap()
    }

    #[tokio::test]
    async fn test_pipelined_responses_in_order() {
        let (connection, mut upstream, _) = connect(Duration::from_secs(5)).await;

        let first = connection.try_reserve(2).unwrap();
        let second = connection.try_reserve(2).unwrap();
        assert!(connection.try_reserve(2).is_none());

        let first = first.send(get("/one")).unwrap();
        let second = second.send(get("/two")).unwrap();

        let requests = read_requests(&mut upstream, 2).await;
        assert!(requests.find("/one").unwrap() < requests.find("/two").unwrap());

        upstream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\noneHTTP/1.1 201 Created\r\ncontent-length: 3\r\n\r\ntwo")
            .await
            .unwrap();

        let first = first.recv().await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let body = first.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"one");

        let second = second.recv().await.unwrap();
        assert_eq!(second.status(), StatusCode::CREATED);
        let body = second.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"two");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connection.in_flight(), 0);
        assert!(connection.is_usable());
    }

    #[tokio::test]
    async fn test_reset_fails_all_in_flight() {
        let (connection, mut upstream, stats) = connect(Duration::from_secs(5)).await;

        let first = connection.try_reserve(2).unwrap().send(get("/a")).unwrap();
        let second = connection.try_reserve(2).unwrap().send(get("/b")).unwrap();
        read_requests(&mut upstream, 2).await;
        drop(upstream);

        assert!(matches!(first.recv().await, Err(Fault::Reset(_))));
        assert!(matches!(second.recv().await, Err(Fault::Reset(_))));
        assert!(!connection.is_usable());
        assert!(connection.try_reserve(2).is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stats.snapshot().connections_closed, 1);
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_protocol_fault() {
        let (connection, mut upstream, _) = connect(Duration::from_secs(5)).await;
        upstream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!connection.is_usable());
        assert!(matches!(connection.shared.fault(), Fault::Protocol(_)));
    }

    #[tokio::test]
    async fn test_dropped_body_is_drained() {
        let (connection, mut upstream, _) = connect(Duration::from_secs(5)).await;

        let first = connection.try_reserve(1).unwrap().send(get("/big")).unwrap();
        read_requests(&mut upstream, 1).await;

        let payload = vec![b'x'; 256 * 1024];
        let head = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n", payload.len());
        upstream.write_all(head.as_bytes()).await.unwrap();

        let response = first.recv().await.unwrap();
        drop(response);
        upstream.write_all(&payload).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let next = connection.try_reserve(1).unwrap().send(get("/next")).unwrap();
        read_requests(&mut upstream, 1).await;
        upstream
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(next.recv().await.unwrap().status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_informational_responses_are_skipped() {
        let (connection, mut upstream, _) = connect(Duration::from_secs(5)).await;
        let pending = connection.try_reserve(1).unwrap().send(get("/")).unwrap();
        read_requests(&mut upstream, 1).await;
        upstream
            .write_all(b"HTTP/1.1 103 Early Hints\r\nlink: </a.css>\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();

        let response = pending.recv().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("link").is_none());
    }

    #[tokio::test]
    async fn test_connection_close_retires() {
        let (connection, mut upstream, _) = connect(Duration::from_secs(5)).await;
        let pending = connection.try_reserve(4).unwrap().send(get("/")).unwrap();
        read_requests(&mut upstream, 1).await;
        upstream
            .write_all(b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 2\r\n\r\nok")
            .await
            .unwrap();

        let response = pending.recv().await.unwrap();
        assert!(!connection.is_usable());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_idle_connection_closes() {
        let (connection, mut upstream, stats) = connect(Duration::from_millis(50)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!connection.is_usable());
        assert_eq!(stats.snapshot().connections_closed, 1);

        let mut rest = Vec::new();
        let n = upstream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_abandon_poisons() {
        let (connection, mut upstream, _) = connect(Duration::from_secs(5)).await;
        let pending = connection.try_reserve(1).unwrap().send(get("/slow")).unwrap();
        read_requests(&mut upstream, 1).await;

        pending.connection().abandon("deadline elapsed");
        assert!(matches!(pending.recv().await, Err(Fault::Reset(_))));
        assert!(!connection.is_usable());
    }

    #[test]
    fn test_fault_classification() {
        use sluice_core::FailureKind;

        assert_eq!(
            Error::from(Fault::Reset("x".into())).kind(),
            FailureKind::ConnectionReset
        );
        assert_eq!(
            Error::from(Fault::Protocol("x".into())).kind(),
            FailureKind::ProtocolViolation
        );
        assert_eq!(Error::from(Fault::Closed).kind(), FailureKind::Closed);
        assert_eq!(
            Error::from(Fault::Retired("idle")).kind(),
            FailureKind::ConnectionReset
        );
    }
}
