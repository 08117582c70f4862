//! HTTP/1.1 wire codec for upstream connections
//!
//! Request heads are encoded directly; response heads are parsed with
//! `httparse`. Bodies are framed per RFC 9112 section 6.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::uri::PathAndQuery;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};

/// Largest response head accepted
pub(crate) const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Most headers accepted on a response
pub(crate) const MAX_HEADERS: usize = 100;

const MAX_CHUNK_LINE: usize = 4096;

/// Wire-level decoding errors
#[derive(Debug, thiserror::Error)]
pub(crate) enum CodecError {
    #[error("response head exceeds {} bytes", MAX_HEAD_SIZE)]
    HeadTooLarge,

    #[error("malformed response head: {0}")]
    Parse(#[from] httparse::Error),

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("invalid content-length")]
    InvalidContentLength,

    #[error("invalid chunk: {0}")]
    InvalidChunk(&'static str),
}

/// How the outbound request body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestFraming {
    /// No body bytes follow the head
    Empty,
    /// Exactly this many bytes follow
    Length(u64),
    /// Body is sent with chunked transfer coding
    Chunked,
}

impl RequestFraming {
    /// Decide framing from the final outbound headers, fixing up the framing
    /// headers so they agree with what will be written.
    ///
    /// `exact_len` is the body's exact size when known up front.
    pub(crate) fn resolve(
        method: &Method,
        headers: &mut HeaderMap,
        exact_len: Option<u64>,
    ) -> Result<Self, CodecError> {
        headers.remove(TRANSFER_ENCODING);

        if !method_has_body(method) {
            headers.remove(CONTENT_LENGTH);
            return Ok(RequestFraming::Empty);
        }

        if let Some(length) = content_length(headers)? {
            return Ok(if length == 0 {
                RequestFraming::Empty
            } else {
                RequestFraming::Length(length)
            });
        }

        match exact_len {
            Some(0) => {
                if matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
                }
                Ok(RequestFraming::Empty)
            }
            Some(length) => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
                Ok(RequestFraming::Length(length))
            }
            None => {
                headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                Ok(RequestFraming::Chunked)
            }
        }
    }
}

/// Whether requests with this method forward a body
pub(crate) fn method_has_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

/// Encode a request line and header block
pub(crate) fn encode_request_head(
    method: &Method,
    path: &PathAndQuery,
    headers: &HeaderMap,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(path.as_str().as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf
}

/// Size line for one chunk of a chunked request body
pub(crate) fn chunk_header(len: usize) -> Bytes {
    Bytes::from(format!("{len:X}\r\n"))
}

/// Terminating zero-size chunk with an empty trailer section
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Parsed upstream response status line and headers
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

/// How an upstream response body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body
    None,
    /// Exactly this many bytes
    Length(u64),
    /// Chunked transfer coding
    Chunked,
    /// Everything until the upstream closes the connection
    UntilClose,
}

impl ResponseHead {
    /// Body framing for this response to a request with the given method
    pub(crate) fn framing(&self, head_request: bool) -> Result<BodyFraming, CodecError> {
        if head_request
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return Ok(BodyFraming::None);
        }

        if let Some(coding) = self.headers.get_all(TRANSFER_ENCODING).iter().last() {
            let chunked = coding
                .to_str()
                .ok()
                .and_then(|v| v.rsplit(',').next())
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
            return Ok(if chunked {
                BodyFraming::Chunked
            } else {
                BodyFraming::UntilClose
            });
        }

        match content_length(&self.headers)? {
            Some(0) => Ok(BodyFraming::None),
            Some(length) => Ok(BodyFraming::Length(length)),
            None => Ok(BodyFraming::UntilClose),
        }
    }

    /// Whether the upstream keeps the connection open after this response
    pub(crate) fn keep_alive(&self) -> bool {
        let tokens = connection_tokens(&self.headers);
        if tokens.iter().any(|t| t.eq_ignore_ascii_case("close")) {
            return false;
        }
        match self.version {
            Version::HTTP_10 => tokens.iter().any(|t| t.eq_ignore_ascii_case("keep-alive")),
            _ => true,
        }
    }
}

/// Whether headers ask for the connection to close after this message
pub(crate) fn wants_close(headers: &HeaderMap) -> bool {
    connection_tokens(headers)
        .iter()
        .any(|t| t.eq_ignore_ascii_case("close"))
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, CodecError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(CodecError::InvalidContentLength)?;
        match length {
            Some(previous) if previous != parsed => return Err(CodecError::InvalidContentLength),
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

/// Parse a response head from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. On success the head bytes
/// are consumed from `buf`.
pub(crate) fn parse_response_head(buf: &mut BytesMut) -> Result<Option<ResponseHead>, CodecError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut storage);

    let len = match response.parse(&buf[..])? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            if buf.len() > MAX_HEAD_SIZE {
                return Err(CodecError::HeadTooLarge);
            }
            return Ok(None);
        }
    };

    let code = response.code.unwrap_or_default();
    let status = StatusCode::from_u16(code)
        .map_err(|_| CodecError::InvalidHeader(format!("status {code}")))?;
    let version = match response.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| CodecError::InvalidHeader(header.name.to_string()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| CodecError::InvalidHeader(header.name.to_string()))?;
        headers.append(name, value);
    }

    let _ = buf.split_to(len);

    Ok(Some(ResponseHead {
        status,
        version,
        headers,
    }))
}

/// Result of one decode step
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// A piece of body data
    Data(Bytes),
    /// More input is required
    NeedMore,
    /// Body complete (trailers consumed)
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for chunked transfer coding
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: ChunkedState,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: ChunkedState::Size,
        }
    }

    /// Decode as much as possible from the front of `buf`
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, CodecError> {
        loop {
            match self.state {
                ChunkedState::Size => {
                    let Some(end) = find_crlf(buf) else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(CodecError::InvalidChunk("size line too long"));
                        }
                        return Ok(Decoded::NeedMore);
                    };
                    let line = buf.split_to(end + 2);
                    let size = parse_chunk_size(&line[..end])?;
                    self.state = if size == 0 {
                        ChunkedState::Trailer
                    } else {
                        ChunkedState::Data(size)
                    };
                }
                ChunkedState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(Decoded::NeedMore);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkedState::DataEnd
                    } else {
                        ChunkedState::Data(left)
                    };
                    return Ok(Decoded::Data(data));
                }
                ChunkedState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(CodecError::InvalidChunk("missing CRLF after chunk data"));
                    }
                    let _ = buf.split_to(2);
                    self.state = ChunkedState::Size;
                }
                ChunkedState::Trailer => {
                    let Some(end) = find_crlf(buf) else {
                        if buf.len() > MAX_CHUNK_LINE {
                            return Err(CodecError::InvalidChunk("trailer line too long"));
                        }
                        return Ok(Decoded::NeedMore);
                    };
                    let _ = buf.split_to(end + 2);
                    if end == 0 {
                        self.state = ChunkedState::Done;
                        return Ok(Decoded::Done);
                    }
                }
                ChunkedState::Done => return Ok(Decoded::Done),
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, CodecError> {
    let line =
        std::str::from_utf8(line).map_err(|_| CodecError::InvalidChunk("non-ascii size line"))?;
    let digits = line.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() {
        return Err(CodecError::InvalidChunk("empty size"));
    }
    u64::from_str_radix(digits, 16).map_err(|_| CodecError::InvalidChunk("bad size"))
}
