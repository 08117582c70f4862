//! Failure translation into gateway responses

use crate::body::ProxyBody;
use http::{header, HeaderValue, Response, StatusCode};
use sluice_core::{Error, ErrorResponse, FailureKind};

/// Classify an error and pick the status answered to the client
pub fn translate(error: &Error) -> (FailureKind, StatusCode) {
    let kind = error.kind();
    (kind, kind.status_code())
}

/// Build the response delivered to the sink for a failed forward.
///
/// Timeouts answer with an empty 504; other kinds carry a small JSON body.
pub fn failure_response(error: &Error) -> Response<ProxyBody> {
    let (kind, status) = translate(error);

    let mut response = if kind == FailureKind::Timeout {
        Response::new(ProxyBody::empty())
    } else {
        let body = ErrorResponse::new(kind, error.to_string()).to_bytes();
        let mut response = Response::new(ProxyBody::full(body));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    };

    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_timeout_is_empty_504() {
        let response = failure_response(&Error::Timeout(Duration::from_millis(100)));
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(response.headers().get(header::CONTENT_TYPE).is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_pool_exhausted_json() {
        let response = failure_response(&Error::PoolExhausted("http://127.0.0.1:3000".into()));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "pool_exhausted");
    }

    #[test]
    fn test_translate() {
        assert_eq!(
            translate(&Error::Closed),
            (FailureKind::Closed, StatusCode::SERVICE_UNAVAILABLE)
        );
        assert_eq!(
            translate(&Error::ProtocolViolation("out of order".into())),
            (FailureKind::ProtocolViolation, StatusCode::BAD_GATEWAY)
        );
        assert_eq!(
            translate(&Error::InvalidTarget("x".into())),
            (FailureKind::Unclassified, StatusCode::BAD_GATEWAY)
        );
    }
}
