//! Task-call client.
//!
//! One HTTP/1 connection per call over hyper's low-level client, the same
//! way health probes talk to services. Any non-2xx answer is a failed call.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use tracing::{debug, warn};

use crate::error::CallError;

const USER_AGENT: &str = "flowmesh/0.1";

/// Classification sent to the daemon in `x-rexflow-error-code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The callee could not be reached (connect failure, timeout, 502, 503).
    Connection,
    /// The callee answered with an error.
    Task,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "CONNECTION_ERROR",
            Self::Task => "TASK_ERROR",
        }
    }
}

impl CallError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Connect { .. } | Self::Timeout { .. } => ErrorCode::Connection,
            Self::Status { status, .. } if *status == 502 || *status == 503 => {
                ErrorCode::Connection
            }
            _ => ErrorCode::Task,
        }
    }
}

/// A 2xx reply.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Issue one request to `url`.
pub async fn request(
    method: Method,
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
    timeout: Duration,
) -> Result<HttpReply, CallError> {
    let uri: Uri = url
        .parse()
        .map_err(|_| CallError::InvalidUrl(url.to_string()))?;
    if uri.scheme_str() != Some("http") {
        return Err(CallError::InvalidUrl(url.to_string()));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| CallError::InvalidUrl(url.to_string()))?
        .clone();
    let address = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));

    let exchange = async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| CallError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| CallError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"))
            .header("host", authority.as_str())
            .header("user-agent", USER_AGENT);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let req = builder.body(Full::new(body)).map_err(|e| CallError::Protocol {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| CallError::Protocol {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let (parts, incoming) = resp.into_parts();
        let body = incoming
            .collect()
            .await
            .map_err(|e| CallError::Protocol {
                url: url.to_string(),
                reason: e.to_string(),
            })?
            .to_bytes();

        if !parts.status.is_success() {
            return Err(CallError::Status {
                url: url.to_string(),
                status: parts.status.as_u16(),
                body,
            });
        }
        Ok::<_, CallError>(HttpReply {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(CallError::Timeout {
            url: url.to_string(),
        }),
    }
}

/// POST `body` to `url`.
pub async fn post(
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
    timeout: Duration,
) -> Result<HttpReply, CallError> {
    request(Method::POST, url, headers, body, timeout).await
}

/// POST with a fixed attempt budget and no backoff. The first success
/// ends the loop; the last error is returned once the budget is spent.
pub async fn post_with_attempts(
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
    attempts: u32,
    timeout: Duration,
) -> Result<HttpReply, CallError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match post(url, headers, body.clone(), timeout).await {
            Ok(reply) => {
                debug!(%url, attempt, "call delivered");
                return Ok(reply);
            }
            Err(e) if attempt < attempts => {
                warn!(%url, attempt, attempts, error = %e, "call failed, retrying");
                attempt += 1;
            }
            Err(e) => {
                warn!(%url, attempts, error = %e, "call failed, budget exhausted");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::Router;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::routing::post as post_route;

    use super::*;
    use crate::headers::{self, FLOW_ID};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn post_delivers_headers_and_body() {
        let router = Router::new().route(
            "/echo",
            post_route(|headers: AxumHeaders, body: Bytes| async move {
                let flow = headers
                    .get(FLOW_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                format!("{flow}:{}", String::from_utf8_lossy(&body))
            }),
        );
        let base = serve(router).await;

        let mut out = HeaderMap::new();
        headers::set(&mut out, FLOW_ID, "inst-1");
        let reply = post(
            &format!("{base}/echo"),
            &out,
            Bytes::from_static(b"hello"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(&reply.body[..], b"inst-1:hello");
    }

    #[tokio::test]
    async fn non_2xx_is_a_task_error() {
        let router = Router::new().route(
            "/fail",
            post_route(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = serve(router).await;
        let err = post(
            &format!("{base}/fail"),
            &HeaderMap::new(),
            Bytes::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CallError::Status { status: 500, .. }));
        assert_eq!(err.code(), ErrorCode::Task);
    }

    #[tokio::test]
    async fn unreachable_is_a_connection_error() {
        // Bind and drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = post(
            &format!("http://{addr}/"),
            &HeaderMap::new(),
            Bytes::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Connection);
        assert_eq!(err.code().as_str(), "CONNECTION_ERROR");
    }

    #[test]
    fn gateway_errors_classify_as_connection() {
        let err = CallError::Status {
            url: "http://x/".into(),
            status: 503,
            body: Bytes::new(),
        };
        assert_eq!(err.code(), ErrorCode::Connection);
    }

    #[tokio::test]
    async fn attempts_stop_at_first_success() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/flaky",
            post_route(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let base = serve(router).await;

        post_with_attempts(
            &format!("{base}/flaky"),
            &HeaderMap::new(),
            Bytes::new(),
            5,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn attempts_exhaust_budget() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/down",
            post_route(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let base = serve(router).await;

        let err = post_with_attempts(
            &format!("{base}/down"),
            &HeaderMap::new(),
            Bytes::new(),
            3,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CallError::Status { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rejects_non_http_urls() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt
            .block_on(post(
                "https://example.com/",
                &HeaderMap::new(),
                Bytes::new(),
                Duration::from_secs(1),
            ))
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidUrl(_)));
    }
}
