//! Per-backend reverse proxying.
//!
//! Plain HTTP requests are forwarded through a pooled hyper client.
//! WebSocket upgrades bypass the HTTP machinery entirely: the original
//! request line and headers are written verbatim to a fresh TCP connection
//! and, once the backend answers 101, the two sockets are spliced
//! byte-for-byte until either side hangs up.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pages;

/// Header names added on the way to the backend.
const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Hop-by-hop headers stripped in both directions (RFC 7230 §6.1).
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Pooled HTTP client shared by every backend proxy.
pub type SharedClient = Client<HttpConnector, Incoming>;

pub fn new_shared_client() -> SharedClient {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector.enforce_http(true);
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(10)
        .build(connector)
}

/// Forwarder for one backend on `127.0.0.1:<port>`.
///
/// Cheap to construct per request: the inner client is a clone sharing one
/// connection pool.
pub struct ReverseProxy {
    port: u16,
    client: SharedClient,
}

impl ReverseProxy {
    pub fn new(port: u16, client: SharedClient) -> Self {
        Self { port, client }
    }

    /// Handle one request for this backend.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if is_websocket_upgrade(req.headers()) {
            self.relay_websocket(req).await
        } else {
            self.forward(req).await
        }
    }

    /// Normal path: forward through the pooled client.
    async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://127.0.0.1:{}{}", self.port, path_and_query);

        let original_host = req
            .headers()
            .get(header::HOST)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(""));
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(X_FORWARDED_HOST, original_host);
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            parts.headers.insert(X_REQUEST_ID, value);
        }

        let backend_req = match Request::builder()
            .method(parts.method)
            .uri(&uri)
            .body(body)
            .map(|mut r| {
                *r.headers_mut() = parts.headers;
                r
            }) {
            Ok(r) => r,
            Err(e) => {
                error!(port = self.port, error = %e, "failed to build backend request");
                return connecting_response();
            }
        };

        match self.client.request(backend_req).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                bust_html_cache(&mut parts.headers);
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                debug!(port = self.port, error = %e, "backend unreachable");
                connecting_response()
            }
        }
    }

    /// WebSocket path: raw TCP relay.
    ///
    /// The stock forwarder cannot carry an upgraded connection, so the
    /// original request line and headers are replayed verbatim on a second
    /// socket; after the backend's 101 both directions are pumped until EOF.
    async fn relay_websocket(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let addr = format!("127.0.0.1:{}", self.port);
        let mut backend = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(port = self.port, error = %e, "websocket backend unreachable");
                return connecting_response();
            }
        };

        let raw_request = raw_upgrade_request(&req);
        if let Err(e) = backend.write_all(&raw_request).await {
            warn!(port = self.port, error = %e, "failed to send upgrade request");
            return connecting_response();
        }

        // Read the backend's response head; anything past the blank line is
        // payload that must reach the client before the splice starts.
        let (head, leftover) = match read_response_head(&mut backend).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(port = self.port, error = %e, "failed to read upgrade response");
                return connecting_response();
            }
        };

        if head.status != StatusCode::SWITCHING_PROTOCOLS {
            debug!(port = self.port, status = %head.status, "backend declined upgrade");
            let mut builder = Response::builder().status(head.status);
            for (name, value) in &head.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            return builder
                .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
                .unwrap_or_else(|_| connecting_response());
        }

        let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &head.headers {
            // hyper writes the framing itself.
            let lower = name.to_ascii_lowercase();
            if lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap_or_else(|_| connecting_response());

        let port = self.port;
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client_io = TokioIo::new(upgraded);
                    if !leftover.is_empty() {
                        if client_io.write_all(&leftover).await.is_err() {
                            return;
                        }
                    }
                    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
                        Ok((up, down)) => {
                            info!(port, bytes_up = up, bytes_down = down, "websocket closed");
                        }
                        Err(e) => debug!(port, error = %e, "websocket closed with error"),
                    }
                }
                Err(e) => warn!(port, error = %e, "client upgrade failed"),
            }
        });

        response
    }
}

/// True iff `Upgrade: websocket` (case-insensitive) and `Connection`
/// contains an `upgrade` token. Other upgrades (h2c etc.) take the normal
/// proxy path.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade_is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    let connection_has_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });

    upgrade_is_websocket && connection_has_upgrade
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect();

    for name in connection_named {
        if !name.is_empty() {
            headers.remove(name.as_str());
        }
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Browsers cache dev HTML aggressively; force revalidation on every HTML
/// response and leave everything else alone.
pub fn bust_html_cache(headers: &mut HeaderMap) {
    let is_html = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/html"));
    if !is_html {
        return;
    }

    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.remove(header::ETAG);
    headers.remove(header::LAST_MODIFIED);
}

/// 502 with the literal text the interstitial script watches for.
pub fn connecting_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-store")
        .body(
            Full::new(Bytes::from(pages::connecting_page()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Serialize the original request line and headers for replay on a raw
/// socket.
fn raw_upgrade_request(req: &Request<Incoming>) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method(), path);
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            out.push_str(&format!("{name}: {v}\r\n"));
        }
    }
    out.push_str("\r\n");
    out.into_bytes()
}

struct ResponseHead {
    status: StatusCode,
    headers: Vec<(String, String)>,
}

/// Read from the backend until the end of the response head. Returns the
/// parsed head and any payload bytes that arrived with it.
async fn read_response_head(stream: &mut TcpStream) -> anyhow::Result<(ResponseHead, Vec<u8>)> {
    const MAX_HEAD: usize = 16 * 1024;
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let split = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("backend closed before completing upgrade response");
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD {
            anyhow::bail!("upgrade response head too large");
        }
    };

    let head_bytes = &buf[..split];
    let leftover = buf[split..].to_vec();

    let text = std::str::from_utf8(head_bytes)?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty upgrade response"))?;
    let code = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("malformed status line: {status_line}"))?;
    let status = StatusCode::from_u16(code.parse()?)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok((ResponseHead { status, headers }, leftover))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                hyper::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn websocket_detection_truth_table() {
        let cases: &[(&str, &str, bool)] = &[
            ("websocket", "Upgrade", true),
            ("WebSocket", "upgrade", true),
            ("websocket", "keep-alive, Upgrade", true),
            ("", "Upgrade", false),
            ("websocket", "", false),
            ("h2c", "Upgrade", false),
            ("", "", false),
        ];

        for (upgrade, connection, want) in cases {
            let mut pairs = Vec::new();
            if !upgrade.is_empty() {
                pairs.push(("upgrade", *upgrade));
            }
            if !connection.is_empty() {
                pairs.push(("connection", *connection));
            }
            assert_eq!(
                is_websocket_upgrade(&headers(&pairs)),
                *want,
                "upgrade={upgrade:?} connection={connection:?}"
            );
        }
    }

    #[test]
    fn strips_standard_hop_by_hop_headers() {
        let mut map = headers(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("te", "trailers"),
            ("x-custom", "stays"),
        ]);

        strip_hop_by_hop(&mut map);

        assert!(map.get("connection").is_none());
        assert!(map.get("keep-alive").is_none());
        assert!(map.get("transfer-encoding").is_none());
        assert!(map.get("te").is_none());
        assert_eq!(map.get("x-custom").unwrap(), "stays");
    }

    #[test]
    fn strips_connection_named_headers() {
        let mut map = headers(&[
            ("connection", "close, x-per-hop"),
            ("x-per-hop", "secret"),
            ("x-end-to-end", "stays"),
        ]);

        strip_hop_by_hop(&mut map);

        assert!(map.get("x-per-hop").is_none());
        assert_eq!(map.get("x-end-to-end").unwrap(), "stays");
    }

    #[test]
    fn cache_busting_applies_only_to_html() {
        let mut html = headers(&[
            ("content-type", "text/html; charset=utf-8"),
            ("etag", "\"abc\""),
            ("last-modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
        ]);
        bust_html_cache(&mut html);
        assert_eq!(
            html.get("cache-control").unwrap(),
            "no-store, no-cache, must-revalidate"
        );
        assert!(html.get("etag").is_none());
        assert!(html.get("last-modified").is_none());

        let mut json = headers(&[("content-type", "application/json"), ("etag", "\"abc\"")]);
        bust_html_cache(&mut json);
        assert!(json.get("cache-control").is_none());
        assert_eq!(json.get("etag").unwrap(), "\"abc\"");
    }

    #[test]
    fn connecting_page_contains_marker() {
        let resp = connecting_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(pages::connecting_page().contains("Connecting..."));
    }

    #[test]
    fn finds_head_terminator() {
        assert_eq!(
            find_head_end(b"HTTP/1.1 101 X\r\nUpgrade: websocket\r\n\r\nrest"),
            Some(38)
        );
        assert_eq!(find_head_end(b"HTTP/1.1 101 X\r\n"), None);
    }

    #[tokio::test]
    async fn parses_upgrade_response_and_leftover() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nearly-frame",
            )
            .await
            .unwrap();
            // Hold the socket open while the client parses.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let (head, leftover) = read_response_head(&mut stream).await.unwrap();

        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(head
            .headers
            .iter()
            .any(|(n, v)| n.eq_ignore_ascii_case("upgrade") && v == "websocket"));
        assert_eq!(leftover, b"early-frame");

        server_task.await.unwrap();
    }
}
