//! The HTTP front door.
//!
//! One handler serves every hostname: the reserved control host goes to the
//! JSON API and dashboard, static and port apps are served directly, and
//! managed apps are started on demand. The "response or wait" decision is a
//! single pre-proxy fork: `ensure` the process, look at its state, then
//! either delegate to the reverse proxy or write the interstitial.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::apps::{AppKind, AppStore, Service};
use crate::broadcast::Broadcaster;
use crate::config::{self, Config};
use crate::logring::LogRing;
use crate::ollama::OllamaClient;
use crate::pages;
use crate::process::{ProcessManager, ProcessState};
use crate::proxy::{self, ProxyBody, ReverseProxy, SharedClient};

/// Everything the request handlers share.
pub struct ServerState {
    pub config: Config,
    pub store: AppStore,
    pub manager: Arc<ProcessManager>,
    pub broadcaster: Broadcaster,
    /// Request/event log behind `/api/server-logs`.
    pub server_log: LogRing,
    pub ollama: Option<OllamaClient>,
    pub client: SharedClient,
}

impl ServerState {
    /// Load the app store and assemble shared state. Fails only on a fatal
    /// configuration problem (exit code 1 territory).
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let store = AppStore::new(config.dir.clone());
        store.load()?;

        let ollama = config
            .ollama
            .as_ref()
            .filter(|o| o.enabled)
            .map(|o| OllamaClient::new(&o.url, &o.model));
        if let Some(client) = &ollama {
            info!(model = client.model(), "ollama log analysis enabled");
        }

        Ok(Arc::new(Self {
            config,
            store,
            manager: ProcessManager::new(),
            broadcaster: Broadcaster::new(),
            server_log: LogRing::default(),
            ollama,
            client: proxy::new_shared_client(),
        }))
    }

    /// Record a request-handling event, timestamped, in the server log ring.
    pub fn log_request(&self, message: &str) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        self.server_log.push_line(format!("[{timestamp}] {message}"));
        info!("{message}");
    }

    /// Public URL for an app or service label.
    pub fn app_url(&self, label: &str) -> String {
        if self.config.http_port == 80 {
            format!("http://{}.{}", label, self.config.tld)
        } else {
            format!("http://{}.{}:{}", label, self.config.tld, self.config.http_port)
        }
    }

    /// Push a fresh status snapshot to SSE clients.
    pub fn broadcast_status(&self) {
        self.broadcaster.publish(&crate::api::status_payload(self));
    }

    /// Reload the app store after a config change; called by the watcher.
    pub fn reload_apps(&self) {
        match self.store.reload() {
            Ok(true) => {
                self.log_request("Config reloaded");
                self.broadcast_status();
            }
            Ok(false) => debug!("config unchanged, keeping current routing"),
            Err(e) => self.log_request(&format!("Config reload error: {e:#}")),
        }
    }
}

/// The listening server. Binding is separate from running so the caller can
/// map a bind failure to its dedicated exit code.
pub struct Server {
    state: Arc<ServerState>,
    listener: TcpListener,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    pub async fn bind(
        state: Arc<ServerState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let addr: SocketAddr = ([127, 0, 0, 1], state.config.http_port).into();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, tld = %state.config.tld, "roost-dev listening");
        Ok(Self {
            state,
            listener,
            shutdown_rx,
        })
    }

    /// The bound address; useful when the configured port is 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        // Status snapshots for dashboard clients; skipped while nobody is
        // connected.
        let snapshot_state = Arc::clone(&self.state);
        let mut snapshot_shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if snapshot_state.broadcaster.client_count() > 0 {
                            snapshot_state.broadcast_status();
                        }
                    }
                    _ = snapshot_shutdown.changed() => {
                        if *snapshot_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { Ok::<_, hyper::Error>(dispatch(state, req).await) }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection_with_upgrades(io, service)
                                    .await
                                {
                                    debug!(%addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "failed to accept connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("front door shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Route one request by hostname.
pub async fn dispatch(state: Arc<ServerState>, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(host) = extract_hostname(&req) else {
        return text_response(StatusCode::BAD_REQUEST, "missing or invalid Host header");
    };

    if host == state.config.control_host() {
        return crate::api::handle(state, req).await;
    }

    // Capture the routing snapshot once; a concurrent reload swaps the
    // pointer without touching this request.
    let snapshot = state.store.snapshot();
    let Some((app, service)) = snapshot.by_host(&host, &state.config.tld) else {
        state.log_request(&format!("{} {}{} -> 404", req.method(), host, req.uri().path()));
        return html_response(
            StatusCode::NOT_FOUND,
            pages::unknown_host(&host, &snapshot.known_hosts(&state.config.tld)),
        );
    };

    state.log_request(&format!("{} {}{}", req.method(), host, req.uri().path()));

    match &app.kind {
        AppKind::Port(port) => ReverseProxy::new(*port, state.client.clone()).handle(req).await,
        AppKind::Static(dir) => serve_static(dir, req.uri().path()).await,
        AppKind::Command { cmd, root, env } => {
            serve_managed(&state, &app.process_key(None), cmd, root, env, &app.theme, req).await
        }
        AppKind::Services(_) => {
            let svc: Service = service.expect("by_host always selects a service");
            let key = app.process_key(Some(&svc));
            serve_managed(&state, &key, &svc.cmd, &svc.dir, &svc.env, &app.theme, req).await
        }
    }
}

/// The pre-proxy fork: ensure the process, then proxy or wait.
async fn serve_managed(
    state: &Arc<ServerState>,
    key: &str,
    cmd: &str,
    dir: &Path,
    env: &HashMap<String, String>,
    app_theme: &Option<String>,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let proc = state.manager.ensure(key, cmd, dir, env);

    match proc.state() {
        ProcessState::Running => {
            ReverseProxy::new(proc.port, state.client.clone())
                .handle(req)
                .await
        }
        ProcessState::Starting => {
            state.broadcast_status();
            interstitial_response(state, key, app_theme, false, "")
        }
        ProcessState::Failed | ProcessState::Stopped => {
            state.broadcast_status();
            let error = proc.error().unwrap_or_default();
            interstitial_response(state, key, app_theme, true, &error)
        }
    }
}

fn interstitial_response(
    state: &ServerState,
    key: &str,
    app_theme: &Option<String>,
    failed: bool,
    error: &str,
) -> Response<ProxyBody> {
    let theme = app_theme
        .clone()
        .unwrap_or_else(|| config::read_theme(&state.config.dir));
    let status = if failed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = pages::interstitial(key, &state.config.tld, &theme, failed, error);
    html_response(status, body)
}

/// Host header without the port, validated and lowercased.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    const MAX_HOSTNAME_LEN: usize = 253;

    let host = req.headers().get(header::HOST)?.to_str().ok()?;
    let host = host.split(':').next()?;
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

/// True iff `child` is strictly below `parent` in the directory tree.
pub fn is_subdir(child: &Path, parent: &Path) -> bool {
    let child = child.as_os_str().as_encoded_bytes();
    let parent = parent.as_os_str().as_encoded_bytes();
    if child.len() <= parent.len() || !child.starts_with(parent) {
        return false;
    }
    child[parent.len()] == b'/' || parent.ends_with(b"/")
}

/// Serve a file from a static app's directory.
async fn serve_static(dir: &Path, request_path: &str) -> Response<ProxyBody> {
    let relative = request_path.trim_start_matches('/');
    let mut target = dir.join(relative);

    // Canonicalize to neutralize `..` components before the subdir check.
    let Ok(root) = dir.canonicalize() else {
        return text_response(StatusCode::NOT_FOUND, "static directory missing");
    };
    target = match target.canonicalize() {
        Ok(resolved) => resolved,
        Err(_) => return text_response(StatusCode::NOT_FOUND, "not found"),
    };
    if target != root && !is_subdir(&target, &root) {
        return text_response(StatusCode::NOT_FOUND, "not found");
    }

    if target.is_dir() {
        let index = target.join("index.html");
        if index.is_file() {
            target = index;
        } else {
            return directory_listing(&target, request_path).await;
        }
    }

    match tokio::fs::read(&target).await {
        Ok(contents) => {
            let mime = mime_guess::from_path(&target).first_or_octet_stream();
            Response::builder()
                .status(StatusCode::OK)
                .header(
                    header::CONTENT_TYPE,
                    HeaderValue::from_str(mime.as_ref())
                        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
                )
                .body(
                    Full::new(Bytes::from(contents))
                        .map_err(|never| match never {})
                        .boxed(),
                )
                .expect("valid response builder")
        }
        Err(_) => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn directory_listing(dir: &Path, request_path: &str) -> Response<ProxyBody> {
    let mut names: Vec<String> = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() {
                name.push('/');
            }
            names.push(name);
        }
    }
    names.sort();

    let base = if request_path.ends_with('/') {
        request_path.to_string()
    } else {
        format!("{request_path}/")
    };
    let items: String = names
        .iter()
        .map(|n| format!("<li><a href=\"{base}{n}\">{n}</a></li>\n"))
        .collect();
    let body = format!(
        "<!DOCTYPE html>\n<html><head><title>Index of {request_path}</title></head>\n\
         <body><h1>Index of {request_path}</h1><ul>\n{items}</ul></body></html>\n"
    );
    html_response(StatusCode::OK, body)
}

fn html_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-store")
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdir_requires_separator_boundary() {
        assert!(is_subdir(Path::new("/a/b/c"), Path::new("/a/b")));
        assert!(is_subdir(Path::new("/a/b/c/d"), Path::new("/a/b")));
        assert!(!is_subdir(Path::new("/a/b"), Path::new("/a/b")));
        // Prefix without a separator boundary is not a subdir.
        assert!(!is_subdir(Path::new("/a/bc"), Path::new("/a/b")));
        assert!(!is_subdir(Path::new("/a"), Path::new("/a/b")));
        assert!(is_subdir(Path::new("/a/b/c"), Path::new("/a/b/")));
    }

    #[test]
    fn hostname_extraction_strips_port_and_validates() {
        let req = |host: &str| {
            Request::builder()
                .uri("/")
                .header("host", host)
                .body(())
                .unwrap()
        };

        assert_eq!(
            extract_hostname(&req("MyApp.Test:8080")).as_deref(),
            Some("myapp.test")
        );
        assert_eq!(extract_hostname(&req("app.test")).as_deref(), Some("app.test"));
        assert!(extract_hostname(&req("bad host")).is_none());
        assert!(extract_hostname(&Request::builder().uri("/").body(()).unwrap()).is_none());
    }

    #[tokio::test]
    async fn static_serving_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "fine").unwrap();

        let resp = serve_static(dir.path(), "/ok.txt").await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = serve_static(dir.path(), "/../../../etc/passwd").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn static_serving_uses_index_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        // No index.html: directory listing.
        let resp = serve_static(dir.path(), "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("a.txt"));

        // With index.html it wins.
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        let resp = serve_static(dir.path(), "/").await;
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("home"));
    }

    #[tokio::test]
    async fn static_serving_sets_content_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("style.css"), "body{}").unwrap();

        let resp = serve_static(dir.path(), "/style.css").await;
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/css"
        );
    }
}
