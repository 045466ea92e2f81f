//! JSON control API served on the reserved control host.
//!
//! All endpoints are GET (the dashboard theme also accepts POST) and are
//! consumed by the interstitial page, the dashboard, and the CLI:
//!
//! - `/api/status` — status of every configured app
//! - `/api/app-status?name=X` — lifecycle state of one process
//! - `/api/logs?name=X` — captured output, most recent 500 lines
//! - `/api/server-logs` — the request/event log ring
//! - `/api/restart?name=X` — stop + fresh start
//! - `/api/analyze-logs?name=X` — LLM error-line hints, if configured
//! - `/api/events` — SSE stream of status snapshots
//! - `/api/open-terminal?name=X` — best-effort agent launch in the app dir
//! - `/api/theme` — read or persist the dashboard theme

use std::collections::HashMap;
use std::sync::Arc;

use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::apps::{App, AppKind, Service};
use crate::config;
use crate::process::ProcessState;
use crate::proxy::ProxyBody;
use crate::server::ServerState;

/// One entry of `/api/status`.
#[derive(Serialize)]
pub struct AppStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub app_type: &'static str,
    pub url: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceStatus>,
}

#[derive(Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    pub url: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

/// Route one control-host request.
pub async fn handle(state: Arc<ServerState>, req: Request<Incoming>) -> Response<ProxyBody> {
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query().unwrap_or(""));

    match (req.method().clone(), path.as_str()) {
        (Method::GET, "/") => html(crate::pages::dashboard(
            &state.config.tld,
            &config::read_theme(&state.config.dir),
        )),
        (Method::GET, "/api/status") => json(StatusCode::OK, &status_payload(&state)),
        (Method::GET, "/api/app-status") => app_status(&state, &query),
        (Method::GET, "/api/logs") => app_logs(&state, &query),
        (Method::GET, "/api/server-logs") => {
            json(StatusCode::OK, &state.server_log.snapshot())
        }
        (Method::GET, "/api/restart") => restart(&state, &query).await,
        (Method::GET, "/api/analyze-logs") => analyze_logs(&state, &query).await,
        (Method::GET, "/api/events") => events(&state),
        (Method::GET, "/api/open-terminal") => open_terminal(&state, &query),
        (Method::GET, "/api/theme") => json(
            StatusCode::OK,
            &serde_json::json!({ "theme": config::read_theme(&state.config.dir) }),
        ),
        (Method::POST, "/api/theme") => set_theme(&state, req).await,
        _ => error_json(StatusCode::NOT_FOUND, "unknown endpoint"),
    }
}

/// Build the status snapshot consumed by `/api/status` and the SSE stream.
pub fn status_payload(state: &ServerState) -> serde_json::Value {
    let snapshot = state.store.snapshot();
    let mut statuses = Vec::new();

    for app in snapshot.all() {
        let url = state.app_url(&app.name);
        match &app.kind {
            AppKind::Command { .. } => {
                let proc = state.manager.get(&app.name);
                let running = proc
                    .as_ref()
                    .is_some_and(|p| p.state() == ProcessState::Running);
                statuses.push(AppStatus {
                    name: app.name.clone(),
                    app_type: app.type_name(),
                    url,
                    aliases: app.aliases.clone(),
                    description: app.description.clone(),
                    running,
                    port: proc.as_ref().filter(|_| running).map(|p| p.port),
                    uptime: proc
                        .as_ref()
                        .filter(|_| running)
                        .map(|p| format_uptime(p.uptime())),
                    services: Vec::new(),
                });
            }
            AppKind::Port(port) => statuses.push(AppStatus {
                name: app.name.clone(),
                app_type: app.type_name(),
                url,
                aliases: app.aliases.clone(),
                description: app.description.clone(),
                running: true,
                port: Some(*port),
                uptime: None,
                services: Vec::new(),
            }),
            AppKind::Static(_) => statuses.push(AppStatus {
                name: app.name.clone(),
                app_type: app.type_name(),
                url,
                aliases: app.aliases.clone(),
                description: app.description.clone(),
                running: true,
                port: None,
                uptime: None,
                services: Vec::new(),
            }),
            AppKind::Services(services) => {
                let svc_statuses: Vec<ServiceStatus> = services
                    .iter()
                    .map(|svc| {
                        let key = app.process_key(Some(svc));
                        let proc = state.manager.get(&key);
                        let running = proc
                            .as_ref()
                            .is_some_and(|p| p.state() == ProcessState::Running);
                        ServiceStatus {
                            name: svc.name.clone(),
                            running,
                            port: proc.as_ref().filter(|_| running).map(|p| p.port),
                            uptime: proc
                                .as_ref()
                                .filter(|_| running)
                                .map(|p| format_uptime(p.uptime())),
                            url: state.app_url(&format!("{}.{}", svc.name, app.name)),
                            default: svc.default,
                        }
                    })
                    .collect();
                let any_running = svc_statuses.iter().any(|s| s.running);
                statuses.push(AppStatus {
                    name: app.name.clone(),
                    app_type: app.type_name(),
                    url,
                    aliases: app.aliases.clone(),
                    description: app.description.clone(),
                    running: any_running,
                    port: None,
                    uptime: None,
                    services: svc_statuses,
                });
            }
        }
    }

    serde_json::to_value(statuses).unwrap_or_else(|_| serde_json::json!([]))
}

fn app_status(state: &ServerState, query: &HashMap<String, String>) -> Response<ProxyBody> {
    let Some(name) = query.get("name") else {
        return error_json(StatusCode::BAD_REQUEST, "missing name parameter");
    };
    let Some((key, _)) = resolve_managed(state, name) else {
        return error_json(StatusCode::NOT_FOUND, &format!("unknown app: {name}"));
    };

    match state.manager.get(&key) {
        None => json(StatusCode::OK, &serde_json::json!({ "status": "idle" })),
        Some(proc) => {
            let mut body = serde_json::json!({ "status": proc.state().as_str() });
            if proc.state() == ProcessState::Running {
                body["port"] = serde_json::json!(proc.port);
            }
            if let Some(error) = proc.error() {
                body["error"] = serde_json::json!(error);
            }
            json(StatusCode::OK, &body)
        }
    }
}

fn app_logs(state: &ServerState, query: &HashMap<String, String>) -> Response<ProxyBody> {
    let Some(name) = query.get("name") else {
        return error_json(StatusCode::BAD_REQUEST, "missing name parameter");
    };
    let Some((key, _)) = resolve_managed(state, name) else {
        return error_json(StatusCode::NOT_FOUND, &format!("unknown app: {name}"));
    };

    let lines = state
        .manager
        .get(&key)
        .map(|p| p.log.snapshot())
        .unwrap_or_default();
    json(StatusCode::OK, &lines)
}

async fn restart(state: &Arc<ServerState>, query: &HashMap<String, String>) -> Response<ProxyBody> {
    let Some(name) = query.get("name") else {
        return error_json(StatusCode::BAD_REQUEST, "missing name parameter");
    };
    let Some((key, target)) = resolve_managed(state, name) else {
        return error_json(StatusCode::NOT_FOUND, &format!("unknown app: {name}"));
    };
    let Some((cmd, dir, env)) = target.command() else {
        return error_json(
            StatusCode::BAD_REQUEST,
            &format!("app is not a managed process: {name}"),
        );
    };

    state.log_request(&format!("Restarting {key}"));
    state.manager.stop(&key).await;
    let proc = state.manager.ensure(&key, &cmd, &dir, &env);
    state.broadcast_status();

    json(
        StatusCode::OK,
        &serde_json::json!({ "status": proc.state().as_str() }),
    )
}

async fn analyze_logs(
    state: &ServerState,
    query: &HashMap<String, String>,
) -> Response<ProxyBody> {
    let Some(ollama) = &state.ollama else {
        return json(StatusCode::OK, &serde_json::json!({ "enabled": false }));
    };
    let Some(name) = query.get("name") else {
        return error_json(StatusCode::BAD_REQUEST, "missing name parameter");
    };
    let Some((key, _)) = resolve_managed(state, name) else {
        return error_json(StatusCode::NOT_FOUND, &format!("unknown app: {name}"));
    };

    let lines = state
        .manager
        .get(&key)
        .map(|p| p.log.snapshot())
        .unwrap_or_default();

    match ollama.analyze_logs(&lines).await {
        Ok(error_lines) => json(
            StatusCode::OK,
            &serde_json::json!({ "enabled": true, "errorLines": error_lines }),
        ),
        Err(e) => {
            debug!(error = %e, "log analysis unavailable");
            json(StatusCode::OK, &serde_json::json!({ "enabled": false }))
        }
    }
}

fn events(state: &ServerState) -> Response<ProxyBody> {
    let stream = state
        .broadcaster
        .subscribe()
        .map(|bytes| Ok::<_, hyper::Error>(Frame::data(bytes)));

    // Prime the new client so the dashboard does not wait for the next tick.
    state.broadcast_status();

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(StreamBody::new(stream).boxed())
        .expect("valid response builder")
}

fn open_terminal(state: &ServerState, query: &HashMap<String, String>) -> Response<ProxyBody> {
    let Some(name) = query.get("name") else {
        return error_json(StatusCode::BAD_REQUEST, "missing name parameter");
    };
    let snapshot = state.store.snapshot();
    let Some(app) = snapshot.by_name(name.split('/').next().unwrap_or(name)) else {
        return error_json(StatusCode::NOT_FOUND, &format!("unknown app: {name}"));
    };
    let Some(dir) = app.working_dir() else {
        return error_json(StatusCode::BAD_REQUEST, "app has no directory");
    };

    let command = state.config.claude_command().to_string();
    let spawned = std::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();

    match spawned {
        Ok(_) => {
            state.log_request(&format!("Opened {command} in {}", dir.display()));
            json(StatusCode::OK, &serde_json::json!({ "ok": true }))
        }
        Err(e) => {
            warn!(error = %e, "failed to open terminal command");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

async fn set_theme(state: &ServerState, req: Request<Incoming>) -> Response<ProxyBody> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return error_json(StatusCode::BAD_REQUEST, "unreadable body"),
    };

    #[derive(serde::Deserialize)]
    struct ThemeBody {
        theme: String,
    }
    let Ok(parsed) = serde_json::from_slice::<ThemeBody>(&body) else {
        return error_json(StatusCode::BAD_REQUEST, "expected {\"theme\": ...}");
    };

    match config::write_theme(&state.config.dir, &parsed.theme) {
        Ok(()) => json(StatusCode::OK, &serde_json::json!({ "theme": parsed.theme })),
        Err(e) => error_json(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

/// A restart/ensure target: the app (or one service of it).
pub struct ManagedTarget {
    app: Arc<App>,
    service: Option<Service>,
}

impl ManagedTarget {
    /// Command, working dir, and env if this target is a managed process.
    pub fn command(&self) -> Option<(String, std::path::PathBuf, HashMap<String, String>)> {
        match (&self.app.kind, &self.service) {
            (AppKind::Services(_), Some(svc)) => {
                Some((svc.cmd.clone(), svc.dir.clone(), svc.env.clone()))
            }
            (AppKind::Command { cmd, root, env }, None) => {
                Some((cmd.clone(), root.clone(), env.clone()))
            }
            _ => None,
        }
    }
}

/// Resolve a `name` query parameter to a process key.
///
/// Accepts an app name, an alias, or a full process key (`app/service`).
/// A bare multi-service app name resolves to its default service.
fn resolve_managed(state: &ServerState, name: &str) -> Option<(String, ManagedTarget)> {
    let snapshot = state.store.snapshot();

    if let Some((app_label, svc_label)) = name.split_once('/') {
        let app = snapshot.by_name(app_label)?;
        let AppKind::Services(services) = &app.kind else {
            return None;
        };
        let svc = services.iter().find(|s| s.name == svc_label)?.clone();
        let key = app.process_key(Some(&svc));
        return Some((
            key,
            ManagedTarget {
                app,
                service: Some(svc),
            },
        ));
    }

    let app = snapshot.by_name(name)?;
    match &app.kind {
        AppKind::Services(services) => {
            let svc = services.iter().find(|s| s.default)?.clone();
            let key = app.process_key(Some(&svc));
            Some((
                key,
                ManagedTarget {
                    app,
                    service: Some(svc),
                },
            ))
        }
        _ => {
            let key = app.process_key(None);
            Some((
                key,
                ManagedTarget {
                    app,
                    service: None,
                },
            ))
        }
    }
}

/// `1h2m3s`-style uptime for status payloads.
fn format_uptime(d: std::time::Duration) -> String {
    let total = d.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Parse a query string, percent-decoding values (`app%2Fweb` → `app/web`).
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((percent_decode(key), percent_decode(value)))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = |offset: usize| {
                    bytes
                        .get(i + offset)
                        .and_then(|b| (*b as char).to_digit(16))
                };
                if let (Some(hi), Some(lo)) = (hex(1), hex(2)) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Response<ProxyBody> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"null".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("access-control-allow-origin", "*")
        .body(
            Full::new(Bytes::from(payload))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

fn error_json(status: StatusCode, message: &str) -> Response<ProxyBody> {
    json(status, &serde_json::json!({ "error": message }))
}

fn html(body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .header("cache-control", "no-store")
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
    fn formats_uptime() {
        use std::time::Duration;
        assert_eq!(format_uptime(Duration::from_secs(5)), "5s");
        assert_eq!(format_uptime(Duration::from_secs(65)), "1m5s");
        assert_eq!(format_uptime(Duration::from_secs(3723)), "1h2m3s");
    }

    #[test]
    fn parses_query_pairs() {
        let query = parse_query("name=myapp&other=1");
        assert_eq!(query.get("name").unwrap(), "myapp");
        assert_eq!(query.get("other").unwrap(), "1");
    }

    #[test]
    fn percent_decodes_process_keys() {
        let query = parse_query("name=multi%2Fweb");
        assert_eq!(query.get("name").unwrap(), "multi/web");
        assert_eq!(percent_decode("a+b%20c"), "a b c");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }
}
