//! App definitions and hostname routing.
//!
//! Every regular file in the config directory describes one app. Three
//! encodings are accepted:
//!
//! - `<app>.yml` / `<app>.yaml` — structured definition (see [`RawApp`]);
//! - a symlink to a directory — static app serving that directory;
//! - a plain file containing a bare port number — proxy to an existing
//!   backend on `127.0.0.1:<port>` with no supervision.
//!
//! The store keeps an immutable snapshot behind an `Arc`; reload builds a
//! fresh snapshot and swaps the pointer, so requests already dispatched keep
//! the routing they started with.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

/// What an app name resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum AppKind {
    /// Managed process: shell command run in `root` with `PORT` injected.
    Command {
        cmd: String,
        root: PathBuf,
        env: HashMap<String, String>,
    },
    /// Pre-existing backend on `127.0.0.1:<port>`; never supervised.
    Port(u16),
    /// Directory served directly.
    Static(PathBuf),
    /// Multiple managed sub-services, each with its own hostname.
    Services(Vec<Service>),
}

/// A sub-service of a multi-service app, reachable at `<svc>.<app>.<tld>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub name: String,
    pub cmd: String,
    pub dir: PathBuf,
    pub env: HashMap<String, String>,
    /// The default service also answers the bare `<app>.<tld>` host.
    pub default: bool,
}

/// One user-defined addressable unit.
#[derive(Debug, Clone)]
pub struct App {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub theme: Option<String>,
    pub kind: AppKind,
    /// Source file, for error messages and mtime tracking.
    pub source: PathBuf,
    pub mtime: Option<SystemTime>,
}

impl App {
    /// Supervision key for this app or one of its services.
    pub fn process_key(&self, service: Option<&Service>) -> String {
        match service {
            Some(svc) => format!("{}/{}", self.name, svc.name),
            None => self.name.clone(),
        }
    }

    /// The directory most closely associated with the app, for
    /// `/api/open-terminal`.
    pub fn working_dir(&self) -> Option<&Path> {
        match &self.kind {
            AppKind::Command { root, .. } => Some(root),
            AppKind::Static(dir) => Some(dir),
            AppKind::Services(services) => services
                .iter()
                .find(|s| s.default)
                .or_else(|| services.first())
                .map(|s| s.dir.as_path()),
            AppKind::Port(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            AppKind::Command { .. } => "process",
            AppKind::Port(_) => "port",
            AppKind::Static(_) => "static",
            AppKind::Services(_) => "multi-service",
        }
    }
}

/// Immutable routing snapshot: every loaded app plus a label index covering
/// names and aliases.
pub struct AppsSnapshot {
    apps: Vec<Arc<App>>,
    by_label: HashMap<String, Arc<App>>,
}

impl AppsSnapshot {
    fn empty() -> Self {
        Self {
            apps: Vec::new(),
            by_label: HashMap::new(),
        }
    }

    pub fn all(&self) -> &[Arc<App>] {
        &self.apps
    }

    /// Look an app up by name or alias.
    pub fn by_name(&self, name: &str) -> Option<Arc<App>> {
        self.by_label.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Resolve a hostname (port already stripped) against this snapshot.
    ///
    /// `myapp.test` matches an app label; `web.myapp.test` matches the `web`
    /// service of `myapp`. For a multi-service app addressed by its bare
    /// label, the default service is selected; without a default the bare
    /// host does not resolve.
    pub fn by_host(&self, host: &str, tld: &str) -> Option<(Arc<App>, Option<Service>)> {
        let host = host.to_ascii_lowercase();
        let labels = host.strip_suffix(&format!(".{tld}"))?;
        if labels.is_empty() {
            return None;
        }

        match labels.split_once('.') {
            None => {
                let app = self.by_label.get(labels)?.clone();
                match &app.kind {
                    AppKind::Services(services) => {
                        let default = services.iter().find(|s| s.default)?.clone();
                        Some((app, Some(default)))
                    }
                    _ => Some((app, None)),
                }
            }
            Some((svc_label, app_label)) => {
                let app = self.by_label.get(app_label)?.clone();
                let AppKind::Services(services) = &app.kind else {
                    return None;
                };
                let svc = services.iter().find(|s| s.name == svc_label)?.clone();
                Some((app, Some(svc)))
            }
        }
    }

    /// All hostnames this snapshot can answer, for 404 pages.
    pub fn known_hosts(&self, tld: &str) -> Vec<String> {
        let mut hosts = Vec::new();
        for app in &self.apps {
            if let AppKind::Services(services) = &app.kind {
                for svc in services {
                    hosts.push(format!("{}.{}.{}", svc.name, app.name, tld));
                }
                if services.iter().any(|s| s.default) {
                    hosts.push(format!("{}.{}", app.name, tld));
                }
            } else {
                hosts.push(format!("{}.{}", app.name, tld));
            }
        }
        hosts.sort();
        hosts
    }
}

/// Loads app definitions from the config directory and serves routing
/// snapshots to the dispatcher.
pub struct AppStore {
    dir: PathBuf,
    current: RwLock<Arc<AppsSnapshot>>,
}

impl AppStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: RwLock::new(Arc::new(AppsSnapshot::empty())),
        }
    }

    /// Initial load. Unlike [`reload`](Self::reload), errors here are fatal.
    pub fn load(&self) -> anyhow::Result<()> {
        let snapshot = load_dir(&self.dir)?;
        *self.current.write() = Arc::new(snapshot);
        Ok(())
    }

    /// Rebuild the snapshot from disk and swap it in atomically.
    ///
    /// On any error (unreadable file, parse failure, name collision) the
    /// previous snapshot stays live and the error is returned for logging.
    pub fn reload(&self) -> anyhow::Result<bool> {
        let snapshot = load_dir(&self.dir)?;
        let mut current = self.current.write();
        let changed = !same_sources(&current, &snapshot);
        *current = Arc::new(snapshot);
        Ok(changed)
    }

    /// The live snapshot. Handlers capture this once per request so a
    /// concurrent reload never re-routes them mid-flight.
    pub fn snapshot(&self) -> Arc<AppsSnapshot> {
        self.current.read().clone()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Compare snapshots by source path + mtime to detect no-op reloads.
fn same_sources(a: &AppsSnapshot, b: &AppsSnapshot) -> bool {
    if a.apps.len() != b.apps.len() {
        return false;
    }
    a.apps
        .iter()
        .zip(b.apps.iter())
        .all(|(x, y)| x.source == y.source && x.mtime == y.mtime && x.name == y.name)
}

/// Lowercase a name and replace spaces with dashes.
pub fn slugify(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace(' ', "-")
}

#[derive(Debug, Deserialize)]
struct RawApp {
    name: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    description: Option<String>,
    theme: Option<String>,
    cmd: Option<String>,
    root: Option<String>,
    port: Option<u16>,
    file_path: Option<String>,
    services: Option<BTreeMap<String, RawService>>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    cmd: String,
    dir: String,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    default: bool,
}

fn load_dir(dir: &Path) -> anyhow::Result<AppsSnapshot> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading config directory {}", dir.display()))?;

    let mut apps: Vec<Arc<App>> = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.starts_with('.')
            || file_name == "config.json"
            || file_name == "config-theme.json"
            || file_name == "certs"
        {
            continue;
        }

        let path = entry.path();
        match load_entry(&path, &file_name) {
            Ok(Some(app)) => apps.push(Arc::new(app)),
            Ok(None) => debug!(file = %path.display(), "skipping unrecognized config entry"),
            Err(e) => return Err(e).with_context(|| format!("loading {}", path.display())),
        }
    }

    apps.sort_by(|a, b| a.name.cmp(&b.name));
    build_snapshot(apps)
}

fn load_entry(path: &Path, file_name: &str) -> anyhow::Result<Option<App>> {
    let meta = std::fs::symlink_metadata(path)?;
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();

    // Symlink to a directory: static app named after the link. Broken or
    // non-directory symlinks are skipped so one stray link cannot poison a
    // reload.
    if meta.file_type().is_symlink() {
        let Ok(target) = std::fs::canonicalize(path) else {
            return Ok(None);
        };
        if !target.is_dir() {
            return Ok(None);
        }
        return Ok(Some(App {
            name: slugify(file_name),
            aliases: Vec::new(),
            description: None,
            theme: None,
            kind: AppKind::Static(target),
            source: path.to_path_buf(),
            mtime,
        }));
    }

    if !meta.is_file() {
        return Ok(None);
    }

    let stem = file_name
        .strip_suffix(".yml")
        .or_else(|| file_name.strip_suffix(".yaml"));

    if let Some(stem) = stem {
        let data = std::fs::read_to_string(path)?;
        let raw: RawApp = serde_yaml::from_str(&data)?;
        return Ok(Some(app_from_raw(raw, stem, path, mtime)?));
    }

    // Plain file containing just a port number: port-only app. Anything
    // else (binary files, strays) is skipped.
    let Ok(data) = std::fs::read_to_string(path) else {
        return Ok(None);
    };
    if let Ok(port) = data.trim().parse::<u16>() {
        if port > 0 {
            return Ok(Some(App {
                name: slugify(file_name),
                aliases: Vec::new(),
                description: None,
                theme: None,
                kind: AppKind::Port(port),
                source: path.to_path_buf(),
                mtime,
            }));
        }
    }

    Ok(None)
}

fn app_from_raw(
    raw: RawApp,
    stem: &str,
    path: &Path,
    mtime: Option<SystemTime>,
) -> anyhow::Result<App> {
    let name = slugify(raw.name.as_deref().unwrap_or(stem));
    if name.is_empty() {
        anyhow::bail!("app name is empty");
    }

    let mut variants = 0;
    if raw.cmd.is_some() {
        variants += 1;
    }
    if raw.port.is_some() {
        variants += 1;
    }
    if raw.file_path.is_some() {
        variants += 1;
    }
    if raw.services.is_some() {
        variants += 1;
    }
    if variants != 1 {
        anyhow::bail!("app {name}: exactly one of cmd, port, file_path, services must be set");
    }

    let kind = if let Some(cmd) = raw.cmd {
        let root = raw
            .root
            .ok_or_else(|| anyhow::anyhow!("app {name}: cmd requires root"))?;
        AppKind::Command {
            cmd,
            root: expand_home(&root),
            env: raw.env,
        }
    } else if let Some(port) = raw.port {
        if port == 0 {
            anyhow::bail!("app {name}: port must be greater than 0");
        }
        AppKind::Port(port)
    } else if let Some(file_path) = raw.file_path {
        AppKind::Static(expand_home(&file_path))
    } else {
        let raw_services = raw.services.expect("services variant checked above");
        if raw_services.is_empty() {
            anyhow::bail!("app {name}: services map is empty");
        }
        let mut services = Vec::new();
        let mut defaults = 0;
        for (svc_name, svc) in raw_services {
            if svc.default {
                defaults += 1;
            }
            services.push(Service {
                name: slugify(&svc_name),
                cmd: svc.cmd,
                dir: expand_home(&svc.dir),
                env: svc.env,
                default: svc.default,
            });
        }
        if defaults > 1 {
            anyhow::bail!("app {name}: at most one service may be marked default");
        }
        AppKind::Services(services)
    };

    Ok(App {
        name,
        aliases: raw.aliases.iter().map(|a| slugify(a)).collect(),
        description: raw.description,
        theme: raw.theme,
        kind,
        source: path.to_path_buf(),
        mtime,
    })
}

fn build_snapshot(apps: Vec<Arc<App>>) -> anyhow::Result<AppsSnapshot> {
    let mut by_label: HashMap<String, Arc<App>> = HashMap::new();
    let mut seen: HashSet<String> = HashSet::new();

    for app in &apps {
        for label in std::iter::once(&app.name).chain(app.aliases.iter()) {
            if !seen.insert(label.clone()) {
                anyhow::bail!(
                    "name collision: {label:?} is used by more than one app (see {})",
                    app.source.display()
                );
            }
            by_label.insert(label.clone(), Arc::clone(app));
        }
    }

    if apps.is_empty() {
        warn!("no apps configured");
    }

    Ok(AppsSnapshot { apps, by_label })
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
