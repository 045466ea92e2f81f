//! On-demand process supervision.
//!
//! The manager owns every running app process. Each record is created by
//! [`ProcessManager::ensure`], which allocates a loopback port, spawns the
//! app command with `PORT` injected, and hands supervision to a background
//! task that probes for readiness, captures output into the process's
//! [`LogRing`], and tracks the child until it exits.
//!
//! Other components never own a process; they hold the string key and look
//! the record up again when they need fresh state.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::logring::LogRing;

/// Dynamic port range handed out to managed processes.
const PORT_RANGE_START: u16 = 50000;
const PORT_RANGE_END: u16 = 60000;

/// Readiness probing: one TCP dial per tick until the deadline.
const READY_PROBE_INTERVAL: Duration = Duration::from_millis(100);
const READY_DIAL_TIMEOUT: Duration = Duration::from_millis(250);
const READY_DEADLINE: Duration = Duration::from_secs(30);

/// Graceful stop: SIGTERM the process group, then SIGKILL after this grace.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Spawned, waiting for its port to accept a TCP connection.
    Starting,
    /// Port answered; traffic is proxied.
    Running,
    /// Exited before readiness, timed out, or died while running.
    Failed,
    /// Explicitly stopped; terminal.
    Stopped,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Failed => "failed",
            ProcessState::Stopped => "stopped",
        }
    }
}

/// Runtime record for one managed app or service instance.
pub struct Process {
    /// `app` or `app/service`.
    pub key: String,
    /// Loopback port reserved for this record while it is alive.
    pub port: u16,
    /// Captured stdout/stderr, 500 lines.
    pub log: Arc<LogRing>,
    started_at: Instant,
    inner: Mutex<ProcInner>,
    exited_rx: watch::Receiver<bool>,
}

struct ProcInner {
    state: ProcessState,
    pid: Option<u32>,
    error: Option<String>,
}

impl Process {
    pub fn state(&self) -> ProcessState {
        self.inner.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    /// Last failure reason, if the process is in [`ProcessState::Failed`].
    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn set_running(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ProcessState::Starting {
            inner.state = ProcessState::Running;
        }
    }

    /// Transition to Failed unless the process was already stopped.
    fn set_failed(&self, error: String) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            ProcessState::Starting | ProcessState::Running => {
                inner.state = ProcessState::Failed;
                inner.error = Some(error);
                true
            }
            _ => false,
        }
    }

    /// Mark the record stopped ahead of killing the child. Returns the pid if
    /// there is still something to kill.
    fn begin_stop(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        match inner.state {
            ProcessState::Starting | ProcessState::Running => {
                inner.state = ProcessState::Stopped;
                inner.pid
            }
            _ => None,
        }
    }
}

struct PortAllocator {
    next: u16,
    reserved: HashSet<u16>,
}

impl PortAllocator {
    fn new() -> Self {
        // Randomized start reduces collisions between consecutive runs.
        let offset = rand::thread_rng().gen_range(0..PORT_RANGE_END - PORT_RANGE_START);
        Self {
            next: PORT_RANGE_START + offset,
            reserved: HashSet::new(),
        }
    }

    fn advance(&mut self) {
        self.next = if self.next + 1 >= PORT_RANGE_END {
            PORT_RANGE_START
        } else {
            self.next + 1
        };
    }

    /// Find a free port and reserve it.
    ///
    /// A port is handed out only if nothing listens on it on either
    /// `127.0.0.1` or `0.0.0.0`; the bind probes catch listeners left behind
    /// by processes that outlived a previous server run.
    fn find_free_port(&mut self) -> anyhow::Result<u16> {
        let span = (PORT_RANGE_END - PORT_RANGE_START) as usize;
        for _ in 0..span {
            let port = self.next;
            self.advance();
            if self.reserved.contains(&port) {
                continue;
            }
            if !probe_bindable(port) {
                continue;
            }
            self.reserved.insert(port);
            return Ok(port);
        }
        anyhow::bail!("no free port in {PORT_RANGE_START}..{PORT_RANGE_END}")
    }

    fn release(&mut self, port: u16) {
        self.reserved.remove(&port);
    }
}

fn probe_bindable(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
        && std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Owns all managed process records.
///
/// Designed to sit behind an `Arc` shared by the dispatcher, control API,
/// and broadcaster. The allocator lock is only held for reservation and
/// release, never across I/O; per-key coalescing happens on the map shard.
pub struct ProcessManager {
    processes: DashMap<String, Arc<Process>>,
    allocator: Mutex<PortAllocator>,
}

impl ProcessManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processes: DashMap::new(),
            allocator: Mutex::new(PortAllocator::new()),
        })
    }

    /// Return the process for `key`, spawning it if absent.
    ///
    /// Idempotent: a record in Starting or Running is returned as-is, so
    /// concurrent requests for the same app coalesce onto one spawn. A
    /// Failed or Stopped record is replaced by a fresh one.
    pub fn ensure(
        self: &Arc<Self>,
        key: &str,
        cmd: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> Arc<Process> {
        // The entry guard serializes racing ensures for the same key.
        let entry = self.processes.entry(key.to_string());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let existing = Arc::clone(occupied.get());
                match existing.state() {
                    ProcessState::Starting | ProcessState::Running => existing,
                    ProcessState::Failed | ProcessState::Stopped => {
                        let fresh = self.spawn(key, cmd, cwd, env);
                        occupied.insert(Arc::clone(&fresh));
                        fresh
                    }
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let fresh = self.spawn(key, cmd, cwd, env);
                vacant.insert(Arc::clone(&fresh));
                fresh
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Process>> {
        self.processes.get(key).map(|p| Arc::clone(&p))
    }

    /// Snapshot of all records.
    pub fn all(&self) -> Vec<Arc<Process>> {
        self.processes.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Stop the process for `key`: SIGTERM its process group, wait up to the
    /// grace period, SIGKILL if needed, and drop the record. The port is
    /// released by the supervisor once the child is reaped.
    pub async fn stop(&self, key: &str) {
        let Some((_, proc)) = self.processes.remove(key) else {
            return;
        };
        info!(key, port = proc.port, "stopping process");

        let Some(pid) = proc.begin_stop() else {
            // Already terminal; the supervisor has cleaned up or will shortly.
            return;
        };

        kill_group(pid, libc::SIGTERM);

        let mut exited = proc.exited_rx.clone();
        let reaped = tokio::time::timeout(STOP_GRACE, async {
            while !*exited.borrow() {
                if exited.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if !reaped {
            warn!(key, pid, "grace period exceeded, sending SIGKILL");
            kill_group(pid, libc::SIGKILL);
            let mut exited = proc.exited_rx.clone();
            let _ = tokio::time::timeout(Duration::from_secs(2), async {
                while !*exited.borrow() {
                    if exited.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }
    }

    /// Stop every record concurrently. Called on shutdown and never races
    /// `ensure` for correctness: each key's stop completes before the server
    /// accepts more work.
    pub async fn stop_all(self: &Arc<Self>) {
        let keys: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        let mut set = tokio::task::JoinSet::new();
        for key in keys {
            let manager = Arc::clone(self);
            set.spawn(async move {
                manager.stop(&key).await;
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Ports currently reserved by live records. Exposed for diagnostics.
    pub fn reserved_ports(&self) -> HashSet<u16> {
        self.allocator.lock().reserved.clone()
    }

    /// The next port the allocator will try. Useful for tests that need to
    /// occupy it ahead of time.
    pub fn peek_next_port(&self) -> u16 {
        self.allocator.lock().next
    }

    fn release_port(&self, port: u16) {
        self.allocator.lock().release(port);
    }

    /// Allocate a port and spawn the command, returning the new record.
    ///
    /// A spawn failure (missing cwd, unspawnable shell) yields a record
    /// already in Failed with the OS error captured, so the caller can show
    /// it on the interstitial like any other failure.
    fn spawn(
        self: &Arc<Self>,
        key: &str,
        cmd: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> Arc<Process> {
        let log = Arc::new(LogRing::default());
        let (exited_tx, exited_rx) = watch::channel(false);

        let port = match self.allocator.lock().find_free_port() {
            Ok(port) => port,
            Err(e) => {
                let _ = exited_tx.send(true);
                return Arc::new(Process {
                    key: key.to_string(),
                    port: 0,
                    log,
                    started_at: Instant::now(),
                    inner: Mutex::new(ProcInner {
                        state: ProcessState::Failed,
                        pid: None,
                        error: Some(e.to_string()),
                    }),
                    exited_rx,
                });
            }
        };

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(cwd)
            .env("PORT", port.to_string())
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // New process group so SIGTERM/SIGKILL reach grandchildren spawned by
        // dev servers (PGID = child pid).
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.release_port(port);
                let error = format!("failed to spawn: {e}");
                log.push_line(error.clone());
                let _ = exited_tx.send(true);
                return Arc::new(Process {
                    key: key.to_string(),
                    port,
                    log,
                    started_at: Instant::now(),
                    inner: Mutex::new(ProcInner {
                        state: ProcessState::Failed,
                        pid: None,
                        error: Some(error),
                    }),
                    exited_rx,
                });
            }
        };

        let pid = child.id();
        info!(key, port, pid, %cmd, "spawned process");

        let proc = Arc::new(Process {
            key: key.to_string(),
            port,
            log: Arc::clone(&log),
            started_at: Instant::now(),
            inner: Mutex::new(ProcInner {
                state: ProcessState::Starting,
                pid,
                error: None,
            }),
            exited_rx,
        });

        // Pipe readers. Interleaving between the two pipes is not ordered;
        // lines within each pipe are.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_pipe(stdout, Arc::clone(&log)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_pipe(stderr, Arc::clone(&log)));
        }

        let manager = Arc::clone(self);
        tokio::spawn(supervise(manager, Arc::clone(&proc), child, exited_tx));

        proc
    }
}

/// Copy one child pipe into the log ring until EOF.
async fn pump_pipe<R>(mut pipe: R, log: Arc<LogRing>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => log.write(&buf[..n]),
        }
    }
}

/// Drive one child: probe for readiness, watch for exit, release the port
/// once the child is reaped.
async fn supervise(
    manager: Arc<ProcessManager>,
    proc: Arc<Process>,
    mut child: Child,
    exited_tx: watch::Sender<bool>,
) {
    let deadline = Instant::now() + READY_DEADLINE;
    let mut probe = tokio::time::interval(READY_PROBE_INTERVAL);

    loop {
        tokio::select! {
            status = child.wait() => {
                let summary = match status {
                    Ok(status) => exit_error(&proc, status.code()),
                    Err(e) => format!("wait failed: {e}"),
                };
                // Release before the Failed state becomes observable so a
                // racing ensure never sees a terminal record holding a port.
                manager.release_port(proc.port);
                if proc.set_failed(summary) {
                    debug!(key = %proc.key, "process exited unexpectedly");
                }
                let _ = exited_tx.send(true);
                return;
            }
            _ = probe.tick() => {
                if proc.state() != ProcessState::Starting {
                    continue;
                }
                if Instant::now() >= deadline {
                    if let Some(pid) = proc.pid() {
                        kill_group(pid, libc::SIGKILL);
                    }
                    let _ = child.wait().await;
                    manager.release_port(proc.port);
                    proc.set_failed(format!(
                        "did not become ready within {}s",
                        READY_DEADLINE.as_secs()
                    ));
                    let _ = exited_tx.send(true);
                    return;
                }
                if port_answers(proc.port).await {
                    proc.set_running();
                    info!(key = %proc.key, port = proc.port, "process is ready");
                }
            }
        }
    }
}

/// One readiness dial with a short timeout.
async fn port_answers(port: u16) -> bool {
    tokio::time::timeout(READY_DIAL_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
        .await
        .is_ok_and(|r| r.is_ok())
}

/// Failure summary for a child that exited on its own: the tail of its
/// output, or the exit code when it said nothing.
fn exit_error(proc: &Process, code: Option<i32>) -> String {
    let tail = proc.log.tail(5);
    if tail.is_empty() {
        match code {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        }
    } else {
        tail.join("\n")
    }
}

/// Signal an entire process group. `pgid` equals the child pid because the
/// child was spawned with `process_group(0)`.
fn kill_group(pid: u32, signal: i32) {
    let ret = unsafe { libc::kill(-(pid as i32), signal) };
    if ret != 0 {
        // Group may already be gone; try the process directly.
        unsafe { libc::kill(pid as i32, signal) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn allocator_starts_inside_range() {
        let alloc = PortAllocator::new();
        assert!(alloc.next >= PORT_RANGE_START && alloc.next < PORT_RANGE_END);
    }

    #[test]
    fn allocator_reserves_and_releases() {
        let mut alloc = PortAllocator::new();
        let port = alloc.find_free_port().unwrap();
        assert!(alloc.reserved.contains(&port));

        alloc.release(port);
        assert!(!alloc.reserved.contains(&port));
    }

    #[test]
    fn allocator_skips_reserved_ports() {
        let mut alloc = PortAllocator::new();
        let first = alloc.find_free_port().unwrap();
        let second = alloc.find_free_port().unwrap();
        assert_ne!(first, second);
        assert!(alloc.reserved.contains(&first) && alloc.reserved.contains(&second));
    }

    #[test]
    fn allocator_skips_ports_with_listeners() {
        let mut alloc = PortAllocator::new();
        let target = alloc.next;
        let Ok(_listener) = std::net::TcpListener::bind(("0.0.0.0", target)) else {
            // Port taken by something else already, which proves the probe anyway.
            return;
        };

        let port = alloc.find_free_port().unwrap();
        assert_ne!(port, target);
    }

    #[test]
    fn released_port_can_be_handed_out_again() {
        let mut alloc = PortAllocator::new();
        let port = alloc.find_free_port().unwrap();
        alloc.release(port);
        alloc.next = port;

        assert_eq!(alloc.find_free_port().unwrap(), port);
    }

    #[tokio::test]
    async fn new_process_starts_in_starting_state() {
        let manager = ProcessManager::new();
        let proc = manager.ensure("test", "sleep 10", Path::new("/tmp"), &empty_env());

        assert_eq!(proc.state(), ProcessState::Starting);
        assert!(manager.reserved_ports().contains(&proc.port));

        manager.stop("test").await;
    }

    #[tokio::test]
    async fn ensure_returns_existing_record_while_starting() {
        let manager = ProcessManager::new();
        let first = manager.ensure("test", "sleep 10", Path::new("/tmp"), &empty_env());
        let second = manager.ensure("test", "sleep 10", Path::new("/tmp"), &empty_env());

        assert!(Arc::ptr_eq(&first, &second));
        manager.stop("test").await;
    }

    #[tokio::test]
    async fn concurrent_ensure_spawns_exactly_once() {
        let manager = ProcessManager::new();

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let manager = Arc::clone(&manager);
            set.spawn(async move {
                manager
                    .ensure("shared", "sleep 10", Path::new("/tmp"), &HashMap::new())
                    .port
            });
        }

        let mut ports = HashSet::new();
        while let Some(port) = set.join_next().await {
            ports.insert(port.unwrap());
        }
        assert_eq!(ports.len(), 1, "all callers must observe the same process");

        manager.stop("shared").await;
    }

    #[tokio::test]
    async fn stop_removes_record_and_releases_port() {
        let manager = ProcessManager::new();
        let proc = manager.ensure("test", "sleep 10", Path::new("/tmp"), &empty_env());
        let port = proc.port;

        manager.stop("test").await;

        assert!(manager.get("test").is_none());
        assert!(!manager.reserved_ports().contains(&port));
    }

    #[tokio::test]
    async fn missing_directory_fails_with_released_port() {
        let manager = ProcessManager::new();
        let proc = manager.ensure(
            "bad",
            "echo hello",
            Path::new("/nonexistent/roost-dev-test-dir"),
            &empty_env(),
        );

        // Spawn fails synchronously on a missing cwd.
        assert_eq!(proc.state(), ProcessState::Failed);
        assert!(proc.error().is_some());
        assert!(!manager.reserved_ports().contains(&proc.port));
    }

    #[tokio::test]
    async fn child_exit_before_readiness_becomes_failed() {
        let manager = ProcessManager::new();
        let proc = manager.ensure("fails", "false", Path::new("/tmp"), &empty_env());
        let port = proc.port;

        let deadline = Instant::now() + Duration::from_secs(5);
        while proc.state() != ProcessState::Failed {
            assert!(Instant::now() < deadline, "process should have failed");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(proc.error().is_some());
        assert!(!manager.reserved_ports().contains(&port));
    }

    #[tokio::test]
    async fn stderr_is_captured_into_the_log() {
        let manager = ProcessManager::new();
        let proc = manager.ensure(
            "noisy",
            "echo boom >&2; exit 3",
            Path::new("/tmp"),
            &empty_env(),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while proc.state() != ProcessState::Failed {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(proc.log.snapshot().iter().any(|l| l.contains("boom")));
        assert!(proc.error().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn process_becomes_running_once_port_answers() {
        let manager = ProcessManager::new();
        // A real listener on the assigned port: use a shell loop with nc?
        // Portable enough here to use python's http.server bound via $PORT.
        let proc = manager.ensure(
            "web",
            "exec python3 -m http.server $PORT --bind 127.0.0.1",
            Path::new("/tmp"),
            &empty_env(),
        );

        let deadline = Instant::now() + Duration::from_secs(10);
        while proc.state() == ProcessState::Starting {
            assert!(Instant::now() < deadline, "server should become ready");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(proc.state(), ProcessState::Running);
        manager.stop("web").await;
        assert!(!manager.reserved_ports().contains(&proc.port));
    }

    #[tokio::test]
    async fn ensure_after_failure_spawns_a_fresh_record() {
        let manager = ProcessManager::new();
        let first = manager.ensure("retry", "false", Path::new("/tmp"), &empty_env());

        let deadline = Instant::now() + Duration::from_secs(5);
        while first.state() != ProcessState::Failed {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let second = manager.ensure("retry", "sleep 10", Path::new("/tmp"), &empty_env());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), ProcessState::Starting);
        assert!(second.error().is_none(), "error clears on restart");

        manager.stop("retry").await;
    }

    #[tokio::test]
    async fn distinct_keys_hold_distinct_ports() {
        let manager = ProcessManager::new();
        let a = manager.ensure("a", "sleep 10", Path::new("/tmp"), &empty_env());
        let b = manager.ensure("b", "sleep 10", Path::new("/tmp"), &empty_env());

        assert_ne!(a.port, b.port);
        manager.stop_all().await;
        assert!(manager.all().is_empty());
    }
}
