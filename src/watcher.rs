//! Config directory watcher.
//!
//! Filesystem events arrive in bursts (editors write, rename, fsync), so raw
//! events are pushed into a channel and a debounce task waits for a quiet
//! window before firing a single reload callback.

use std::path::Path;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Quiet window before a burst of events collapses into one reload.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

/// Watches the config directory and invokes a callback once per coalesced
/// burst of changes. Dropping the watcher stops both the OS watcher and the
/// debounce task.
pub struct ConfigWatcher {
    // Held only to keep the OS-level watch alive.
    _watcher: notify::RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `dir`. `on_change` runs on a tokio task after each
    /// debounced burst; it should do its own error handling.
    pub fn spawn<F>(dir: &Path, on_change: F) -> anyhow::Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel::<()>(16);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove()
                        {
                            // A full queue is fine: a pending event already
                            // guarantees a reload.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => error!(error = %e, "config watch error"),
                }
            })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        let task = tokio::spawn(debounce_loop(rx, on_change));

        debug!(dir = %dir.display(), "watching config directory");
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

async fn debounce_loop<F>(mut rx: mpsc::Receiver<()>, on_change: F)
where
    F: Fn() + Send + Sync + 'static,
{
    while rx.recv().await.is_some() {
        // Absorb the rest of the burst until the directory goes quiet.
        loop {
            match tokio::time::timeout(DEBOUNCE_WINDOW, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        on_change();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn coalesces_bursts_into_one_callback() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let watcher = ConfigWatcher::spawn(dir.path(), move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // A burst of writes in quick succession.
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.yml")), "x").unwrap();
        }

        // Wait out the debounce window plus slack for the OS watcher.
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let seen = calls.load(Ordering::SeqCst);
        assert!(seen >= 1, "expected at least one callback");
        assert!(seen <= 2, "burst should coalesce, got {seen} callbacks");

        watcher.stop();
    }

    #[tokio::test]
    async fn fires_again_for_later_changes() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let watcher = ConfigWatcher::spawn(dir.path(), move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::fs::write(dir.path().join("a.yml"), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let first = calls.load(Ordering::SeqCst);

        std::fs::write(dir.path().join("b.yml"), "y").unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let second = calls.load(Ordering::SeqCst);

        assert!(first >= 1);
        assert!(second > first, "second change should trigger another reload");

        watcher.stop();
    }
}
