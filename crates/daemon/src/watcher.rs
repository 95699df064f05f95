// crates/daemon/src/watcher.rs
//! Session directory watcher.
//!
//! notify events are forwarded into an mpsc channel and debounced by a
//! [`FileTracker`]: a file that keeps changing emits one `SessionChanged`
//! once writes settle for `stability_threshold`, and one `SessionIdle` once
//! it has been quiet for the idle timeout. Both fire at most once per
//! quiescent period; the next modification re-arms them.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Events emitted by the watcher, pre-filtered to `.jsonl` session files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Writes to the file have settled (quiet for the stability threshold).
    SessionChanged(PathBuf),
    /// The file has been idle for the configured idle timeout.
    SessionIdle(PathBuf),
}

#[derive(Debug, Clone)]
struct FileState {
    last_modified: Instant,
    changed_emitted: bool,
    idle_emitted: bool,
}

/// Pure debouncing state machine, separated from notify so the timing rules
/// are unit-testable with a fake clock.
#[derive(Debug)]
pub struct FileTracker {
    stability_threshold: Duration,
    idle_timeout: Duration,
    files: HashMap<PathBuf, FileState>,
}

impl FileTracker {
    pub fn new(stability_threshold: Duration, idle_timeout: Duration) -> Self {
        Self {
            stability_threshold,
            idle_timeout,
            files: HashMap::new(),
        }
    }

    /// Record a modification at `now`. Re-arms both events.
    pub fn touch(&mut self, path: PathBuf, now: Instant) {
        let state = self.files.entry(path).or_insert(FileState {
            last_modified: now,
            changed_emitted: false,
            idle_emitted: false,
        });
        state.last_modified = now;
        state.changed_emitted = false;
        state.idle_emitted = false;
    }

    /// Forget a removed file.
    pub fn remove(&mut self, path: &Path) {
        self.files.remove(path);
    }

    /// Collect due events at `now`. Each event fires at most once per
    /// quiescent period.
    pub fn poll(&mut self, now: Instant) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        for (path, state) in self.files.iter_mut() {
            let quiet = now.saturating_duration_since(state.last_modified);
            if !state.changed_emitted && quiet >= self.stability_threshold {
                state.changed_emitted = true;
                events.push(WatchEvent::SessionChanged(path.clone()));
            }
            if !state.idle_emitted && quiet >= self.idle_timeout {
                state.idle_emitted = true;
                events.push(WatchEvent::SessionIdle(path.clone()));
            }
        }
        events
    }

    pub fn tracked_count(&self) -> usize {
        self.files.len()
    }
}

/// Filesystem watcher over the configured session directories.
pub struct SessionWatcher {
    // Dropping the notify handle stops the watch.
    _watcher: RecommendedWatcher,
    join: tokio::task::JoinHandle<()>,
}

impl SessionWatcher {
    /// Start watching. Missing directories are created. Returns the watcher
    /// handle and the debounced event stream.
    pub fn start(
        dirs: &[PathBuf],
        stability_threshold: Duration,
        idle_timeout: Duration,
        token: CancellationToken,
    ) -> notify::Result<(Self, mpsc::Receiver<WatchEvent>)> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<(PathBuf, bool)>(256);
        let (event_tx, event_rx) = mpsc::channel::<WatchEvent>(256);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        let removed = matches!(event.kind, EventKind::Remove(_));
                        if !removed
                            && !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                        {
                            return;
                        }
                        for path in event.paths {
                            if path.extension().map(|ext| ext == "jsonl").unwrap_or(false) {
                                // Best-effort send; a full channel only delays
                                // debouncing, never loses the final state.
                                let _ = raw_tx.try_send((path, removed));
                            }
                        }
                    }
                    Err(e) => error!("file watcher error: {e}"),
                }
            })?;

        for dir in dirs {
            if !dir.exists() {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    warn!(dir = %dir.display(), error = %e, "could not create session directory");
                    continue;
                }
            }
            watcher.watch(dir, RecursiveMode::Recursive)?;
            info!(dir = %dir.display(), "watching for session changes");
        }

        let join = tokio::spawn(async move {
            let mut tracker = FileTracker::new(stability_threshold, idle_timeout);
            let mut tick = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("watcher debounce task stopping");
                        break;
                    }
                    raw = raw_rx.recv() => {
                        match raw {
                            Some((path, removed)) => {
                                if removed {
                                    tracker.remove(&path);
                                } else {
                                    tracker.touch(path, Instant::now());
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tick.tick() => {
                        for event in tracker.poll(Instant::now()) {
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok((
            Self {
                _watcher: watcher,
                join,
            },
            event_rx,
        ))
    }

    /// Stop the watcher and join the debounce task.
    pub async fn stop(self) {
        // Cancellation is signalled by the caller's token; dropping the
        // notify handle here ends the raw stream either way.
        drop(self._watcher);
        let _ = self.join.await;
    }
}

/// Scan session directories for existing `.jsonl` files (startup backlog).
pub fn initial_scan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir in dirs {
        scan_dir(dir, &mut found);
    }
    found.sort();
    found
}

fn scan_dir(dir: &Path, found: &mut Vec<PathBuf>) {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_dir(&path, found);
        } else if path.extension().map(|ext| ext == "jsonl").unwrap_or(false) {
            found.push(path);
        }
    }
}
