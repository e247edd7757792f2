//! Run and per-host locking
//!
//! Two scopes: the run-scope lock serializes orchestrator invocations on the
//! control host; the per-host lock keeps two invocations (possibly from
//! different control hosts) from touching the same target concurrently.
//!
//! Both are marker files carrying a JSON body with the holder identity and
//! the acquisition timestamp. A marker is stale when its age exceeds the
//! configured threshold, or (locally) when its recorded pid is gone; stale
//! markers are reclaimed by overwrite instead of blocking. Acquisition is a
//! single bounded attempt, never an indefinite wait.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{Error, Result, Server, Transport};

/// Default staleness threshold for reclaiming a lock marker
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(1800);

/// Marker path on target hosts
pub const REMOTE_LOCK_PATH: &str = "/tmp/fleetsteer.lock";

const LOCAL_LOCK_FILE: &str = "fleetsteer.lock";

/// On-disk lock marker
#[derive(Debug, Serialize, Deserialize)]
struct LockMarker {
    holder: String,
    pid: u32,
    /// Unix epoch seconds
    acquired_at: i64,
}

impl LockMarker {
    fn new(holder: String) -> Self {
        Self {
            holder,
            pid: std::process::id(),
            acquired_at: chrono::Utc::now().timestamp(),
        }
    }

    fn age(&self) -> Duration {
        let secs = chrono::Utc::now().timestamp() - self.acquired_at;
        Duration::from_secs(secs.max(0) as u64)
    }
}

/// Guard for the run-scope lock.
///
/// Release happens exactly once: explicitly via [`LockGuard::release`], or on
/// drop if the run unwinds before reaching it.
pub struct LockGuard {
    path: PathBuf,
    armed: bool,
}

impl LockGuard {
    /// Release the lock now
    pub fn release(mut self) {
        self.remove();
        self.armed = false;
    }

    fn remove(&self) {
        // Removing an already-removed marker is a no-op.
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove lock marker");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.armed {
            self.remove();
        }
    }
}

/// Acquires and releases run-scope and per-host locks
pub struct LockManager {
    lock_dir: PathBuf,
    stale_after: Duration,
    holder: String,
}

impl LockManager {
    pub fn new(lock_dir: PathBuf) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        Self {
            lock_dir,
            stale_after: DEFAULT_STALE_AFTER,
            holder: format!("{}:{}", host, std::process::id()),
        }
    }

    /// Override the staleness threshold
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Path of the local run-scope marker
    pub fn local_lock_path(&self) -> PathBuf {
        self.lock_dir.join(LOCAL_LOCK_FILE)
    }

    /// Acquire the run-scope lock.
    ///
    /// Fails with [`Error::LockHeld`] if a fresh marker from a live holder is
    /// present; stale markers are reclaimed.
    pub fn acquire_local(&self) -> Result<LockGuard> {
        std::fs::create_dir_all(&self.lock_dir)
            .map_err(|e| Error::LockError(format!("cannot create lock dir: {}", e)))?;

        let path = self.local_lock_path();
        match self.try_create(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                self.reclaim_or_fail(&path)?;
            }
            Err(e) => return Err(Error::LockError(format!("cannot create lock marker: {}", e))),
        }

        debug!(path = %path.display(), holder = %self.holder, "Acquired run lock");
        Ok(LockGuard { path, armed: true })
    }

    /// Release the run-scope marker unconditionally. Idempotent.
    pub fn release_local(&self) {
        let path = self.local_lock_path();
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove lock marker");
            }
        }
    }

    fn try_create(&self, path: &Path) -> std::io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(self.marker_json().as_bytes())
    }

    /// Existing marker: reclaim if stale, otherwise fail
    fn reclaim_or_fail(&self, path: &Path) -> Result<()> {
        let marker = std::fs::read_to_string(path)
            .ok()
            .and_then(|body| serde_json::from_str::<LockMarker>(&body).ok());

        match marker {
            Some(marker) if !self.is_stale_local(&marker) => {
                return Err(Error::LockHeld {
                    scope: "local".to_string(),
                    holder: marker.holder,
                });
            }
            Some(marker) => {
                warn!(
                    holder = %marker.holder,
                    age_secs = marker.age().as_secs(),
                    "Reclaiming stale run lock"
                );
            }
            None => {
                warn!(path = %path.display(), "Reclaiming unreadable run lock marker");
            }
        }

        std::fs::remove_file(path)
            .map_err(|e| Error::LockError(format!("cannot reclaim lock marker: {}", e)))?;
        self.try_create(path)
            .map_err(|e| Error::LockError(format!("cannot recreate lock marker: {}", e)))
    }

    fn is_stale_local(&self, marker: &LockMarker) -> bool {
        marker.age() > self.stale_after || !pid_alive(marker.pid)
    }

    fn marker_json(&self) -> String {
        // Marker fields are plain strings and numbers; serialization cannot fail.
        serde_json::to_string(&LockMarker::new(self.holder.clone())).unwrap_or_default()
    }

    /// Acquire the per-host lock on a target, through the transport.
    ///
    /// The marker is created with noclobber semantics so two control hosts
    /// cannot both win; a stale marker (by age) is reclaimed by overwrite.
    pub async fn acquire_host(&self, transport: &dyn Transport, server: &Server) -> Result<()> {
        let marker = self.marker_json();
        let script = format!(
            "if (set -C; echo '{marker}' > {path}) 2>/dev/null; then echo LOCKED; else cat {path} 2>/dev/null; fi",
            marker = marker,
            path = REMOTE_LOCK_PATH,
        );

        let output = transport
            .run(server, &script)
            .await
            .map_err(|e| Error::LockError(format!("{}: {}", server, e)))?;

        if output.stdout.trim() == "LOCKED" {
            debug!(server = %server, "Acquired host lock");
            return Ok(());
        }

        match serde_json::from_str::<LockMarker>(output.stdout.trim()) {
            Ok(existing) if existing.age() <= self.stale_after => Err(Error::LockHeld {
                scope: server.name().to_string(),
                holder: existing.holder,
            }),
            parsed => {
                if let Ok(existing) = parsed {
                    warn!(server = %server, holder = %existing.holder, "Reclaiming stale host lock");
                } else {
                    warn!(server = %server, "Reclaiming unreadable host lock marker");
                }
                let overwrite = format!(
                    "echo '{marker}' > {path} && echo LOCKED",
                    marker = marker,
                    path = REMOTE_LOCK_PATH,
                );
                let output = transport
                    .run(server, &overwrite)
                    .await
                    .map_err(|e| Error::LockError(format!("{}: {}", server, e)))?;
                if output.stdout.trim() == "LOCKED" {
                    Ok(())
                } else {
                    Err(Error::LockError(format!(
                        "{}: could not reclaim stale host lock",
                        server
                    )))
                }
            }
        }
    }

    /// Remove the per-host marker. Idempotent; callers run this on every
    /// exit path and only log failures.
    pub async fn release_host(&self, transport: &dyn Transport, server: &Server) -> Result<()> {
        let command = format!("rm -f {}", REMOTE_LOCK_PATH);
        transport
            .run(server, &command)
            .await
            .map_err(|e| Error::LockError(format!("{}: {}", server, e)))?;
        debug!(server = %server, "Released host lock");
        Ok(())
    }
}

fn pid_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.exists() {
        // No procfs to consult; assume the holder is alive.
        return true;
    }
    proc_root.join(pid.to_string()).exists()
}
