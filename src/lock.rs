//! Workspace run lock
//!
//! `sync` takes `<state_dir>/sync.lock` for its whole duration so that two
//! runs never interleave commits or race on the snapshot. The lock file is
//! created exclusively and holds the owner's PID. A lock whose owner is no
//! longer running (checked through `/proc` where available) is taken over,
//! as is one whose PID cannot be read once it is older than the wait timeout.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::error::PipelineError;

pub const LOCK_FILE_NAME: &str = "sync.lock";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct SyncLock {
    path: PathBuf,
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Time since the lock file was last written.
fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(target_os = "linux")]
fn holder_is_gone(pid: u32) -> bool {
    pid != std::process::id() && !Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn holder_is_gone(_pid: u32) -> bool {
    false
}

impl SyncLock {
    fn try_create(path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()
    }

    /// Waits up to `timeout` for the lock.
    pub async fn acquire(state_dir: &Path, timeout: Duration) -> Result<Self, PipelineError> {
        fs::create_dir_all(state_dir).map_err(|e| PipelineError::io(state_dir, e))?;
        let path = state_dir.join(LOCK_FILE_NAME);
        let started = Instant::now();

        loop {
            match Self::try_create(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "run lock acquired");
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = read_holder(&path);
                    let stale = match holder {
                        Some(pid) => holder_is_gone(pid),
                        None => lock_age(&path).is_some_and(|age| age >= timeout),
                    };
                    if stale {
                        tracing::warn!(path = %path.display(), pid = ?holder, "removing stale run lock");
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(PipelineError::io(&path, e)),
                        }
                    }
                    if started.elapsed() >= timeout {
                        return Err(PipelineError::Locked { path, holder });
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(err) => return Err(PipelineError::io(&path, err)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SyncLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release run lock");
        }
    }
}
