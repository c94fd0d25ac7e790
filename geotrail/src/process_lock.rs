//! Process-level locks for coordinating `geotrail run` and `geotrail agent`.
//!
//! Lock strategy:
//! - `geotrail-agent.lock` marks the process that owns periodic background
//!   capture for a queue.
//! - `geotrail-foreground.lock` is the wake-lock-like resource held while the
//!   terminal surface is visible.
//! - Locks are advisory OS file locks (flock), scoped to the queue path.

use anyhow::{Context, Result};
use geotrail_core::lifecycle::{WakeGuard, WakeLock};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const AGENT_LOCK_FILE: &str = "geotrail-agent.lock";
const FOREGROUND_LOCK_FILE: &str = "geotrail-foreground.lock";

/// Guard held by the process that owns periodic background capture.
pub struct AgentProcessGuard {
    _agent_lock: ProcessLock,
}

/// Acquire the agent lock for `geotrail agent`.
///
/// Fails if another agent (or a foreground process acting as agent) owns
/// this queue.
pub fn acquire_agent_guard(queue_path: &Path) -> Result<AgentProcessGuard> {
    let agent_lock = acquire_lock(AGENT_LOCK_FILE, queue_path).with_context(|| {
        "refusing to start geotrail agent: another agent already owns this queue"
    })?;
    Ok(AgentProcessGuard {
        _agent_lock: agent_lock,
    })
}

/// Try to take the agent lock; `None` when someone else holds it.
pub fn try_acquire_agent_guard(queue_path: &Path) -> Result<Option<AgentProcessGuard>> {
    Ok(try_acquire_lock(AGENT_LOCK_FILE, queue_path)?
        .map(|lock| AgentProcessGuard { _agent_lock: lock }))
}

/// Whether some process currently owns background capture for this queue
pub fn is_agent_running(queue_path: &Path) -> Result<bool> {
    // Holding it for a moment is the only way to probe an flock
    Ok(try_acquire_lock(AGENT_LOCK_FILE, queue_path)?.is_none())
}

/// Foreground lock exposed as the wake-lock-like resource
pub struct ForegroundWakeLock {
    queue_path: PathBuf,
}

impl ForegroundWakeLock {
    pub fn new(queue_path: impl Into<PathBuf>) -> Self {
        Self {
            queue_path: queue_path.into(),
        }
    }
}

impl WakeLock for ForegroundWakeLock {
    fn acquire(&self) -> geotrail_core::Result<Option<WakeGuard>> {
        let lock = try_acquire_lock(FOREGROUND_LOCK_FILE, &self.queue_path)
            .map_err(|e| geotrail_core::Error::Io(io::Error::other(format!("{e:#}"))))?;
        Ok(lock.map(WakeGuard::new))
    }
}

struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        // Best-effort cleanup of lock file itself (not required for correctness).
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_lock(filename: &str, queue_path: &Path) -> Result<ProcessLock> {
    match try_acquire_lock(filename, queue_path)? {
        Some(lock) => Ok(lock),
        None => anyhow::bail!("lock is already held: {}", filename),
    }
}

fn try_acquire_lock(filename: &str, queue_path: &Path) -> Result<Option<ProcessLock>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(filename, queue_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Write basic owner info for debugging.
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();

            Ok(Some(ProcessLock { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("geotrail");
    dir
}

fn scoped_lock_filename(base_filename: &str, queue_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    queue_path.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("geotrail process locks currently require Unix (macOS/Linux)");
