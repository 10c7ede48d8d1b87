//! PID-file singleton guard.
//!
//! One broker per host: a second instance finds the PID file, sees the
//! recorded process still alive and refuses to start (exit code 2). A stale
//! file left behind by a crash is taken over.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidLockError {
    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("pid file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Held for the lifetime of the daemon; removes the file on drop.
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(path: &Path) -> Result<Self, PidLockError> {
        if let Ok(text) = fs::read_to_string(path) {
            if let Ok(pid) = text.trim().parse::<u32>() {
                if pid != std::process::id() && Path::new(&format!("/proc/{pid}")).exists() {
                    return Err(PidLockError::AlreadyRunning(pid));
                }
            }
        }
        fs::write(path, format!("{}\n", std::process::id())).map_err(|source| {
            PidLockError::Io {
                path: path.display().to_string(),
                source,
            }
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gtoaes.pid");
        {
            let _lock = PidLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_blocks_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gtoaes.pid");
        // Our own pid is certainly alive; write it as a foreign owner.
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        // Taking over our own pid is allowed, so fake a different live one:
        // pid 1 is always running on Linux.
        std::fs::write(&path, "1\n").unwrap();
        assert!(matches!(
            PidLock::acquire(&path),
            Err(PidLockError::AlreadyRunning(1))
        ));
    }

    #[test]
    fn stale_pid_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gtoaes.pid");
        std::fs::write(&path, "999999999\n").unwrap();
        let _lock = PidLock::acquire(&path).unwrap();
    }
}
