//! Agent process lifecycle
//!
//! PID file ownership, stopping a running agent, and translating SIGINT or
//! SIGTERM into cancellation.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to read PID file {}: {source}", .path.display())]
    ReadPidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write PID file {}: {source}", .path.display())]
    WritePidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("PID file {} does not contain a process id", .path.display())]
    InvalidPidFile { path: PathBuf },

    #[error("agent already running with pid {pid}")]
    AlreadyRunning { pid: i32 },

    #[error("no running agent with pid {pid}")]
    NotRunning { pid: i32 },

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: Errno,
    },

    #[error("failed to install signal handlers: {0}")]
    SignalHandler(#[source] io::Error),
}

/// PID file held for the lifetime of a running agent; removed on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Record the current process id at `path`.
    ///
    /// A file naming a live process other than this one is refused. Stale
    /// files are overwritten.
    pub fn acquire(path: &Path) -> Result<Self, LifecycleError> {
        let own_pid = std::process::id() as i32;

        match read_pid(path) {
            Ok(pid) if pid != own_pid && is_alive(pid) => {
                return Err(LifecycleError::AlreadyRunning { pid });
            }
            Ok(pid) => warn!(pid, path = %path.display(), "Replacing stale PID file"),
            Err(LifecycleError::ReadPidFile { source, .. })
                if source.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Replacing unreadable PID file"),
        }

        let write = |source| LifecycleError::WritePidFile {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write)?;
        }
        std::fs::write(path, own_pid.to_string()).map_err(write)?;

        info!(pid = own_pid, path = %path.display(), "PID file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

/// Read the process id recorded at `path`
pub fn read_pid(path: &Path) -> Result<i32, LifecycleError> {
    let contents = std::fs::read_to_string(path).map_err(|source| LifecycleError::ReadPidFile {
        path: path.to_path_buf(),
        source,
    })?;
    contents
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| LifecycleError::InvalidPidFile {
            path: path.to_path_buf(),
        })
}

/// Whether a process with this id exists
pub fn is_alive(pid: i32) -> bool {
    // signal 0 only checks for existence; EPERM means it runs under another user
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Ask the agent recorded in `path` to shut down; returns its pid
pub fn stop(path: &Path) -> Result<i32, LifecycleError> {
    let pid = read_pid(path)?;
    if !is_alive(pid) {
        return Err(LifecycleError::NotRunning { pid });
    }
    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|source| LifecycleError::Signal { pid, source })?;
    info!(pid, "Sent SIGTERM to agent");
    Ok(pid)
}

/// Cancel `cancel` on the first SIGINT or SIGTERM
pub fn spawn_signal_listener(cancel: CancellationToken) -> Result<JoinHandle<()>, LifecycleError> {
    let mut sigterm = signal(SignalKind::terminate()).map_err(LifecycleError::SignalHandler)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(LifecycleError::SignalHandler)?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    }))
}
