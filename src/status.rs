/// Optional JSON snapshot of the watchdog for external tooling. The monitor
/// replaces it after every poll and on each state change; a reader always
/// sees a complete document because the new content is renamed into place.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Watchdog states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    /// No observation yet for the current child.
    Waiting,
    Tracking,
    /// Polls without progress, below the threshold.
    Stalled,
    Escalating,
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    /// The watchdog's own pid.
    pub pid: u32,
    pub child_pid: Option<u32>,
    pub generation: u64,
    pub state: WatchState,
    pub height: Option<u64>,
    pub block_hash: Option<String>,
    pub stall_count: u32,
    pub stall_threshold: u32,
    pub last_update: DateTime<Utc>,
}

pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling of the status file that receives the next snapshot.
    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "heightwatch.status".into());
        name.push(".next");
        self.path.with_file_name(name)
    }

    /// Replace the snapshot with `data`.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let bytes = serde_json::to_vec_pretty(data).map_err(StatusError::Encode)?;

        let staging = self.staging_path();
        if let Err(source) = std::fs::write(&staging, bytes) {
            return Err(StatusError::Io {
                action: "write",
                path: staging,
                source,
            });
        }
        std::fs::rename(&staging, &self.path).map_err(|source| StatusError::Io {
            action: "publish",
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Debug)]
pub enum StatusError {
    Encode(serde_json::Error),
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Encode(e) => write!(f, "cannot encode status snapshot: {e}"),
            StatusError::Io {
                action,
                path,
                source,
            } => write!(f, "cannot {action} status snapshot {}: {source}", path.display()),
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Encode(e) => Some(e),
            StatusError::Io { source, .. } => Some(source),
        }
    }
}
