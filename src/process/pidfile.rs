//! Single-instance pidfile lock.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PidfileError {
    #[error("already running: pidfile {path} exists")]
    AlreadyRunning { path: String },
    #[error("failed to write pidfile {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A pidfile held for the lifetime of this process; removed on drop.
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    /// Create the pidfile exclusively, writing our pid into it.
    pub fn acquire(path: &Path) -> Result<Self, PidfileError> {
        let display = path.display().to_string();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::AlreadyExists {
                    PidfileError::AlreadyRunning {
                        path: display.clone(),
                    }
                } else {
                    PidfileError::Io {
                        path: display.clone(),
                        source,
                    }
                }
            })?;
        writeln!(file, "{}", std::process::id()).map_err(|source| PidfileError::Io {
            path: display,
            source,
        })?;
        tracing::info!(path = %path.display(), pid = std::process::id(), "Pidfile written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::info!(path = %self.path.display(), "Cleaned pidfile"),
            Err(err) => {
                tracing::error!(path = %self.path.display(), error = %err, "Failed to clean pidfile")
            }
        }
    }
}
