use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{info, warn};

use crate::AppError;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("database {path} is already open in another session")]
    Held { path: PathBuf },
    #[error("failed to open lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<LockError> for AppError {
    fn from(err: LockError) -> Self {
        match &err {
            LockError::Held { path } => AppError::new(AppError::DB_LOCKED, err.to_string())
                .with_context("path", path.display().to_string()),
            LockError::Io { path, source } => AppError::new("DB/LOCK_IO", err.to_string())
                .with_context("path", path.display().to_string())
                .with_context("os_error", source.to_string()),
        }
    }
}

/// Exclusive advisory lock on `<db>.lock`, held for as long as the value
/// lives.
#[derive(Debug)]
pub struct DbLock {
    file: File,
    path: PathBuf,
}

impl DbLock {
    pub fn lock_path(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn acquire(db_path: &Path) -> Result<Self, LockError> {
        let path = Self::lock_path(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        if let Err(e) = file.try_lock_exclusive() {
            warn!(
                target: "waystone::db",
                event = "db_lock_busy",
                path = %path.display(),
                error = %e
            );
            return Err(LockError::Held { path });
        }
        info!(target: "waystone::db", event = "db_lock_acquired", path = %path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DbLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(target: "waystone::db", event = "db_unlock_failed", error = %e);
        }
    }
}
