use std::path::{Path, PathBuf};

use anyhow::Context;
use file_rotate::{compression::Compression, suffix::AppendCount, ContentLimit, FileRotate};
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "WAYSTONE_LOG";
pub const LOG_MAX_SIZE_ENV: &str = "WAYSTONE_LOG_MAX_SIZE_BYTES";
pub const LOG_MAX_FILES_ENV: &str = "WAYSTONE_LOG_MAX_FILES";
pub const LOG_FILE_NAME: &str = "waystone.log";

const DEFAULT_FILTER: &str = "waystone=info,sqlx=warn";
const DEFAULT_MAX_SIZE_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 5;

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub filter: String,
    /// Directory for the rotating file sink; stderr only when `None`.
    pub dir: Option<PathBuf>,
    pub max_size_bytes: usize,
    pub max_files: usize,
}

impl LogSettings {
    pub fn from_env(dir: Option<PathBuf>) -> Self {
        Self {
            filter: std::env::var(LOG_ENV).unwrap_or_else(|_| DEFAULT_FILTER.into()),
            dir,
            max_size_bytes: env_usize(LOG_MAX_SIZE_ENV).unwrap_or(DEFAULT_MAX_SIZE_BYTES),
            max_files: env_usize(LOG_MAX_FILES_ENV).unwrap_or(DEFAULT_MAX_FILES),
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn rotating_writer(dir: &Path, settings: &LogSettings) -> anyhow::Result<FileRotate<AppendCount>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;
    Ok(FileRotate::new(
        dir.join(LOG_FILE_NAME),
        AppendCount::new(settings.max_files),
        ContentLimit::BytesSurpassed(settings.max_size_bytes),
        Compression::None,
        #[cfg(unix)]
        None,
    ))
}

/// Installs the global subscriber: JSON lines on stderr, plus a rotating file
/// sink when `settings.dir` is set. `log` records are bridged into tracing.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
/// When the file sink cannot be created the stderr layer is still installed
/// and the sink error is returned.
pub fn init_with(settings: &LogSettings) -> anyhow::Result<()> {
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_new(&settings.filter)
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .context("build log filter")?;

    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let mut sink_error = None;
    let file_layer = match settings.dir.as_deref() {
        Some(dir) if FILE_GUARD.get().is_none() => match rotating_writer(dir, settings) {
            Ok(writer) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(writer);
                let _ = FILE_GUARD.set(guard);
                Some(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_ansi(false)
                        .with_timer(fmt::time::UtcTime::rfc_3339())
                        .with_writer(non_blocking),
                )
            }
            Err(err) => {
                sink_error = Some(err);
                None
            }
        },
        _ => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    match sink_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fall_back_to_defaults() {
        std::env::remove_var(LOG_MAX_SIZE_ENV);
        std::env::remove_var(LOG_MAX_FILES_ENV);
        let settings = LogSettings::from_env(None);
        assert_eq!(settings.max_size_bytes, DEFAULT_MAX_SIZE_BYTES);
        assert_eq!(settings.max_files, DEFAULT_MAX_FILES);
        assert!(settings.dir.is_none());
    }

    #[test]
    fn zero_limits_are_ignored() {
        std::env::set_var("WAYSTONE_TEST_ZERO_LIMIT", "0");
        assert_eq!(env_usize("WAYSTONE_TEST_ZERO_LIMIT"), None);
        std::env::set_var("WAYSTONE_TEST_ZERO_LIMIT", " 12 ");
        assert_eq!(env_usize("WAYSTONE_TEST_ZERO_LIMIT"), Some(12));
    }

    #[test]
    fn unwritable_log_directory_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("write blocker");
        let settings = LogSettings::from_env(Some(blocker.join("logs")));
        let err = rotating_writer(&blocker.join("logs"), &settings).err().expect("parent is a file");
        assert!(err.to_string().contains("create log directory"));
    }

    #[test]
    fn rotating_writer_creates_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("logs");
        let settings = LogSettings::from_env(Some(dir.clone()));
        let _writer = rotating_writer(&dir, &settings).expect("writer");
        assert!(dir.is_dir());
    }
}
