use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{AppError, AppResult};

pub const DATA_DIR_ENV: &str = "WAYSTONE_DATA_DIR";
pub const DRIVER_ENV: &str = "WAYSTONE_DRIVER";
pub const IN_MEMORY_ENV: &str = "WAYSTONE_IN_MEMORY";

pub const APP_IDENTIFIER: &str = "waystone";
pub const DEFAULT_DB_NAME: &str = "local";
pub const DB_FILE_EXTENSION: &str = "db";

const DEFAULT_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const MAX_NAME_LEN: usize = 64;
const USER_PREFIX: &str = "user_";
const USER_DIGEST_LEN: usize = 16;

/// Which SQLite engine backs the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Pooled on-disk engine used by the desktop build.
    #[default]
    Native,
    /// Single in-process connection, file-backed or memory-only.
    Embedded,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Native => "native",
            DriverKind::Embedded => "embedded",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "desktop" => Ok(DriverKind::Native),
            "embedded" | "web" => Ok(DriverKind::Embedded),
            other => Err(AppError::new("CONFIG/INVALID_DRIVER", "Unknown driver kind")
                .with_context("value", other.to_string())),
        }
    }
}

/// A validated, caller-scoped database name. Doubles as the file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DbName(String);

impl DbName {
    #[allow(clippy::result_large_err)]
    pub fn new(name: impl Into<String>) -> AppResult<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_NAME_LEN
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(AppError::new(
                AppError::DB_INVALID_NAME,
                "Database names may only contain letters, digits, '_' and '-'",
            )
            .with_context("name", name));
        }
        Ok(DbName(name))
    }

    /// Derives the per-user database name once a session has been validated.
    ///
    /// Identifiers made only of lowercase letters, digits and `-` map to
    /// `user_<id>`. Anything else is folded into a readable prefix followed by
    /// `_` and a digest of the raw identifier, so two users never share a file
    /// even on case-insensitive filesystems.
    #[allow(clippy::result_large_err)]
    pub fn for_user(user_id: &str) -> AppResult<Self> {
        if user_id.trim().is_empty() {
            return Err(AppError::new(AppError::DB_INVALID_NAME, "User identifier is empty"));
        }
        let plain = user_id.len() <= MAX_NAME_LEN - USER_PREFIX.len()
            && user_id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if plain {
            return DbName::new(format!("{USER_PREFIX}{user_id}"));
        }

        let digest = format!("{:x}", Sha256::digest(user_id.as_bytes()));
        let digest = &digest[..USER_DIGEST_LEN];
        let room = MAX_NAME_LEN - USER_PREFIX.len() - 1 - USER_DIGEST_LEN;
        let folded: String = user_id
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .take(room)
            .collect();
        DbName::new(format!("{USER_PREFIX}{folded}_{digest}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DbName {
    fn default() -> Self {
        DbName(DEFAULT_DB_NAME.to_string())
    }
}

impl fmt::Display for DbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DbName {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DbName::new(value)
    }
}

impl From<DbName> for String {
    fn from(value: DbName) -> Self {
        value.0
    }
}

/// Where a database lives once a name has been resolved against the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    File(PathBuf),
    Memory,
}

impl DbLocation {
    /// The database file, or `None` for a memory-only database.
    pub fn path(&self) -> Option<&Path> {
        match self {
            DbLocation::File(path) => Some(path),
            DbLocation::Memory => None,
        }
    }
}

impl fmt::Display for DbLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbLocation::File(path) => write!(f, "{}", path.display()),
            DbLocation::Memory => f.write_str(":memory:"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub data_dir: PathBuf,
    pub driver: DriverKind,
    /// Keep the database in memory instead of under `data_dir`.
    pub in_memory: bool,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            driver: DriverKind::default(),
            in_memory: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DbConfig {
    pub fn new(data_dir: impl Into<PathBuf>, driver: DriverKind) -> Self {
        Self {
            data_dir: data_dir.into(),
            driver,
            ..Self::default()
        }
    }

    /// A memory-only database; nothing touches the filesystem.
    pub fn in_memory(driver: DriverKind) -> Self {
        Self {
            driver,
            in_memory: true,
            ..Self::default()
        }
    }

    /// Reads overrides from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = std::env::var(DRIVER_ENV) {
            match raw.parse() {
                Ok(kind) => config.driver = kind,
                Err(err) => warn!(
                    target: "waystone::db",
                    event = "config_driver_ignored",
                    env = DRIVER_ENV,
                    error = %err
                ),
            }
        }
        if let Ok(raw) = std::env::var(IN_MEMORY_ENV) {
            config.in_memory = matches!(raw.as_str(), "1" | "true" | "TRUE" | "yes" | "YES");
        }
        config
    }

    pub fn location(&self, name: &DbName) -> DbLocation {
        if self.in_memory {
            DbLocation::Memory
        } else {
            DbLocation::File(
                self.data_dir
                    .join(format!("{}.{DB_FILE_EXTENSION}", name.as_str())),
            )
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_IDENTIFIER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_name_rejects_path_characters() {
        assert!(DbName::new("local").is_ok());
        assert!(DbName::new("user_0190-abc").is_ok());
        for bad in ["", "../etc", "a b", "name.db", "x/y"] {
            let err = DbName::new(bad).expect_err("invalid name");
            assert_eq!(err.code(), AppError::DB_INVALID_NAME);
        }
    }

    #[test]
    fn db_name_for_user_keeps_plain_ids() {
        let name = DbName::for_user("0190aa-bob").expect("derived name");
        assert_eq!(name.as_str(), "user_0190aa-bob");
        assert!(DbName::for_user("   ").is_err());
    }

    #[test]
    fn db_name_for_user_folds_unsafe_characters_with_digest() {
        let name = DbName::for_user("Ada@Example.com").expect("derived name");
        assert!(name.as_str().starts_with("user_ada_example_com_"));
        assert_eq!(
            name.as_str().len(),
            "user_ada_example_com_".len() + USER_DIGEST_LEN
        );
        assert_eq!(DbName::for_user("Ada@Example.com").unwrap(), name);
    }

    #[test]
    fn db_name_for_user_never_collides() {
        let pairs = [
            ("User-ABC", "user-abc"),
            ("a.b", "a_b"),
            ("a.b", "a@b"),
            ("a_b", "a-b"),
        ];
        for (left, right) in pairs {
            let left_name = DbName::for_user(left).unwrap();
            let right_name = DbName::for_user(right).unwrap();
            assert_ne!(left_name, right_name, "{left} vs {right}");
            assert!(
                !left_name.as_str().eq_ignore_ascii_case(right_name.as_str()),
                "{left} vs {right} differ only by case"
            );
        }

        let prefix = "x".repeat(200);
        let a = DbName::for_user(&format!("{prefix}a")).unwrap();
        let b = DbName::for_user(&format!("{prefix}b")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn db_name_for_user_is_bounded() {
        let long = "x".repeat(200);
        let name = DbName::for_user(&long).expect("derived name");
        assert_eq!(name.as_str().len(), MAX_NAME_LEN);
    }

    #[test]
    fn driver_kind_parses_aliases() {
        assert_eq!("native".parse::<DriverKind>().unwrap(), DriverKind::Native);
        assert_eq!("Desktop".parse::<DriverKind>().unwrap(), DriverKind::Native);
        assert_eq!("web".parse::<DriverKind>().unwrap(), DriverKind::Embedded);
        assert!("postgres".parse::<DriverKind>().is_err());
    }

    #[test]
    fn location_uses_name_as_file_stem() {
        let config = DbConfig::new("/tmp/ws", DriverKind::Native);
        let name = DbName::new("local").unwrap();
        assert_eq!(
            config.location(&name),
            DbLocation::File(PathBuf::from("/tmp/ws/local.db"))
        );
        assert_eq!(
            DbConfig::in_memory(DriverKind::Embedded).location(&name),
            DbLocation::Memory
        );
    }
}
