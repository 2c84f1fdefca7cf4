// dbbackup/src/config/mod.rs
use chrono_tz::Tz;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{AppError, Result};
use crate::retention::RetentionPolicy;
use crate::scheduler::Schedule;
use crate::utils::redact_uri;

pub const ENV_PREFIX: &str = "DBBACKUP_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Backup,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLocation {
    Local,
    Remote,
    Both,
}

impl StorageLocation {
    pub fn uses_local(self) -> bool {
        matches!(self, StorageLocation::Local | StorageLocation::Both)
    }

    pub fn uses_remote(self) -> bool {
        matches!(self, StorageLocation::Remote | StorageLocation::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbEngine {
    MongoDb,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    Latest,
    /// Exact artifact name, or its `YYYYMMDDTHHMMSSZ` timestamp.
    Named(String),
}

impl std::fmt::Display for RestoreTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreTarget::Latest => write!(f, "latest"),
            RestoreTarget::Named(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

/// S3-compatible object storage settings.
#[derive(Clone)]
pub struct RemoteConfig {
    pub bucket_name: String,
    pub bucket_path: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("bucket_name", &self.bucket_name)
            .field("bucket_path", &self.bucket_path)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub engine: DbEngine,
    pub uri: String,
    pub db_name: String,
    pub dump_timeout: Option<Duration>,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("engine", &self.engine)
            .field("uri", &redact_uri(&self.uri))
            .field("db_name", &self.db_name)
            .field("dump_timeout", &self.dump_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub action: Action,
    pub name: String,
    /// Required for backups only.
    pub database: Option<DatabaseConfig>,
    pub storage_location: StorageLocation,
    pub storage_path: Option<PathBuf>,
    pub remote: Option<RemoteConfig>,
    pub restore_path: Option<PathBuf>,
    pub restore_target: RestoreTarget,
    pub retention: RetentionPolicy,
    pub timezone: Tz,
    pub schedule: Option<Schedule>,
    pub listen_addr: Option<SocketAddr>,
    pub work_dir: Option<PathBuf>,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Reads `DBBACKUP_*` variables from the process environment, after loading
    /// `.env.secrets` and `.env` when present.
    pub fn from_env() -> Result<Self> {
        dotenv::from_filename(".env.secrets").ok();
        dotenv::dotenv().ok();
        Self::from_lookup(|key| {
            std::env::var(format!("{}{}", ENV_PREFIX, key))
                .ok()
                .or_else(|| (key == "TZ").then(|| std::env::var("TZ").ok()).flatten())
        })
    }

    /// Builds and validates the configuration from a key lookup. Keys are given
    /// without the `DBBACKUP_` prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let action = match env.get("ACTION").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("backup") => Action::Backup,
            Some("restore") => Action::Restore,
            Some(other) => {
                return Err(AppError::config(format!(
                    "{}ACTION must be one of: 'backup', 'restore' (got '{}')",
                    ENV_PREFIX, other
                )));
            }
        };

        let name = env.require("NAME")?;
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(AppError::config(format!(
                "{}NAME may only contain letters, digits, '.', '_' and '-' (got '{}')",
                ENV_PREFIX, name
            )));
        }

        let storage_location = match env
            .get("STORAGE_LOCATION")
            .as_deref()
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            None | Some("local") => StorageLocation::Local,
            Some("remote") | Some("aws") => StorageLocation::Remote,
            Some("both") | Some("all") => StorageLocation::Both,
            Some(other) => {
                return Err(AppError::config(format!(
                    "{}STORAGE_LOCATION must be one of: 'local', 'remote', 'both' (got '{}')",
                    ENV_PREFIX, other
                )));
            }
        };

        let storage_path = env.get("STORAGE_PATH").map(PathBuf::from);
        if storage_location.uses_local() && storage_path.is_none() {
            return Err(AppError::config(format!(
                "{}STORAGE_PATH is required for local storage",
                ENV_PREFIX
            )));
        }

        let remote = if storage_location.uses_remote() {
            Some(RemoteConfig {
                access_key_id: env.require("AWS_ACCESS_KEY")?,
                secret_access_key: env.require("AWS_SECRET_KEY")?,
                bucket_name: env.require("AWS_S3_BUCKET_NAME")?,
                bucket_path: env.get("AWS_S3_BUCKET_PATH"),
                region: env.get("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                endpoint_url: env.get("AWS_ENDPOINT_URL"),
            })
        } else {
            None
        };

        let database = match action {
            Action::Backup => Some(DatabaseConfig {
                engine: match env
                    .get("DB_ENGINE")
                    .as_deref()
                    .map(str::to_ascii_lowercase)
                    .as_deref()
                {
                    None | Some("mongodb") | Some("mongo") => DbEngine::MongoDb,
                    Some("postgres") | Some("postgresql") => DbEngine::Postgres,
                    Some(other) => {
                        return Err(AppError::config(format!(
                            "{}DB_ENGINE must be one of: 'mongodb', 'postgres' (got '{}')",
                            ENV_PREFIX, other
                        )));
                    }
                },
                uri: env.require("DB_URI")?,
                db_name: env.require("DB_NAME")?,
                dump_timeout: env.parse_u64("DUMP_TIMEOUT")?.map(Duration::from_secs),
            }),
            Action::Restore => None,
        };

        let restore_path = env.get("RESTORE_PATH").map(PathBuf::from);
        if action == Action::Restore && restore_path.is_none() {
            return Err(AppError::config(format!(
                "{}RESTORE_PATH is required for restore",
                ENV_PREFIX
            )));
        }
        let restore_target = match env.get("RESTORE_TARGET") {
            None => RestoreTarget::Latest,
            Some(target) if target.eq_ignore_ascii_case("latest") => RestoreTarget::Latest,
            Some(target) => RestoreTarget::Named(target),
        };

        let retention = RetentionPolicy {
            yearly: env.parse_u32("RETENTION_YEARLY")?.unwrap_or(0),
            monthly: env.parse_u32("RETENTION_MONTHLY")?.unwrap_or(0),
            weekly: env.parse_u32("RETENTION_WEEKLY")?.unwrap_or(0),
            daily: env.parse_u32("RETENTION_DAILY")?.unwrap_or(0),
            hourly: env.parse_u32("RETENTION_HOURLY")?.unwrap_or(0),
            minutely: env.parse_u32("RETENTION_MINUTELY")?.unwrap_or(0),
            max_backups: env.parse_u32("MAX_BACKUPS")?,
        };

        let timezone = match env.get("TZ") {
            None => Tz::UTC,
            Some(raw) => raw.parse::<Tz>().map_err(|_| {
                AppError::config(format!("{}TZ '{}' is not a known time zone", ENV_PREFIX, raw))
            })?,
        };

        let schedule = env
            .get("CRON")
            .map(|cron| Schedule::parse(&cron, timezone))
            .transpose()?;

        let listen_addr = env
            .get("LISTEN_ADDR")
            .map(|raw| {
                raw.parse::<SocketAddr>().map_err(|e| {
                    AppError::config(format!(
                        "{}LISTEN_ADDR '{}' is invalid: {}",
                        ENV_PREFIX, raw, e
                    ))
                })
            })
            .transpose()?;

        let level = match env.get("LOG_LEVEL").as_deref().map(str::to_ascii_uppercase).as_deref() {
            None | Some("INFO") => LogLevel::Info,
            Some("TRACE") => LogLevel::Trace,
            Some("DEBUG") => LogLevel::Debug,
            Some("WARNING") | Some("WARN") => LogLevel::Warning,
            Some("ERROR") => LogLevel::Error,
            Some("CRITICAL") => LogLevel::Critical,
            Some(other) => {
                return Err(AppError::config(format!(
                    "{}LOG_LEVEL must be one of: TRACE, DEBUG, INFO, WARNING, ERROR, CRITICAL (got '{}')",
                    ENV_PREFIX, other
                )));
            }
        };

        Ok(AppConfig {
            action,
            name,
            database,
            storage_location,
            storage_path,
            remote,
            restore_path,
            restore_target,
            retention,
            timezone,
            schedule,
            listen_addr,
            work_dir: env.get("WORK_DIR").map(PathBuf::from),
            logging: LoggingConfig {
                level,
                file: env.get("LOG_FILE").map(PathBuf::from),
                prefix: env.get("LOG_PREFIX"),
            },
        })
    }

    /// Emits the effective configuration at debug level. Secrets are never logged.
    pub fn log_summary(&self) {
        tracing::debug!(action = ?self.action, name = %self.name, "Config");
        if let Some(database) = &self.database {
            tracing::debug!(database = ?database, "Config");
        }
        tracing::debug!(
            storage_location = ?self.storage_location,
            storage_path = ?self.storage_path,
            remote = ?self.remote,
            "Config"
        );
        tracing::debug!(retention = ?self.retention, timezone = %self.timezone, "Config");
        if let Some(schedule) = &self.schedule {
            tracing::debug!(schedule = %schedule, "Config");
        }
        if let Some(path) = &self.restore_path {
            tracing::debug!(
                restore_path = %path.display(),
                restore_target = ?self.restore_target,
                "Config"
            );
        }
    }
}

/// Empty values count as unset.
struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.get(key)
            .ok_or_else(|| AppError::config(format!("{}{} is required", ENV_PREFIX, key)))
    }

    fn parse_u32(&self, key: &str) -> Result<Option<u32>> {
        self.get(key)
            .map(|raw| {
                raw.parse::<u32>().map_err(|_| {
                    AppError::config(format!(
                        "{}{} must be a non-negative integer (got '{}')",
                        ENV_PREFIX, key, raw
                    ))
                })
            })
            .transpose()
    }

    fn parse_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)
            .map(|raw| {
                raw.parse::<u64>().map_err(|_| {
                    AppError::config(format!(
                        "{}{} must be a non-negative integer (got '{}')",
                        ENV_PREFIX, key, raw
                    ))
                })
            })
            .transpose()
    }
}
