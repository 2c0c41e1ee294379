//! Configuration: a TOML file merged with `PIGEON_*` environment
//! overrides.
//!
//! The file lives at `$PIGEON_CONFIG` or `~/.config/pigeon/config.toml`.
//! Environment variables win over file values, file values win over
//! defaults; the only required setting is `cache`, the shared directory
//! both sides mount. The worker re-reads the file once per second, so
//! `route`, `poll_interval` and `debug` edits take effect on a running
//! worker without a restart (values pinned on the command line do not
//! reload).

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use tempfile::NamedTempFile;
use toml_edit::DocumentMut;

use crate::append_log::FsyncPolicy;
use crate::error::ConfigError;
use crate::paths::PathLayout;
use crate::protocol::normalize_route;

pub const DEFAULT_WORKER_MAX_JOBS: usize = 4;
pub const DEFAULT_WORKER_POLL_INTERVAL: f64 = 0.05;
pub const DEFAULT_HEARTBEAT_STALE_SECS: f64 = 5.0;
const HEARTBEAT_STALE_RANGE: (f64, f64) = (3.0, 10.0);

/// Keys accepted by `pigeon config set/unset`.
pub const CONFIG_KEYS: &[&str] = &[
    "cache",
    "namespace",
    "route",
    "user",
    "heartbeat_stale",
    "source_bashrc",
    "worker.max_jobs",
    "worker.poll_interval",
    "worker.debug",
    "worker.route",
    "worker.accept_unrouted",
    "remote_env.<NAME>",
];

/// Raw file contents; every field optional so a partial file is valid.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub cache: Option<String>,
    pub namespace: Option<String>,
    pub route: Option<String>,
    pub user: Option<String>,
    pub heartbeat_stale: Option<f64>,
    pub source_bashrc: Option<bool>,
    #[serde(default)]
    pub worker: WorkerTable,
    #[serde(default)]
    pub remote_env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerTable {
    pub max_jobs: Option<usize>,
    pub poll_interval: Option<f64>,
    pub debug: Option<bool>,
    pub route: Option<String>,
    pub accept_unrouted: Option<bool>,
}

/// Effective settings after the env/file/default merge.
#[derive(Debug, Clone)]
pub struct Settings {
    pub layout: PathLayout,
    pub user: String,
    /// Route attached to new client requests.
    pub route: Option<String>,
    /// Route the worker advertises and filters on.
    pub worker_route: Option<String>,
    pub worker_max_jobs: usize,
    pub worker_poll_interval: f64,
    pub worker_debug: bool,
    pub accept_unrouted: bool,
    pub heartbeat_stale: f64,
    pub source_bashrc: bool,
    pub remote_env: BTreeMap<String, String>,
    pub fsync: FsyncPolicy,
}

/// Resolves the config file path: `$PIGEON_CONFIG` beats the default
/// under the user config directory.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(env_path) = env_non_empty("PIGEON_CONFIG") {
        return PathBuf::from(env_path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pigeon")
        .join("config.toml")
}

/// Loads the file; a missing file is an empty config, not an error.
pub fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FileConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&body).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl FileConfig {
    /// Applies environment overrides and defaults. Fails only when no
    /// cache directory is configured anywhere.
    pub fn resolve(&self) -> Result<Settings, ConfigError> {
        let cache = env_non_empty("PIGEON_CACHE")
            .or_else(|| self.cache.clone())
            .ok_or(ConfigError::MissingCache)?;
        let cache_root = expand_home(&cache);

        let user = env_non_empty("PIGEON_USER")
            .or_else(|| self.user.clone())
            .or_else(|| env_non_empty("USER"))
            .unwrap_or_default();
        let namespace = env_non_empty("PIGEON_NAMESPACE")
            .or_else(|| self.namespace.clone())
            .or_else(|| if user.is_empty() { None } else { Some(user.clone()) })
            .unwrap_or_else(|| "default".to_string());

        let route = normalize_route(
            env_non_empty("PIGEON_ROUTE")
                .or_else(|| self.route.clone())
                .as_deref(),
        );
        let worker_route = normalize_route(
            env_non_empty("PIGEON_WORKER_ROUTE")
                .or_else(|| env_non_empty("PIGEON_ROUTE"))
                .or_else(|| self.worker.route.clone())
                .or_else(|| self.route.clone())
                .as_deref(),
        );

        let source_bashrc = match env_non_empty("PIGEON_SOURCE_BASHRC") {
            Some(raw) => parse_bool(&raw, "PIGEON_SOURCE_BASHRC")?,
            None => self.source_bashrc.unwrap_or(false),
        };

        let heartbeat_stale = self
            .heartbeat_stale
            .unwrap_or(DEFAULT_HEARTBEAT_STALE_SECS)
            .clamp(HEARTBEAT_STALE_RANGE.0, HEARTBEAT_STALE_RANGE.1);

        let worker_max_jobs = self.worker.max_jobs.unwrap_or(DEFAULT_WORKER_MAX_JOBS).max(1);
        let worker_poll_interval = self
            .worker
            .poll_interval
            .unwrap_or(DEFAULT_WORKER_POLL_INTERVAL)
            .max(0.01);

        Ok(Settings {
            layout: PathLayout::new(cache_root, namespace),
            user,
            route,
            worker_route,
            worker_max_jobs,
            worker_poll_interval,
            worker_debug: self.worker.debug.unwrap_or(false),
            accept_unrouted: self.worker.accept_unrouted.unwrap_or(true),
            heartbeat_stale,
            source_bashrc,
            remote_env: self.remote_env.clone(),
            fsync: FsyncPolicy::from_env(),
        })
    }
}

/// Sets one key in the config file, preserving formatting and comments.
pub fn set_value(path: &Path, key: &str, value: &str) -> Result<(), ConfigError> {
    let mut doc = read_document(path)?;
    apply_set(&mut doc, key, value)?;
    write_document(path, &doc)
}

/// Removes one key from the config file.
pub fn unset_value(path: &Path, key: &str) -> Result<(), ConfigError> {
    let mut doc = read_document(path)?;
    apply_unset(&mut doc, key)?;
    write_document(path, &doc)
}

fn apply_set(doc: &mut DocumentMut, key: &str, value: &str) -> Result<(), ConfigError> {
    let invalid = |detail: &str| ConfigError::InvalidValue {
        key: key.to_string(),
        detail: detail.to_string(),
    };
    match key {
        "cache" | "namespace" | "route" | "user" => {
            if value.trim().is_empty() {
                return Err(invalid("cannot be empty"));
            }
            doc[key] = toml_edit::value(value.trim());
        }
        "heartbeat_stale" => {
            let secs: f64 = value.parse().map_err(|_| invalid("must be a number"))?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(invalid("must be > 0"));
            }
            doc[key] = toml_edit::value(secs);
        }
        "source_bashrc" => {
            let flag = parse_bool(value, key)?;
            doc[key] = toml_edit::value(flag);
        }
        "worker.max_jobs" => {
            let jobs: i64 = value.parse().map_err(|_| invalid("must be an integer"))?;
            if jobs <= 0 {
                return Err(invalid("must be > 0"));
            }
            worker_table(doc)["max_jobs"] = toml_edit::value(jobs);
        }
        "worker.poll_interval" => {
            let secs: f64 = value.parse().map_err(|_| invalid("must be a number"))?;
            if !secs.is_finite() || secs <= 0.0 {
                return Err(invalid("must be > 0"));
            }
            worker_table(doc)["poll_interval"] = toml_edit::value(secs);
        }
        "worker.debug" => {
            let flag = parse_bool(value, key)?;
            worker_table(doc)["debug"] = toml_edit::value(flag);
        }
        "worker.route" => {
            if value.trim().is_empty() {
                return Err(invalid("cannot be empty"));
            }
            worker_table(doc)["route"] = toml_edit::value(value.trim());
        }
        "worker.accept_unrouted" => {
            let flag = parse_bool(value, key)?;
            worker_table(doc)["accept_unrouted"] = toml_edit::value(flag);
        }
        _ => {
            if let Some(name) = key.strip_prefix("remote_env.") {
                if !is_env_name(name) {
                    return Err(invalid("remote_env key must match [A-Za-z_][A-Za-z0-9_]*"));
                }
                remote_env_table(doc)[name] = toml_edit::value(value);
            } else {
                return Err(ConfigError::UnknownKey {
                    key: key.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn apply_unset(doc: &mut DocumentMut, key: &str) -> Result<(), ConfigError> {
    match key {
        "cache" | "namespace" | "route" | "user" | "heartbeat_stale" | "source_bashrc" => {
            doc.remove(key);
        }
        "worker.max_jobs" | "worker.poll_interval" | "worker.debug" | "worker.route"
        | "worker.accept_unrouted" => {
            let field = key.strip_prefix("worker.").unwrap_or(key);
            if let Some(table) = doc.get_mut("worker").and_then(|item| item.as_table_mut()) {
                table.remove(field);
                if table.is_empty() {
                    doc.remove("worker");
                }
            }
        }
        _ => {
            if let Some(name) = key.strip_prefix("remote_env.") {
                if let Some(table) = doc.get_mut("remote_env").and_then(|item| item.as_table_mut())
                {
                    table.remove(name);
                    if table.is_empty() {
                        doc.remove("remote_env");
                    }
                }
            } else {
                return Err(ConfigError::UnknownKey {
                    key: key.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn worker_table(doc: &mut DocumentMut) -> &mut toml_edit::Item {
    if doc.get("worker").and_then(|item| item.as_table()).is_none() {
        doc["worker"] = toml_edit::Item::Table(toml_edit::Table::new());
    }
    &mut doc["worker"]
}

fn remote_env_table(doc: &mut DocumentMut) -> &mut toml_edit::Item {
    if doc
        .get("remote_env")
        .and_then(|item| item.as_table())
        .is_none()
    {
        doc["remote_env"] = toml_edit::Item::Table(toml_edit::Table::new());
    }
    &mut doc["remote_env"]
}

fn read_document(path: &Path) -> Result<DocumentMut, ConfigError> {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    body.parse::<DocumentMut>()
        .map_err(|err| ConfigError::InvalidValue {
            key: path.display().to_string(),
            detail: err.to_string(),
        })
}

fn write_document(path: &Path, doc: &DocumentMut) -> Result<(), ConfigError> {
    let write_err = |source: std::io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(write_err)?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    tmp.write_all(doc.to_string().as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_data().map_err(write_err)?;
    tmp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}

fn env_non_empty(name: &str) -> Option<String> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_bool(raw: &str, key: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            detail: format!("invalid boolean {raw:?}"),
        }),
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(raw)
}
