use serde::Deserialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const CONFIG_ENV: &str = "HAMON_CONFIG";
pub const CONFIG_FILE_NAME: &str = "haproxy-monitor.conf";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Target {
    pub name: String,
    pub addr: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("bad config entry on line {line}: {entry:?}")]
    BadEntry { line: usize, entry: String },
    #[error("invalid toml in {}: {message}", path.display())]
    Toml { path: PathBuf, message: String },
    #[error("no targets configured in {}", path.display())]
    Empty { path: PathBuf },
    #[error("couldn't find any of {tried:?}")]
    NotFound { tried: Vec<PathBuf> },
}

#[derive(Debug, Default, Deserialize)]
struct TomlTargets {
    #[serde(default)]
    target: Vec<Target>,
}

/// Parses the plain `<name> <address>` format, one target per line.
pub fn parse_targets(contents: &str) -> Result<Vec<Target>, ConfigError> {
    let mut targets = Vec::new();
    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts = line.split_whitespace().collect::<Vec<_>>();
        let [name, addr] = parts.as_slice() else {
            return Err(ConfigError::BadEntry {
                line: idx + 1,
                entry: raw.to_string(),
            });
        };
        targets.push(Target {
            name: name.to_string(),
            addr: addr.to_string(),
        });
    }
    Ok(targets)
}

pub fn load_targets(path: &Path) -> Result<Vec<Target>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let targets = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str::<TomlTargets>(&contents)
            .map_err(|err| ConfigError::Toml {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?
            .target
    } else {
        parse_targets(&contents)?
    };
    if targets.is_empty() {
        return Err(ConfigError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(targets)
}

/// Picks the target list file: an explicit path wins outright, otherwise the
/// first existing of `$HAMON_CONFIG`, `./haproxy-monitor.conf` and
/// `$HOME/.haproxy-monitor.conf`.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let env_path = std::env::var(CONFIG_ENV).ok();
    let home = std::env::var("HOME").ok();
    first_existing(candidate_paths(env_path.as_deref(), home.as_deref()))
}

fn candidate_paths(env_path: Option<&str>, home: Option<&str>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(value) = env_path {
        if !value.trim().is_empty() {
            paths.push(PathBuf::from(value));
        }
    }
    paths.push(PathBuf::from(CONFIG_FILE_NAME));
    if let Some(value) = home {
        if !value.trim().is_empty() {
            paths.push(PathBuf::from(value).join(format!(".{CONFIG_FILE_NAME}")));
        }
    }
    paths
}

fn first_existing(paths: Vec<PathBuf>) -> Result<PathBuf, ConfigError> {
    match paths.iter().find(|path| path.is_file()) {
        Some(path) => Ok(path.clone()),
        None => Err(ConfigError::NotFound { tried: paths }),
    }
}
