#![forbid(unsafe_code)]

//! Runtime configuration for the vidfetch backend.
//!
//! Values are resolved in three layers: explicit overrides (CLI flags), the
//! process environment, and finally a `.env` file in the working directory.
//! Every key has a default so a bare `backend` invocation works out of the
//! box.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
const DOWNLOADS_SUBDIR: &str = "downloads";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub download_root: PathBuf,
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub download_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

/// The download directory defaults to a `downloads` subfolder of the system
/// temporary root, matching where short-lived fetches belong.
pub fn default_download_root() -> PathBuf {
    env::temp_dir().join(DOWNLOADS_SUBDIR)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let download_root = overrides
        .download_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DOWNLOAD_ROOT", file_vars, &env_lookup))
        .map(PathBuf::from)
        .unwrap_or_else(default_download_root);
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    Ok(RuntimeConfig {
        download_root,
        port,
        host,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
