use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

pub const APP_ID: &str = "com.echo.Echo";
pub const APP_NAME: &str = "Echo";

const DB_FILE_NAME: &str = "echo-sync.db";
const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;

/// Runtime configuration for the sync daemon, read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub db_path: PathBuf,
    pub sync_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let api_base_url =
            std::env::var("ECHO_API_BASE_URL").unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string());
        let api_token = std::env::var("ECHO_API_TOKEN").ok().filter(|t| !t.is_empty());

        let db_path = match std::env::var("ECHO_DB_PATH") {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => default_db_path()?,
        };

        let sync_interval = match std::env::var("ECHO_SYNC_INTERVAL_SECS") {
            Ok(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("Invalid ECHO_SYNC_INTERVAL_SECS: {}", raw))?,
            Err(_) => DEFAULT_SYNC_INTERVAL_SECS,
        };

        Ok(Self {
            api_base_url,
            api_token,
            db_path,
            sync_interval: Duration::from_secs(sync_interval.max(1)),
        })
    }
}

/// `$XDG_DATA_HOME/echo`, falling back to `~/.local/share/echo`.
pub fn data_dir() -> Result<PathBuf> {
    let base = match std::env::var("XDG_DATA_HOME") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var("HOME").context("HOME not set")?;
            PathBuf::from(home).join(".local/share")
        }
    };
    Ok(base.join("echo"))
}

pub fn default_db_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(DB_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_identity() {
        assert!(APP_ID.ends_with(APP_NAME));
        assert_eq!(APP_ID.split('.').count(), 3);
    }
}
