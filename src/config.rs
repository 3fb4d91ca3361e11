//! Configuration loading from `.env` files.

use std::env;

use anyhow::Result;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum resident events before eviction; 0 disables the bound.
    pub capacity: usize,
    /// Log filter directive, e.g. `info` or `monstr=debug`.
    pub log: String,
}

/// Serializes tests that read or write process environment variables.
#[cfg(test)]
pub(crate) static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

impl Settings {
    /// Load settings from the specified `.env` file. A missing file just
    /// means defaults; set variables always win over file entries.
    pub fn from_env(path: &str) -> Result<Self> {
        match dotenvy::from_filename(path) {
            Ok(_) => {}
            Err(err) if err.not_found() => {}
            Err(err) => return Err(err.into()),
        }
        let capacity = env::var("MONSTR_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let log = env::var("MONSTR_LOG").unwrap_or_else(|_| "info".into());
        Ok(Self { capacity, log })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn clear_vars() {
        for v in ["MONSTR_CAPACITY", "MONSTR_LOG"] {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "MONSTR_CAPACITY=5000\nMONSTR_LOG=monstr=debug\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.capacity, 5000);
        assert_eq!(cfg.log, "monstr=debug");
        clear_vars();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let cfg =
            Settings::from_env(dir.path().join("absent.env").to_str().unwrap()).unwrap();
        assert_eq!(cfg.capacity, 0);
        assert_eq!(cfg.log, "info");
    }

    #[test]
    fn invalid_capacity_falls_back() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "MONSTR_CAPACITY=plenty\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.capacity, 0);
        clear_vars();
    }
}
