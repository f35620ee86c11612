use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};

const MIN_SECRET_LEN: usize = 32;

/// Process configuration read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: SocketAddr,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// Snapshot directory for the in-memory store; `None` keeps it ephemeral.
    pub data_dir: Option<PathBuf>,
    pub frontend_url: String,
    pub enable_hsts: bool,
    pub swagger: bool,
}

fn flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"),
        Err(_) => default,
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if secret.len() < MIN_SECRET_LEN {
            bail!("JWT_SECRET must be at least {MIN_SECRET_LEN} characters long");
        }

        let bind = non_empty("QUILL_BIND")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("QUILL_BIND is not a socket address")?;
        let db_max_connections = match non_empty("QUILL_DB_MAX_CONNECTIONS") {
            Some(v) => v.parse().context("QUILL_DB_MAX_CONNECTIONS must be a positive integer")?,
            None => 5,
        };

        Ok(Self {
            bind,
            database_url: non_empty("DATABASE_URL"),
            db_max_connections,
            data_dir: non_empty("QUILL_DATA_DIR").map(PathBuf::from),
            frontend_url: non_empty("FRONTEND_URL").unwrap_or_else(|| "http://localhost:5173".to_string()),
            enable_hsts: flag("ENABLE_HSTS", false),
            swagger: flag("QUILL_SWAGGER", true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env is process-global; keep everything touching it in one test.
    #[test]
    fn reads_environment() {
        env::remove_var("JWT_SECRET");
        assert!(Settings::from_env().is_err());

        env::set_var("JWT_SECRET", "short");
        assert!(Settings::from_env().is_err());

        env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
        env::set_var("QUILL_BIND", "127.0.0.1:9999");
        env::set_var("QUILL_SWAGGER", "false");
        env::remove_var("QUILL_DATA_DIR");
        let s = Settings::from_env().unwrap();
        assert_eq!(s.bind.port(), 9999);
        assert!(!s.swagger);
        assert!(s.data_dir.is_none());
        assert_eq!(s.db_max_connections, 5);

        env::set_var("QUILL_BIND", "not an address");
        assert!(Settings::from_env().is_err());
        env::remove_var("QUILL_BIND");
        env::remove_var("QUILL_SWAGGER");
    }
}
