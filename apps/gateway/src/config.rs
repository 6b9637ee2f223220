use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8990";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_UPLOAD_DIR: &str = "data/uploads";
const DEFAULT_AUDIT_DB_PATH: &str = "data/audit.db";
const DEFAULT_SESSION_SIGNING_KEY: &str = "datawash-dev-session-key";
const DEFAULT_SESSION_TTL_SECONDS: u64 = 86_400;
const DEFAULT_ADMIN_EMAILS: &str = "";
const DEFAULT_WORKER_BASE_URL: &str = "http://127.0.0.1:8991";
const DEFAULT_WORKER_TIMEOUT_MS: u64 = datawash_worker_client::DEFAULT_TIMEOUT_MS;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub upload_dir: PathBuf,
    /// Sqlite file backing the audit trail. `None` opens an in-memory
    /// database (tests only).
    pub audit_db_path: Option<PathBuf>,
    pub job_store_path: Option<PathBuf>,
    pub result_store_path: Option<PathBuf>,
    pub auth_store_path: Option<PathBuf>,
    pub session_signing_key: String,
    pub session_ttl_seconds: u64,
    /// bcrypt work factor; lowered in tests to keep them fast.
    pub bcrypt_cost: u32,
    pub admin_emails: Vec<String>,
    pub worker_base_url: String,
    pub worker_timeout_ms: u64,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid DW_GATEWAY_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env_string("DW_GATEWAY_BIND_ADDR", DEFAULT_BIND_ADDR);
        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        Ok(Self {
            bind_addr,
            log_filter: env_string("DW_GATEWAY_LOG_FILTER", DEFAULT_LOG_FILTER),
            upload_dir: PathBuf::from(env_string("DW_GATEWAY_UPLOAD_DIR", DEFAULT_UPLOAD_DIR)),
            audit_db_path: Some(PathBuf::from(env_string(
                "DW_GATEWAY_AUDIT_DB",
                DEFAULT_AUDIT_DB_PATH,
            ))),
            job_store_path: env_path("DW_GATEWAY_JOB_STORE"),
            result_store_path: env_path("DW_GATEWAY_RESULT_STORE"),
            auth_store_path: env_path("DW_GATEWAY_AUTH_STORE"),
            session_signing_key: env_string(
                "DW_GATEWAY_SESSION_SIGNING_KEY",
                DEFAULT_SESSION_SIGNING_KEY,
            ),
            session_ttl_seconds: env_u64("DW_GATEWAY_SESSION_TTL_SECONDS", DEFAULT_SESSION_TTL_SECONDS),
            bcrypt_cost: env_u64("DW_GATEWAY_BCRYPT_COST", u64::from(bcrypt::DEFAULT_COST)) as u32,
            admin_emails: parse_csv(env_string("DW_GATEWAY_ADMIN_EMAILS", DEFAULT_ADMIN_EMAILS))
                .into_iter()
                .map(|email| email.to_lowercase())
                .collect(),
            worker_base_url: env_string("DW_GATEWAY_WORKER_BASE_URL", DEFAULT_WORKER_BASE_URL),
            worker_timeout_ms: env_u64("DW_GATEWAY_WORKER_TIMEOUT_MS", DEFAULT_WORKER_TIMEOUT_MS),
            max_upload_bytes: env_u64(
                "DW_GATEWAY_MAX_UPLOAD_BYTES",
                DEFAULT_MAX_UPLOAD_BYTES as u64,
            ) as usize,
        })
    }

    /// Configuration for in-process tests: scratch-dir stores, in-memory
    /// audit database, short worker timeout, fixed signing key.
    pub fn for_tests(scratch_dir: PathBuf) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: "warn".to_string(),
            upload_dir: scratch_dir.join("uploads"),
            audit_db_path: None,
            job_store_path: Some(scratch_dir.join("job-store.json")),
            result_store_path: Some(scratch_dir.join("result-store.json")),
            auth_store_path: Some(scratch_dir.join("auth-store.json")),
            session_signing_key: "datawash-test-session-key".to_string(),
            session_ttl_seconds: 3_600,
            // bcrypt's minimum cost (the crate does not export `MIN_COST`).
            bcrypt_cost: 4,
            admin_emails: vec!["admin@datawash.test".to_string()],
            worker_base_url: "http://127.0.0.1:9".to_string(),
            worker_timeout_ms: 1_000,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_csv(raw: String) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied_without_env() {
        let config = Config::for_tests(PathBuf::from("/tmp/datawash-test"));
        assert_eq!(config.session_ttl_seconds, 3_600);
        assert!(config.audit_db_path.is_none());
        assert_eq!(config.admin_emails, vec!["admin@datawash.test"]);
    }

    #[test]
    fn csv_parsing_trims_and_drops_empty_entries() {
        let parsed = parse_csv(" a@x.test , ,b@x.test,".to_string());
        assert_eq!(parsed, vec!["a@x.test", "b@x.test"]);
    }
}
