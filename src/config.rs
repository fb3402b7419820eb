//!
//! kvgate server configuration
//! ---------------------------
//! Resolved once at startup. Precedence: CLI flag, then `KVGATE_*` environment
//! variable, then the built-in default.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HTTP_PORT: u16 = 7979;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_PERSIST_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_RATE_LIMIT: u32 = 100;
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 15 * 60;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub http_port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// 0 disables background snapshots; the store then only saves on clear and shutdown.
    pub persist_interval_ms: u64,
    /// Optional seed file of identity records imported at startup.
    pub identities_file: Option<PathBuf>,
    pub clear_all_key: Option<String>,
    /// Requests per client address per window on the storage routes. 0 disables limiting.
    pub rate_limit: u32,
    pub rate_window_secs: u64,
    pub session_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            bind: DEFAULT_BIND.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            persist_interval_ms: DEFAULT_PERSIST_INTERVAL_MS,
            identities_file: None,
            clear_all_key: None,
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window_secs: DEFAULT_RATE_WINDOW_SECS,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn string_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag {
            return args.get(i + 1).map(String::as_str);
        }
        i += 1;
    }
    None
}

fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    arg_value(args, flag).and_then(|v| v.parse::<T>().ok())
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

impl ServerConfig {
    /// Resolve from process arguments (including argv[0]) and the environment.
    pub fn from_args_and_env(args: &[String]) -> Self {
        let d = Self::default();
        Self {
            http_port: parse_arg(args, "--http-port").or_else(|| parse_env("KVGATE_HTTP_PORT")).unwrap_or(d.http_port),
            bind: arg_value(args, "--bind").map(str::to_string).or_else(|| string_env("KVGATE_BIND")).unwrap_or(d.bind),
            data_dir: arg_value(args, "--data-dir")
                .map(PathBuf::from)
                .or_else(|| string_env("KVGATE_DATA_DIR").map(PathBuf::from))
                .unwrap_or(d.data_dir),
            persist_interval_ms: parse_arg(args, "--persist-interval-ms")
                .or_else(|| parse_env("KVGATE_PERSIST_INTERVAL_MS"))
                .unwrap_or(d.persist_interval_ms),
            identities_file: arg_value(args, "--identities")
                .map(PathBuf::from)
                .or_else(|| string_env("KVGATE_IDENTITIES").map(PathBuf::from)),
            // Secret only from the environment so it stays out of process listings.
            clear_all_key: string_env("KVGATE_CLEAR_ALL_KEY"),
            rate_limit: parse_arg(args, "--rate-limit").or_else(|| parse_env("KVGATE_RATE_LIMIT")).unwrap_or(d.rate_limit),
            rate_window_secs: parse_arg(args, "--rate-window-secs")
                .or_else(|| parse_env("KVGATE_RATE_WINDOW_SECS"))
                .unwrap_or(d.rate_window_secs),
            session_ttl_secs: parse_env("KVGATE_SESSION_TTL_SECS").unwrap_or(d.session_ttl_secs),
        }
    }

    pub fn rate_window(&self) -> Duration { Duration::from_secs(self.rate_window_secs.max(1)) }

    pub fn session_ttl(&self) -> Duration { Duration::from_secs(self.session_ttl_secs) }

    pub fn addr(&self) -> String { format!("{}:{}", self.bind, self.http_port) }

    pub fn usage() -> &'static str {
        "kvgate Server\n\nUSAGE:\n  kvgate_server [--http-port N] [--bind ADDR] [--data-dir PATH] [--identities FILE]\n\nOPTIONS:\n  --http-port N              HTTP port (env: KVGATE_HTTP_PORT, default 7979)\n  --bind ADDR                Bind address (env: KVGATE_BIND, default 0.0.0.0)\n  --data-dir PATH            Snapshot and identity folder (env: KVGATE_DATA_DIR, default data)\n  --persist-interval-ms N    Snapshot interval, 0 disables (env: KVGATE_PERSIST_INTERVAL_MS, default 5000)\n  --identities FILE          Identity seed file (env: KVGATE_IDENTITIES)\n  --rate-limit N             Requests per window per client, 0 disables (env: KVGATE_RATE_LIMIT, default 100)\n  --rate-window-secs N       Rate limit window (env: KVGATE_RATE_WINDOW_SECS, default 900)\n\nENVIRONMENT:\n  KVGATE_CLEAR_ALL_KEY       Shared secret for POST /clearAll; unset disables it\n  KVGATE_SESSION_TTL_SECS    Bearer token lifetime (default 3600)\n  RUST_LOG                   tracing filter\n"
    }
}
