//! Process configuration: CLI flags / env vars / config file, layered with
//! `figment` the way `mmoldb-ingest/src/config.rs` and `mmoldb-db/src/url.rs`
//! layer theirs. Every CLI flag is `Option<T>` so that an unset flag doesn't
//! shadow the corresponding env var, matching spec.md §6's precedence rule:
//! "every flag overrides the corresponding upper-cased env var; otherwise
//! env; otherwise default".

use clap::Parser;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

fn default_env_path() -> String {
    ".env".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_cooldown() -> u64 {
    2
}
fn default_max_jobs() -> usize {
    16
}
fn default_tsdb_adapter() -> String {
    "postgres".to_string()
}
fn default_config_path() -> String {
    "chomp.yml".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    40004
}
fn default_ws_ping_interval() -> u64 {
    15
}
fn default_ws_ping_timeout() -> u64 {
    10
}
fn random_proc_id() -> String {
    use rand::Rng;
    let suffix: u32 = rand::thread_rng().gen();
    format!("chomp-{suffix:08x}")
}

/// Resolved process configuration (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChompConfig {
    #[serde(default = "default_env_path")]
    pub env: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "random_proc_id")]
    pub proc_id: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_cooldown")]
    pub retry_cooldown: u64,
    #[serde(default = "default_threaded")]
    pub threaded: bool,
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    #[serde(default = "default_tsdb_adapter")]
    pub tsdb_adapter: String,
    #[serde(default = "default_config_path")]
    pub config_path: String,
    #[serde(default)]
    pub perpetual_indexing: bool,
    #[serde(default)]
    pub server: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ws_ping_interval")]
    pub ws_ping_interval: u64,
    #[serde(default = "default_ws_ping_timeout")]
    pub ws_ping_timeout: u64,
}

fn default_threaded() -> bool {
    true
}

impl Default for ChompConfig {
    fn default() -> Self {
        Self {
            env: default_env_path(),
            verbose: false,
            proc_id: random_proc_id(),
            max_retries: default_max_retries(),
            retry_cooldown: default_retry_cooldown(),
            threaded: default_threaded(),
            max_jobs: default_max_jobs(),
            tsdb_adapter: default_tsdb_adapter(),
            config_path: default_config_path(),
            perpetual_indexing: false,
            server: false,
            host: default_host(),
            port: default_port(),
            ws_ping_interval: default_ws_ping_interval(),
            ws_ping_timeout: default_ws_ping_timeout(),
        }
    }
}

/// The CLI surface, out of core scope per spec.md §1 ("the CLI/argument
/// parser" is an external collaborator) but given here to its stated
/// interface: every field optional so only explicitly-passed flags override
/// env/defaults in the Figment merge below.
#[derive(Debug, Parser, Default, Serialize)]
#[command(name = "chomp", about = "Horizontally scalable ingestion fleet")]
pub struct CliArgs {
    #[arg(long)]
    pub env: Option<String>,
    #[arg(long)]
    pub verbose: bool,
    #[arg(long)]
    pub proc_id: Option<String>,
    #[arg(long)]
    pub max_retries: Option<u32>,
    #[arg(long)]
    pub retry_cooldown: Option<u64>,
    #[arg(long)]
    pub threaded: Option<bool>,
    #[arg(long)]
    pub max_jobs: Option<usize>,
    #[arg(long)]
    pub tsdb_adapter: Option<String>,
    #[arg(long)]
    pub config_path: Option<String>,
    #[arg(long)]
    pub perpetual_indexing: bool,
    #[arg(long)]
    pub server: bool,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub ws_ping_interval: Option<u64>,
    #[arg(long)]
    pub ws_ping_timeout: Option<u64>,
}

impl ChompConfig {
    pub fn figment(cli: &CliArgs) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ChompConfig::default()))
            .merge(Toml::file("chomp.toml"))
            .merge(Env::prefixed("CHOMP_"))
            .merge(Env::raw());

        macro_rules! merge_flag {
            ($field:ident) => {
                if let Some(v) = &cli.$field {
                    figment = figment.clone().merge(Serialized::default(
                        stringify!($field),
                        v.clone(),
                    ));
                }
            };
        }
        merge_flag!(env);
        merge_flag!(proc_id);
        merge_flag!(max_retries);
        merge_flag!(retry_cooldown);
        merge_flag!(threaded);
        merge_flag!(max_jobs);
        merge_flag!(tsdb_adapter);
        merge_flag!(config_path);
        merge_flag!(host);
        merge_flag!(port);
        merge_flag!(ws_ping_interval);
        merge_flag!(ws_ping_timeout);

        if cli.verbose {
            figment = figment.merge(Serialized::default("verbose", true));
        }
        if cli.perpetual_indexing {
            figment = figment.merge(Serialized::default("perpetual_indexing", true));
        }
        if cli.server {
            figment = figment.merge(Serialized::default("server", true));
        }

        figment
    }

    pub fn load(cli: &CliArgs) -> figment::Result<Self> {
        Self::figment(cli).extract()
    }
}

/// `HTTP_RPCS_<chain_id>` environment lookup for the RPC pool (spec.md §4.4).
pub fn http_rpcs_for_chain(chain_id: u64) -> Vec<String> {
    std::env::var(format!("HTTP_RPCS_{chain_id}"))
        .ok()
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Coordination-store (redis) connection settings:
/// `REDIS_HOST/PORT/DB/MAX_CONNECTIONS/NS`, `DB_RW_USER/PASS`.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_namespace")]
    pub ns: String,
    pub db_rw_user: Option<String>,
    pub db_rw_pass: Option<String>,
}

fn default_redis_host() -> String {
    "localhost".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_max_connections() -> u32 {
    16
}
fn default_namespace() -> String {
    "chomp".to_string()
}

impl CoordinationConfig {
    /// The env vars here don't share a single prefix (`REDIS_*` vs.
    /// `DB_RW_*`), so they're read directly rather than through a single
    /// `Env::prefixed` figment layer (mirrors `mmoldb-db/src/url.rs`'s manual
    /// env reads for the same reason).
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("REDIS_HOST").unwrap_or_else(|_| default_redis_host()),
            port: std::env::var("REDIS_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_redis_port),
            db: std::env::var("REDIS_DB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            max_connections: std::env::var("REDIS_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_connections),
            ns: std::env::var("REDIS_NS").unwrap_or_else(|_| default_namespace()),
            db_rw_user: std::env::var("DB_RW_USER").ok(),
            db_rw_pass: std::env::var("DB_RW_PASS").ok(),
        }
    }

    pub fn redis_url(&self) -> String {
        match (&self.db_rw_user, &self.db_rw_pass) {
            (Some(user), Some(pass)) => {
                format!(
                    "redis://{user}:{pass}@{}:{}/{}",
                    self.host, self.port, self.db
                )
            }
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_loads() {
        let cli = CliArgs::default();
        let cfg = ChompConfig::load(&cli).unwrap();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.max_jobs, 16);
        assert!(cfg.threaded);
    }

    #[test]
    fn cli_flag_overrides_default() {
        let mut cli = CliArgs::default();
        cli.max_retries = Some(9);
        let cfg = ChompConfig::load(&cli).unwrap();
        assert_eq!(cfg.max_retries, 9);
    }
}
