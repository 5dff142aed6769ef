//! Process bootstrap (spec.md §4.7's "Bootstrap enumerates ingesters..." and
//! §6's exit codes). Grounded on `mmoldb-ingest/src/main.rs`'s
//! `Notify`/`CancellationToken` orchestration, generalized from one
//! hardcoded raw-game/process-games pair of tasks to the five
//! config-driven ingester families.

mod context;
mod families;
mod scheduler;
mod select;
mod store;

use std::process::ExitCode;
use std::sync::Arc;

use chomp_core::{ChompConfig, CliArgs, CoordinationConfig, CoordinationStore};
use chomp_tsdb::{PostgresAdapter, TsdbAdapter};
use clap::Parser;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::scheduler::{Job, Scheduler};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ChompConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("config validation failed: {e}");
            return ExitCode::from(1);
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(if config.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    // The dotfile loader is an external collaborator (out of scope): `config.env`
    // names the path but loading it into the process environment happens upstream.

    let raw_config = match load_ingester_config(&config.config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load ingester config {}: {e}", config.config_path);
            return ExitCode::from(1);
        }
    };
    let mut ingester_config = match raw_config.finalize() {
        Ok(c) => c,
        Err(e) => {
            error!("ingester config validation failed: {e}");
            return ExitCode::from(1);
        }
    };

    match run(config, &mut ingester_config).await {
        Ok(()) => ExitCode::from(0),
        Err(code) => ExitCode::from(code),
    }
}

fn load_ingester_config(path: &str) -> Result<chomp_core::Config, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&raw)?)
}

async fn run(config: ChompConfig, ingester_config: &mut chomp_core::Config) -> Result<(), u8> {
    let coordination_config = CoordinationConfig::from_env();
    let coordination = CoordinationStore::connect(&coordination_config.redis_url(), coordination_config.ns.clone(), config.proc_id.clone())
        .await
        .map_err(|e| {
            error!("failed to connect to coordination store: {e}");
            2
        })?;

    let mut adapter = PostgresAdapter::from_env(coordination_config.max_connections);
    adapter.connect().await.map_err(|e| {
        error!("failed to connect to TSDB: {e}");
        2
    })?;
    chomp_tsdb::run_migrations(&chomp_tsdb::postgres_url_from_environment()).map_err(|e| {
        error!("failed to run migrations: {e}");
        2
    })?;
    let tsdb: Arc<dyn TsdbAdapter> = Arc::new(adapter);

    let rpc = build_rpc_registry(ingester_config).await;
    let ctx = Context::new(config.clone(), coordination, tsdb, rpc);

    let scheduler = Arc::new(Scheduler::new(config.threaded));
    let cancel = CancellationToken::new();
    let mut ws_handles = Vec::new();
    let mut registered = 0usize;

    for ingester in ingester_config.all_ingesters_mut() {
        if registered >= config.max_jobs {
            warn!("max_jobs ({}) reached, skipping remaining ingesters", config.max_jobs);
            break;
        }
        if matches!(ctx.coordination.is_claimed(&ingester.id, true).await, Ok(true)) {
            info!("ingester {} already claimed by another worker, skipping", ingester.name);
            continue;
        }

        let job: Job = match ingester.ingester_type {
            Some(chomp_core::IngesterType::Scrapper) => families::scrapper::schedule(ctx.clone(), ingester.clone()),
            Some(chomp_core::IngesterType::HttpApi) => families::http_api::schedule(ctx.clone(), ingester.clone()),
            Some(chomp_core::IngesterType::WsApi) => {
                let (job, handles) = families::ws_api::schedule(ctx.clone(), ingester.clone(), cancel.clone());
                ws_handles.extend(handles);
                job
            }
            Some(chomp_core::IngesterType::EvmCaller) => families::evm_caller::schedule(ctx.clone(), ingester.clone()),
            Some(chomp_core::IngesterType::EvmLogger) => families::evm_logger::schedule(ctx.clone(), ingester.clone()),
            None => {
                warn!("ingester {} has no resolved type, skipping", ingester.name);
                continue;
            }
        };

        if let Err(e) = scheduler.add(&ingester.id, ingester.interval, job).await {
            error!("failed to register ingester {}: {e}", ingester.name);
            continue;
        }
        registered += 1;
    }

    info!("registered {registered} ingester(s), starting scheduler");
    let monitor_handles = scheduler.clone().start(cancel.clone()).await;

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received, cancelling all monitors");
    cancel.cancel();

    for handle in monitor_handles.into_iter().chain(ws_handles) {
        let _ = handle.await;
    }

    for ingester in ingester_config.all_ingesters() {
        let _ = ctx.coordination.free(&ingester.id).await;
    }

    info!("shutdown complete");
    Ok(())
}

/// Builds one [`chomp_core::RpcPool`] per chain id referenced by any EVM
/// ingester's fields, reading `HTTP_RPCS_<chain_id>` at bootstrap
/// (spec.md §4.4, §6).
async fn build_rpc_registry(config: &chomp_core::Config) -> chomp_core::RpcRegistry {
    let mut chain_ids = std::collections::HashSet::new();
    for ingester in config.evm_caller.iter().chain(config.evm_logger.iter()) {
        for field in &ingester.fields {
            if let Some(target) = &field.target {
                if let Some((chain_id, _)) = families::evm_abi::parse_chain_addr(target) {
                    chain_ids.insert(chain_id);
                }
            }
        }
    }

    let mut registry = chomp_core::RpcRegistry::new();
    for chain_id in chain_ids {
        let urls = chomp_core::config::http_rpcs_for_chain(chain_id);
        if urls.is_empty() {
            warn!("no HTTP_RPCS_{chain_id} configured, skipping chain");
            continue;
        }
        match chomp_core::RpcPool::new(chain_id, urls) {
            Ok(pool) => {
                pool.refresh_liveness().await;
                registry.insert(pool);
            }
            Err(e) => error!("failed to build RPC pool for chain {chain_id}: {e}"),
        }
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_ingester_config_parses_yaml() {
        let path = std::env::temp_dir().join(format!("chomp-ingest-test-{}.yaml", std::process::id()));
        std::fs::write(&path, "http_api: []\n").unwrap();
        let loaded = load_ingester_config(path.to_str().unwrap());
        std::fs::remove_file(&path).ok();
        assert!(loaded.is_ok());
    }

    #[test]
    fn load_ingester_config_errors_on_missing_file() {
        assert!(load_ingester_config("/nonexistent/chomp-ingest-config.yaml").is_err());
    }
}
