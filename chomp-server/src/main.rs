//! Thin read-only server: the retriever (HTTP reads of cache/TSDB) and the
//! forwarder (WS bridge of coordination-store pub/sub), CORS-open, rate
//! limited (spec.md §1's stated server interface). Grounded on
//! `mmoldb-app/src/main.rs`'s Rocket bootstrap (`rocket_db_pools` redis
//! fairing, CORS, figment-constructed DB url), generalized from its
//! baseball-domain templated pages to the two boundary route groups named
//! in `examples/original_source/src/server/__init__.py::start`.

mod error;
mod forwarder;
mod limiter;
mod retriever;
mod state;

use std::sync::Arc;

use chomp_core::{ChompConfig, CliArgs, CoordinationConfig, CoordinationStore};
use chomp_tsdb::{PostgresAdapter, TsdbAdapter};
use clap::Parser;
use log::{error, info};
use rocket::{Build, Rocket};

use crate::state::AppState;

#[rocket::main]
async fn main() -> miette::Result<()> {
    let cli = CliArgs::parse();
    let config = ChompConfig::load(&cli).unwrap_or_else(|e| {
        eprintln!("config validation failed: {e}");
        std::process::exit(1);
    });

    env_logger::Builder::from_default_env()
        .filter_level(if config.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let coordination_config = CoordinationConfig::from_env();
    let redis_url = coordination_config.redis_url();
    let coordination = CoordinationStore::connect(&redis_url, coordination_config.ns.clone(), config.proc_id.clone())
        .await
        .map_err(|e| miette::miette!("failed to connect to coordination store: {e}"))?;

    let mut adapter = PostgresAdapter::from_env(coordination_config.max_connections);
    adapter.connect().await.map_err(|e| miette::miette!("failed to connect to TSDB: {e}"))?;
    let tsdb: Arc<dyn TsdbAdapter> = Arc::new(adapter);

    let state = AppState {
        config: config.clone(),
        coordination: Arc::new(coordination),
        tsdb,
        redis_url,
    };

    if let Err(e) = rocket(state, &config).launch().await {
        error!("server error: {e}");
        return Err(miette::miette!("{e}"));
    }
    info!("server shut down cleanly");
    Ok(())
}

fn rocket(state: AppState, config: &ChompConfig) -> Rocket<Build> {
    let cors = rocket_cors::CorsOptions::default().to_cors().expect("CORS specification should be valid");

    let figment = rocket::Config::figment()
        .merge(("address", config.host.clone()))
        .merge(("port", config.port));

    rocket::custom(figment)
        .attach(cors)
        .manage(state)
        .mount("/", retriever::routes())
        .mount("/", forwarder::routes())
}
