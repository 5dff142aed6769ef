//! Process-scoped Context carried into every ingester tick, resolving
//! spec.md §9's "global mutable state" design note: one struct populated at
//! bootstrap, passed by `Arc` reference rather than reached for through
//! singletons. Grounded on `mmoldb-ingest/src/main.rs`'s own shared-handle
//! pattern (`url`/`notify`/`finish` threaded through spawned tasks).

use std::sync::Arc;

use chomp_core::{ChompConfig, CoordinationStore, RpcRegistry};
use chomp_tsdb::TsdbAdapter;

/// Everything an ingester family needs to run a tick, minus the Ingester
/// itself. Cloning is cheap: every field is already `Arc`-shared or `Clone`.
#[derive(Clone)]
pub struct Context {
    pub config: ChompConfig,
    pub coordination: Arc<CoordinationStore>,
    pub tsdb: Arc<dyn TsdbAdapter>,
    pub rpc: Arc<RpcRegistry>,
    pub http: reqwest::Client,
}

impl Context {
    pub fn new(
        config: ChompConfig,
        coordination: CoordinationStore,
        tsdb: Arc<dyn TsdbAdapter>,
        rpc: RpcRegistry,
    ) -> Self {
        Self {
            config,
            coordination: Arc::new(coordination),
            tsdb,
            rpc: Arc::new(rpc),
            http: reqwest::Client::new(),
        }
    }
}
