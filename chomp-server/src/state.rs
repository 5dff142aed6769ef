//! Process-scoped state managed by Rocket and shared by every route. Grounded
//! on `chomp-ingest/src/context.rs`'s shared-handle pattern (config +
//! `Arc`-shared clients, no singleton statics), reused here for the
//! read-only server process.

use std::sync::Arc;

use chomp_core::{ChompConfig, CoordinationStore};
use chomp_tsdb::TsdbAdapter;

#[derive(Clone)]
pub struct AppState {
    pub config: ChompConfig,
    pub coordination: Arc<CoordinationStore>,
    pub tsdb: Arc<dyn TsdbAdapter>,
    pub redis_url: String,
}
