//! The five ingester families (spec.md §4.6), each exposing a `schedule`
//! function that registers its tick callback (and, for the streaming
//! families, its long-lived subscription tasks) with the [`Scheduler`].
//! Grounded file-by-file on `examples/original_source/src/collectors/*.py`.

pub mod evm_abi;
pub mod evm_caller;
pub mod evm_logger;
pub mod http_api;
pub mod scrapper;
pub mod ws_api;

use std::sync::Arc;
use std::time::Duration;

use chomp_core::{CoordinationError, Interval};
use log::warn;
use tokio::sync::Mutex;

use crate::context::Context;

/// Claims (or renews, since the claim is re-entrant for the same proc id)
/// the task on entry to a tick, matching every family's shared
/// `ensure_claim_task(c)` first step (spec.md §4.6).
pub async fn ensure_claim(ctx: &Context, ingester_id: &str, interval: Interval) -> Result<bool, CoordinationError> {
    let ttl = Duration::from_secs((interval.to_seconds() as u64 * 12) / 10 + 1);
    let claimed = ctx.coordination.claim(ingester_id, ttl).await?;
    if !claimed {
        warn!("ingester {ingester_id} is claimed by another worker, skipping tick");
    }
    Ok(claimed)
}

/// A per-route memoization cache scoped to a single ingester instance,
/// cleared after each tick (spec.md §4.6.1/§4.6.2's "local caches cleared").
pub type RouteCache<V> = Arc<Mutex<std::collections::HashMap<String, V>>>;

pub fn route_cache<V>() -> RouteCache<V> {
    Arc::new(Mutex::new(std::collections::HashMap::new()))
}

/// Substitutes `{field_name}` tokens in a URL template from already-set
/// sibling field values, mirroring `http_api.py`'s
/// `url.strip().format(**c.data_by_field)`.
pub fn substitute_fields(template: &str, ingester: &chomp_core::Ingester) -> String {
    let mut out = template.trim().to_string();
    for field in &ingester.fields {
        if let Some(value) = &field.value {
            out = out.replace(&format!("{{{}}}", field.name), &value.to_string());
        }
    }
    out
}
