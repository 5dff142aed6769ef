//! HTTP JSON API family (spec.md §4.6.2). Grounded on
//! `examples/original_source/src/collectors/http_api.py::schedule`/`collect`:
//! route-hash-memoized single fetch per tick, dotted/bracketed JSON
//! selection, per-field transform, store.

use std::sync::Arc;

use chomp_core::Ingester;
use log::error;
use tokio::sync::Mutex;

use crate::context::Context;
use crate::families::{ensure_claim, route_cache, substitute_fields};
use crate::scheduler::Job;
use crate::select::select_from_dict;
use crate::store::transform_and_store;

/// Builds the single recurring job this ingester contributes to its cron
/// slot. The Ingester lives behind one `Arc<Mutex<_>>` owned by this job
/// alone (spec.md §5's single-owner invariant: no other task ever touches
/// it); the per-route fetch memoization is reset at the top of every tick,
/// matching the Python `data_by_route` local dict.
pub fn schedule(ctx: Context, ingester: Ingester) -> Job {
    let id = ingester.id.clone();
    let state = Arc::new(Mutex::new(ingester));
    let cache = route_cache::<String>();

    Arc::new(move || {
        let ctx = ctx.clone();
        let id = id.clone();
        let cache = cache.clone();
        let state = state.clone();
        Box::pin(async move {
            let mut ingester = state.lock().await;
            let interval = ingester.interval;
            if !matches!(ensure_claim(&ctx, &id, interval).await, Ok(true)) {
                return;
            }
            collect(&ctx, &mut ingester, &cache).await;
        })
    })
}

async fn collect(ctx: &Context, ingester: &mut Ingester, cache: &crate::families::RouteCache<String>) {
    cache.lock().await.clear();
    let ttl_secs = ingester.interval.to_seconds().max(1) as u64;

    for i in 0..ingester.fields.len() {
        let Some(target) = ingester.fields[i].target.clone() else {
            continue;
        };
        let url = substitute_fields(&target, ingester);
        let route_hash = blake3::hash(format!("{url}:{}", ingester.interval.symbol()).as_bytes())
            .to_hex()
            .to_string();

        let cached = cache.lock().await.get(&route_hash).cloned();
        let body = match cached {
            Some(body) => body,
            None => {
                let text = match ctx
                    .coordination
                    .get_or_set(&route_hash, ttl_secs, || {
                        let http = ctx.http.clone();
                        let url = url.clone();
                        async move { chomp_core::fetch::fetch_text(&http, &url).await.ok() }
                    })
                    .await
                {
                    Ok(Some(text)) => text,
                    Ok(None) => {
                        error!("no cached or fetched body for {url}, skipping field {}", ingester.fields[i].name);
                        continue;
                    }
                    Err(e) => {
                        error!("coordination store error fetching {url}: {e}");
                        continue;
                    }
                };
                cache.lock().await.insert(route_hash.clone(), text.clone());
                text
            }
        };

        let json: serde_json::Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(e) => {
                error!("failed to parse JSON response from {url}: {e}");
                continue;
            }
        };

        let selector = ingester.fields[i].selector.as_deref();
        let selected = select_from_dict(selector, &json);
        ingester.fields[i].value = selected.and_then(|v| chomp_core::FieldValue::from_json(ingester.fields[i].ty, v));
    }

    transform_and_store(ingester, ctx.tsdb.as_ref(), &ctx.coordination).await;
}
