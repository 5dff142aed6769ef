//! Per-chain JSON-RPC pools for the EVM ingester families (spec.md §4.4).
//! Endpoints come from `HTTP_RPCS_<chain_id>` (see [`crate::config::http_rpcs_for_chain`]);
//! selection rotates round-robin with a first-use liveness check, matching
//! `examples/original_source/src/utils/proxies.py`'s `Web3Proxy.client`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::transports::http::reqwest::Url;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no RPC endpoints configured for chain {0}")]
    NoEndpoints(u64),
    #[error("invalid RPC url `{0}`")]
    InvalidUrl(String),
    #[error("all {0} RPC endpoints for chain {1} failed liveness check")]
    AllDead(usize, u64),
}

struct Endpoint {
    url: Url,
    provider: RootProvider,
    alive: std::sync::atomic::AtomicBool,
}

/// A rotating pool of HTTP providers for one chain. Cheaply cloneable: the
/// endpoint list and cursor are shared behind an `Arc`.
#[derive(Clone)]
pub struct RpcPool {
    chain_id: u64,
    endpoints: Arc<Vec<Endpoint>>,
    cursor: Arc<AtomicUsize>,
}

impl RpcPool {
    pub fn new(chain_id: u64, urls: Vec<String>) -> Result<Self, RpcError> {
        if urls.is_empty() {
            return Err(RpcError::NoEndpoints(chain_id));
        }
        let endpoints = urls
            .into_iter()
            .map(|raw| {
                let url: Url = raw.parse().map_err(|_| RpcError::InvalidUrl(raw.clone()))?;
                let provider = ProviderBuilder::new().on_http(url.clone());
                Ok(Endpoint {
                    url,
                    provider,
                    alive: std::sync::atomic::AtomicBool::new(true),
                })
            })
            .collect::<Result<Vec<_>, RpcError>>()?;

        Ok(Self {
            chain_id,
            endpoints: Arc::new(endpoints),
            cursor: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Picks the next endpoint marked alive, rolling round-robin. Returns
    /// `AllDead` if every endpoint has been marked down by a prior
    /// [`Self::mark_dead`] call; callers should treat that as
    /// fleet-exhausted for this tick, not retry forever.
    pub fn next(&self) -> Result<(usize, &RootProvider), RpcError> {
        let n = self.endpoints.len();
        for _ in 0..n {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            if self.endpoints[idx].alive.load(Ordering::Relaxed) {
                return Ok((idx, &self.endpoints[idx].provider));
            }
        }
        Err(RpcError::AllDead(n, self.chain_id))
    }

    pub fn mark_dead(&self, idx: usize) {
        if let Some(ep) = self.endpoints.get(idx) {
            ep.alive.store(false, Ordering::Relaxed);
        }
    }

    pub fn mark_alive(&self, idx: usize) {
        if let Some(ep) = self.endpoints.get(idx) {
            ep.alive.store(true, Ordering::Relaxed);
        }
    }

    pub fn url_at(&self, idx: usize) -> Option<&Url> {
        self.endpoints.get(idx).map(|e| &e.url)
    }

    /// Pings `eth_blockNumber` on every endpoint and resets liveness flags
    /// accordingly. Run once at startup and whenever `AllDead` is hit, so a
    /// transient outage doesn't permanently retire an endpoint.
    pub async fn refresh_liveness(&self) {
        for (idx, ep) in self.endpoints.iter().enumerate() {
            let ok = ep.provider.get_block_number().await.is_ok();
            if ok {
                self.mark_alive(idx);
            } else {
                self.mark_dead(idx);
            }
        }
    }
}

/// Holds one [`RpcPool`] per chain, built from `HTTP_RPCS_<chain_id>` at
/// bootstrap (spec.md §4.4, §6 "process startup").
#[derive(Clone, Default)]
pub struct RpcRegistry {
    pools: std::collections::HashMap<u64, RpcPool>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pool: RpcPool) {
        self.pools.insert(pool.chain_id(), pool);
    }

    pub fn get(&self, chain_id: u64) -> Result<&RpcPool, RpcError> {
        self.pools.get(&chain_id).ok_or(RpcError::NoEndpoints(chain_id))
    }

    pub fn chains(&self) -> impl Iterator<Item = u64> + '_ {
        self.pools.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_empty_endpoint_list() {
        let err = RpcPool::new(1, vec![]).unwrap_err();
        assert!(matches!(err, RpcError::NoEndpoints(1)));
    }

    #[test]
    fn rotates_across_endpoints() {
        let pool = RpcPool::new(
            1,
            vec![
                "http://a.example".to_string(),
                "http://b.example".to_string(),
            ],
        )
        .unwrap();
        let (first, _) = pool.next().unwrap();
        let (second, _) = pool.next().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn skips_dead_endpoints() {
        let pool = RpcPool::new(
            1,
            vec![
                "http://a.example".to_string(),
                "http://b.example".to_string(),
            ],
        )
        .unwrap();
        pool.mark_dead(0);
        for _ in 0..4 {
            let (idx, _) = pool.next().unwrap();
            assert_eq!(idx, 1);
        }
    }

    #[test]
    fn all_dead_is_reported() {
        let pool = RpcPool::new(1, vec!["http://a.example".to_string()]).unwrap();
        pool.mark_dead(0);
        assert!(matches!(pool.next(), Err(RpcError::AllDead(1, 1))));
    }

    proptest! {
        /// Rotation fairness (spec.md §4.4): over one lap of `n` calls to
        /// `next()`, every endpoint is selected exactly once, regardless of
        /// pool size or starting cursor position.
        #[test]
        fn round_robin_covers_every_endpoint_once_per_lap(n in 2usize..8, warmup in 0usize..10) {
            let urls: Vec<String> = (0..n).map(|i| format!("http://host{i}.example")).collect();
            let pool = RpcPool::new(1, urls).unwrap();
            for _ in 0..warmup {
                let _ = pool.next();
            }
            let mut seen = std::collections::HashSet::new();
            for _ in 0..n {
                let (idx, _) = pool.next().unwrap();
                seen.insert(idx);
            }
            prop_assert_eq!(seen.len(), n);
        }

        /// A dead endpoint is never returned by `next()` while any other
        /// endpoint remains alive.
        #[test]
        fn dead_endpoints_are_never_selected(n in 2usize..8, dead_idx in 0usize..8, laps in 1usize..5) {
            let dead_idx = dead_idx % n;
            let urls: Vec<String> = (0..n).map(|i| format!("http://host{i}.example")).collect();
            let pool = RpcPool::new(1, urls).unwrap();
            pool.mark_dead(dead_idx);
            for _ in 0..(n * laps) {
                let (idx, _) = pool.next().unwrap();
                prop_assert_ne!(idx, dead_idx);
            }
        }
    }
}
