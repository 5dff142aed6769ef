//! EVM event-log family (spec.md §4.6.5). Grounded on
//! `examples/original_source/src/collectors/evm_logger.py::schedule`/
//! `collect`/`decode_log_data`: one `eth_getLogs` filter per contract
//! covering every referenced event's topic0, a tracked `last_block_by_contract`
//! watermark, indexed-first ABI decode reordered to declaration order.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::dyn_abi::DynSolType;
use alloy::primitives::{keccak256, Address, B256};
use alloy::providers::Provider;
use alloy::rpc::types::Filter;
use chomp_core::{FieldValue, Ingester};
use log::{error, info};
use tokio::sync::Mutex;

use crate::context::Context;
use crate::families::evm_abi::{canonical_signature, dyn_value_to_json, parse_chain_addr, parse_event_signature, reorder_decoded};
use crate::families::ensure_claim;
use crate::scheduler::Job;
use crate::store::transform_and_store;

struct EventSpec {
    field_name: String,
    topic0: B256,
    types: Vec<DynSolType>,
    indexed: Vec<bool>,
}

struct ContractState {
    chain_id: u64,
    address: Address,
    events: Vec<EventSpec>,
    last_block: Option<u64>,
}

/// Builds the single recurring job this ingester contributes to its cron
/// slot. Per-contract state (including the `last_block` watermark) lives
/// alongside the Ingester behind one `Arc<Mutex<_>>` owned by this job alone
/// (spec.md §5).
pub fn schedule(ctx: Context, ingester: Ingester) -> Job {
    let id = ingester.id.clone();

    let mut contracts: HashMap<String, ContractState> = HashMap::new();
    for field in &ingester.fields {
        let (Some(target), Some(signature)) = (field.target.as_deref(), field.selector.as_deref()) else {
            continue;
        };
        let Some((chain_id, address)) = parse_chain_addr(target) else {
            error!("invalid EVM contract target {target} for {}.{}", ingester.name, field.name);
            continue;
        };
        let Some((name, types, indexed)) = parse_event_signature(signature) else {
            error!("invalid event signature {signature} for {}.{}", ingester.name, field.name);
            continue;
        };
        let topic0 = keccak256(canonical_signature(&name, &types).as_bytes());

        contracts
            .entry(target.to_string())
            .or_insert_with(|| ContractState { chain_id, address, events: Vec::new(), last_block: None })
            .events
            .push(EventSpec { field_name: field.name.clone(), topic0, types, indexed });
    }

    let state = Arc::new(Mutex::new(ingester));
    let contracts = Arc::new(Mutex::new(contracts));

    Arc::new(move || {
        let ctx = ctx.clone();
        let id = id.clone();
        let state = state.clone();
        let contracts = contracts.clone();
        Box::pin(async move {
            let mut ingester = state.lock().await;
            let interval = ingester.interval;
            if !matches!(ensure_claim(&ctx, &id, interval).await, Ok(true)) {
                return;
            }
            let mut contracts = contracts.lock().await;
            collect(&ctx, &mut ingester, &mut contracts).await;
        })
    })
}

async fn collect(ctx: &Context, ingester: &mut Ingester, contracts: &mut HashMap<String, ContractState>) {
    let mut results: HashMap<String, serde_json::Value> = HashMap::new();

    for contract in contracts.values_mut() {
        let Ok(pool) = ctx.rpc.get(contract.chain_id) else {
            error!("no RPC pool configured for chain {}", contract.chain_id);
            continue;
        };

        let mut retry_count = 0;
        loop {
            let Ok((idx, provider)) = pool.next() else {
                error!("all RPC endpoints exhausted for chain {}", contract.chain_id);
                break;
            };

            let current_block = match provider.get_block_number().await {
                Ok(n) => n,
                Err(e) => {
                    error!("failed to read block number for chain {}: {e}", contract.chain_id);
                    pool.mark_dead(idx);
                    retry_count += 1;
                    if retry_count >= ctx.config.max_retries {
                        break;
                    }
                    continue;
                }
            };
            let from_block = contract.last_block.unwrap_or(current_block);
            if from_block >= current_block {
                info!("no new blocks for {}, skipping event polling", contract.address);
                break;
            }

            let topics: Vec<B256> = contract.events.iter().map(|e| e.topic0).collect();
            let filter = Filter::new()
                .address(contract.address)
                .from_block(from_block + 1)
                .to_block(current_block)
                .event_signature(topics);

            match provider.get_logs(&filter).await {
                Ok(logs) => {
                    for log in logs {
                        decode_log(contract, &log, &mut results);
                    }
                    contract.last_block = Some(current_block);
                    break;
                }
                Err(e) => {
                    error!("failed to poll event logs for contract {}: {e}", contract.address);
                    pool.mark_dead(idx);
                    retry_count += 1;
                    if retry_count >= ctx.config.max_retries {
                        break;
                    }
                }
            }
        }
    }

    for field in &mut ingester.fields {
        if let Some(value) = results.remove(&field.name) {
            field.value = FieldValue::from_json(field.ty, &value);
        }
    }

    transform_and_store(ingester, ctx.tsdb.as_ref(), &ctx.coordination).await;
}

/// Concatenates indexed topics then data, ABI-decodes against the
/// indexed-first type list, then reorders to the event's declared parameter
/// order (spec.md §4.6.5).
fn decode_log(contract: &ContractState, log: &alloy::rpc::types::Log, results: &mut HashMap<String, serde_json::Value>) {
    let Some(topic0) = log.topics().first() else { return };
    let Some(spec) = contract.events.iter().find(|e| &e.topic0 == topic0) else { return };

    let index_count = spec.indexed.iter().filter(|i| **i).count();
    let (index_types, non_index_types): (Vec<_>, Vec<_>) = spec
        .types
        .iter()
        .zip(&spec.indexed)
        .fold((Vec::new(), Vec::new()), |(mut idx, mut non_idx), (ty, is_indexed)| {
            if *is_indexed {
                idx.push(ty.clone());
            } else {
                non_idx.push(ty.clone());
            }
            (idx, non_idx)
        });

    let mut decoded = Vec::with_capacity(spec.types.len());
    for (topic, ty) in log.topics().iter().skip(1).zip(index_types.iter()) {
        if let Ok(v) = ty.abi_decode(topic.as_slice()) {
            decoded.push(dyn_value_to_json(&v));
        }
    }
    if !non_index_types.is_empty() {
        if let Ok(alloy::dyn_abi::DynSolValue::Tuple(values)) =
            DynSolType::Tuple(non_index_types).abi_decode_params(log.data().data.as_ref())
        {
            decoded.extend(values.iter().map(dyn_value_to_json));
        }
    }

    if decoded.len() != index_count + (spec.types.len() - index_count) {
        return;
    }
    let reordered = reorder_decoded(decoded, &spec.indexed);
    let value = if reordered.len() == 1 {
        reordered.into_iter().next().unwrap()
    } else {
        serde_json::Value::Array(reordered)
    };
    results.insert(spec.field_name.clone(), value);
}
