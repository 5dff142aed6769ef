//! ABI plumbing shared by the two EVM families (spec.md §4.6.4/§4.6.5).
//! Grounded on `examples/original_source/src/collectors/evm_caller.py` (the
//! `multicall` signature format `"name(intypes)(outtypes)"`) and
//! `evm_logger.py::parse_event_signature`/`decode_log_data`.

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::Address;
use serde_json::Value;

/// Converts a JSON call parameter into the `DynSolValue` its declared type
/// expects (strings parse as decimal/hex integers for numeric types).
pub fn json_to_dyn_value(ty: &DynSolType, v: &Value) -> Option<DynSolValue> {
    match ty {
        DynSolType::Address => v.as_str().and_then(|s| s.parse().ok()).map(DynSolValue::Address),
        DynSolType::Bool => v.as_bool().map(DynSolValue::Bool),
        DynSolType::String => v.as_str().map(|s| DynSolValue::String(s.to_string())),
        DynSolType::Uint(bits) => {
            let as_str = v.as_str().map(str::to_string).or_else(|| v.as_u64().map(|n| n.to_string()))?;
            alloy::primitives::U256::from_str_radix(as_str.trim_start_matches("0x"), if as_str.starts_with("0x") { 16 } else { 10 })
                .ok()
                .map(|n| DynSolValue::Uint(n, *bits))
        }
        DynSolType::Int(bits) => {
            let n = v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))?;
            Some(DynSolValue::Int(alloy::primitives::I256::try_from(n).ok()?, *bits))
        }
        DynSolType::Bytes => v.as_str().and_then(|s| hex::decode(s.trim_start_matches("0x")).ok()).map(DynSolValue::Bytes),
        _ => None,
    }
}

/// Converts a decoded `DynSolValue` to JSON, widening integers to string
/// form to avoid precision loss for values beyond `u64`/`i64`.
pub fn dyn_value_to_json(v: &DynSolValue) -> Value {
    match v {
        DynSolValue::Address(a) => Value::String(a.to_string()),
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Uint(n, _) => Value::String(n.to_string()),
        DynSolValue::Int(n, _) => Value::String(n.to_string()),
        DynSolValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::FixedBytes(b, _) => Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(dyn_value_to_json).collect())
        }
        _ => Value::Null,
    }
}

/// Splits `"1:0xabc..."` into `(chain_id, address)`; a bare address with no
/// `chain_id:` prefix defaults to chain 1 (spec.md §4.6.4).
pub fn parse_chain_addr(target: &str) -> Option<(u64, Address)> {
    match target.split_once(':') {
        Some((chain, addr)) => {
            let chain_id: u64 = chain.parse().ok()?;
            Some((chain_id, addr.parse().ok()?))
        }
        None => Some((1, target.parse().ok()?)),
    }
}

/// Parses a multicall-style `"name(in1,in2)(out1,out2)"` selector into its
/// function name plus input/output type lists.
pub fn parse_call_selector(selector: &str) -> Option<(String, Vec<DynSolType>, Vec<DynSolType>)> {
    let open_in = selector.find('(')?;
    let name = selector[..open_in].trim().to_string();
    let close_in = matching_paren(selector, open_in)?;
    let inputs = parse_type_list(&selector[open_in + 1..close_in])?;

    let rest = &selector[close_in + 1..];
    let open_out = rest.find('(')?;
    let close_out = matching_paren(rest, open_out)?;
    let outputs = parse_type_list(&rest[open_out + 1..close_out])?;

    Some((name, inputs, outputs))
}

/// Parses an event signature `"Transfer(address indexed from, address indexed to, uint256 amount)"`
/// into its name, parameter types in declared order, and each parameter's
/// `indexed` flag.
pub fn parse_event_signature(signature: &str) -> Option<(String, Vec<DynSolType>, Vec<bool>)> {
    let open = signature.find('(')?;
    let name = signature[..open].trim().to_string();
    let close = matching_paren(signature, open)?;
    let body = &signature[open + 1..close];

    let mut types = Vec::new();
    let mut indexed = Vec::new();
    if !body.trim().is_empty() {
        for param in split_top_level(body) {
            let param = param.trim();
            let indexed_param = param.contains("indexed");
            let ty_str = param
                .split_whitespace()
                .find(|tok| *tok != "indexed")
                .unwrap_or(param);
            types.push(DynSolType::parse(ty_str).ok()?);
            indexed.push(indexed_param);
        }
    }
    Some((name, types, indexed))
}

/// The canonical `name(type1,type2)` signature used to derive the
/// 4-byte function selector or the event's topic0 hash.
pub fn canonical_signature(name: &str, types: &[DynSolType]) -> String {
    let joined: Vec<String> = types.iter().map(|t| t.sol_type_name().to_string()).collect();
    format!("{name}({})", joined.join(","))
}

/// Given declared parameter order and each parameter's `indexed` flag,
/// reorders a decoded (indexed-first) tuple back to declaration order
/// (spec.md §4.6.5's `reorder_decoded_params`).
pub fn reorder_decoded(decoded: Vec<Value>, indexed: &[bool]) -> Vec<Value> {
    let (mut idx_i, mut idx_n) = (0, 0);
    let index_count = indexed.iter().filter(|i| **i).count();
    let mut out = Vec::with_capacity(indexed.len());
    for is_indexed in indexed {
        if *is_indexed {
            out.push(decoded.get(idx_i).cloned().unwrap_or(Value::Null));
            idx_i += 1;
        } else {
            out.push(decoded.get(index_count + idx_n).cloned().unwrap_or(Value::Null));
            idx_n += 1;
        }
    }
    out
}

fn matching_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0;
    for (i, c) in s.char_indices().skip(open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_type_list(body: &str) -> Option<Vec<DynSolType>> {
    if body.trim().is_empty() {
        return Some(Vec::new());
    }
    split_top_level(body)
        .into_iter()
        .map(|t| DynSolType::parse(t.trim()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chain_prefixed_target() {
        let (chain, addr) = parse_chain_addr("137:0x0000000000000000000000000000000000000001").unwrap();
        assert_eq!(chain, 137);
        assert_eq!(addr, Address::with_last_byte(1));
    }

    #[test]
    fn defaults_to_mainnet_without_prefix() {
        let (chain, _) = parse_chain_addr("0x0000000000000000000000000000000000000001").unwrap();
        assert_eq!(chain, 1);
    }

    #[test]
    fn parses_multicall_style_selector() {
        let (name, inputs, outputs) = parse_call_selector("balanceOf(address)(uint256)").unwrap();
        assert_eq!(name, "balanceOf");
        assert_eq!(inputs.len(), 1);
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn parses_event_signature_with_indexed_params() {
        let (name, types, indexed) =
            parse_event_signature("Transfer(address indexed from, address indexed to, uint256 amount)").unwrap();
        assert_eq!(name, "Transfer");
        assert_eq!(types.len(), 3);
        assert_eq!(indexed, vec![true, true, false]);
    }

    #[test]
    fn reorders_indexed_first_decoding_back_to_declared_order() {
        let decoded = vec![Value::from("from"), Value::from("to"), Value::from(100)];
        let reordered = reorder_decoded(decoded, &[true, true, false]);
        assert_eq!(reordered, vec![Value::from("from"), Value::from("to"), Value::from(100)]);
    }
}
