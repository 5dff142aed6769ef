//! Read-only retriever routes (spec.md §4.9, SPEC_FULL.md §0/§2). Grounded
//! on `examples/original_source/src/server/routers/retriever.py`: `/`,
//! `/resources`/`/schema`, `/last/<resources>`, `/history/<resources>`,
//! `/limits`.

use std::collections::HashMap;

use chomp_core::{Interval, ResourceStatus};
use chrono::{DateTime, Duration, Utc};
use rocket::serde::json::Json;
use rocket::{get, Request, State};
use serde_json::Value;

use crate::error::ApiError;
use crate::limiter::{requester_id, RateLimit, BUCKETS};
use crate::state::AppState;

#[get("/")]
pub fn index() -> &'static str {
    "Chomp server is up and running. See /schema for available resources."
}

/// Splits on any of `-/,;|&`, matching the Python source's
/// `GENERIC_SPLITTER = r"[-/,;|&]"`.
fn parse_resources(raw: &str) -> Result<Vec<String>, ApiError> {
    let resources: Vec<String> = raw
        .split(|c| "-/,;|&".contains(c))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if resources.is_empty() {
        return Err(ApiError::BadRequest("no resources provided".to_string()));
    }
    Ok(resources)
}

/// Accepts either an RFC3339 timestamp or a unix epoch (seconds).
fn parse_date(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(epoch) = raw.parse::<i64>() {
        return DateTime::from_timestamp(epoch, 0).ok_or_else(|| ApiError::BadRequest(format!("invalid epoch {raw}")));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| ApiError::BadRequest(format!("invalid date {raw}")))
}

/// An explicit `?interval=<seconds>` rounds up to the nearest known
/// aggregation interval; otherwise one is picked to fit ~200 epochs across
/// the requested window.
fn resolve_interval(from: DateTime<Utc>, to: DateTime<Utc>, interval_secs: Option<f64>) -> Interval {
    match interval_secs {
        Some(secs) => Interval::round(secs, 0.25),
        None => Interval::fit(from, to, 200),
    }
}

#[get("/resources")]
pub async fn resources(state: &State<AppState>, _limit: RateLimit) -> Result<Json<Vec<ResourceStatus>>, ApiError> {
    let statuses = state.coordination.get::<Vec<ResourceStatus>>(&state.coordination.status_key()).await?.unwrap_or_default();
    Ok(Json(statuses))
}

#[get("/schema")]
pub async fn schema(state: &State<AppState>, limit: RateLimit) -> Result<Json<Vec<ResourceStatus>>, ApiError> {
    resources(state, limit).await
}

#[get("/last/<resources>")]
pub async fn last(state: &State<AppState>, resources: &str, _limit: RateLimit) -> Result<Json<Value>, ApiError> {
    let names = parse_resources(resources)?;
    let raw = state.coordination.batch_get_raw(&names).await?;

    let mut missing = Vec::new();
    let mut values: HashMap<String, Value> = HashMap::new();
    for (name, bytes) in names.iter().zip(raw.into_iter()) {
        match bytes {
            Some(b) => {
                let v: Value = serde_json::from_slice(&b).unwrap_or(Value::Null);
                values.insert(name.clone(), v);
            }
            None => missing.push(name.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(ApiError::NotFound(missing.join(", ")));
    }

    if names.len() == 1 {
        Ok(Json(values.remove(&names[0]).unwrap_or(Value::Null)))
    } else {
        Ok(Json(serde_json::to_value(values).unwrap_or(Value::Null)))
    }
}

#[get("/history/<resources>?<from_date>&<to_date>&<interval>")]
pub async fn history(
    state: &State<AppState>,
    resources: &str,
    from_date: Option<&str>,
    to_date: Option<&str>,
    interval: Option<f64>,
    _limit: RateLimit,
) -> Result<Json<Value>, ApiError> {
    let names = parse_resources(resources)?;
    let to = match to_date {
        Some(d) => parse_date(d)?,
        None => Utc::now(),
    };
    let from = match from_date {
        Some(d) => parse_date(d)?,
        None => to - Duration::days(30),
    };
    let interval = resolve_interval(from, to, interval);

    let rows = state.tsdb.fetch_batch(&names, from, to, interval, &[]).await?;
    let json: HashMap<String, Vec<Value>> = rows
        .into_iter()
        .map(|(table, rows)| {
            let serialized = rows
                .into_iter()
                .map(|r| {
                    let mut map = serde_json::Map::new();
                    map.insert("ts".to_string(), Value::String(r.ts.to_rfc3339()));
                    for (k, v) in r.values {
                        map.insert(k, serde_json::to_value(v).unwrap_or(Value::Null));
                    }
                    Value::Object(map)
                })
                .collect();
            (table, serialized)
        })
        .collect();
    Ok(Json(serde_json::to_value(json).unwrap_or(Value::Null)))
}

#[get("/limits")]
pub async fn limits(state: &State<AppState>, req: &Request<'_>, _limit: RateLimit) -> Result<Json<Value>, ApiError> {
    let user = requester_id(req);
    let mut out = serde_json::Map::new();
    for (bucket, cap, _ttl) in BUCKETS {
        let (count, ttl) = state.coordination.limiter_peek(bucket, &user).await?;
        out.insert(
            bucket.to_string(),
            serde_json::json!({"cap": cap, "remaining": (cap - count).max(0), "ttl": ttl}),
        );
    }
    Ok(Json(serde_json::json!({"user": user, "limits": Value::Object(out)})))
}

pub fn routes() -> Vec<rocket::Route> {
    rocket::routes![index, resources, schema, last, history, limits]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resources_splits_on_any_separator() {
        let got = parse_resources("btc-price,eth_supply;gas/fee|tvl&count").unwrap();
        assert_eq!(got, vec!["btc", "price", "eth_supply", "gas", "fee", "tvl", "count"]);
    }

    #[test]
    fn parse_resources_trims_and_drops_empties() {
        let got = parse_resources(" btc , ,eth ").unwrap();
        assert_eq!(got, vec!["btc", "eth"]);
    }

    #[test]
    fn parse_resources_rejects_empty_input() {
        assert!(parse_resources("").is_err());
        assert!(parse_resources("  ,  ").is_err());
    }

    #[test]
    fn parse_date_accepts_epoch_seconds() {
        let d = parse_date("1700000000").unwrap();
        assert_eq!(d.timestamp(), 1700000000);
    }

    #[test]
    fn parse_date_accepts_rfc3339() {
        let d = parse_date("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(d.timestamp(), 1704067200);
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert!(parse_date("not-a-date").is_err());
    }

    #[test]
    fn resolve_interval_uses_explicit_seconds_when_given() {
        let from = Utc::now() - Duration::days(1);
        let to = Utc::now();
        assert_eq!(resolve_interval(from, to, Some(3600.0)), chomp_core::Interval::H1);
    }

    #[test]
    fn resolve_interval_falls_back_to_fit_when_absent() {
        let to = Utc::now();
        let from = to - Duration::days(30);
        assert_eq!(resolve_interval(from, to, None), chomp_core::Interval::fit(from, to, 200));
    }
}
