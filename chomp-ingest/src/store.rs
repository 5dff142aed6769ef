//! The shared collect→transform→store→publish tail every ingester family
//! runs after populating `field.value` (spec.md §4.6, §4.9). Grounded on
//! `examples/original_source/src/actions/store.py`'s `store`/`store_batch`
//! and `transform.py`'s `transform_all` (apply per field, count successes,
//! skip the write entirely on zero).

use std::time::Duration;

use chomp_core::{
    CoordinationStore, FieldValue, Ingester, Interval, ResourceType, TransformContext, TransformError,
};
use chomp_tsdb::{TsdbAdapter, TsdbError, TsdbRow};
use chrono::{DateTime, Utc};
use log::{error, warn};

const TRANSFORM_DEADLINE: Duration = Duration::from_secs(2);

/// Implements [`TransformContext`] against one ingester's in-flight field
/// values plus the TSDB for windowed series lookups, per spec.md §4.5's
/// resolution order.
struct TickContext<'a> {
    ingester: &'a Ingester,
    tsdb: &'a dyn TsdbAdapter,
    now: DateTime<Utc>,
}

#[async_trait::async_trait]
impl<'a> TransformContext for TickContext<'a> {
    fn field_value(&self, name: &str) -> Option<&FieldValue> {
        self.ingester
            .fields
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.value.as_ref())
    }

    async fn load_series(
        &self,
        target: &str,
        interval: Interval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<FieldValue>, TransformError> {
        let rows = self
            .tsdb
            .fetch(self.ingester.table_name(), from, to, interval, &[target.to_string()])
            .await
            .map_err(|e| TransformError::Malformed(e.to_string()))?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.values.get(target).cloned())
            .collect())
    }

    fn interval(&self) -> Interval {
        self.ingester.interval
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

/// Runs every field's transformer chain with the 2s-per-field deadline
/// (spec.md §4.5/§7), mutating `field.value` in place. Returns the count of
/// fields that successfully transformed (spec.md §4.5's "zero ⇒ skip store").
pub async fn transform_all(ingester: &mut Ingester, tsdb: &dyn TsdbAdapter) -> usize {
    let now = Utc::now();
    let mut success = 0;

    for i in 0..ingester.fields.len() {
        let Some(current) = ingester.fields[i].value.clone() else {
            continue;
        };
        if ingester.fields[i].transformers.is_empty() {
            success += 1;
            continue;
        }

        let ctx = TickContext { ingester: &*ingester, tsdb, now };
        let mut value = current;
        let mut failed = false;

        for expr in ingester.fields[i].transformers.clone() {
            let fut = chomp_core::transform::apply_transformer(&expr, &value, &ctx);
            match tokio::time::timeout(TRANSFORM_DEADLINE, fut).await {
                Ok(Ok(v)) => value = v,
                Ok(Err(e)) => {
                    error!(
                        "transform {} failed for {}.{}: {e}",
                        expr, ingester.name, ingester.fields[i].name
                    );
                    failed = true;
                    break;
                }
                Err(_) => {
                    error!(
                        "transform {} timed out for {}.{}",
                        expr, ingester.name, ingester.fields[i].name
                    );
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            ingester.fields[i].value = Some(value);
            success += 1;
        }
    }

    success
}

/// Writes the ingester's current field values to cache (always) and to the
/// TSDB (series/timeseries only), then publishes the snapshot to its topic.
/// Skipped entirely when `transform_all` returned zero (spec.md §7's
/// "zero-count store skip").
pub async fn store(
    ingester: &Ingester,
    tsdb: &dyn TsdbAdapter,
    coordination: &CoordinationStore,
) -> Result<(), TsdbError> {
    let snapshot = snapshot_json(ingester);

    if matches!(ingester.resource_type, ResourceType::Series | ResourceType::Timeseries) {
        let row = TsdbRow {
            ts: ingester.interval.floor(Utc::now()),
            values: ingester
                .fields
                .iter()
                .filter(|f| !f.transient)
                .filter_map(|f| f.value.clone().map(|v| (f.name.clone(), v)))
                .collect(),
        };
        tsdb.insert(ingester, &row).await?;
    }

    if let Err(e) = coordination
        .publish_snapshot(&ingester.name, &snapshot, chomp_core::coordination::YEAR_SECONDS)
        .await
    {
        warn!("failed to cache/publish snapshot for {}: {e}", ingester.name);
    }

    Ok(())
}

fn snapshot_json(ingester: &Ingester) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(
        "date".to_string(),
        serde_json::Value::String(Utc::now().to_rfc3339()),
    );
    for field in &ingester.fields {
        if let Some(value) = &field.value {
            map.insert(field.name.clone(), field_value_json(value));
        }
    }
    serde_json::Value::Object(map)
}

fn field_value_json(value: &FieldValue) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// The full per-tick tail shared by every family's `collect` callback:
/// transform, then store-if-nonzero (spec.md §4.6's common suffix).
pub async fn transform_and_store(
    ingester: &mut Ingester,
    tsdb: &dyn TsdbAdapter,
    coordination: &CoordinationStore,
) {
    let transformed = transform_all(ingester, tsdb).await;
    if transformed == 0 {
        warn!("no fields transformed for {}, skipping store", ingester.name);
        return;
    }
    ingester.ingestion_time = Some(ingester.interval.floor(Utc::now()));
    if let Err(e) = store(ingester, tsdb, coordination).await {
        error!("store failed for {}: {e}", ingester.name);
    }
}
