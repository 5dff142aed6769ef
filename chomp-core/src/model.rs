//! The Field/Ingester/Config data model (spec.md §3), translated from
//! `examples/original_source/src/model.py`'s `ResourceField`/`Resource`/
//! `CollectorConfig`/`Config` dataclasses.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::interval::{Interval, InvalidInterval};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    InvalidInterval(#[from] InvalidInterval),
    #[error("unknown ingester type: {0} (only scrapper, http_api, ws_api, evm_caller, evm_logger are supported)")]
    UnknownIngesterType(String),
    #[error("duplicate field id {id} in ingester {ingester}; the duplicate was elided")]
    DuplicateFieldId { ingester: String, id: String },
}

/// Field scalar type (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    Bool,
    Timestamp,
    String,
    Binary,
    Varbinary,
}

/// A Field's runtime value, wide enough to cover every `FieldType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    String(String),
    Binary(Vec<u8>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::UInt(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            FieldValue::String(v) => write!(f, "{v}"),
            FieldValue::Binary(v) => write!(f, "{}", hex::encode(v)),
        }
    }
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::UInt(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            FieldValue::String(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub fn from_json(ty: FieldType, value: &serde_json::Value) -> Option<FieldValue> {
        use FieldType::*;
        match ty {
            Int8 | Int16 | Int32 | Int64 => value.as_i64().map(FieldValue::Int),
            Uint8 | Uint16 | Uint32 | Uint64 => value.as_u64().map(FieldValue::UInt),
            Float32 | Float64 => value.as_f64().map(FieldValue::Float),
            Bool => value.as_bool().map(FieldValue::Bool),
            Timestamp => value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| FieldValue::Timestamp(dt.with_timezone(&Utc))),
            String | Binary | Varbinary => value.as_str().map(|s| FieldValue::String(s.to_string())),
        }
    }
}

/// List or mapping of call/query parameters (spec.md §3 `params`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    #[default]
    None,
    List(Vec<serde_json::Value>),
    Map(HashMap<String, serde_json::Value>),
}

/// The smallest schema unit (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub reducer: Option<String>,
    #[serde(default)]
    pub transformers: Vec<String>,
    #[serde(default)]
    pub transient: bool,

    #[serde(skip, default)]
    pub value: Option<FieldValue>,
    #[serde(skip, default)]
    pub id: String,
}

impl Field {
    /// `id = hash(name, type, target, selector, params, transformers)`.
    pub fn compute_id(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.ty.to_string().as_bytes());
        hasher.update(self.target.as_deref().unwrap_or("").as_bytes());
        hasher.update(self.selector.as_deref().unwrap_or("").as_bytes());
        if let Ok(params_json) = serde_json::to_vec(&self.params) {
            hasher.update(&params_json);
        }
        for t in &self.transformers {
            hasher.update(t.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Fills in any target/selector/params/handler/type left unset from the
    /// owning Ingester's inherited defaults, then computes `id`.
    pub fn finalize(&mut self, defaults: &FieldDefaults) {
        if self.target.is_none() {
            self.target = defaults.target.clone();
        }
        if self.selector.is_none() {
            self.selector = defaults.selector.clone();
        }
        if self.handler.is_none() {
            self.handler = defaults.handler.clone();
        }
        if matches!(self.params, Params::None) {
            if let Some(p) = &defaults.params {
                self.params = p.clone();
            }
        }
        self.id = self.compute_id();
    }
}

/// Defaults an Ingester applies to any Field that leaves the attribute unset.
#[derive(Debug, Clone, Default)]
pub struct FieldDefaults {
    pub target: Option<String>,
    pub selector: Option<String>,
    pub params: Option<Params>,
    pub handler: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Value,
    Series,
    Timeseries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Hash)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IngesterType {
    Scrapper,
    HttpApi,
    WsApi,
    EvmCaller,
    EvmLogger,
}

/// An ordered set of Fields sharing an interval and a family tag
/// (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingester {
    pub name: String,
    pub resource_type: ResourceType,
    pub interval: Interval,
    #[serde(default)]
    pub ingester_type: Option<IngesterType>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub handler: Option<String>,
    /// Probability this ingester's tick actually runs in a given interval
    /// (1.0 = always); used to thin out very chatty sources.
    #[serde(default = "default_probability")]
    pub probability: f64,
    pub fields: Vec<Field>,

    #[serde(skip, default)]
    pub id: String,
    #[serde(skip, default)]
    pub ingestion_time: Option<DateTime<Utc>>,
}

fn default_probability() -> f64 {
    1.0
}

impl Ingester {
    pub fn table_name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self, namespace: &str) -> String {
        format!("{namespace}:{}", self.name)
    }

    /// Assigns the parent-tag-inferred `ingester_type`, propagates field
    /// defaults, computes every Field's `id`, elides duplicate field ids
    /// (spec.md §3 invariant), and computes the Ingester's own `id`.
    pub fn finalize(&mut self, inferred_type: IngesterType) -> Result<(), ModelError> {
        if self.ingester_type.is_none() {
            self.ingester_type = Some(inferred_type);
        }

        let defaults = FieldDefaults {
            target: self.target.clone(),
            selector: self.selector.clone(),
            params: if matches!(self.params, Params::None) {
                None
            } else {
                Some(self.params.clone())
            },
            handler: self.handler.clone(),
        };

        for field in &mut self.fields {
            field.finalize(&defaults);
        }

        let mut seen = std::collections::HashSet::new();
        self.fields.retain(|f| {
            if seen.insert(f.id.clone()) {
                true
            } else {
                log::warn!(
                    "duplicate field id {} in ingester {}, eliding",
                    f.id,
                    self.name
                );
                false
            }
        });

        self.id = self.compute_id();
        Ok(())
    }

    fn compute_id(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.resource_type.to_string().as_bytes());
        hasher.update(self.interval.symbol().as_bytes());
        if let Some(ty) = self.ingester_type {
            hasher.update(ty.to_string().as_bytes());
        }
        for field in &self.fields {
            hasher.update(field.id.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Maps each ingester family tag to a list of Ingesters (spec.md §3).
/// Loaded once per process; never mutated at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scrapper: Vec<Ingester>,
    #[serde(default)]
    pub http_api: Vec<Ingester>,
    #[serde(default)]
    pub ws_api: Vec<Ingester>,
    #[serde(default)]
    pub evm_caller: Vec<Ingester>,
    #[serde(default)]
    pub evm_logger: Vec<Ingester>,
}

impl Config {
    /// Finalizes every ingester (inferred type, field defaults, ids) and
    /// rejects anything that doesn't belong to the five recognized families.
    pub fn finalize(mut self) -> Result<Self, ModelError> {
        for (ingesters, ty) in [
            (&mut self.scrapper, IngesterType::Scrapper),
            (&mut self.http_api, IngesterType::HttpApi),
            (&mut self.ws_api, IngesterType::WsApi),
            (&mut self.evm_caller, IngesterType::EvmCaller),
            (&mut self.evm_logger, IngesterType::EvmLogger),
        ] {
            for ingester in ingesters.iter_mut() {
                if let Some(declared) = ingester.ingester_type {
                    if declared != ty {
                        return Err(ModelError::UnknownIngesterType(declared.to_string()));
                    }
                }
                ingester.finalize(ty)?;
            }
        }
        Ok(self)
    }

    pub fn all_ingesters(&self) -> impl Iterator<Item = &Ingester> {
        self.scrapper
            .iter()
            .chain(self.http_api.iter())
            .chain(self.ws_api.iter())
            .chain(self.evm_caller.iter())
            .chain(self.evm_logger.iter())
    }

    pub fn all_ingesters_mut(&mut self) -> impl Iterator<Item = &mut Ingester> {
        self.scrapper
            .iter_mut()
            .chain(self.http_api.iter_mut())
            .chain(self.ws_api.iter_mut())
            .chain(self.evm_caller.iter_mut())
            .chain(self.evm_logger.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_field(name: &str) -> Field {
        Field {
            name: name.to_string(),
            ty: FieldType::Float64,
            target: None,
            selector: Some(".price".to_string()),
            params: Params::None,
            method: None,
            headers: None,
            handler: None,
            reducer: None,
            transformers: vec!["float".to_string()],
            transient: false,
            value: None,
            id: String::new(),
        }
    }

    #[test]
    fn field_id_is_deterministic() {
        let mut a = sample_field("px");
        let mut b = sample_field("px");
        a.finalize(&FieldDefaults::default());
        b.finalize(&FieldDefaults::default());
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn field_id_changes_with_selector() {
        let mut a = sample_field("px");
        let mut b = sample_field("px");
        b.selector = Some(".other".to_string());
        a.finalize(&FieldDefaults::default());
        b.finalize(&FieldDefaults::default());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn duplicate_field_ids_are_elided() {
        let mut ingester = Ingester {
            name: "dup".to_string(),
            resource_type: ResourceType::Value,
            interval: Interval::M1,
            ingester_type: None,
            target: Some("https://example".to_string()),
            selector: None,
            params: Params::None,
            handler: None,
            probability: 1.0,
            fields: vec![sample_field("px"), sample_field("px")],
            id: String::new(),
            ingestion_time: None,
        };
        ingester.finalize(IngesterType::HttpApi).unwrap();
        assert_eq!(ingester.fields.len(), 1);
    }

    #[test]
    fn fields_inherit_ingester_defaults() {
        let mut ingester = Ingester {
            name: "btc_price".to_string(),
            resource_type: ResourceType::Value,
            interval: Interval::M1,
            ingester_type: None,
            target: Some("https://example/p".to_string()),
            selector: None,
            params: Params::None,
            handler: None,
            probability: 1.0,
            fields: vec![sample_field("usd")],
            id: String::new(),
            ingestion_time: None,
        };
        ingester.finalize(IngesterType::Scrapper).unwrap();
        assert_eq!(
            ingester.fields[0].target.as_deref(),
            Some("https://example/p")
        );
    }
}
