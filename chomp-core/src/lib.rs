//! Shared types and clients used by every process in the fleet: the symbolic
//! interval table, the Field/Ingester/Config data model, layered process
//! configuration, the coordination-store client (claims, cache, pub/sub),
//! per-chain RPC pools, the transformer engine, and generic HTTP fetch
//! helpers.

pub mod config;
pub mod coordination;
pub mod fetch;
pub mod interval;
pub mod model;
pub mod rpc;
pub mod transform;

pub use config::{ChompConfig, CliArgs, CoordinationConfig};
pub use coordination::{CoordinationError, CoordinationStore, ResourceStatus};
pub use interval::{Interval, InvalidInterval};
pub use model::{
    Config, Field, FieldDefaults, FieldType, FieldValue, Ingester, IngesterType, ModelError,
    Params, ResourceType,
};
pub use rpc::{RpcError, RpcPool, RpcRegistry};
pub use transform::{TransformContext, TransformError};
