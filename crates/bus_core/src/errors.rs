use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Control-plane error taxonomy: everything that is not specific to a single
/// in-flight RPC call. The RPC call path layers `RpcError` on top of this.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BusError {
    #[error("unknown api: {0}")]
    UnknownApi(String),
    #[error("event not found: {api_name}.{event_name}")]
    EventNotFound { api_name: String, event_name: String },
    #[error("invalid event arguments for {api_name}.{event_name}: {message}")]
    InvalidEventArguments {
        api_name: String,
        event_name: String,
        message: String,
    },
    #[error("invalid event listener {listener_name:?}: {message}")]
    InvalidEventListener {
        listener_name: String,
        message: String,
    },
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no apis to listen on")]
    NoApisToListenOn,
    #[error("bus is already closed")]
    BusAlreadyClosed,
    #[error("unsupported use: {requested} is not one of {allowed}")]
    UnsupportedUse { requested: String, allowed: String },
    #[error("transport is closed")]
    TransportClosed,
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error taxonomy for a single RPC call, client or server side.
///
/// `PartialEq` only: the `Timeout` variant holds an `f64`, which has no
/// total order and so cannot implement `Eq`.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RpcError {
    #[error("rpc call to {canonical_name} timed out after {timeout_secs}s; consider raising rpc_timeout for this api")]
    Timeout {
        canonical_name: String,
        timeout_secs: f64,
    },
    #[error("error while calling {canonical_name}: {message}\nremote stack trace:\n{trace}")]
    ServerError {
        canonical_name: String,
        message: String,
        trace: String,
    },
    /// Testing-only sentinel: a handler that deliberately terminates its consumer
    /// rather than converting the failure into a result message.
    #[error("sudden death in {canonical_name}")]
    SuddenDeath { canonical_name: String },
    #[error(transparent)]
    Bus(#[from] BusError),
}
