//! Hook and plugin contract types shared between the dispatch engine and
//! anything that wants to observe or gate its lifecycle from outside the crate.
//!
//! Kept deliberately decoupled from the message types in `bus_core`: a hook
//! sees `serde_json::Value` views of the rpc/result/event in flight rather
//! than the concrete structs, so this crate can be depended on by plugin
//! authors without pulling in the whole dispatch engine.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginContractVersion {
    pub major: u16,
    pub minor: u16,
}

impl PluginContractVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub const fn is_compatible_with(self, other: Self) -> bool {
        self.major == other.major
    }
}

/// The ten named points at which hooks may be registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    BeforeWorkerStart,
    AfterWorkerStopped,
    BeforeRpcCall,
    AfterRpcCall,
    BeforeRpcExecution,
    AfterRpcExecution,
    BeforeEventSent,
    AfterEventSent,
    BeforeEventExecution,
    AfterEventExecution,
}

impl HookPoint {
    pub const ALL: [HookPoint; 10] = [
        HookPoint::BeforeWorkerStart,
        HookPoint::AfterWorkerStopped,
        HookPoint::BeforeRpcCall,
        HookPoint::AfterRpcCall,
        HookPoint::BeforeRpcExecution,
        HookPoint::AfterRpcExecution,
        HookPoint::BeforeEventSent,
        HookPoint::AfterEventSent,
        HookPoint::BeforeEventExecution,
        HookPoint::AfterEventExecution,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::BeforeWorkerStart => "before_worker_start",
            HookPoint::AfterWorkerStopped => "after_worker_stopped",
            HookPoint::BeforeRpcCall => "before_rpc_call",
            HookPoint::AfterRpcCall => "after_rpc_call",
            HookPoint::BeforeRpcExecution => "before_rpc_execution",
            HookPoint::AfterRpcExecution => "after_rpc_execution",
            HookPoint::BeforeEventSent => "before_event_sent",
            HookPoint::AfterEventSent => "after_event_sent",
            HookPoint::BeforeEventExecution => "before_event_execution",
            HookPoint::AfterEventExecution => "after_event_execution",
        }
    }
}

/// Snapshot handed to every hook callback firing at `point`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HookContext {
    pub point: HookPoint,
    pub api_name: Option<String>,
    pub procedure_name: Option<String>,
    pub event_name: Option<String>,
    pub rpc_message: Option<Value>,
    pub result_message: Option<Value>,
    pub event_message: Option<Value>,
    pub correlation_id: String,
    pub ts_ms: i64,
}

impl HookContext {
    pub fn new(point: HookPoint, correlation_id: impl Into<String>, ts_ms: i64) -> Self {
        Self {
            point,
            api_name: None,
            procedure_name: None,
            event_name: None,
            rpc_message: None,
            result_message: None,
            event_message: None,
            correlation_id: correlation_id.into(),
            ts_ms,
        }
    }

    pub fn with_rpc_message(mut self, value: Value) -> Self {
        self.rpc_message = Some(value);
        self
    }

    pub fn with_result_message(mut self, value: Value) -> Self {
        self.result_message = Some(value);
        self
    }

    pub fn with_event_message(mut self, value: Value) -> Self {
        self.event_message = Some(value);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookIssueClass {
    Validation,
    Execution,
    Internal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HookIssue {
    pub hook_name: String,
    pub point: HookPoint,
    pub class: HookIssueClass,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HookReport {
    pub issues: Vec<HookIssue>,
}

impl HookReport {
    pub fn push(&mut self, issue: HookIssue) {
        self.issues.push(issue);
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// A single registered callback. Failure aborts the operation that fired it.
pub trait BusHook: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn call<'a>(&'a self, ctx: &'a HookContext) -> HookFuture<'a, Result<(), HookIssue>>;
}
