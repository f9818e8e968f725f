//! Transport Registry (SPEC §4.A) and the four transport capability traits
//! (SPEC §6). Concrete production transports (network brokers, message
//! queues) are external collaborators; this module defines only the
//! interface they must satisfy plus an in-memory implementation used as test
//! scaffolding (see `transport::memory`).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::errors::BusError;
use crate::messages::{EventMessage, MessageId, ReturnPath, RpcMessage};

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait RpcTransport: Send + Sync {
    fn open(&self) -> TransportFuture<'_, Result<(), BusError>>;
    fn close(&self) -> TransportFuture<'_, Result<(), BusError>>;
    /// Block until at least one message is available for one of `apis`, or
    /// return `Err(BusError::TransportClosed)` once the transport is shut down.
    fn consume_rpcs<'a>(&'a self, apis: &'a [String]) -> TransportFuture<'a, Result<Vec<RpcMessage>, BusError>>;
    fn call_rpc<'a>(&'a self, message: &'a RpcMessage) -> TransportFuture<'a, Result<(), BusError>>;
}

pub trait ResultTransport: Send + Sync {
    fn open(&self) -> TransportFuture<'_, Result<(), BusError>>;
    fn close(&self) -> TransportFuture<'_, Result<(), BusError>>;
    fn get_return_path<'a>(&'a self, message: &'a RpcMessage) -> TransportFuture<'a, Result<ReturnPath, BusError>>;
    fn send_result<'a>(
        &'a self,
        rpc_message_id: &'a MessageId,
        result: &'a crate::messages::ResultMessage,
        return_path: &'a ReturnPath,
    ) -> TransportFuture<'a, Result<(), BusError>>;
    /// Wait for the result addressed to `return_path`, or `Err(TransportClosed)`.
    fn receive_result<'a>(
        &'a self,
        rpc_message_id: &'a MessageId,
        return_path: &'a ReturnPath,
    ) -> TransportFuture<'a, Result<crate::messages::ResultMessage, BusError>>;
}

pub trait EventTransport: Send + Sync {
    fn open(&self) -> TransportFuture<'_, Result<(), BusError>>;
    fn close(&self) -> TransportFuture<'_, Result<(), BusError>>;
    fn send_event<'a>(&'a self, message: &'a EventMessage) -> TransportFuture<'a, Result<(), BusError>>;
    /// Block for the next event matching `events` for `listener_name`, or
    /// return `Ok(None)` once the transport is closed (normal consumer exit).
    fn recv_event<'a>(
        &'a self,
        events: &'a [(String, String)],
        listener_name: &'a str,
    ) -> TransportFuture<'a, Result<Option<EventMessage>, BusError>>;
}

pub trait SchemaTransport: Send + Sync {
    fn open(&self) -> TransportFuture<'_, Result<(), BusError>>;
    fn close(&self) -> TransportFuture<'_, Result<(), BusError>>;
    fn load(&self) -> TransportFuture<'_, Result<HashMap<String, Value>, BusError>>;
    fn store<'a>(&'a self, api_name: &'a str, schema: Value) -> TransportFuture<'a, Result<(), BusError>>;
    /// Poll once for a changed api's schema; `Ok(None)` means no change this tick.
    fn poll_change(&self) -> TransportFuture<'_, Result<Option<(String, Value)>, BusError>>;
}

#[derive(Clone, Default)]
pub struct TransportSet {
    pub rpc: Option<Arc<dyn RpcTransport>>,
    pub result: Option<Arc<dyn ResultTransport>>,
    pub event: Option<Arc<dyn EventTransport>>,
    pub schema: Option<Arc<dyn SchemaTransport>>,
}

/// Maps each registered API name to the transport handles that serve it.
pub struct TransportRegistry {
    bindings: RwLock<HashMap<String, TransportSet>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn bind(&self, api_name: impl Into<String>, transports: TransportSet) {
        write(&self.bindings).insert(api_name.into(), transports);
    }

    pub fn rpc_transport(&self, api_name: &str) -> Option<Arc<dyn RpcTransport>> {
        read(&self.bindings).get(api_name).and_then(|t| t.rpc.clone())
    }

    pub fn result_transport(&self, api_name: &str) -> Option<Arc<dyn ResultTransport>> {
        read(&self.bindings).get(api_name).and_then(|t| t.result.clone())
    }

    pub fn event_transport(&self, api_name: &str) -> Option<Arc<dyn EventTransport>> {
        read(&self.bindings).get(api_name).and_then(|t| t.event.clone())
    }

    pub fn schema_transport(&self, api_name: &str) -> Option<Arc<dyn SchemaTransport>> {
        read(&self.bindings).get(api_name).and_then(|t| t.schema.clone())
    }

    /// Group `api_names` by the physical RPC transport instance serving
    /// them, so one consumer task can serve every API sharing a transport.
    /// Grouping is by allocation identity (trait objects have no `PartialEq`),
    /// the idiomatic substitute for the reference implementation's
    /// object-identity grouping.
    pub fn group_rpc_transports(&self, api_names: &[String]) -> Vec<(Arc<dyn RpcTransport>, Vec<String>)> {
        let guard = read(&self.bindings);
        let mut groups: Vec<(usize, Arc<dyn RpcTransport>, Vec<String>)> = Vec::new();
        for name in api_names {
            let Some(transport) = guard.get(name).and_then(|t| t.rpc.clone()) else {
                continue;
            };
            let id = transport_identity(&transport);
            if let Some(group) = groups.iter_mut().find(|(existing_id, _, _)| *existing_id == id) {
                group.2.push(name.clone());
            } else {
                groups.push((id, transport, vec![name.clone()]));
            }
        }
        groups.into_iter().map(|(_, t, names)| (t, names)).collect()
    }

    /// All distinct transport instances of every kind, deduplicated by
    /// identity, for bulk `open`/`close` during lazy init and shutdown.
    pub fn all_distinct(&self) -> DistinctTransports {
        let guard = read(&self.bindings);
        let mut out = DistinctTransports::default();
        let mut rpc_seen = Vec::new();
        let mut result_seen = Vec::new();
        let mut event_seen = Vec::new();
        let mut schema_seen = Vec::new();
        for set in guard.values() {
            if let Some(t) = &set.rpc {
                push_distinct(&mut rpc_seen, &mut out.rpc, t);
            }
            if let Some(t) = &set.result {
                push_distinct(&mut result_seen, &mut out.result, t);
            }
            if let Some(t) = &set.event {
                push_distinct(&mut event_seen, &mut out.event, t);
            }
            if let Some(t) = &set.schema {
                push_distinct(&mut schema_seen, &mut out.schema, t);
            }
        }
        out
    }

    pub fn api_names(&self) -> Vec<String> {
        read(&self.bindings).keys().cloned().collect()
    }
}

#[derive(Default)]
pub struct DistinctTransports {
    pub rpc: Vec<Arc<dyn RpcTransport>>,
    pub result: Vec<Arc<dyn ResultTransport>>,
    pub event: Vec<Arc<dyn EventTransport>>,
    pub schema: Vec<Arc<dyn SchemaTransport>>,
}

fn push_distinct<T: ?Sized>(seen: &mut Vec<usize>, out: &mut Vec<Arc<T>>, candidate: &Arc<T>) {
    let id = transport_identity(candidate);
    if !seen.contains(&id) {
        seen.push(id);
        out.push(Arc::clone(candidate));
    }
}

fn transport_identity<T: ?Sized>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as *const () as usize
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub mod memory;

#[cfg(test)]
mod tests;
