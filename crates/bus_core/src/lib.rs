pub mod api;
pub mod client;
pub mod config;
pub mod errors;
pub mod hooks;
pub mod listener;
pub mod messages;
pub mod metrics;
pub mod rpc;
pub mod scheduler;
pub mod schema;
pub mod tasks;
pub mod transport;
pub(crate) mod util;

pub use api::{Api, ApiRegistry, EventDecl, ParamSpec, Procedure, ProcedureFuture, ProcedureHandler};
pub use bus_plugin_core::{BusHook, HookContext, HookIssue, HookIssueClass, HookPoint, HookReport};
pub use client::{BusClient, CallOptions, HookSlot, Phase, StateSnapshot};
pub use config::{ApiConfig, BusClientConfig, Feature};
pub use errors::{BusError, RpcError};
pub use hooks::{HookConfig, HookDispatcher};
pub use listener::{EventFuture, EventHandler, EventListener, EventListenerManager};
pub use messages::{Direction, EventMessage, MessageId, ResultMessage, ReturnPath, RpcMessage};
pub use metrics::{BusMetrics, BusMetricsSnapshot};
pub use rpc::RpcEngine;
pub use scheduler::{ScheduleSpec, Scheduler, TickFuture, TickHandler};
pub use schema::SchemaCoordinator;
pub use tasks::{TaskKind, TaskRegistry};
pub use transport::{
    DistinctTransports, EventTransport, ResultTransport, RpcTransport, SchemaTransport,
    TransportFuture, TransportRegistry, TransportSet,
};
