use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use crate::api::{Api, ParamSpec, Procedure};
use crate::errors::RpcError;
use crate::hooks::{HookConfig, HookDispatcher};
use crate::metrics::BusMetrics;
use crate::schema::SchemaCoordinator;
use crate::transport::memory::InMemoryBus;
use crate::transport::{RpcTransport, TransportRegistry, TransportSet};

use super::*;

fn build_engine(bus: &Arc<InMemoryBus>, api: Api) -> Arc<RpcEngine> {
    let apis = Arc::new(ApiRegistry::new());
    apis.add(api);
    let transports = Arc::new(TransportRegistry::new());
    transports.bind(
        "accounts",
        TransportSet {
            rpc: Some(bus.clone() as Arc<dyn RpcTransport>),
            result: Some(bus.clone() as Arc<dyn crate::transport::ResultTransport>),
            ..Default::default()
        },
    );
    RpcEngine::new(
        apis,
        transports,
        Arc::new(HookDispatcher::new(HookConfig::new())),
        Arc::new(SchemaCoordinator::new()),
        Arc::new(BusMetrics::new(0)),
    )
}

fn echo_api() -> Api {
    Api::new("accounts").with_procedure(
        "ping",
        Procedure::new(
            vec![ParamSpec::required("value")],
            Arc::new(|kwargs| Box::pin(async move { Ok(kwargs["value"].clone()) })),
        ),
    )
}

#[tokio::test(flavor = "current_thread")]
async fn call_rpc_remote_round_trips_through_a_consumer() {
    let bus = InMemoryBus::new();
    let engine = build_engine(&bus, echo_api());

    let handles = engine.spawn_consumers(&["accounts".to_owned()], Arc::new(Notify::new()));
    assert_eq!(handles.len(), 1);

    let result = engine
        .call_rpc_remote("accounts", "ping", json!({"value": 42}), None, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(result, json!(42));

    RpcTransport::close(&*bus).await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "current_thread")]
async fn call_rpc_remote_reports_unknown_procedure_as_server_error() {
    let bus = InMemoryBus::new();
    let engine = build_engine(&bus, Api::new("accounts"));
    let handles = engine.spawn_consumers(&["accounts".to_owned()], Arc::new(Notify::new()));

    let err = engine
        .call_rpc_remote("accounts", "missing", json!({}), None, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ServerError { .. }));

    RpcTransport::close(&*bus).await.unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "current_thread")]
async fn call_rpc_remote_times_out_when_nobody_consumes() {
    let bus = InMemoryBus::new();
    let engine = build_engine(&bus, echo_api());

    let err = engine
        .call_rpc_remote(
            "accounts",
            "ping",
            json!({"value": 1}),
            Some(Duration::from_millis(20)),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));
}

#[tokio::test(flavor = "current_thread")]
async fn sudden_death_terminates_the_consumer_without_a_reply() {
    let bus = InMemoryBus::new();
    let api = Api::new("accounts").with_procedure(
        "explode",
        Procedure::new(
            vec![],
            Arc::new(|_kwargs| {
                Box::pin(async move {
                    Err(RpcError::SuddenDeath {
                        canonical_name: "accounts.explode".to_owned(),
                    })
                })
            }),
        ),
    );
    let engine = build_engine(&bus, api);
    let mut handles = engine.spawn_consumers(&["accounts".to_owned()], Arc::new(Notify::new()));
    assert_eq!(handles.len(), 1);

    let call = engine.call_rpc_remote(
        "accounts",
        "explode",
        json!({}),
        Some(Duration::from_millis(200)),
        Duration::from_secs(5),
    );
    let err = call.await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));

    let handle = handles.remove(0);
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("consumer task should have exited after sudden death")
        .unwrap();
}
