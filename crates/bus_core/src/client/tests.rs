use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use crate::api::{Api, EventDecl, ParamSpec, Procedure};
use crate::config::{BusClientConfig, Feature};
use crate::errors::RpcError;
use crate::transport::memory::InMemoryBus;
use crate::transport::{EventTransport, ResultTransport, RpcTransport, SchemaTransport, TransportSet};

use super::*;

fn bind_all(client: &BusClient, api_name: &str, bus: &Arc<InMemoryBus>) {
    client.bind_transport(
        api_name,
        TransportSet {
            rpc: Some(bus.clone() as Arc<dyn RpcTransport>),
            result: Some(bus.clone() as Arc<dyn ResultTransport>),
            event: Some(bus.clone() as Arc<dyn EventTransport>),
            schema: Some(bus.clone() as Arc<dyn SchemaTransport>),
        },
    );
}

#[tokio::test(flavor = "current_thread")]
async fn start_server_disables_rpcs_when_no_apis_registered() {
    let client = BusClient::new(BusClientConfig::new());
    client.start_server().await.unwrap();
    let err = client
        .call_rpc("accounts", "ping", json!({}), CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Bus(BusError::UnsupportedUse { .. })));
    client.close().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn call_rpc_round_trips_end_to_end_through_a_started_server() {
    let client = BusClient::new(BusClientConfig::new());
    client.register_api(Api::new("accounts").with_procedure(
        "ping",
        Procedure::new(
            vec![ParamSpec::required("value")],
            Arc::new(|kwargs| Box::pin(async move { Ok(kwargs["value"].clone()) })),
        ),
    ));
    let bus = InMemoryBus::new();
    bind_all(&client, "accounts", &bus);

    client.start_server().await.unwrap();
    assert_eq!(client.phase(), Phase::Running);

    let result = client
        .call_rpc("accounts", "ping", json!({"value": "pong"}), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!("pong"));

    client.close().await.unwrap();
    assert_eq!(client.phase(), Phase::Closed);
}

#[tokio::test(flavor = "current_thread")]
async fn fire_event_delivers_to_a_listener_after_start() {
    let client = BusClient::new(
        BusClientConfig::new()
            .with_features([Feature::Events]),
    );
    client.register_api(Api::new("accounts").with_event("created", EventDecl::new(vec!["id".to_owned()])));
    let bus = InMemoryBus::new();
    bind_all(&client, "accounts", &bus);

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_for_handler = seen.clone();
    client
        .listen_for_event(
            "accounts",
            "created",
            "watcher",
            Arc::new(move |_event| {
                let seen = seen_for_handler.clone();
                Box::pin(async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )
        .unwrap();

    client.start_server().await.unwrap();
    client.fire_event("accounts", "created", json!({"id": 7})).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while seen.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    client.close().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn close_is_not_idempotent_and_errors_on_second_call() {
    let client = BusClient::new(BusClientConfig::new());
    client.start_server().await.unwrap();
    client.close().await.unwrap();
    let err = client.close().await.unwrap_err();
    assert!(matches!(err, BusError::BusAlreadyClosed));
}

#[tokio::test(flavor = "current_thread")]
async fn shutdown_server_drives_the_client_to_shutting_down() {
    let client = BusClient::new(BusClientConfig::new());
    client.start_server().await.unwrap();
    client.shutdown_server(3).await;

    tokio::time::timeout(Duration::from_secs(1), async {
        while client.phase() != Phase::ShuttingDown {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(client.exit_code(), 3);
}

#[tokio::test(flavor = "current_thread")]
async fn a_panicking_background_task_escalates_to_a_non_zero_exit_shutdown() {
    let client = BusClient::new(BusClientConfig::new().with_features([Feature::Tasks]));
    client.add_background_every(
        Duration::from_secs(10),
        true,
        Arc::new(|| Box::pin(async { panic!("background task exploded") })),
    );
    client.start_server().await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while client.phase() != Phase::Closed && client.phase() != Phase::ShuttingDown {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(client.exit_code(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn state_ping_reports_running_phase_and_active_features() {
    let client = BusClient::new(BusClientConfig::new().with_features([Feature::Rpcs]));
    client.register_api(Api::new("accounts").with_procedure(
        "noop",
        Procedure::new(vec![], Arc::new(|_| Box::pin(async { Ok(Value::Null) }))),
    ));
    let bus = InMemoryBus::new();
    bind_all(&client, "accounts", &bus);
    bind_all(&client, "state", &bus);
    client.start_server().await.unwrap();

    let result = client
        .call_rpc("state", "ping", json!({}), CallOptions::default())
        .await
        .unwrap();
    let snapshot: StateSnapshot = serde_json::from_value(result).unwrap();
    assert_eq!(snapshot.phase, Phase::Running);
    assert!(snapshot.features.contains(&"RPCS".to_owned()));

    client.close().await.unwrap();
}
