use serde_json::json;

use crate::api::{Api, EventDecl, ParamSpec, Procedure};
use crate::messages::Direction;
use crate::transport::memory::InMemoryBus;
use crate::transport::{SchemaTransport, TransportRegistry, TransportSet};

use super::*;

fn noop_handler() -> crate::api::ProcedureHandler {
    std::sync::Arc::new(|_kwargs| Box::pin(async { Ok(Value::Null) }))
}

#[test]
fn schema_digest_is_stable_for_equal_values() {
    let a = json!({"x": 1, "y": [1, 2, 3]});
    let b = json!({"x": 1, "y": [1, 2, 3]});
    assert_eq!(schema_digest(&a), schema_digest(&b));
}

#[test]
fn validate_rpc_kwargs_reports_missing_required_param() {
    let coordinator = SchemaCoordinator::new();
    let api = Api::new("accounts").with_procedure(
        "create",
        Procedure::new(vec![ParamSpec::required("name")], noop_handler()),
    );
    let err = coordinator
        .validate_rpc_kwargs(&api, "create", &json!({}), Direction::Outgoing)
        .unwrap_err();
    assert!(matches!(err, BusError::SchemaValidation(_)));
}

#[test]
fn validate_event_kwargs_reports_unknown_event() {
    let coordinator = SchemaCoordinator::new();
    let api = Api::new("accounts").with_event("created", EventDecl::new(vec!["id".to_owned()]));
    let err = coordinator
        .validate_event_kwargs(&api, "deleted", &json!({}))
        .unwrap_err();
    assert!(matches!(err, BusError::EventNotFound { .. }));
}

#[tokio::test(flavor = "current_thread")]
async fn ensure_loaded_from_bus_runs_exactly_once() {
    let coordinator = SchemaCoordinator::new();
    let registry = TransportRegistry::new();
    let bus = InMemoryBus::new();
    bus.store("accounts", json!({"procedures": {}})).await.unwrap();
    registry.bind(
        "accounts",
        TransportSet {
            schema: Some(bus.clone() as std::sync::Arc<dyn crate::transport::SchemaTransport>),
            ..Default::default()
        },
    );

    coordinator.ensure_loaded_from_bus(&registry).await.unwrap();
    assert!(coordinator.remote_schema("accounts").is_some());

    // Second call is a no-op even if the underlying schema changed since.
    bus.store("billing", json!({"procedures": {}})).await.unwrap();
    coordinator.ensure_loaded_from_bus(&registry).await.unwrap();
    assert!(coordinator.remote_schema("billing").is_none());
}
