use std::sync::Arc;

use super::memory::InMemoryBus;
use super::*;

#[test]
fn group_rpc_transports_groups_apis_sharing_one_instance() {
    let registry = TransportRegistry::new();
    let shared = InMemoryBus::new();
    let other = InMemoryBus::new();

    registry.bind(
        "accounts",
        TransportSet {
            rpc: Some(shared.clone() as Arc<dyn RpcTransport>),
            ..Default::default()
        },
    );
    registry.bind(
        "billing",
        TransportSet {
            rpc: Some(shared.clone() as Arc<dyn RpcTransport>),
            ..Default::default()
        },
    );
    registry.bind(
        "search",
        TransportSet {
            rpc: Some(other.clone() as Arc<dyn RpcTransport>),
            ..Default::default()
        },
    );

    let groups = registry.group_rpc_transports(&[
        "accounts".to_owned(),
        "billing".to_owned(),
        "search".to_owned(),
    ]);

    assert_eq!(groups.len(), 2);
    let shared_group = groups
        .iter()
        .find(|(_, names)| names.len() == 2)
        .expect("shared group");
    assert!(shared_group.1.contains(&"accounts".to_owned()));
    assert!(shared_group.1.contains(&"billing".to_owned()));
}

#[test]
fn all_distinct_deduplicates_shared_transport_across_kinds() {
    let registry = TransportRegistry::new();
    let shared = InMemoryBus::new();

    registry.bind(
        "accounts",
        TransportSet {
            rpc: Some(shared.clone() as Arc<dyn RpcTransport>),
            result: Some(shared.clone() as Arc<dyn ResultTransport>),
            event: Some(shared.clone() as Arc<dyn EventTransport>),
            schema: Some(shared.clone() as Arc<dyn SchemaTransport>),
        },
    );
    registry.bind(
        "billing",
        TransportSet {
            rpc: Some(shared.clone() as Arc<dyn RpcTransport>),
            ..Default::default()
        },
    );

    let distinct = registry.all_distinct();
    assert_eq!(distinct.rpc.len(), 1);
    assert_eq!(distinct.result.len(), 1);
    assert_eq!(distinct.event.len(), 1);
    assert_eq!(distinct.schema.len(), 1);
}
