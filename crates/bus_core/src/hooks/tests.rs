use std::sync::Arc;

use bus_plugin_core::{HookContext, HookFuture, HookIssue, HookIssueClass, HookPoint};

use super::*;

struct RecordingHook {
    name: &'static str,
    order: Arc<std::sync::Mutex<Vec<&'static str>>>,
}

impl BusHook for RecordingHook {
    fn name(&self) -> &'static str {
        self.name
    }

    fn call<'a>(&'a self, _ctx: &'a HookContext) -> HookFuture<'a, Result<(), HookIssue>> {
        Box::pin(async move {
            self.order.lock().unwrap().push(self.name);
            Ok(())
        })
    }
}

struct FailingHook;

impl BusHook for FailingHook {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn call<'a>(&'a self, _ctx: &'a HookContext) -> HookFuture<'a, Result<(), HookIssue>> {
        Box::pin(async move {
            Err(HookIssue {
                hook_name: "failing".to_owned(),
                point: HookPoint::BeforeRpcCall,
                class: HookIssueClass::Execution,
                message: "boom".to_owned(),
            })
        })
    }
}

fn ctx(point: HookPoint) -> HookContext {
    HookContext::new(point, "corr-1", 0)
}

#[tokio::test(flavor = "current_thread")]
async fn before_plugin_runs_before_plugin_and_after_plugin() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let config = HookConfig::new()
        .with_after_plugin_hook(
            HookPoint::BeforeRpcCall,
            Arc::new(RecordingHook {
                name: "after",
                order: order.clone(),
            }),
        )
        .with_plugin_hook(
            HookPoint::BeforeRpcCall,
            Arc::new(RecordingHook {
                name: "plugin",
                order: order.clone(),
            }),
        )
        .with_before_plugin_hook(
            HookPoint::BeforeRpcCall,
            Arc::new(RecordingHook {
                name: "before",
                order: order.clone(),
            }),
        );
    let dispatcher = HookDispatcher::new(config);
    dispatcher.fire(&ctx(HookPoint::BeforeRpcCall)).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["before", "plugin", "after"]);
}

#[tokio::test(flavor = "current_thread")]
async fn failing_hook_aborts_remaining_pipeline() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let never_run = Arc::new(RecordingHook {
        name: "never",
        order,
    });
    let config = HookConfig::new()
        .with_before_plugin_hook(HookPoint::BeforeRpcCall, Arc::new(FailingHook))
        .with_plugin_hook(HookPoint::BeforeRpcCall, never_run.clone());
    let dispatcher = HookDispatcher::new(config);

    let result = dispatcher.fire(&ctx(HookPoint::BeforeRpcCall)).await;
    assert!(result.is_err());
    assert!(never_run.order.lock().unwrap().is_empty());
    assert!(dispatcher.report_snapshot().issues.iter().any(|i| i.hook_name == "failing"));
}

#[tokio::test(flavor = "current_thread")]
async fn duplicate_hook_names_in_same_slot_are_deduplicated() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let config = HookConfig::new()
        .with_before_plugin_hook(
            HookPoint::AfterEventSent,
            Arc::new(RecordingHook {
                name: "dup",
                order: order.clone(),
            }),
        )
        .with_before_plugin_hook(
            HookPoint::AfterEventSent,
            Arc::new(RecordingHook {
                name: "dup",
                order: order.clone(),
            }),
        );
    let dispatcher = HookDispatcher::new(config);
    dispatcher.fire(&ctx(HookPoint::AfterEventSent)).await.unwrap();
    assert_eq!(order.lock().unwrap().len(), 1);
}
