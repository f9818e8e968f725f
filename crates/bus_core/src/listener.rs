//! Event Listener Manager (SPEC §4.F): registration of event consumers before
//! `start_server`, and the consumer task spawned for each one once the
//! server is up. Listener tasks are tagged so the shutdown sweep can cancel
//! them independently of RPC consumers and background schedules.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use bus_plugin_core::{HookContext, HookPoint};

use crate::api::ApiRegistry;
use crate::errors::BusError;
use crate::hooks::HookDispatcher;
use crate::messages::EventMessage;
use crate::metrics::BusMetrics;
use crate::schema::SchemaCoordinator;
use crate::transport::TransportRegistry;
use crate::util::now_unix_millis;

pub type EventFuture = Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>>;
pub type EventHandler = Arc<dyn Fn(EventMessage) -> EventFuture + Send + Sync>;

pub struct EventListener {
    pub name: String,
    /// `(api_name, event_name)` pairs this listener is subscribed to.
    pub events: Vec<(String, String)>,
    pub handler: EventHandler,
}

/// Listeners registered before `start_server`. Registration after the server
/// is already running does not retroactively spawn a consumer for it; that
/// mirrors the one-shot nature of `start_server`'s task-spawning sweep.
#[derive(Default)]
pub struct EventListenerManager {
    listeners: RwLock<Vec<Arc<EventListener>>>,
}

impl EventListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen_for_event(
        &self,
        api_name: impl Into<String>,
        event_name: impl Into<String>,
        listener_name: impl Into<String>,
        handler: EventHandler,
    ) -> Result<(), BusError> {
        self.listen_for_events(vec![(api_name.into(), event_name.into())], listener_name, handler)
    }

    pub fn listen_for_events(
        &self,
        events: Vec<(String, String)>,
        listener_name: impl Into<String>,
        handler: EventHandler,
    ) -> Result<(), BusError> {
        if events.is_empty() {
            return Err(BusError::NoApisToListenOn);
        }
        let name = listener_name.into();
        if name.trim().is_empty() {
            return Err(BusError::InvalidEventListener {
                listener_name: name,
                message: "listener name must not be empty".to_owned(),
            });
        }
        let mut guard = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        if guard.iter().any(|existing| existing.name == name) {
            return Err(BusError::InvalidEventListener {
                listener_name: name,
                message: "listener_name must be unique among active listeners".to_owned(),
            });
        }
        guard.push(Arc::new(EventListener { name, events, handler }));
        Ok(())
    }

    pub fn listeners(&self) -> Vec<Arc<EventListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// One long-lived consumer task for `listener`: pulls matching events off
/// whichever event transport serves the first api it is subscribed to, runs
/// the before/after execution hooks around the handler, and logs (rather
/// than propagates) handler failures: one listener's bug must not take down
/// the others.
pub fn spawn_listener_task(
    listener: Arc<EventListener>,
    transports: Arc<TransportRegistry>,
    apis: Arc<ApiRegistry>,
    hooks: Arc<HookDispatcher>,
    schema: Arc<SchemaCoordinator>,
    metrics: Arc<BusMetrics>,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some((first_api, _)) = listener.events.first() else {
            return;
        };
        let Some(transport) = transports.event_transport(first_api) else {
            tracing::warn!(listener = %listener.name, api = %first_api, "no event transport bound, listener task exiting");
            return;
        };

        loop {
            let event = tokio::select! {
                _ = shutdown.notified() => return,
                result = transport.recv_event(&listener.events, &listener.name) => match result {
                    Ok(Some(event)) => event,
                    Ok(None) => return,
                    Err(err) => {
                        tracing::warn!(listener = %listener.name, error = %err, "event transport error, listener task exiting");
                        return;
                    }
                },
            };
            metrics.record_ingress();

            if let Ok(api) = apis.get(&event.api_name) {
                if let Err(err) = schema.validate_event_kwargs(&api, &event.event_name, &event.kwargs) {
                    tracing::warn!(listener = %listener.name, error = %err, "dropping event that failed schema validation");
                    continue;
                }
            }

            let payload: Value = serde_json::to_value(&event).unwrap_or(Value::Null);
            let before_ctx = HookContext::new(HookPoint::BeforeEventExecution, event.id.to_string(), now_unix_millis())
                .with_event_message(payload.clone());
            if hooks.fire(&before_ctx).await.is_err() {
                continue;
            }

            let handler_result = (listener.handler)(event.clone()).await;

            let after_ctx = HookContext::new(HookPoint::AfterEventExecution, event.id.to_string(), now_unix_millis())
                .with_event_message(payload);
            let _ = hooks.fire(&after_ctx).await;

            if let Err(err) = handler_result {
                tracing::error!(listener = %listener.name, error = %err, "event listener handler failed");
            }
        }
    })
}
