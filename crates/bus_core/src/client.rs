//! `BusClient`: the lifecycle controller (SPEC §4.H) and feature gate
//! (SPEC §4.I) that ties every other component together into the single
//! object applications construct and drive.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use bus_plugin_core::{BusHook, HookContext, HookPoint};

use crate::api::{Api, ApiRegistry, ParamSpec, Procedure, ProcedureHandler};
use crate::config::{BusClientConfig, Feature};
use crate::errors::{BusError, RpcError};
use crate::hooks::{HookConfig, HookDispatcher};
use crate::listener::{spawn_listener_task, EventHandler, EventListenerManager};
use crate::metrics::{BusMetrics, BusMetricsSnapshot};
use crate::rpc::RpcEngine;
use crate::scheduler::{ScheduleSpec, Scheduler, TickHandler};
use crate::schema::SchemaCoordinator;
use crate::tasks::{TaskKind, TaskRegistry};
use crate::transport::TransportRegistry;
use crate::util::now_unix_millis;

/// The lifecycle controller's current phase, exposed through the internal
/// `state.ping` procedure (SPEC §4.J).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Constructed,
    Initializing,
    Running,
    ShuttingDown,
    Closed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub phase: Phase,
    pub features: Vec<String>,
}

/// Which of the dispatcher's three ordered slots a hook registers into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookSlot {
    BeforePlugin,
    Plugin,
    AfterPlugin,
}

#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
}

enum BackgroundSpec {
    Every {
        interval: Duration,
        run_immediately: bool,
        handler: TickHandler,
    },
    Schedule {
        spec: ScheduleSpec,
        run_immediately: bool,
        handler: TickHandler,
    },
}

pub struct BusClient {
    config: BusClientConfig,
    apis: Arc<ApiRegistry>,
    transports: Arc<TransportRegistry>,
    hooks: Arc<HookDispatcher>,
    schema: Arc<SchemaCoordinator>,
    metrics: Arc<BusMetrics>,
    rpc_engine: Arc<RpcEngine>,
    listeners: Arc<EventListenerManager>,
    tasks: Arc<TaskRegistry>,
    phase: Arc<ArcSwap<Phase>>,
    active_features: Arc<RwLock<HashSet<Feature>>>,
    background_specs: RwLock<Vec<BackgroundSpec>>,
    shutdown_tx: AsyncMutex<Option<mpsc::Sender<i32>>>,
    exit_code: AtomicI32,
    init_lock: AsyncMutex<bool>,
}

impl BusClient {
    pub fn new(config: BusClientConfig) -> Arc<Self> {
        let apis = Arc::new(ApiRegistry::new());
        let transports = Arc::new(TransportRegistry::new());
        let hooks = Arc::new(HookDispatcher::new(HookConfig::new()));
        let schema = Arc::new(SchemaCoordinator::new());
        let metrics = Arc::new(BusMetrics::new(now_unix_millis()));
        let rpc_engine = RpcEngine::new(apis.clone(), transports.clone(), hooks.clone(), schema.clone(), metrics.clone());
        let active_features = Arc::new(RwLock::new(config.features().clone()));

        Arc::new(Self {
            config,
            apis,
            transports,
            hooks,
            schema,
            metrics,
            rpc_engine,
            listeners: Arc::new(EventListenerManager::new()),
            tasks: Arc::new(TaskRegistry::new()),
            phase: Arc::new(ArcSwap::new(Arc::new(Phase::Constructed))),
            active_features,
            background_specs: RwLock::new(Vec::new()),
            shutdown_tx: AsyncMutex::new(None),
            exit_code: AtomicI32::new(0),
            init_lock: AsyncMutex::new(false),
        })
    }

    pub fn phase(&self) -> Phase {
        **self.phase.load()
    }

    pub fn register_api(&self, api: Api) {
        self.apis.add(api);
    }

    pub fn bind_transport(&self, api_name: impl Into<String>, transports: crate::transport::TransportSet) {
        self.transports.bind(api_name, transports);
    }

    pub fn register_hook(&self, slot: HookSlot, point: HookPoint, hook: Arc<dyn BusHook>) {
        let config = match slot {
            HookSlot::BeforePlugin => HookConfig::new().with_before_plugin_hook(point, hook),
            HookSlot::Plugin => HookConfig::new().with_plugin_hook(point, hook),
            HookSlot::AfterPlugin => HookConfig::new().with_after_plugin_hook(point, hook),
        };
        self.hooks.register(config);
    }

    pub fn listen_for_event(
        &self,
        api_name: impl Into<String>,
        event_name: impl Into<String>,
        listener_name: impl Into<String>,
        handler: EventHandler,
    ) -> Result<(), BusError> {
        self.listeners.listen_for_event(api_name, event_name, listener_name, handler)
    }

    pub fn listen_for_events(
        &self,
        events: Vec<(String, String)>,
        listener_name: impl Into<String>,
        handler: EventHandler,
    ) -> Result<(), BusError> {
        self.listeners.listen_for_events(events, listener_name, handler)
    }

    pub fn add_background_every(&self, interval: Duration, run_immediately: bool, handler: TickHandler) {
        self.background_specs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(BackgroundSpec::Every {
                interval,
                run_immediately,
                handler,
            });
    }

    pub fn add_background_schedule(&self, spec: ScheduleSpec, run_immediately: bool, handler: TickHandler) {
        self.background_specs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(BackgroundSpec::Schedule {
                spec,
                run_immediately,
                handler,
            });
    }

    pub fn set_features_by_name(&self, names: &[String]) -> Result<(), BusError> {
        let mut parsed = HashSet::new();
        for name in names {
            parsed.insert(Feature::parse(name)?);
        }
        *self.active_features.write().unwrap_or_else(|p| p.into_inner()) = parsed;
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> BusMetricsSnapshot {
        self.metrics.snapshot(now_unix_millis())
    }

    /// Single-flight lazy initialization (SPEC §4.H): load remote schemas,
    /// publish local ones, open every distinct transport. Safe to call from
    /// every public operation; only the first caller does the work.
    async fn ensure_initialized(&self) -> Result<(), BusError> {
        let mut guard = self.init_lock.lock().await;
        if *guard {
            return Ok(());
        }
        self.schema.ensure_loaded_from_bus(&self.transports).await?;
        for api in self.apis.all() {
            self.schema.add_api(&api, &self.transports).await?;
        }
        let distinct = self.transports.all_distinct();
        for t in &distinct.rpc {
            t.open().await?;
        }
        for t in &distinct.result {
            t.open().await?;
        }
        for t in &distinct.event {
            t.open().await?;
        }
        for t in &distinct.schema {
            t.open().await?;
        }
        *guard = true;
        Ok(())
    }

    pub async fn call_rpc(
        &self,
        api_name: &str,
        procedure_name: &str,
        kwargs: Value,
        options: CallOptions,
    ) -> Result<Value, RpcError> {
        self.ensure_initialized().await?;
        if !self
            .active_features
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&Feature::Rpcs)
        {
            return Err(RpcError::Bus(BusError::UnsupportedUse {
                requested: "RPCS".to_owned(),
                allowed: "client was started with RPCS disabled".to_owned(),
            }));
        }
        let api_config = self.config.api(api_name);
        self.rpc_engine
            .call_rpc_remote(api_name, procedure_name, kwargs, options.timeout, api_config.rpc_timeout)
            .await
    }

    /// Validate → `before_event_sent` → send via transport → `after_event_sent`.
    /// This is the corrected flow; the reference implementation's `fire_event`
    /// erroneously routes through the listener-dispatch path instead (see
    /// design notes); that bug is not reproduced here.
    pub async fn fire_event(&self, api_name: &str, event_name: &str, kwargs: Value) -> Result<(), BusError> {
        self.ensure_initialized().await?;
        let api = self.apis.get(api_name)?;
        self.schema.validate_event_kwargs(&api, event_name, &kwargs)?;

        let message = crate::messages::EventMessage::new(api_name, event_name, kwargs);
        let payload = serde_json::to_value(&message).unwrap_or(Value::Null);

        let before_ctx = HookContext::new(HookPoint::BeforeEventSent, message.id.to_string(), now_unix_millis())
            .with_event_message(payload.clone());
        self.hooks
            .fire(&before_ctx)
            .await
            .map_err(|issue| BusError::Internal(issue.message))?;

        let transport = self
            .transports
            .event_transport(api_name)
            .ok_or_else(|| BusError::UnknownApi(api_name.to_owned()))?;
        transport.send_event(&message).await?;
        self.metrics.record_event_publish();

        let after_ctx = HookContext::new(HookPoint::AfterEventSent, message.id.to_string(), now_unix_millis())
            .with_event_message(payload);
        let _ = self.hooks.fire(&after_ctx).await;
        Ok(())
    }

    pub async fn shutdown_server(&self, exit_code: i32) {
        let guard = self.shutdown_tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(exit_code).await;
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    /// Steps numbered as in SPEC §4.H.
    pub async fn start_server(self: &Arc<Self>) -> Result<(), BusError> {
        tracing::info!("starting bus client");

        // 2. disable RPCS if nothing is registered to serve.
        if self.apis.is_empty() {
            let mut features = self.active_features.write().unwrap_or_else(|p| p.into_inner());
            if features.remove(&Feature::Rpcs) {
                tracing::info!("no apis registered, disabling serving of RPCs");
            }
        }

        // 3 & 4. shutdown channel plus its monitor.
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<i32>(1);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        {
            let me = Arc::clone(self);
            let shutdown_signal = self.tasks.shutdown_signal();
            let handle = tokio::spawn(async move {
                // Races the shared shutdown signal against the exit-code
                // channel: if `stop_server`/`close` is driven directly (no
                // `shutdown_server` call), the monitor must still return so
                // the task-registry drain awaiting its handle doesn't hang.
                tokio::select! {
                    _ = shutdown_signal.notified() => {}
                    received = shutdown_rx.recv() => {
                        if let Some(exit_code) = received {
                            me.exit_code.store(exit_code, Ordering::SeqCst);
                            let me = Arc::clone(&me);
                            // Spawned detached: stop_server awaits every recorded
                            // task including this monitor's own handle, so it must
                            // not be awaited from within the monitor itself.
                            tokio::spawn(async move { me.stop_server().await });
                        }
                    }
                }
            });
            self.supervise(TaskKind::Background, handle);
        }

        // 5. internal apis, pushed into the schema during lazy init below.
        self.register_internal_apis();

        // 6. lazy init.
        self.phase.store(Arc::new(Phase::Initializing));
        self.ensure_initialized().await?;

        // 7. schema monitor, escalating failure to a shutdown request.
        {
            let me = Arc::clone(self);
            let handle = tokio::spawn(async move { me.schema_monitor_loop().await });
            self.supervise(TaskKind::SchemaMonitor, handle);
        }

        // 8. before_worker_start.
        let before_ctx = HookContext::new(HookPoint::BeforeWorkerStart, "lifecycle".to_owned(), now_unix_millis());
        self.hooks
            .fire(&before_ctx)
            .await
            .map_err(|issue| BusError::Internal(issue.message))?;

        // 9 & 10. subject to the feature gate, spawn and record every task kind.
        let features = self.active_features.read().unwrap_or_else(|p| p.into_inner()).clone();

        if features.contains(&Feature::Rpcs) {
            let api_names = self.apis.names();
            for handle in self.rpc_engine.spawn_consumers(&api_names, self.tasks.shutdown_signal()) {
                self.supervise(TaskKind::RpcConsumer, handle);
            }
        } else {
            tracing::info!("RPCS feature disabled, no rpc consumer spawned");
        }

        if features.contains(&Feature::Events) {
            for listener in self.listeners.listeners() {
                let handle = spawn_listener_task(
                    listener,
                    self.transports.clone(),
                    self.apis.clone(),
                    self.hooks.clone(),
                    self.schema.clone(),
                    self.metrics.clone(),
                    self.tasks.shutdown_signal(),
                );
                self.supervise(TaskKind::EventListener, handle);
            }
        } else {
            tracing::info!("EVENTS feature disabled, no listener tasks spawned");
        }

        if features.contains(&Feature::Tasks) {
            let specs: Vec<BackgroundSpec> =
                std::mem::take(&mut *self.background_specs.write().unwrap_or_else(|p| p.into_inner()));
            for spec in specs {
                let shutdown = self.tasks.shutdown_signal();
                let handle = match spec {
                    BackgroundSpec::Every {
                        interval,
                        run_immediately,
                        handler,
                    } => Scheduler::every(interval, run_immediately, shutdown, handler)?,
                    BackgroundSpec::Schedule {
                        spec,
                        run_immediately,
                        handler,
                    } => Scheduler::schedule(spec, run_immediately, shutdown, handler)?,
                };
                self.supervise(TaskKind::Background, handle);
            }
        } else {
            tracing::info!("TASKS feature disabled, no background tasks spawned");
        }

        self.phase.store(Arc::new(Phase::Running));
        Ok(())
    }

    async fn schema_monitor_loop(self: Arc<Self>) {
        let shutdown = self.tasks.shutdown_signal();
        loop {
            tokio::select! {
                _ = shutdown.notified() => return,
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
            if let Err(err) = self.schema.poll_once(&self.transports).await {
                tracing::error!(error = %err, "schema monitor failed, requesting shutdown");
                self.shutdown_server(1).await;
                return;
            }
        }
    }

    /// Cancel the shutdown monitor and every recorded server task, then fire
    /// `after_worker_stopped`.
    pub async fn stop_server(self: &Arc<Self>) {
        self.phase.store(Arc::new(Phase::ShuttingDown));
        self.tasks.shutdown_and_join().await;
        let after_ctx = HookContext::new(HookPoint::AfterWorkerStopped, "lifecycle".to_owned(), now_unix_millis());
        let _ = self.hooks.fire(&after_ctx).await;
    }

    pub async fn close(self: &Arc<Self>) -> Result<(), BusError> {
        if self.phase() == Phase::Closed {
            return Err(BusError::BusAlreadyClosed);
        }
        self.stop_server().await;

        let distinct = self.transports.all_distinct();
        for t in &distinct.rpc {
            if let Err(err) = t.close().await {
                tracing::warn!(error = %err, "rpc transport close failed");
            }
        }
        for t in &distinct.result {
            if let Err(err) = t.close().await {
                tracing::warn!(error = %err, "result transport close failed");
            }
        }
        for t in &distinct.event {
            if let Err(err) = t.close().await {
                tracing::warn!(error = %err, "event transport close failed");
            }
        }
        for t in &distinct.schema {
            if let Err(err) = t.close().await {
                tracing::warn!(error = %err, "schema transport close failed");
            }
        }

        self.phase.store(Arc::new(Phase::Closed));
        Ok(())
    }

    /// Register `handle` under `kind`, wrapped in a supervisor that escalates
    /// a panic to a non-zero-exit shutdown (SPEC §3 invariant 4, Testable
    /// Property 8). A task that simply returns (shutdown observed, transport
    /// closed) is not a failure and is left alone.
    fn supervise(self: &Arc<Self>, kind: TaskKind, handle: JoinHandle<()>) {
        let me = Arc::clone(self);
        let supervisor = tokio::spawn(async move {
            if let Err(join_err) = handle.await {
                if join_err.is_panic() {
                    tracing::error!(error = %join_err, "background task panicked, requesting shutdown");
                    me.exit_code.store(1, Ordering::SeqCst);
                    let me = Arc::clone(&me);
                    // Drives stop_server directly rather than through
                    // shutdown_server's channel: the monitor that would
                    // otherwise receive it may be the very task that panicked.
                    tokio::spawn(async move { me.stop_server().await });
                }
            }
        });
        self.tasks.register(kind, supervisor);
    }

    fn register_internal_apis(&self) {
        self.apis.add(internal_state_api(self.phase.clone(), self.active_features.clone()));
        self.apis.add(internal_metrics_api(self.metrics.clone()));
    }
}

fn internal_state_api(phase: Arc<ArcSwap<Phase>>, features: Arc<RwLock<HashSet<Feature>>>) -> Api {
    let handler: ProcedureHandler = Arc::new(move |_kwargs| {
        let phase = phase.clone();
        let features = features.clone();
        Box::pin(async move {
            let current_phase: Phase = **phase.load();
            let feature_names = features
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .map(|f| f.as_str().to_owned())
                .collect();
            let snapshot = StateSnapshot {
                phase: current_phase,
                features: feature_names,
            };
            Ok(serde_json::to_value(snapshot).unwrap_or(Value::Null))
        })
    });
    Api::new("state").with_procedure("ping", Procedure::new(Vec::<ParamSpec>::new(), handler))
}

fn internal_metrics_api(metrics: Arc<BusMetrics>) -> Api {
    let handler: ProcedureHandler = Arc::new(move |_kwargs| {
        let metrics = metrics.clone();
        Box::pin(async move {
            let snapshot = metrics.snapshot(now_unix_millis());
            Ok(serde_json::to_value(snapshot).unwrap_or(Value::Null))
        })
    });
    Api::new("metrics").with_procedure("snapshot", Procedure::new(Vec::<ParamSpec>::new(), handler))
}

#[cfg(test)]
mod tests;
