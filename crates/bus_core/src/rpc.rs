//! RPC Engine (SPEC §4.G): the server-side consumer loop that executes
//! locally-registered procedures for incoming calls, and the client-side
//! `call_rpc_remote` that dispatches a call and waits for its result.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use bus_plugin_core::{HookContext, HookPoint};

use crate::api::ApiRegistry;
use crate::errors::{BusError, RpcError};
use crate::hooks::HookDispatcher;
use crate::messages::{Direction, ResultMessage, RpcMessage};
use crate::metrics::BusMetrics;
use crate::schema::SchemaCoordinator;
use crate::transport::TransportRegistry;
use crate::util::now_unix_millis;

pub struct RpcEngine {
    pub apis: Arc<ApiRegistry>,
    pub transports: Arc<TransportRegistry>,
    pub hooks: Arc<HookDispatcher>,
    pub schema: Arc<SchemaCoordinator>,
    pub metrics: Arc<BusMetrics>,
}

impl RpcEngine {
    pub fn new(
        apis: Arc<ApiRegistry>,
        transports: Arc<TransportRegistry>,
        hooks: Arc<HookDispatcher>,
        schema: Arc<SchemaCoordinator>,
        metrics: Arc<BusMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            apis,
            transports,
            hooks,
            schema,
            metrics,
        })
    }

    /// Spawn one consumer task per distinct RPC transport backing `api_names`,
    /// each serving every api sharing that transport instance (SPEC §4.A).
    /// `shutdown` is raced against the (possibly long-blocking) transport
    /// poll so a consumer stops promptly even if the transport itself is
    /// never closed.
    pub fn spawn_consumers(self: &Arc<Self>, api_names: &[String], shutdown: Arc<Notify>) -> Vec<JoinHandle<()>> {
        self.transports
            .group_rpc_transports(api_names)
            .into_iter()
            .map(|(transport, served)| {
                let engine = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { engine.consumer_loop(transport, served, shutdown).await })
            })
            .collect()
    }

    async fn consumer_loop(
        self: Arc<Self>,
        transport: Arc<dyn crate::transport::RpcTransport>,
        served_apis: Vec<String>,
        shutdown: Arc<Notify>,
    ) {
        loop {
            let messages = tokio::select! {
                _ = shutdown.notified() => return,
                result = transport.consume_rpcs(&served_apis) => match result {
                    Ok(messages) => messages,
                    Err(_) => return,
                },
            };
            for message in messages {
                if let Err(err) = self.serve_one(&message).await {
                    if matches!(err, RpcError::SuddenDeath { .. }) {
                        tracing::error!(rpc = %message.canonical_name(), "sudden death, consumer terminating");
                        return;
                    }
                    tracing::warn!(rpc = %message.canonical_name(), error = %err, "rpc consumer failed to serve message");
                }
            }
        }
    }

    /// Validate, execute, and reply to one incoming `RpcMessage`. Returning
    /// `Err(RpcError::SuddenDeath)` signals the caller to stop the whole
    /// consumer loop rather than continue serving; every other error has
    /// already been converted into an error `ResultMessage` and sent.
    async fn serve_one(&self, message: &RpcMessage) -> Result<(), RpcError> {
        self.metrics.record_ingress();
        let api = self.apis.get(&message.api_name)?;

        if let Err(err) = self
            .schema
            .validate_rpc_kwargs(&api, &message.procedure_name, &message.kwargs, Direction::Incoming)
        {
            return self.reply_error(message, &err.to_string(), "").await;
        }

        let payload = serde_json::to_value(message).unwrap_or(Value::Null);
        let before_ctx = before_execution_ctx(message, payload.clone());
        if let Err(issue) = self.hooks.fire(&before_ctx).await {
            return self.reply_error(message, &issue.message, "").await;
        }

        self.metrics.inc_pending_server_execution();
        let outcome = match api.procedure(&message.procedure_name) {
            Some(procedure) => (procedure.handler)(message.kwargs.clone()).await,
            None => Err(RpcError::Bus(BusError::InvalidName(message.canonical_name()))),
        };
        self.metrics.dec_pending_server_execution();

        let after_ctx = after_execution_ctx(message, payload);
        let _ = self.hooks.fire(&after_ctx).await;

        match outcome {
            Ok(value) => self.reply_success(message, value).await,
            Err(RpcError::SuddenDeath { canonical_name }) => {
                Err(RpcError::SuddenDeath { canonical_name })
            }
            Err(err) => self.reply_error(message, &err.to_string(), "").await,
        }
    }

    async fn reply_success(&self, message: &RpcMessage, value: Value) -> Result<(), RpcError> {
        let api = self.apis.get(&message.api_name)?;
        if let Err(err) = self
            .schema
            .validate_result(&api, &message.procedure_name, &value, Direction::Outgoing)
        {
            return self.reply_error(message, &err.to_string(), "").await;
        }
        let result = ResultMessage::success(message.id.clone(), value);
        self.send_result(message, result).await
    }

    async fn reply_error(&self, message: &RpcMessage, error_message: &str, trace: &str) -> Result<(), RpcError> {
        let result = ResultMessage::failure(message.id.clone(), error_message, trace);
        self.send_result(message, result).await
    }

    async fn send_result(&self, message: &RpcMessage, result: ResultMessage) -> Result<(), RpcError> {
        let Some(return_path) = message.return_path.clone() else {
            return Err(RpcError::Bus(BusError::Internal(
                "rpc message has no return path set".to_owned(),
            )));
        };
        let result_transport = self
            .transports
            .result_transport(&message.api_name)
            .ok_or_else(|| RpcError::Bus(BusError::UnknownApi(message.api_name.clone())))?;
        result_transport
            .send_result(&message.id, &result, &return_path)
            .await?;
        Ok(())
    }

    /// Dispatch a call to `api_name.procedure_name` and await its result,
    /// bounded by `timeout_override` if set, else `default_timeout`.
    ///
    /// Races `receive_result` against `call_rpc` via `tokio::join!` so both
    /// futures start polling within the same scheduling slice; this narrows
    /// but does not eliminate the inherent hazard that a reply transport
    /// faster than the send path could, in principle, deliver a result
    /// before the send future has registered as polled.
    pub async fn call_rpc_remote(
        &self,
        api_name: &str,
        procedure_name: &str,
        kwargs: Value,
        timeout_override: Option<Duration>,
        default_timeout: Duration,
    ) -> Result<Value, RpcError> {
        let api = self.apis.get(api_name)?;
        self.schema
            .validate_rpc_kwargs(&api, procedure_name, &kwargs, Direction::Outgoing)?;

        let mut message = RpcMessage::new(api_name, procedure_name, kwargs);
        let canonical_name = message.canonical_name();

        let result_transport = self
            .transports
            .result_transport(api_name)
            .ok_or_else(|| RpcError::Bus(BusError::UnknownApi(api_name.to_owned())))?;
        let rpc_transport = self
            .transports
            .rpc_transport(api_name)
            .ok_or_else(|| RpcError::Bus(BusError::UnknownApi(api_name.to_owned())))?;

        let return_path = result_transport.get_return_path(&message).await?;
        message.return_path = Some(return_path.clone());

        let payload = serde_json::to_value(&message).unwrap_or(Value::Null);
        let before_ctx = HookContext::new(HookPoint::BeforeRpcCall, message.id.to_string(), now_unix_millis())
            .with_rpc_message(payload.clone());
        let _ = self.hooks.fire(&before_ctx).await;

        self.metrics.inc_pending_rpc();
        let start = std::time::Instant::now();
        let timeout = timeout_override.unwrap_or(default_timeout);

        let raced = tokio::time::timeout(timeout, async {
            tokio::join!(
                rpc_transport.call_rpc(&message),
                result_transport.receive_result(&message.id, &return_path)
            )
        })
        .await;

        self.metrics.dec_pending_rpc();

        let (call_outcome, receive_outcome) = match raced {
            Ok(pair) => pair,
            Err(_) => {
                return Err(RpcError::Timeout {
                    canonical_name,
                    timeout_secs: timeout.as_secs_f64(),
                })
            }
        };

        let latency_micros = start.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;

        if let Err(err) = call_outcome {
            self.metrics.record_rpc_call(latency_micros, true);
            let after_ctx = after_call_ctx(&message, payload.clone());
            let _ = self.hooks.fire(&after_ctx).await;
            return Err(RpcError::Bus(err));
        }

        let result_message = match receive_outcome {
            Ok(result_message) => result_message,
            Err(err) => {
                self.metrics.record_rpc_call(latency_micros, true);
                let after_ctx = after_call_ctx(&message, payload);
                let _ = self.hooks.fire(&after_ctx).await;
                return Err(RpcError::Bus(err));
            }
        };

        self.metrics
            .record_rpc_call(latency_micros, result_message.error);

        let result_payload = serde_json::to_value(&result_message).unwrap_or(Value::Null);
        let after_ctx = HookContext::new(HookPoint::AfterRpcCall, message.id.to_string(), now_unix_millis())
            .with_rpc_message(payload)
            .with_result_message(result_payload);
        let _ = self.hooks.fire(&after_ctx).await;

        if result_message.error {
            return Err(RpcError::ServerError {
                canonical_name,
                message: result_message
                    .result
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| result_message.result.to_string()),
                trace: result_message.trace.unwrap_or_default(),
            });
        }

        self.schema
            .validate_result(&api, procedure_name, &result_message.result, Direction::Incoming)?;
        Ok(result_message.result)
    }
}

fn before_execution_ctx(message: &RpcMessage, payload: Value) -> HookContext {
    HookContext::new(HookPoint::BeforeRpcExecution, message.id.to_string(), now_unix_millis())
        .with_rpc_message(payload)
}

fn after_execution_ctx(message: &RpcMessage, payload: Value) -> HookContext {
    HookContext::new(HookPoint::AfterRpcExecution, message.id.to_string(), now_unix_millis())
        .with_rpc_message(payload)
}

fn after_call_ctx(message: &RpcMessage, payload: Value) -> HookContext {
    HookContext::new(HookPoint::AfterRpcCall, message.id.to_string(), now_unix_millis())
        .with_rpc_message(payload)
}

#[cfg(test)]
mod tests;
