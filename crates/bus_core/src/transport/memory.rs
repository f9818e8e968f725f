//! In-memory transport pair used as test scaffolding. Not part of the public
//! dispatch contract beyond implementing the four transport traits; exercises
//! the engine's concurrency behavior without a real broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Notify};

use crate::errors::BusError;
use crate::messages::{EventMessage, MessageId, ReturnPath, ResultMessage, RpcMessage};
use crate::transport::{EventTransport, ResultTransport, RpcTransport, SchemaTransport, TransportFuture};

/// One shared in-memory bus. RPC calls fan into an mpsc queue consumed by
/// `consume_rpcs`; results are routed back by return path through a map of
/// one-shot waiters; events fan out over a broadcast channel.
pub struct InMemoryBus {
    rpc_tx: mpsc::UnboundedSender<RpcMessage>,
    rpc_rx: Mutex<mpsc::UnboundedReceiver<RpcMessage>>,
    results: Mutex<HashMap<String, ResultMessage>>,
    result_notify: Notify,
    events: broadcast::Sender<EventMessage>,
    schema: Mutex<HashMap<String, Value>>,
    closed: AtomicBool,
    closed_notify: Notify,
    next_return_path: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> std::sync::Arc<Self> {
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        std::sync::Arc::new(Self {
            rpc_tx,
            rpc_rx: Mutex::new(rpc_rx),
            results: Mutex::new(HashMap::new()),
            result_notify: Notify::new(),
            events,
            schema: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            next_return_path: AtomicU64::new(1),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl RpcTransport for InMemoryBus {
    fn open(&self) -> TransportFuture<'_, Result<(), BusError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> TransportFuture<'_, Result<(), BusError>> {
        Box::pin(async {
            self.closed.store(true, Ordering::Release);
            self.closed_notify.notify_waiters();
            self.result_notify.notify_waiters();
            Ok(())
        })
    }

    fn consume_rpcs<'a>(&'a self, _apis: &'a [String]) -> TransportFuture<'a, Result<Vec<RpcMessage>, BusError>> {
        Box::pin(async move {
            loop {
                {
                    let mut rx = self.rpc_rx.lock().unwrap();
                    match rx.try_recv() {
                        Ok(message) => return Ok(vec![message]),
                        Err(mpsc::error::TryRecvError::Empty) => {}
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            return Err(BusError::TransportClosed)
                        }
                    }
                }
                if self.is_closed() {
                    return Err(BusError::TransportClosed);
                }
                tokio::select! {
                    _ = self.closed_notify.notified() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_millis(5)) => {}
                }
                if self.is_closed() {
                    return Err(BusError::TransportClosed);
                }
            }
        })
    }

    fn call_rpc<'a>(&'a self, message: &'a RpcMessage) -> TransportFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            self.rpc_tx
                .send(message.clone())
                .map_err(|_| BusError::TransportClosed)
        })
    }
}

impl ResultTransport for InMemoryBus {
    fn open(&self) -> TransportFuture<'_, Result<(), BusError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> TransportFuture<'_, Result<(), BusError>> {
        Box::pin(async {
            self.closed.store(true, Ordering::Release);
            self.result_notify.notify_waiters();
            Ok(())
        })
    }

    fn get_return_path<'a>(&'a self, _message: &'a RpcMessage) -> TransportFuture<'a, Result<ReturnPath, BusError>> {
        Box::pin(async move {
            let n = self.next_return_path.fetch_add(1, Ordering::Relaxed);
            Ok(ReturnPath(format!("mem-{n}")))
        })
    }

    fn send_result<'a>(
        &'a self,
        rpc_message_id: &'a MessageId,
        result: &'a ResultMessage,
        return_path: &'a ReturnPath,
    ) -> TransportFuture<'a, Result<(), BusError>> {
        let _ = rpc_message_id;
        Box::pin(async move {
            self.results
                .lock()
                .unwrap()
                .insert(return_path.0.clone(), result.clone());
            self.result_notify.notify_waiters();
            Ok(())
        })
    }

    fn receive_result<'a>(
        &'a self,
        _rpc_message_id: &'a MessageId,
        return_path: &'a ReturnPath,
    ) -> TransportFuture<'a, Result<ResultMessage, BusError>> {
        Box::pin(async move {
            loop {
                if let Some(result) = self.results.lock().unwrap().remove(&return_path.0) {
                    return Ok(result);
                }
                if self.is_closed() {
                    return Err(BusError::TransportClosed);
                }
                self.result_notify.notified().await;
            }
        })
    }
}

impl EventTransport for InMemoryBus {
    fn open(&self) -> TransportFuture<'_, Result<(), BusError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> TransportFuture<'_, Result<(), BusError>> {
        Box::pin(async {
            self.closed.store(true, Ordering::Release);
            self.closed_notify.notify_waiters();
            Ok(())
        })
    }

    fn send_event<'a>(&'a self, message: &'a EventMessage) -> TransportFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            // A broadcast send failing (no receivers) is not an error: events
            // are fire-and-forget with zero-or-more consumers.
            let _ = self.events.send(message.clone());
            Ok(())
        })
    }

    fn recv_event<'a>(
        &'a self,
        events: &'a [(String, String)],
        _listener_name: &'a str,
    ) -> TransportFuture<'a, Result<Option<EventMessage>, BusError>> {
        Box::pin(async move {
            let mut rx = self.events.subscribe();
            loop {
                if self.is_closed() {
                    return Ok(None);
                }
                tokio::select! {
                    _ = self.closed_notify.notified() => return Ok(None),
                    received = rx.recv() => {
                        match received {
                            Ok(event) => {
                                if events.iter().any(|(api, name)| *api == event.api_name && *name == event.event_name) {
                                    return Ok(Some(event));
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => return Ok(None),
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            }
        })
    }
}

impl SchemaTransport for InMemoryBus {
    fn open(&self) -> TransportFuture<'_, Result<(), BusError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> TransportFuture<'_, Result<(), BusError>> {
        Box::pin(async { Ok(()) })
    }

    fn load(&self) -> TransportFuture<'_, Result<HashMap<String, Value>, BusError>> {
        Box::pin(async move { Ok(self.schema.lock().unwrap().clone()) })
    }

    fn store<'a>(&'a self, api_name: &'a str, schema: Value) -> TransportFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            self.schema.lock().unwrap().insert(api_name.to_owned(), schema);
            Ok(())
        })
    }

    fn poll_change(&self) -> TransportFuture<'_, Result<Option<(String, Value)>, BusError>> {
        Box::pin(async { Ok(None) })
    }
}
