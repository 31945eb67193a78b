//! Operation correlation
//!
//! A [`Correlator`] turns the fire-and-forget routing fabric into
//! request/response calls. Each correlation scope (a connection, or the
//! SVC channel) owns one correlator with its own id counter and pending
//! table.
//!
//! Operation ids come from a wrapping counter that skips zero and any id
//! still in flight. Responses are matched by id only; arrival order does
//! not matter.

use super::error::{BusError, BusResult};
use super::message::{
    CportId, InterfaceId, Message, MessageHeader, OperationId, OperationStatus,
};
use super::routing::{ForwardReceipt, RoutingFabric};
use super::worker::WorkerPool;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Number of usable operation ids (1..=0xffff)
const OPERATION_ID_SPACE: u32 = 0xffff;

/// Handles requests arriving on a correlation scope
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Process a request; the returned payload is sent back on success,
    /// the status otherwise
    async fn handle_request(&self, message_type: u8, payload: Bytes) -> Result<Bytes, OperationStatus>;
}

struct PendingOperation {
    tx: oneshot::Sender<BusResult<Message>>,
    message_type: u8,
    started: Instant,
}

/// Correlator counters snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationStats {
    /// Requests sent expecting a response
    pub sent: u64,
    /// Requests sent with no response expected
    pub unidirectional: u64,
    /// Responses matched to a pending operation
    pub completed: u64,
    /// Operations that hit their deadline
    pub timeouts: u64,
    /// Operations aborted by `cancel_all`
    pub canceled: u64,
    /// Responses with no matching pending operation
    pub unknown_responses: u64,
    /// Frames rejected as malformed
    pub invalid_messages: u64,
    /// Inbound requests handed to the request handler
    pub requests_handled: u64,
    /// Operations currently pending
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    unidirectional: AtomicU64,
    completed: AtomicU64,
    timeouts: AtomicU64,
    canceled: AtomicU64,
    unknown_responses: AtomicU64,
    invalid_messages: AtomicU64,
    requests_handled: AtomicU64,
}

/// Removes a pending entry if the waiting future is dropped early
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<OperationId, PendingOperation>>,
    id: OperationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Request/response correlation for one scope
pub struct Correlator {
    name: String,
    fabric: Arc<RoutingFabric>,
    workers: WorkerPool,
    local_if: InterfaceId,
    cycle: AtomicU32,
    pending: Mutex<HashMap<OperationId, PendingOperation>>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    counters: Counters,
}

impl Correlator {
    /// Create a correlator sending from interface `local_if`
    pub fn new(
        name: impl Into<String>,
        fabric: Arc<RoutingFabric>,
        workers: WorkerPool,
        local_if: InterfaceId,
    ) -> Self {
        Self {
            name: name.into(),
            fabric,
            workers,
            local_if,
            cycle: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
            counters: Counters::default(),
        }
    }

    /// Scope name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the handler for inbound requests
    pub fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Remove the request handler; later requests are answered with `protocol bad`
    pub fn clear_handler(&self) {
        *self.handler.write() = None;
    }

    /// Start the id counter at a given cycle value
    pub fn with_cycle(self, cycle: u32) -> Self {
        self.cycle.store(cycle, Ordering::SeqCst);
        self
    }

    /// Allocate an id and park the completion sender under it
    fn register(&self, tx: oneshot::Sender<BusResult<Message>>, message_type: u8) -> BusResult<OperationId> {
        let mut pending = self.pending.lock();

        for _ in 0..OPERATION_ID_SPACE {
            let cycle = self.cycle.fetch_add(1, Ordering::Relaxed);
            let id = (cycle % OPERATION_ID_SPACE + 1) as OperationId;
            if pending.contains_key(&id) {
                continue;
            }
            pending.insert(id, PendingOperation { tx, message_type, started: Instant::now() });
            return Ok(id);
        }

        Err(BusError::ResourceExhausted(format!("{}: all operation ids in flight", self.name)))
    }

    /// Send a request from `src_cport` and wait for its response.
    ///
    /// A response with a non-zero result is returned as [`BusError::Remote`].
    pub async fn send_sync(
        &self,
        src_cport: CportId,
        message_type: u8,
        payload: Bytes,
        timeout: Duration,
    ) -> BusResult<Message> {
        let mut request = Message::request(message_type, payload)?;
        let (tx, rx) = oneshot::channel();
        let id = self.register(tx, message_type)?;
        let guard = PendingGuard { pending: &self.pending, id };
        request.set_operation_id(id);

        let receipt = self.fabric.forward(self.local_if, src_cport, &request.encode())?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        trace!(scope = %self.name, op_id = id, msg_type = message_type, "request sent");

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(guard);

        match outcome {
            Ok(Ok(Ok(response))) => {
                let status = response.status();
                if status.is_success() {
                    Ok(response)
                } else {
                    debug!(scope = %self.name, op_id = id, %status, "request failed remotely");
                    Err(BusError::Remote(status))
                }
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(BusError::Canceled),
            Err(_) => {
                self.on_timeout(id, &receipt);
                Err(BusError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    fn on_timeout(&self, id: OperationId, receipt: &ForwardReceipt) {
        self.fabric.cancel(receipt);
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        warn!(scope = %self.name, op_id = id, dst = %receipt.dst, "operation timed out");
    }

    /// Send a request that expects no response (operation id 0)
    pub fn send_unidirectional(&self, src_cport: CportId, message_type: u8, payload: Bytes) -> BusResult<()> {
        let request = Message::request(message_type, payload)?;
        self.fabric.forward(self.local_if, src_cport, &request.encode())?;
        self.counters.unidirectional.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Inbound message delivered to `local_cport`.
    ///
    /// Runs on the delivery path: responses complete their operation in
    /// place, requests are handed to a worker.
    pub fn receive(&self, local_cport: CportId, raw: &[u8]) -> BusResult<()> {
        let message = match Message::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                self.counters.invalid_messages.fetch_add(1, Ordering::Relaxed);
                warn!(scope = %self.name, cport = local_cport, error = %e, "malformed message dropped");
                return Err(e);
            }
        };

        if message.is_response() {
            self.complete(message)
        } else {
            self.dispatch_request(local_cport, message);
            Ok(())
        }
    }

    fn complete(&self, response: Message) -> BusResult<()> {
        let id = response.operation_id();
        let Some(op) = self.pending.lock().remove(&id) else {
            self.counters.unknown_responses.fetch_add(1, Ordering::Relaxed);
            warn!(scope = %self.name, op_id = id, msg_type = response.header().message_type, "response for unknown operation dropped");
            return Err(BusError::NotFound(format!("operation {}", id)));
        };

        if op.message_type != response.request_type() {
            warn!(
                scope = %self.name,
                op_id = id,
                expected = op.message_type,
                got = response.request_type(),
                "response type mismatch"
            );
        }

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        trace!(scope = %self.name, op_id = id, elapsed_us = op.started.elapsed().as_micros() as u64, "operation complete");
        // Receiver gone means the caller already gave up
        let _ = op.tx.send(Ok(response));
        Ok(())
    }

    fn dispatch_request(&self, local_cport: CportId, request: Message) {
        self.counters.requests_handled.fetch_add(1, Ordering::Relaxed);
        let handler = self.handler.read().clone();
        let fabric = Arc::clone(&self.fabric);
        let scope = self.name.clone();
        let local_if = self.local_if;
        let header = *request.header();

        self.workers.spawn(async move {
            let result = match handler {
                Some(handler) => handler.handle_request(header.message_type, request.into_payload()).await,
                None => Err(OperationStatus::ProtocolBad),
            };

            if header.operation_id == 0 {
                if let Err(status) = result {
                    debug!(%scope, msg_type = header.message_type, %status, "unidirectional request failed");
                }
                return;
            }

            if let Err(e) = send_response(&fabric, local_if, local_cport, &header, result) {
                warn!(%scope, op_id = header.operation_id, error = %e, "failed to send response");
            }
        });
    }

    /// Fail every pending operation with `reason`
    pub fn cancel_all(&self, reason: &BusError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();

        for (id, op) in drained {
            trace!(scope = %self.name, op_id = id, "operation canceled");
            let _ = op.tx.send(Err(reason.clone()));
        }

        if count > 0 {
            self.counters.canceled.fetch_add(count as u64, Ordering::Relaxed);
            debug!(scope = %self.name, count, reason = %reason, "pending operations canceled");
        }
        count
    }

    /// Is an operation with this id in flight?
    pub fn is_pending(&self, id: OperationId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Number of operations in flight
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Counters snapshot
    pub fn stats(&self) -> OperationStats {
        OperationStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            unidirectional: self.counters.unidirectional.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            canceled: self.counters.canceled.load(Ordering::Relaxed),
            unknown_responses: self.counters.unknown_responses.load(Ordering::Relaxed),
            invalid_messages: self.counters.invalid_messages.load(Ordering::Relaxed),
            requests_handled: self.counters.requests_handled.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }
}

fn send_response(
    fabric: &RoutingFabric,
    local_if: InterfaceId,
    local_cport: CportId,
    request: &MessageHeader,
    result: Result<Bytes, OperationStatus>,
) -> BusResult<()> {
    let (status, payload) = match result {
        Ok(payload) => (OperationStatus::Success, payload),
        Err(status) => (status, Bytes::new()),
    };
    let response = Message::response(request, status, payload)?;
    fabric.forward(local_if, local_cport, &response.encode())?;
    Ok(())
}
