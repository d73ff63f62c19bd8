//! Request dispatcher - correlates worker responses with waiting callers.
//!
//! Every outbound request gets a fresh [`RequestId`] and a pending entry holding
//! a oneshot waiter. An entry leaves the table exactly once, through whichever
//! path removes it first:
//! - a response with a matching id arrives (`on_bytes`)
//! - the caller's timeout fires
//! - the process goes away (`fail_all`)
//! - the caller stops waiting (its future is dropped)
//!
//! Removal from the DashMap is the arbitration point, so two paths can never
//! both deliver for the same id. No lock is held while a caller waits.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Semaphore, oneshot};
use tokio_util::bytes::{Bytes, BytesMut};

use crate::bridge::codec;
use crate::bridge::protocol::{Inbound, Request, RequestId, Response};
use crate::config::CorrelationMode;
use crate::error::BridgeError;

/// Destination for encoded request lines (the worker's stdin).
#[async_trait]
pub trait LineSink: Send + Sync {
    /// Write one complete line. Fails with `ProcessNotRunning` when there is no
    /// live worker to write to.
    async fn write_line(&self, line: Bytes) -> Result<(), BridgeError>;
}

type Waiter = oneshot::Sender<Result<Value, BridgeError>>;

struct PendingEntry {
    action: String,
    issued_at: Instant,
    waiter: Waiter,
}

pub struct Dispatcher {
    pending: DashMap<RequestId, PendingEntry>,
    /// Bytes of an incomplete trailing line from the last read.
    inbound: StdMutex<BytesMut>,
    mode: CorrelationMode,
    /// Admits one request at a time in `Sequential` mode.
    turn: Semaphore,
    /// Abandoned requests whose id-less replies are still expected (`Sequential`).
    orphans: AtomicUsize,
}

impl Dispatcher {
    pub fn new(mode: CorrelationMode) -> Self {
        Self {
            pending: DashMap::new(),
            inbound: StdMutex::new(BytesMut::new()),
            mode,
            turn: Semaphore::new(1),
            orphans: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its outcome.
    ///
    /// Encoding problems are reported before anything is written. `timeout`
    /// bounds the whole call: waiting for a turn, writing the line and waiting
    /// for the response.
    pub async fn send(
        &self,
        sink: &dyn LineSink,
        action: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let request = Request::new(action, params)?;
        let line = codec::encode(&request)?;

        let _turn = match self.mode {
            CorrelationMode::Sequential => {
                match tokio::time::timeout_at(deadline, self.turn.acquire()).await {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => return Err(BridgeError::ProcessNotRunning),
                    Err(_) => {
                        tracing::warn!(action, ?timeout, "Request timed out waiting for its turn");
                        return Err(BridgeError::Timeout(timeout));
                    }
                }
            }
            CorrelationMode::EchoId => None,
        };

        let id = request.id;
        let (waiter, mut outcome) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingEntry {
                action: request.action,
                issued_at: Instant::now(),
                waiter,
            },
        );
        let mut guard = PendingGuard {
            dispatcher: self,
            id: &id,
            written: false,
        };

        tracing::debug!(request_id = %id, action, "Sending request");
        match tokio::time::timeout_at(deadline, sink.write_line(line)).await {
            Ok(Ok(())) => guard.written = true,
            Ok(Err(e)) => {
                if self.pending.remove(&id).is_some() {
                    tracing::debug!(request_id = %id, error = %e, "Request was not written");
                    return Err(e);
                }
                // Already resolved elsewhere (e.g. drained by a crash).
                return outcome.await.unwrap_or(Err(BridgeError::ProcessNotRunning));
            }
            Err(_) => {
                if self.pending.remove(&id).is_some() {
                    tracing::warn!(request_id = %id, action, ?timeout, "Request timed out before the worker accepted it");
                    return Err(BridgeError::Timeout(timeout));
                }
                return outcome.await.unwrap_or(Err(BridgeError::ProcessNotRunning));
            }
        }

        match tokio::time::timeout_at(deadline, &mut outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ProcessNotRunning),
            Err(_) => {
                if self.abandon(&id, true) {
                    tracing::warn!(request_id = %id, action, ?timeout, "Request timed out");
                    Err(BridgeError::Timeout(timeout))
                } else {
                    // A response won the race against the timer.
                    outcome.await.unwrap_or(Err(BridgeError::ProcessNotRunning))
                }
            }
        }
    }

    /// Feed bytes read from the worker's stdout.
    ///
    /// Returns true if the batch contained the ready signal.
    pub fn on_bytes(&self, bytes: &[u8]) -> bool {
        let messages = {
            let mut buffer = self.lock_inbound();
            codec::decode(&mut buffer, bytes)
        };

        let mut ready = false;
        for value in messages {
            match Inbound::from_value(value) {
                Ok(Inbound::Ready) => {
                    tracing::debug!("Worker signalled ready");
                    ready = true;
                }
                Ok(Inbound::Response(response)) => self.resolve(response),
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring unrecognized message from worker");
                }
            }
        }
        ready
    }

    /// Resolve every pending entry with `error`. Returns how many were resolved.
    pub fn fail_all(&self, error: BridgeError) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((id, entry)) = self.pending.remove(&id) {
                tracing::debug!(request_id = %id, action = %entry.action, error = %error, "Failing pending request");
                let _ = entry.waiter.send(Err(error.clone()));
                failed += 1;
            }
        }
        self.orphans.store(0, Ordering::SeqCst);
        failed
    }

    /// Forget any partial line left over from a previous process.
    pub fn reset_inbound(&self) {
        self.lock_inbound().clear();
    }

    fn resolve(&self, response: Response) {
        let id = match response.id.clone() {
            Some(id) => id,
            None => match self.unlabelled_target() {
                Some(id) => id,
                None => return,
            },
        };

        match self.pending.remove(&id) {
            Some((id, entry)) => {
                tracing::debug!(
                    request_id = %id,
                    action = %entry.action,
                    success = response.success,
                    elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
                    "Response received"
                );
                if entry.waiter.send(response.into_result()).is_err() {
                    tracing::debug!(request_id = %id, "Caller stopped waiting before the response arrived");
                }
            }
            None => {
                tracing::debug!(request_id = %id, "Discarding response for unknown or expired request");
            }
        }
    }

    /// Which entry an id-less response belongs to, if it can be told.
    fn unlabelled_target(&self) -> Option<RequestId> {
        match self.mode {
            CorrelationMode::EchoId => {
                tracing::warn!("Discarding response without an id");
                None
            }
            CorrelationMode::Sequential => {
                if self
                    .orphans
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    tracing::debug!("Discarding late response to an abandoned request");
                    return None;
                }
                let ids: Vec<RequestId> = self
                    .pending
                    .iter()
                    .take(2)
                    .map(|e| e.key().clone())
                    .collect();
                match ids.as_slice() {
                    [only] => Some(only.clone()),
                    [] => {
                        tracing::debug!("Discarding response with no request in flight");
                        None
                    }
                    _ => {
                        tracing::warn!("Discarding ambiguous response without an id");
                        None
                    }
                }
            }
        }
    }

    /// Remove an entry nobody will wait for any more. True if it was still pending.
    ///
    /// `written` says whether the line reached the worker, i.e. whether a reply
    /// is still coming.
    fn abandon(&self, id: &RequestId, written: bool) -> bool {
        let removed = self.pending.remove(id).is_some();
        if removed && written && self.mode == CorrelationMode::Sequential {
            // The worker will still answer it, without an id.
            self.orphans.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    fn lock_inbound(&self) -> std::sync::MutexGuard<'_, BytesMut> {
        match self.inbound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Inbound buffer mutex poisoned - discarding partial line");
                let mut guard = poisoned.into_inner();
                guard.clear();
                guard
            }
        }
    }
}

/// Removes the caller's entry if its future is dropped while still pending.
struct PendingGuard<'a> {
    dispatcher: &'a Dispatcher,
    id: &'a RequestId,
    written: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.dispatcher.abandon(self.id, self.written) {
            tracing::debug!(request_id = %self.id, "Request abandoned by caller");
        }
    }
}
