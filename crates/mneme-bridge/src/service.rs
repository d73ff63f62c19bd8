//! Bridge: the facade collaborators talk to.
//!
//! Owns one supervisor and one dispatcher. `start`, `stop` and `request` are the
//! whole surface; everything else is convenience on top of `request`.
//!
//! Cloning is cheap and every clone drives the same worker, so any number of
//! tasks can issue requests concurrently.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;

use crate::bridge::codec;
use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;
use crate::error::BridgeError;
use crate::health::{BridgeStatus, ProcessState};
use crate::supervisor::ProcessSupervisor;

#[derive(Clone)]
pub struct Bridge {
    supervisor: Arc<ProcessSupervisor>,
    dispatcher: Arc<Dispatcher>,
    request_timeout: Duration,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("state", &self.supervisor.state())
            .field("mode", &self.dispatcher.mode())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Bridge {
    /// Create a bridge. Nothing is spawned until `start()`.
    pub fn new(config: BridgeConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(config.correlation));
        let request_timeout = config.request_timeout;
        let supervisor = Arc::new(ProcessSupervisor::new(config, Arc::clone(&dispatcher)));
        Self {
            supervisor,
            dispatcher,
            request_timeout,
        }
    }

    /// Launch the worker and wait for it to come up. No-op when already running.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.supervisor.start().await
    }

    /// Terminate the worker. Pending requests fail with `ProcessNotRunning`.
    pub async fn stop(&self) {
        self.supervisor.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.state().is_running()
    }

    pub fn state(&self) -> ProcessState {
        self.supervisor.state()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.supervisor.subscribe()
    }

    pub fn status(&self) -> BridgeStatus {
        self.supervisor.status()
    }

    pub fn pending_count(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// Issue one request with the configured timeout.
    ///
    /// `params` must be a JSON object (`null` is sent as `{}`). Resolves to the
    /// response `data`, or `{}` when the worker sent none.
    pub async fn request(
        &self,
        action: impl AsRef<str>,
        params: Value,
    ) -> Result<Value, BridgeError> {
        self.request_with_timeout(action, params, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        action: impl AsRef<str>,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        self.dispatcher
            .send(self.supervisor.as_ref(), action.as_ref(), params, timeout)
            .await
    }

    /// Typed request: serialize `params`, deserialize the result into `R`.
    ///
    /// Params containing NaN or an infinity fail with `Encoding` before any I/O.
    pub async fn call<P, R>(&self, action: impl AsRef<str>, params: &P) -> Result<R, BridgeError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = codec::to_params(params)?;
        let data = self.request(action, params).await?;
        serde_json::from_value(data).map_err(|e| BridgeError::Decoding(e.to_string()))
    }
}
