//! Connection establishment with a hard wall-clock deadline.
//!
//! A transport's own open may overrun the timeout it is given, and may even block the thread it
//! runs on. The connector runs the open on a dedicated worker thread with a longer
//! transport-level timeout and waits on a completion signal for at most the caller's deadline.
//! If the deadline passes first, the worker is told to stop, the communication object is aborted
//! and [`ConnectError::TimedOut`] is returned. A worker that finishes after that point has nobody
//! to report to and its result is dropped. Worker threads are never reused.

use crate::error::TransportError;
use crate::transport::{Channel, ChannelFactory};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Extra time granted to the worker beyond the caller's deadline.
pub const DEFAULT_CONNECT_GRACE: Duration = Duration::from_secs(5);

/// Outcome of a bounded open that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The deadline passed before the transport reported back.
    #[error("connect timed out after {0:?}")]
    TimedOut(Duration),
    /// The transport reported a failure inside the deadline.
    #[error(transparent)]
    Failed(TransportError),
}

impl ConnectError {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

impl From<ConnectError> for TransportError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::TimedOut(after) => TransportError::ConnectTimeout(after),
            ConnectError::Failed(inner) => inner,
        }
    }
}

/// Opens channels and factories within a deadline, independent of transport behavior.
#[derive(Debug, Clone)]
pub struct BoundedConnector {
    grace: Duration,
}

impl Default for BoundedConnector {
    fn default() -> Self {
        Self { grace: DEFAULT_CONNECT_GRACE }
    }
}

impl BoundedConnector {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Transport-level timeout handed to the worker.
    pub fn worker_timeout(&self, timeout: Duration) -> Duration {
        timeout.saturating_add(self.grace)
    }

    /// Open `channel` within `timeout`.
    pub async fn open_channel(
        &self,
        channel: Arc<dyn Channel>,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        let worker_channel = channel.clone();
        self.bounded(
            "channel",
            timeout,
            move |budget| Box::pin(async move { worker_channel.open(budget).await }),
            move || channel.abort(),
        )
        .await
    }

    /// Open `factory` within `timeout`.
    pub async fn open_factory(
        &self,
        factory: Arc<dyn ChannelFactory>,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        let worker_factory = factory.clone();
        self.bounded(
            "factory",
            timeout,
            move |budget| Box::pin(async move { worker_factory.open(budget).await }),
            move || factory.abort(),
        )
        .await
    }

    async fn bounded<O, A>(
        &self,
        what: &'static str,
        timeout: Duration,
        open: O,
        abort: A,
    ) -> Result<(), ConnectError>
    where
        O: FnOnce(Duration) -> BoxFuture<'static, Result<(), TransportError>> + Send + 'static,
        A: FnOnce(),
    {
        let started = Instant::now();
        let budget = self.worker_timeout(timeout);
        let (done_tx, done_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let handle = Handle::current();

        // The open is driven on its own thread so a transport that blocks cannot stall the
        // caller's timer. Timers and I/O still come from the caller's runtime.
        let spawned = std::thread::Builder::new()
            .name(format!("lifeline-open-{what}"))
            .spawn(move || {
                let outcome = handle.block_on(async move {
                    tokio::select! {
                        result = open(budget) => Some(result),
                        _ = cancel_rx => None,
                    }
                });
                if let Some(result) = outcome {
                    // Err means the caller already gave up; the late result is discarded.
                    let _ = done_tx.send(result);
                }
            });
        if let Err(err) = spawned {
            abort();
            warn!(what, error = %err, "could not start open worker");
            return Err(ConnectError::Failed(TransportError::Communication(format!(
                "{what} open worker could not start: {err}"
            ))));
        }

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(what, elapsed_ms = started.elapsed().as_millis() as u64, "opened");
                Ok(())
            }
            Ok(Ok(Err(err))) => {
                debug!(what, error = %err, "open failed");
                Err(ConnectError::Failed(err))
            }
            Ok(Err(_)) => {
                // Worker dropped its sender without reporting (panicked).
                abort();
                Err(ConnectError::Failed(TransportError::Communication(format!(
                    "{what} open worker terminated"
                ))))
            }
            Err(_) => {
                let _ = cancel_tx.send(());
                abort();
                warn!(what, timeout_ms = timeout.as_millis() as u64, "open timed out; aborted");
                Err(ConnectError::TimedOut(timeout))
            }
        }
    }
}
