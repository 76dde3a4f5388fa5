//! One worker per running tenant.
//!
//! A [`Worker`] owns exactly one background relay task bound to the
//! connection snapshot it was created with. It never changes tenant or
//! configuration; a reconfiguration is a stop of this worker and a start of a
//! new one.
use std::{fmt, sync::Arc, time::Duration};

use crossbeam_utils::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{Mutex, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;

pub mod relay;

pub use relay::{GatewayRelayFactory, Relay, RelayFactory};

/// `Created -> Running -> Stopping -> Stopped`. Nothing leaves `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker `{0}` was already started")]
    AlreadyStarted(String),
    #[error("worker `{client_id}` failed to start: {reason}")]
    StartFailed { client_id: String, reason: String },
    #[error("worker `{0}` did not confirm start within {1:?}")]
    StartTimeout(String, Duration),
    #[error("worker `{0}` did not stop within {1:?}, task left to finish on its own")]
    StopTimeout(String, Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimeouts {
    /// How long `start` waits for the relay to report it is runnable.
    pub start: Duration,
    /// How long `stop` waits for the relay task to wind down.
    pub stop: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(10),
            stop: Duration::from_secs(5),
        }
    }
}

pub struct Worker {
    connection: Connection,
    relays: Arc<dyn RelayFactory>,
    timeouts: WorkerTimeouts,
    state: AtomicCell<WorkerState>,
    cancel: CancellationToken,
    // held across start/stop so the two never interleave on one worker
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(connection: Connection, relays: Arc<dyn RelayFactory>, timeouts: WorkerTimeouts) -> Self {
        Self {
            connection,
            relays,
            timeouts,
            state: AtomicCell::new(WorkerState::Created),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.connection.client_id
    }

    /// The configuration this worker was created with.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn state(&self) -> WorkerState {
        self.state.load()
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Launch the relay task and wait until it reports it is runnable.
    ///
    /// A failed start leaves the worker `Stopped`; it cannot be retried.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let mut task = self.task.lock().await;
        if self.state() != WorkerState::Created {
            return Err(WorkerError::AlreadyStarted(self.client_id().to_string()));
        }

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let handle = tokio::spawn(relay_task(
            self.connection.clone(),
            self.relays.clone(),
            self.cancel.clone(),
            ready_tx,
        ));

        let failure = match timeout(self.timeouts.start, ready_rx).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(reason))) => Some(WorkerError::StartFailed {
                client_id: self.client_id().to_string(),
                reason,
            }),
            // the task died before saying anything
            Ok(Err(_)) => Some(WorkerError::StartFailed {
                client_id: self.client_id().to_string(),
                reason: "relay task exited before becoming ready".to_string(),
            }),
            Err(_) => Some(WorkerError::StartTimeout(
                self.client_id().to_string(),
                self.timeouts.start,
            )),
        };

        if let Some(err) = failure {
            self.cancel.cancel();
            handle.abort();
            self.state.store(WorkerState::Stopped);
            return Err(err);
        }

        *task = Some(handle);
        self.state.store(WorkerState::Running);
        info!(client_id = %self.client_id(), "Worker started");
        Ok(())
    }

    /// Cancel the relay task and wait for it, bounded by the stop timeout.
    ///
    /// No-op unless the worker is running. On timeout the task is detached and
    /// the worker still ends up `Stopped`.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let mut task = self.task.lock().await;
        if self.state() != WorkerState::Running {
            debug!(client_id = %self.client_id(), state = ?self.state(), "Stop ignored");
            return Ok(());
        }

        self.state.store(WorkerState::Stopping);
        self.cancel.cancel();

        let result = match task.take() {
            Some(handle) => match timeout(self.timeouts.stop, handle).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(join_err)) => {
                    error!(client_id = %self.client_id(), "Relay task ended abnormally: {join_err}");
                    Ok(())
                }
                Err(_) => {
                    warn!(
                        client_id = %self.client_id(),
                        "Relay task did not stop within {:?}, detaching it",
                        self.timeouts.stop
                    );
                    Err(WorkerError::StopTimeout(
                        self.client_id().to_string(),
                        self.timeouts.stop,
                    ))
                }
            },
            None => Ok(()),
        };

        self.state.store(WorkerState::Stopped);
        info!(client_id = %self.client_id(), "Worker stopped");
        result
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("client_id", &self.connection.client_id)
            .field("system_url", &self.connection.system_url)
            .field("state", &self.state())
            .finish()
    }
}

async fn relay_task(
    connection: Connection,
    relays: Arc<dyn RelayFactory>,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let client_id = connection.client_id.clone();
    let prepared = tokio::select! {
        _ = cancel.cancelled() => return,
        prepared = relays.prepare(&connection) => prepared,
    };

    let relay = match prepared {
        Ok(relay) => relay,
        Err(err) => {
            let _ = ready.send(Err(format!("{err:#}")));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        // start gave up waiting
        return;
    }

    if let Err(err) = relay.run(cancel).await {
        error!(client_id = %client_id, "Relay exited with error: {err:#}");
    } else {
        debug!(client_id = %client_id, "Relay exited");
    }
}
