//! Network error resolver lifecycle.
//!
//! A single worker thread registers this node as the interconnect's fault
//! reporting endpoint and then services reports until cancelled. The thread
//! that starts it blocks on a handshake until the worker reports ready or
//! failed, so no step is programmed before faults can be resolved.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::NeterrError;
use crate::fabric::{FabricError, QswFabric};

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Lifecycle of the resolver worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    NotStarted,
    Starting,
    Ready,
    Failed,
    Cancelled,
}

impl fmt::Display for ResolverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One-shot startup result passed from the worker to its initiator.
struct Handshake {
    slot: Mutex<Option<Result<(), NeterrError>>>,
    ready: Condvar,
}

impl Handshake {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn report(&self, result: Result<(), NeterrError>) {
        let mut slot = self.slot.lock();
        *slot = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<(), NeterrError> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.ready.wait(&mut slot);
        }
    }
}

/// Worker side of the handshake. Reports `WorkerLost` if dropped without
/// reporting, so the initiator never waits forever on a panicked worker.
struct HandshakeGuard {
    handshake: Option<Arc<Handshake>>,
}

impl HandshakeGuard {
    fn report(mut self, result: Result<(), NeterrError>) {
        if let Some(handshake) = self.handshake.take() {
            handshake.report(result);
        }
    }
}

impl Drop for HandshakeGuard {
    fn drop(&mut self) {
        if let Some(handshake) = self.handshake.take() {
            handshake.report(Err(NeterrError::WorkerLost));
        }
    }
}

struct Inner {
    state: ResolverState,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

/// Owner of the resolver worker. One per node daemon.
pub struct FaultResolver {
    inner: Mutex<Inner>,
    cancel_grace: Duration,
}

impl FaultResolver {
    #[must_use]
    pub fn new(cancel_grace: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ResolverState::NotStarted,
                cancel: CancellationToken::new(),
                worker: None,
            }),
            cancel_grace,
        }
    }

    #[must_use]
    pub fn state(&self) -> ResolverState {
        self.inner.lock().state
    }

    /// Load the node name table, spawn the worker and wait for it to report.
    ///
    /// Starting an already running resolver is a no-op.
    ///
    /// # Errors
    ///
    /// `Spawn`, `Init`, `Register` or `WorkerLost` when the worker did not
    /// come up. The resolver is then `Failed` and may be started again.
    pub fn start(
        &self,
        fabric: Arc<dyn QswFabric>,
        nodes: &[(u32, String)],
    ) -> Result<(), NeterrError> {
        let handshake = Handshake::new();
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, ResolverState::Starting | ResolverState::Ready) {
                debug!(state = %inner.state, "fault resolver already started");
                return Ok(());
            }
            load_node_names(fabric.as_ref(), nodes);

            let cancel = CancellationToken::new();
            let guard = HandshakeGuard {
                handshake: Some(Arc::clone(&handshake)),
            };
            let worker_cancel = cancel.clone();
            let spawned = thread::Builder::new()
                .name("qsw-neterr".to_owned())
                .spawn(move || run_worker(fabric.as_ref(), guard, &worker_cancel));
            match spawned {
                Ok(handle) => {
                    inner.state = ResolverState::Starting;
                    inner.cancel = cancel;
                    inner.worker = Some(handle);
                }
                Err(e) => {
                    error!(error = %e, "can't spawn fault resolver thread");
                    inner.state = ResolverState::Failed;
                    return Err(NeterrError::Spawn(e.to_string()));
                }
            }
        }

        let result = handshake.wait();
        let mut inner = self.inner.lock();
        match &result {
            Ok(()) => info!("fault resolver ready"),
            Err(e) => error!(error = %e, "fault resolver failed to start"),
        }
        // A concurrent cancel wins over the startup result.
        if inner.state == ResolverState::Starting {
            inner.state = if result.is_ok() {
                ResolverState::Ready
            } else {
                inner.worker = None;
                ResolverState::Failed
            };
        }
        result
    }

    /// Ask the worker to stop and wait up to the grace period for it.
    ///
    /// The state becomes `Cancelled` even when the worker does not stop in
    /// time; it is then left detached.
    ///
    /// # Errors
    ///
    /// `NotRunning` if no worker was started, `StopTimeout` if it is still
    /// alive after the grace period.
    pub fn cancel(&self) -> Result<(), NeterrError> {
        let (cancel, worker) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, ResolverState::Starting | ResolverState::Ready) {
                return Err(NeterrError::NotRunning);
            }
            inner.state = ResolverState::Cancelled;
            (inner.cancel.clone(), inner.worker.take())
        };
        cancel.cancel();

        let Some(worker) = worker else {
            return Ok(());
        };
        let deadline = Instant::now() + self.cancel_grace;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                return Err(NeterrError::StopTimeout);
            }
            thread::sleep(JOIN_POLL);
        }
        if worker.join().is_err() {
            warn!("fault resolver thread panicked during shutdown");
        }
        debug!("fault resolver stopped");
        Ok(())
    }
}

impl Drop for FaultResolver {
    fn drop(&mut self) {
        self.inner.get_mut().cancel.cancel();
    }
}

/// Teach the fault service every node's hostname. Individual failures are
/// logged and skipped.
fn load_node_names(fabric: &dyn QswFabric, nodes: &[(u32, String)]) {
    for (node_id, host) in nodes {
        if let Err(e) = fabric.load_neterr_svc(*node_id, host) {
            error!(node_id, host = %host, error = %e, "can't load node name into fault service");
        }
    }
}

fn run_worker(fabric: &dyn QswFabric, handshake: HandshakeGuard, cancel: &CancellationToken) {
    debug!("starting interconnect fault resolver");

    if let Err(e) = fabric.init_neterr_svc() {
        handshake.report(Err(NeterrError::Init(e.to_string())));
        return;
    }

    match fabric.register_neterr_svc() {
        Ok(()) => {}
        Err(FabricError::AddressInUse) => {
            info!("fault resolver already running for this node");
        }
        Err(e) => {
            handshake.report(Err(NeterrError::Register(e.to_string())));
            return;
        }
    }
    handshake.report(Ok(()));

    match fabric.run_neterr_svc(cancel) {
        Ok(()) if cancel.is_cancelled() => debug!("fault resolver cancelled"),
        Ok(()) => warn!("fault resolver service returned unexpectedly"),
        Err(e) => error!(error = %e, "fault resolver service failed"),
    }
}
