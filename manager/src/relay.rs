//! The cross-context relay.
//!
//! UI surfaces, this relay, and the privileged executor are three isolated
//! execution contexts; only the executor can reach the authenticated origin.
//! The relay's job is to guarantee that exactly one executor exists at a
//! time, to serialize access to it, and to get typed requests across even
//! when the executor has died in the meantime.
//!
//! Acquisition is single-flight: concurrent callers that find no executor
//! await the same in-flight attempt rather than creating duplicates. The
//! attempt is modeled as an owned state (not a boolean) holding a watch
//! channel its waiters subscribe to, cleared once the attempt settles so the
//! next failure can try again.

use crate::executor::{ExecutorHandle, ExecutorRequest};
use crate::protocol::{
    ControlMessage, Envelope, ErrorKind, SurfaceError, SurfaceRequest, SurfaceResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::instrument;

/// Total delivery attempts (including the first) before a dispatch fails.
pub const DELIVERY_ATTEMPTS: u32 = 3;

/// How long a freshly created executor gets to signal readiness.
pub const ACQUISITION_TIMEOUT: Duration = Duration::from_secs(10);

/// Readiness means the executor exists; give it a beat before treating it as
/// interactive.
pub const READY_GRACE: Duration = Duration::from_millis(150);

/// How executors come into being. Split out as a trait so the state machine
/// is testable without spawning real executors.
pub trait ExecutorSpawner: Send + Sync + 'static {
    /// Probes for an existing reachable executor before creating one.
    fn find_existing(&self) -> Option<ExecutorHandle>;

    /// Creates a new executor; the receiver fires when it is ready.
    fn create(&self) -> (ExecutorHandle, oneshot::Receiver<()>);
}

/// The default spawner: runs [`crate::executor::spawn`] and remembers the
/// handle so later acquisitions can find the still-live executor instead of
/// creating another.
pub struct ClientExecutorSpawner {
    client: innertube::InnerTubeClient,
    last: std::sync::Mutex<Option<ExecutorHandle>>,
}

impl ClientExecutorSpawner {
    pub fn new(client: innertube::InnerTubeClient) -> Self {
        Self {
            client,
            last: std::sync::Mutex::new(None),
        }
    }
}

impl ExecutorSpawner for ClientExecutorSpawner {
    fn find_existing(&self) -> Option<ExecutorHandle> {
        self.last
            .lock()
            .expect("no panics while holding handle lock")
            .clone()
            .filter(ExecutorHandle::is_reachable)
    }

    fn create(&self) -> (ExecutorHandle, oneshot::Receiver<()>) {
        let (handle, ready) = crate::executor::spawn(self.client.clone());
        *self
            .last
            .lock()
            .expect("no panics while holding handle lock") = Some(handle.clone());
        (handle, ready)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("could not acquire the executor: {0}")]
    Acquisition(String),
    #[error("could not deliver request to the executor after {attempts} attempts")]
    Delivery { attempts: u32 },
}

impl From<&RelayError> for SurfaceError {
    fn from(error: &RelayError) -> Self {
        SurfaceError::new(ErrorKind::Delivery, error.to_string())
    }
}

/// `None` while the attempt is in flight; errors are stringly typed because
/// every waiter gets a clone.
type AcquisitionOutcome = Option<Result<ExecutorHandle, String>>;

enum ExecutorState {
    /// No executor and nobody trying to make one.
    NoExecutor,
    /// An acquisition is in flight; waiters subscribe to its outcome.
    Acquiring(watch::Receiver<AcquisitionOutcome>),
    /// An executor answered readiness and has not failed delivery since.
    Ready(ExecutorHandle),
}

/// See the module docs. Cheap to clone; clones share the executor state.
#[derive(Clone)]
pub struct CrossContextRelay {
    state: Arc<Mutex<ExecutorState>>,
    spawner: Arc<dyn ExecutorSpawner>,
    /// Our application instance id; envelopes from other applications are
    /// never handled.
    application: String,
    /// Sink for control messages, wired to whatever hosts the UI.
    control_tx: mpsc::Sender<ControlMessage>,
    /// Sink for requests served by this process (overlay and undo state);
    /// the executor never sees those.
    local_tx: mpsc::Sender<ExecutorRequest>,
}

impl CrossContextRelay {
    pub fn new(
        spawner: Arc<dyn ExecutorSpawner>,
        application: impl Into<String>,
        control_tx: mpsc::Sender<ControlMessage>,
        local_tx: mpsc::Sender<ExecutorRequest>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(ExecutorState::NoExecutor)),
            spawner,
            application: application.into(),
            control_tx,
            local_tx,
        }
    }

    /// Entry point for raw surface messages: origin checks, shape
    /// validation, control handling, then executor dispatch.
    #[instrument(skip(self, envelope), fields(surface = %envelope.origin.surface))]
    pub async fn handle_envelope(&self, envelope: Envelope) -> SurfaceResponse {
        if envelope.origin.application != self.application {
            return SurfaceResponse::err(SurfaceError::new(
                ErrorKind::Untrusted,
                "message from a foreign application",
            ));
        }

        // Control messages are accepted from any surface of our application
        // but are handled here, never forwarded to the executor.
        if let Ok(control) = serde_json::from_value::<ControlMessage>(envelope.body.clone()) {
            tracing::debug!(?control, "handling control message locally");
            let _ = self.control_tx.send(control).await;
            return SurfaceResponse::ok_empty();
        }

        let Ok(request) = serde_json::from_value::<SurfaceRequest>(envelope.body.clone()) else {
            return SurfaceResponse::err(SurfaceError::new(
                ErrorKind::Unsupported,
                "unsupported message",
            ));
        };

        // Operation requests additionally require a trusted surface.
        if !envelope.origin.is_trusted_surface() {
            return SurfaceResponse::err(SurfaceError::new(
                ErrorKind::Untrusted,
                format!("surface '{}' may not issue requests", envelope.origin.surface),
            ));
        }

        if request.is_local() {
            return self.dispatch_local(request).await;
        }

        match self.forward(request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(error = %error, "dispatch failed");
                SurfaceResponse::err(SurfaceError::from(&error))
            }
        }
    }

    /// Hands an overlay or undo request to the in-process handler. No retry
    /// loop here: the handler lives in this process, so an unreachable one
    /// is a wiring bug, not a transient fault.
    async fn dispatch_local(&self, request: SurfaceRequest) -> SurfaceResponse {
        let (reply_tx, reply_rx) = oneshot::channel();
        let delivery = self
            .local_tx
            .send(ExecutorRequest {
                request,
                reply: reply_tx,
            })
            .await;
        if delivery.is_err() {
            return SurfaceResponse::err(SurfaceError::new(
                ErrorKind::Delivery,
                "local handler is gone",
            ));
        }
        match reply_rx.await {
            Ok(response) => response,
            Err(_) => SurfaceResponse::err(SurfaceError::new(
                ErrorKind::Delivery,
                "local handler dropped the reply",
            )),
        }
    }

    /// Forwards one typed request, re-establishing the executor between
    /// failed delivery attempts.
    pub async fn forward(&self, request: SurfaceRequest) -> Result<SurfaceResponse, RelayError> {
        for attempt in 1..=DELIVERY_ATTEMPTS {
            let handle = self.acquire().await?;

            let (reply_tx, reply_rx) = oneshot::channel();
            let delivery = handle
                .send(ExecutorRequest {
                    request: request.clone(),
                    reply: reply_tx,
                })
                .await;

            if delivery.is_err() {
                tracing::warn!(attempt, "executor unreachable, re-establishing");
                self.invalidate(&handle).await;
                continue;
            }

            match reply_rx.await {
                Ok(response) => return Ok(response),
                Err(_) => {
                    // Executor died mid-request. The operation may or may
                    // not have happened; retrying a fetch is harmless and
                    // mutations are idempotent enough in practice.
                    tracing::warn!(attempt, "executor dropped the reply, re-establishing");
                    self.invalidate(&handle).await;
                }
            }
        }

        Err(RelayError::Delivery {
            attempts: DELIVERY_ATTEMPTS,
        })
    }

    /// Returns a reachable executor, joining any in-flight acquisition
    /// rather than starting a second one.
    pub(crate) async fn acquire(&self) -> Result<ExecutorHandle, RelayError> {
        let mut outcome_rx = {
            let mut state = self.state.lock().await;
            match &*state {
                ExecutorState::Ready(handle) if handle.is_reachable() => {
                    return Ok(handle.clone());
                }
                ExecutorState::Acquiring(rx) => rx.clone(),
                ExecutorState::Ready(_) | ExecutorState::NoExecutor => {
                    let (outcome_tx, outcome_rx) = watch::channel(None);
                    *state = ExecutorState::Acquiring(outcome_rx.clone());

                    let spawner = Arc::clone(&self.spawner);
                    let shared_state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        let outcome = establish(spawner.as_ref()).await;
                        // Settle the state before waking waiters so nobody
                        // observes a stale Acquiring.
                        let mut state = shared_state.lock().await;
                        *state = match &outcome {
                            Ok(handle) => ExecutorState::Ready(handle.clone()),
                            Err(_) => ExecutorState::NoExecutor,
                        };
                        drop(state);
                        let _ = outcome_tx.send(Some(outcome));
                    });

                    outcome_rx
                }
            }
        };

        loop {
            if let Some(outcome) = outcome_rx.borrow_and_update().clone() {
                return outcome.map_err(RelayError::Acquisition);
            }
            if outcome_rx.changed().await.is_err() {
                return Err(RelayError::Acquisition(
                    "acquisition task vanished".to_string(),
                ));
            }
        }
    }

    /// Drops a dead executor from the state so the next acquisition starts
    /// fresh. Only clears state that still refers to that executor.
    async fn invalidate(&self, dead: &ExecutorHandle) {
        let mut state = self.state.lock().await;
        if let ExecutorState::Ready(current) = &*state
            && current.same_executor(dead)
        {
            *state = ExecutorState::NoExecutor;
        }
    }
}

/// One acquisition attempt: probe for an existing executor, otherwise create
/// one and wait for readiness plus the interactivity grace period.
async fn establish(spawner: &dyn ExecutorSpawner) -> Result<ExecutorHandle, String> {
    if let Some(existing) = spawner.find_existing()
        && existing.is_reachable()
    {
        tracing::debug!("reusing existing executor");
        return Ok(existing);
    }

    tracing::info!("creating executor");
    let (handle, ready) = spawner.create();

    match tokio::time::timeout(ACQUISITION_TIMEOUT, ready).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => return Err("executor exited before signalling readiness".to_string()),
        Err(_) => {
            return Err(format!(
                "executor not ready within {}s",
                ACQUISITION_TIMEOUT.as_secs()
            ));
        }
    }

    tokio::time::sleep(READY_GRACE).await;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const APP: &str = "test-app";

    /// Spawner whose executors immediately answer every request with an
    /// empty success, counting creations.
    struct CountingSpawner {
        created: AtomicUsize,
        /// When set, executors drop requests instead of answering them.
        unresponsive: bool,
    }

    impl CountingSpawner {
        fn new(unresponsive: bool) -> Self {
            Self {
                created: AtomicUsize::new(0),
                unresponsive,
            }
        }
    }

    impl ExecutorSpawner for CountingSpawner {
        fn find_existing(&self) -> Option<ExecutorHandle> {
            None
        }

        fn create(&self) -> (ExecutorHandle, oneshot::Receiver<()>) {
            self.created.fetch_add(1, Ordering::SeqCst);
            let (tx, mut rx) = mpsc::channel::<ExecutorRequest>(8);
            let (ready_tx, ready_rx) = oneshot::channel();
            let unresponsive = self.unresponsive;
            tokio::spawn(async move {
                let _ = ready_tx.send(());
                while let Some(request) = rx.recv().await {
                    if unresponsive {
                        drop(request.reply);
                    } else {
                        let _ = request.reply.send(SurfaceResponse::ok_empty());
                    }
                }
            });
            (ExecutorHandle::new(tx), ready_rx)
        }
    }

    /// Relay wired to a local handler that answers every request with an
    /// empty success and records what it saw.
    fn relay_with(
        spawner: Arc<CountingSpawner>,
    ) -> (
        CrossContextRelay,
        mpsc::Receiver<ControlMessage>,
        Arc<std::sync::Mutex<Vec<SurfaceRequest>>>,
    ) {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (local_tx, mut local_rx) = mpsc::channel::<ExecutorRequest>(8);
        let local_log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&local_log);
        tokio::spawn(async move {
            while let Some(request) = local_rx.recv().await {
                log.lock().unwrap().push(request.request);
                let _ = request.reply.send(SurfaceResponse::ok_empty());
            }
        });
        (
            CrossContextRelay::new(spawner, APP, control_tx, local_tx),
            control_rx,
            local_log,
        )
    }

    fn envelope(surface: &str, body: serde_json::Value) -> Envelope {
        Envelope {
            origin: crate::protocol::SurfaceOrigin {
                application: APP.to_string(),
                surface: surface.to_string(),
            },
            body,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquisition_creates_exactly_one_executor() {
        let spawner = Arc::new(CountingSpawner::new(false));
        let (relay, _control, _local) = relay_with(Arc::clone(&spawner));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let relay = relay.clone();
            handles.push(tokio::spawn(async move { relay.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(spawner.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_executor_is_reused_across_dispatches() {
        let spawner = Arc::new(CountingSpawner::new(false));
        let (relay, _control, _local) = relay_with(Arc::clone(&spawner));

        for _ in 0..3 {
            let response = relay
                .forward(SurfaceRequest::FetchPlaylists)
                .await
                .unwrap();
            assert!(response.success);
        }
        assert_eq!(spawner.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_retries_then_names_attempt_count() {
        let spawner = Arc::new(CountingSpawner::new(true));
        let (relay, _control, _local) = relay_with(Arc::clone(&spawner));

        let error = relay
            .forward(SurfaceRequest::FetchPlaylists)
            .await
            .unwrap_err();
        let RelayError::Delivery { attempts } = error else {
            panic!("expected delivery error, got {error:?}");
        };
        assert_eq!(attempts, DELIVERY_ATTEMPTS);
        // one re-establish per failed attempt
        assert_eq!(
            spawner.created.load(Ordering::SeqCst) as u32,
            DELIVERY_ATTEMPTS
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_shapes_are_rejected_not_dropped() {
        let (relay, _control, _local) = relay_with(Arc::new(CountingSpawner::new(false)));
        let response = relay
            .handle_envelope(envelope("manager", json!({ "type": "mine-bitcoin" })))
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().kind, ErrorKind::Unsupported);
    }

    #[tokio::test(start_paused = true)]
    async fn untrusted_surfaces_cannot_reach_the_executor() {
        let spawner = Arc::new(CountingSpawner::new(false));
        let (relay, _control, _local) = relay_with(Arc::clone(&spawner));

        let response = relay
            .handle_envelope(envelope("player", json!({ "type": "fetch-playlists" })))
            .await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::Untrusted);
        assert_eq!(spawner.created.load(Ordering::SeqCst), 0);

        let response = relay
            .handle_envelope(Envelope {
                origin: crate::protocol::SurfaceOrigin {
                    application: "someone-else".to_string(),
                    surface: "manager".to_string(),
                },
                body: json!({ "type": "fetch-playlists" }),
            })
            .await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::Untrusted);
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_requests_are_served_locally_without_an_executor() {
        let spawner = Arc::new(CountingSpawner::new(false));
        let (relay, _control, local_log) = relay_with(Arc::clone(&spawner));

        for body in [
            json!({ "type": "toggle-watched", "videoId": "v0" }),
            json!({ "type": "hide-video", "videoId": "v0" }),
            json!({ "type": "undo" }),
        ] {
            let response = relay.handle_envelope(envelope("manager", body)).await;
            assert!(response.success);
        }

        assert_eq!(local_log.lock().unwrap().len(), 3);
        assert_eq!(spawner.created.load(Ordering::SeqCst), 0);

        // still gated on surface trust like every other operation request
        let response = relay
            .handle_envelope(envelope("player", json!({ "type": "undo" })))
            .await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::Untrusted);
        assert_eq!(local_log.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn control_messages_are_handled_locally_from_any_surface() {
        let spawner = Arc::new(CountingSpawner::new(false));
        let (relay, mut control_rx, _local) = relay_with(Arc::clone(&spawner));

        let response = relay
            .handle_envelope(envelope("player", json!({ "type": "focus-window" })))
            .await;
        assert!(response.success);
        assert_eq!(control_rx.recv().await, Some(ControlMessage::FocusWindow));
        // never forwarded, so no executor was needed
        assert_eq!(spawner.created.load(Ordering::SeqCst), 0);
    }
}
