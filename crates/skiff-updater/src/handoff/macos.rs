//! macOS handoff through a loopback relay.
//!
//! The OS updater only consumes updates over HTTP, so the verified artifact
//! is re-exposed by a short-lived server on `127.0.0.1:<ephemeral>`:
//!
//! - `GET /token` returns the per-session token
//! - `GET /` returns the feed manifest `{ "url": "<server>/<uuid>.zip" }`
//! - `GET /<uuid>.zip` streams the artifact
//! - anything else is a 404
//!
//! The server proves it is the one answering by echoing the token to a
//! self-check before the OS updater is pointed at it. A fresh server is bound
//! for every attempt and always torn down before the attempt resolves.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{InstallerHandoff, QuitPolicy};
use crate::error::UpdateError;
use crate::host::HostShell;
use crate::verify::VerifiedArtifact;

/// How long a stopping relay may drain connections before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Events emitted by the OS updater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeUpdaterEvent {
    /// The update has been fetched and staged for install
    UpdateDownloaded,
    /// The OS updater failed; carries its message
    Error(String),
}

/// The OS-level updater (Squirrel.Mac behind Electron's `autoUpdater`).
pub trait NativeUpdater: Send + Sync {
    /// Subscribe to updater events. Subscribe before triggering a check.
    fn subscribe(&self) -> broadcast::Receiver<NativeUpdaterEvent>;

    /// Point the updater at a feed manifest URL.
    fn set_feed_url(&self, url: &str) -> Result<(), UpdateError>;

    /// Start fetching from the feed; progress arrives as events.
    fn check_for_updates(&self);

    /// Quit the app and install the staged update.
    fn quit_and_install(&self);
}

/// Progress of a single relay handoff attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Idle,
    ServerStarting,
    AwaitingTokenEcho,
    FeedActive,
    Downloaded,
    Done,
    Failed,
}

#[derive(Clone)]
struct RelayState {
    token: Arc<str>,
    feed_url: Arc<str>,
    artifact: Arc<PathBuf>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// A running loopback relay.
pub struct RelayServer {
    addr: SocketAddr,
    file_route: String,
    shutdown_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
    handle: Option<JoinHandle<()>>,
}

impl RelayServer {
    /// Bind a relay serving `artifact` and answering `/token` with `token`.
    pub async fn start(artifact: PathBuf, token: String) -> Result<Self, UpdateError> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| UpdateError::RelayServer(format!("failed to bind: {}", e)))?;
        let addr = listener.local_addr()?;

        let file_route = format!("/{}.zip", Uuid::new_v4());
        let state = RelayState {
            token: token.into(),
            feed_url: format!("http://{}{}", addr, file_route).into(),
            artifact: Arc::new(artifact),
        };

        let app = Router::new()
            .route("/token", get(token_handler))
            .route("/", get(feed_handler))
            .route(&file_route, get(artifact_handler))
            .fallback(not_found_handler)
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal(shutdown_rx))
                .await;
            if let Err(e) = result {
                error!("relay: server error: {}", e);
            }
            let _ = stopped_tx.send(true);
        });

        info!("relay: listening on {}", addr);

        Ok(Self {
            addr,
            file_route,
            shutdown_tx,
            stopped_rx,
            handle: Some(handle),
        })
    }

    /// Base URL, also the feed manifest URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn file_url(&self) -> String {
        format!("{}{}", self.url(), self.file_route)
    }

    /// Resolves once the server task has exited for any reason.
    pub async fn stopped(&self) {
        let mut stopped = self.stopped_rx.clone();
        while !*stopped.borrow_and_update() {
            if stopped.changed().await.is_err() {
                break;
            }
        }
    }

    /// Stop accepting requests and wait for the server task to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);

        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("relay: graceful shutdown timed out, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
        debug!("relay: stopped {}", self.addr);
    }

    /// Ask the relay for its token and compare it with `expected`.
    pub async fn self_check(&self, expected: &str, timeout: Duration) -> Result<(), UpdateError> {
        // Loopback only; a system proxy would answer for someone else.
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()?;
        let token_url = format!("{}/token", self.url());

        let echoed = tokio::time::timeout(timeout, async {
            let response = client.get(&token_url).send().await?.error_for_status()?;
            let body: TokenResponse = response.json().await?;
            Ok::<_, reqwest::Error>(body.token)
        })
        .await
        .map_err(|_| UpdateError::SelfCheckTimeout)??;

        if echoed != expected {
            error!("relay: token mismatch on self-check");
            return Err(UpdateError::TokenMismatch);
        }
        debug!("relay: token self-check passed");
        Ok(())
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Run the token self-check and only hand the relay back if it passes. On
/// failure the relay is fully stopped before the error is returned.
pub async fn checked_relay(
    server: RelayServer,
    expected_token: &str,
    timeout: Duration,
) -> Result<RelayServer, UpdateError> {
    match server.self_check(expected_token, timeout).await {
        Ok(()) => Ok(server),
        Err(e) => {
            server.shutdown().await;
            Err(e)
        }
    }
}

async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

async fn token_handler(State(state): State<RelayState>) -> Json<serde_json::Value> {
    debug!("relay: token requested");
    Json(json!({ "token": &*state.token }))
}

async fn feed_handler(State(state): State<RelayState>) -> Json<serde_json::Value> {
    debug!("relay: feed manifest requested");
    Json(json!({ "url": &*state.feed_url }))
}

async fn artifact_handler(State(state): State<RelayState>) -> Response {
    let file = match tokio::fs::File::open(state.artifact.as_path()).await {
        Ok(file) => file,
        Err(e) => {
            error!(path = %state.artifact.display(), "relay: cannot open artifact: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            error!(path = %state.artifact.display(), "relay: cannot stat artifact: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    info!(bytes = len, "relay: serving artifact");
    (
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

async fn not_found_handler(uri: Uri) -> StatusCode {
    warn!(path = uri.path(), "relay: unexpected request");
    StatusCode::NOT_FOUND
}

/// Handoff strategy driving the OS updater through a loopback relay.
pub struct MacRelayHandoff {
    native: Arc<dyn NativeUpdater>,
    token_check_timeout: Duration,
    phase: watch::Sender<RelayPhase>,
}

impl MacRelayHandoff {
    pub fn new(native: Arc<dyn NativeUpdater>, token_check_timeout: Duration) -> Self {
        let (phase, _) = watch::channel(RelayPhase::Idle);
        Self {
            native,
            token_check_timeout,
            phase,
        }
    }

    /// Phase of the current or most recent attempt.
    pub fn phase(&self) -> RelayPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: RelayPhase) {
        debug!(?phase, "relay: phase");
        self.phase.send_replace(phase);
    }

    async fn relay(&self, artifact: &VerifiedArtifact) -> Result<(), UpdateError> {
        self.set_phase(RelayPhase::ServerStarting);
        let token = Uuid::new_v4().to_string();
        let server = RelayServer::start(artifact.path().to_path_buf(), token.clone()).await?;

        self.set_phase(RelayPhase::AwaitingTokenEcho);
        let server = checked_relay(server, &token, self.token_check_timeout).await?;

        let mut events = self.native.subscribe();
        if let Err(e) = self.native.set_feed_url(&server.url()) {
            server.shutdown().await;
            return Err(e);
        }
        self.set_phase(RelayPhase::FeedActive);
        self.native.check_for_updates();

        let outcome = tokio::select! {
            outcome = next_outcome(&mut events) => outcome,
            _ = server.stopped() => Err(UpdateError::RelayServer(
                "relay stopped before the update was fetched".to_string(),
            )),
        };

        server.shutdown().await;
        outcome
    }
}

async fn next_outcome(
    events: &mut broadcast::Receiver<NativeUpdaterEvent>,
) -> Result<(), UpdateError> {
    loop {
        match events.recv().await {
            Ok(NativeUpdaterEvent::UpdateDownloaded) => return Ok(()),
            Ok(NativeUpdaterEvent::Error(message)) => {
                return Err(UpdateError::from_native_message(message))
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "relay: missed native updater events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(UpdateError::NativeUpdater(
                    "event channel closed".to_string(),
                ))
            }
        }
    }
}

#[async_trait]
impl InstallerHandoff for MacRelayHandoff {
    fn quit_policy(&self) -> QuitPolicy {
        QuitPolicy::ClearCache
    }

    async fn deliver(&self, artifact: VerifiedArtifact) -> Result<(), UpdateError> {
        info!(
            version = %artifact.version(),
            file_name = artifact.file_name(),
            "handOffToInstaller: starting relay"
        );

        match self.relay(&artifact).await {
            Ok(()) => {
                self.set_phase(RelayPhase::Downloaded);
                info!("handOffToInstaller: update downloaded by OS updater");
                self.set_phase(RelayPhase::Done);
                Ok(())
            }
            Err(e) => {
                self.set_phase(RelayPhase::Failed);
                error!("handOffToInstaller: relay failed: {}", e);
                Err(e)
            }
        }
    }

    async fn restart(&self, _host: &dyn HostShell) {
        info!("handOffToInstaller: quitting to install");
        self.native.quit_and_install();
    }
}
