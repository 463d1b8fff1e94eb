//! Shared fixtures for unit tests: an in-process file server standing in for
//! the update host, and scripted host-shell, OS-updater and spawner doubles.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use semver::Version;

use crate::cache::CachedDownload;
use crate::download::DownloadProgress;
use crate::error::UpdateError;
use crate::signature::write_signature;
use crate::verify::{verify_download, VerifiedArtifact};
use crate::handoff::macos::{NativeUpdater, NativeUpdaterEvent};
use crate::handoff::windows::ProcessSpawner;
use crate::host::{HostShell, Prompt, PromptResponse};

#[derive(Clone, Default)]
struct FileServerState {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    stalled: Arc<Mutex<HashSet<String>>>,
}

/// Minimal static file server on an ephemeral loopback port.
pub struct FileServer {
    addr: SocketAddr,
    state: FileServerState,
    handle: JoinHandle<()>,
}

impl FileServer {
    pub async fn start(files: Vec<(&str, Vec<u8>)>) -> Self {
        let state = FileServerState::default();
        for (path, bytes) in files {
            state.files.lock().unwrap().insert(path.to_string(), bytes);
        }

        let app = Router::new().fallback(serve_file).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state, handle }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    pub fn put(&self, path: &str, bytes: Vec<u8>) {
        self.state.files.lock().unwrap().insert(path.to_string(), bytes);
    }

    /// Answer `path` with a few bytes and then never finish the body.
    pub fn stall(&self, path: &str) {
        self.state.stalled.lock().unwrap().insert(path.to_string());
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_file(State(state): State<FileServerState>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    *state.hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;
    if state.stalled.lock().unwrap().contains(&path) {
        let head = stream::iter(vec![Ok::<_, io::Error>(vec![0u8; 16])]);
        return Body::from_stream(head.chain(stream::pending())).into_response();
    }
    match state.files.lock().unwrap().get(&path) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Host shell double that answers prompts from a script and records them.
pub struct ScriptedHost {
    consent: PromptResponse,
    acknowledge: bool,
    prompts: Mutex<Vec<Prompt>>,
    native_dialogs: Mutex<Vec<Prompt>>,
    should_quit: Mutex<bool>,
    quit: Mutex<bool>,
    progress: Mutex<Vec<DownloadProgress>>,
}

impl ScriptedHost {
    pub fn new(consent: PromptResponse) -> Self {
        Self {
            consent,
            acknowledge: true,
            prompts: Mutex::new(Vec::new()),
            native_dialogs: Mutex::new(Vec::new()),
            should_quit: Mutex::new(false),
            quit: Mutex::new(false),
            progress: Mutex::new(Vec::new()),
        }
    }

    /// Never acknowledge acknowledge-only prompts.
    pub fn unresponsive(mut self) -> Self {
        self.acknowledge = false;
        self
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn native_dialogs(&self) -> Vec<Prompt> {
        self.native_dialogs.lock().unwrap().clone()
    }

    pub fn marked_should_quit(&self) -> bool {
        *self.should_quit.lock().unwrap()
    }

    pub fn quit_requested(&self) -> bool {
        *self.quit.lock().unwrap()
    }

    pub fn progress(&self) -> Vec<DownloadProgress> {
        self.progress.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostShell for ScriptedHost {
    async fn show(&self, prompt: Prompt) -> PromptResponse {
        let is_consent = matches!(prompt, Prompt::RestartToUpdate { .. });
        self.prompts.lock().unwrap().push(prompt);
        if is_consent {
            return self.consent;
        }
        if !self.acknowledge {
            std::future::pending::<()>().await;
        }
        PromptResponse::Acknowledged
    }

    async fn show_native_dialog(&self, prompt: Prompt) {
        self.native_dialogs.lock().unwrap().push(prompt);
    }

    fn mark_should_quit(&self) {
        *self.should_quit.lock().unwrap() = true;
    }

    fn quit(&self) {
        *self.quit.lock().unwrap() = true;
    }

    fn download_progress(&self, progress: DownloadProgress) {
        self.progress.lock().unwrap().push(progress);
    }
}

#[derive(Deserialize)]
struct FeedManifest {
    url: String,
}

/// OS updater double that behaves like Squirrel.Mac: on a check it fetches
/// the feed manifest, then the artifact, then reports the download (or the
/// scripted error).
pub struct ScriptedNativeUpdater {
    events: broadcast::Sender<NativeUpdaterEvent>,
    feed_url: Mutex<Option<String>>,
    fail_with: Option<String>,
    fetched: Arc<Mutex<Option<Vec<u8>>>>,
    quit_and_install: Mutex<bool>,
}

impl ScriptedNativeUpdater {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            events,
            feed_url: Mutex::new(None),
            fail_with: None,
            fetched: Arc::new(Mutex::new(None)),
            quit_and_install: Mutex::new(false),
        }
    }

    pub fn failing(message: &str) -> Self {
        let mut native = Self::new();
        native.fail_with = Some(message.to_string());
        native
    }

    pub fn feed_url(&self) -> Option<String> {
        self.feed_url.lock().unwrap().clone()
    }

    pub fn fetched(&self) -> Option<Vec<u8>> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn quit_and_install_called(&self) -> bool {
        *self.quit_and_install.lock().unwrap()
    }
}

impl NativeUpdater for ScriptedNativeUpdater {
    fn subscribe(&self) -> broadcast::Receiver<NativeUpdaterEvent> {
        self.events.subscribe()
    }

    fn set_feed_url(&self, url: &str) -> Result<(), UpdateError> {
        *self.feed_url.lock().unwrap() = Some(url.to_string());
        Ok(())
    }

    fn check_for_updates(&self) {
        let events = self.events.clone();
        let feed_url = self.feed_url();
        let fail_with = self.fail_with.clone();
        let fetched = Arc::clone(&self.fetched);

        tokio::spawn(async move {
            if let Some(message) = fail_with {
                let _ = events.send(NativeUpdaterEvent::Error(message));
                return;
            }
            let result: Result<Vec<u8>, reqwest::Error> = async {
                let feed_url = feed_url.unwrap_or_default();
                let manifest: FeedManifest = reqwest::get(&feed_url).await?.json().await?;
                let bytes = reqwest::get(&manifest.url).await?.error_for_status()?.bytes().await?;
                Ok(bytes.to_vec())
            }
            .await;
            match result {
                Ok(bytes) => {
                    *fetched.lock().unwrap() = Some(bytes);
                    let _ = events.send(NativeUpdaterEvent::UpdateDownloaded);
                }
                Err(e) => {
                    let _ = events.send(NativeUpdaterEvent::Error(e.to_string()));
                }
            }
        });
    }

    fn quit_and_install(&self) {
        *self.quit_and_install.lock().unwrap() = true;
    }
}

/// Write `content` to `dir/name`, sign it for `version` with a throwaway key
/// and run it through the verification gate.
pub fn signed_artifact(dir: &Path, name: &str, version: &str, content: &[u8]) -> VerifiedArtifact {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    let pair = skiff_crypto::generate_key_pair();
    write_signature(&path, version, &pair.private_key).unwrap();
    let download = CachedDownload::new(path, name.to_string(), Version::parse(version).unwrap());
    verify_download(&download, &pair.public_key).unwrap()
}

/// Process spawner double that fails the first `failures` calls with the
/// given error kind and records every call.
pub struct RecordingSpawner {
    failures: Mutex<Vec<io::ErrorKind>>,
    calls: Mutex<Vec<(PathBuf, Vec<OsString>)>>,
}

impl RecordingSpawner {
    pub fn new(failures: Vec<io::ErrorKind>) -> Self {
        Self {
            failures: Mutex::new(failures),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(PathBuf, Vec<OsString>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProcessSpawner for RecordingSpawner {
    fn spawn(&self, program: &Path, args: &[OsString]) -> io::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_path_buf(), args.to_vec()));
        let mut failures = self.failures.lock().unwrap();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(io::Error::from(failures.remove(0)))
        }
    }
}
