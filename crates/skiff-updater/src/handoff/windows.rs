//! Windows handoff: run the downloaded installer as a detached process.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{InstallerHandoff, QuitPolicy};
use crate::config::UpdaterConfig;
use crate::error::UpdateError;
use crate::host::HostShell;
use crate::verify::VerifiedArtifact;

/// Flag telling the installer it was launched by the updater.
pub const UPDATED_FLAG: &str = "--updated";

/// `ERROR_ELEVATION_REQUIRED`
const ERROR_ELEVATION_REQUIRED: i32 = 740;

/// Starts processes without waiting for them.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, program: &Path, args: &[OsString]) -> io::Result<()>;
}

/// Spawner that detaches the child from this process and discards its stdio.
pub struct DetachedSpawner;

impl ProcessSpawner for DetachedSpawner {
    fn spawn(&self, program: &Path, args: &[OsString]) -> io::Result<()> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            use windows::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, DETACHED_PROCESS};

            command.creation_flags(DETACHED_PROCESS.0 | CREATE_NEW_PROCESS_GROUP.0);
        }

        // Detached; never waited on.
        command.spawn().map(|_child| ())
    }
}

/// Permission-class spawn failures that warrant one elevated retry.
pub fn is_permission_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied
        || err.raw_os_error() == Some(ERROR_ELEVATION_REQUIRED)
}

/// Handoff strategy that launches the NSIS installer directly.
pub struct WindowsInstallerHandoff {
    spawner: Arc<dyn ProcessSpawner>,
    user_data_dir: PathBuf,
    elevate_helper: PathBuf,
    spawn_grace: Duration,
}

impl WindowsInstallerHandoff {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, config: &UpdaterConfig) -> Self {
        Self {
            spawner,
            user_data_dir: config.user_data_dir.clone(),
            elevate_helper: config.elevate_helper(),
            spawn_grace: config.spawn_grace(),
        }
    }

    /// Spawn the installer, retrying exactly once through the elevation
    /// helper on a permission error.
    fn spawn_installer(&self, installer: &Path) -> Result<(), UpdateError> {
        let args = [OsString::from(UPDATED_FLAG)];

        match self.spawner.spawn(installer, &args) {
            Ok(()) => Ok(()),
            Err(e) if is_permission_error(&e) => {
                warn!(
                    "handOffToInstaller: permission denied ({}), retrying with {}",
                    e,
                    self.elevate_helper.display()
                );
                let elevated_args = [
                    installer.as_os_str().to_os_string(),
                    OsString::from(UPDATED_FLAG),
                ];
                self.spawner
                    .spawn(&self.elevate_helper, &elevated_args)
                    .map_err(|e| UpdateError::SpawnFailed(e.to_string()))
            }
            Err(e) => Err(UpdateError::SpawnFailed(e.to_string())),
        }
    }

    /// Delete leftover installers from earlier sessions. Returns how many
    /// files were removed; failures are logged per file.
    pub async fn delete_leftover_installers(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.user_data_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(
                        path = %self.user_data_dir.display(),
                        "deleteTempFiles: cannot read user data dir: {}", e
                    );
                }
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("deleteTempFiles: error listing user data dir: {}", e);
                    break;
                }
            };
            let path = entry.path();
            if !is_installer_file(&path) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "deleteTempFiles: removed");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), "deleteTempFiles: failed to remove: {}", e);
                }
            }
        }

        if removed > 0 {
            info!(removed, "deleteTempFiles: removed leftover installers");
        }
        removed
    }
}

fn is_installer_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}

#[async_trait]
impl InstallerHandoff for WindowsInstallerHandoff {
    fn quit_policy(&self) -> QuitPolicy {
        QuitPolicy::LastChanceInstall
    }

    async fn prepare(&self) -> Result<(), UpdateError> {
        self.delete_leftover_installers().await;
        Ok(())
    }

    async fn deliver(&self, artifact: VerifiedArtifact) -> Result<(), UpdateError> {
        info!(
            version = %artifact.version(),
            file_name = artifact.file_name(),
            "handOffToInstaller: spawning installer"
        );

        if let Err(e) = self.spawn_installer(artifact.path()) {
            error!("handOffToInstaller: {}", e);
            return Err(e);
        }

        tokio::time::sleep(self.spawn_grace).await;
        Ok(())
    }

    async fn restart(&self, host: &dyn HostShell) {
        info!("handOffToInstaller: quitting so the installer can proceed");
        host.quit();
    }

    fn on_quit(&self, artifact: VerifiedArtifact) -> Result<(), UpdateError> {
        info!(
            version = %artifact.version(),
            "onQuit: last chance install"
        );
        self.spawn_installer(artifact.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::PromptResponse;
    use crate::test_support::{signed_artifact, RecordingSpawner, ScriptedHost};
    use tempfile::TempDir;

    fn handoff(spawner: Arc<RecordingSpawner>, user_data: &Path) -> WindowsInstallerHandoff {
        let config = UpdaterConfig {
            user_data_dir: user_data.to_path_buf(),
            elevate_helper: Some(PathBuf::from("C:/Skiff/resources/elevate.exe")),
            spawn_grace_ms: 10,
            ..Default::default()
        };
        WindowsInstallerHandoff::new(spawner, &config)
    }

    #[test]
    fn test_permission_error_classification() {
        assert!(is_permission_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(is_permission_error(&io::Error::from_raw_os_error(740)));
        assert!(!is_permission_error(&io::Error::from(io::ErrorKind::NotFound)));
    }

    #[tokio::test]
    async fn test_spawns_installer_with_updated_flag() {
        let dir = TempDir::new().unwrap();
        let artifact = signed_artifact(dir.path(), "skiff-win-2.0.0.exe", "2.0.0", b"MZ");
        let installer = artifact.path().to_path_buf();
        let spawner = Arc::new(RecordingSpawner::new(vec![]));

        handoff(spawner.clone(), dir.path()).deliver(artifact).await.unwrap();

        assert_eq!(
            spawner.calls(),
            vec![(installer, vec![OsString::from("--updated")])]
        );
    }

    #[tokio::test]
    async fn test_permission_denied_retries_once_via_elevation_helper() {
        let dir = TempDir::new().unwrap();
        let artifact = signed_artifact(dir.path(), "skiff-win-2.0.0.exe", "2.0.0", b"MZ");
        let installer = artifact.path().to_path_buf();
        let spawner = Arc::new(RecordingSpawner::new(vec![io::ErrorKind::PermissionDenied]));

        handoff(spawner.clone(), dir.path()).deliver(artifact).await.unwrap();

        let calls = spawner.calls();
        assert_eq!(calls.len(), 2);
        let elevated: Vec<_> = calls
            .iter()
            .filter(|(program, _)| program == Path::new("C:/Skiff/resources/elevate.exe"))
            .collect();
        assert_eq!(elevated.len(), 1);
        assert_eq!(
            elevated[0].1,
            vec![installer.into_os_string(), OsString::from("--updated")]
        );
    }

    #[tokio::test]
    async fn test_failed_elevated_retry_is_terminal() {
        let dir = TempDir::new().unwrap();
        let artifact = signed_artifact(dir.path(), "skiff-win-2.0.0.exe", "2.0.0", b"MZ");
        let spawner = Arc::new(RecordingSpawner::new(vec![
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::PermissionDenied,
        ]));

        let err = handoff(spawner.clone(), dir.path())
            .deliver(artifact)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::SpawnFailed(_)));
        assert_eq!(spawner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_other_spawn_errors_are_not_retried() {
        let dir = TempDir::new().unwrap();
        let artifact = signed_artifact(dir.path(), "skiff-win-2.0.0.exe", "2.0.0", b"MZ");
        let spawner = Arc::new(RecordingSpawner::new(vec![io::ErrorKind::NotFound]));

        assert!(handoff(spawner.clone(), dir.path()).deliver(artifact).await.is_err());
        assert_eq!(spawner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_prepare_deletes_leftover_installers() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("skiff-win-1.0.0.exe"), b"old").unwrap();
        std::fs::write(dir.path().join("SETUP.EXE"), b"old").unwrap();
        std::fs::write(dir.path().join("config.json"), b"{}").unwrap();
        // a directory named like an installer cannot be removed with remove_file
        std::fs::create_dir(dir.path().join("stuck.exe")).unwrap();

        let spawner = Arc::new(RecordingSpawner::new(vec![]));
        let handoff = handoff(spawner, dir.path());
        assert_eq!(handoff.delete_leftover_installers().await, 2);

        assert!(!dir.path().join("skiff-win-1.0.0.exe").exists());
        assert!(!dir.path().join("SETUP.EXE").exists());
        assert!(dir.path().join("config.json").exists());
        assert!(dir.path().join("stuck.exe").exists());
    }

    #[tokio::test]
    async fn test_prepare_tolerates_missing_user_data_dir() {
        let dir = TempDir::new().unwrap();
        let spawner = Arc::new(RecordingSpawner::new(vec![]));
        let handoff = handoff(spawner, &dir.path().join("absent"));
        handoff.prepare().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_quits_host_and_last_chance_spawns() {
        let dir = TempDir::new().unwrap();
        let artifact = signed_artifact(dir.path(), "skiff-win-2.0.0.exe", "2.0.0", b"MZ");
        let spawner = Arc::new(RecordingSpawner::new(vec![]));
        let handoff = handoff(spawner.clone(), dir.path());
        let host = ScriptedHost::new(PromptResponse::Accepted);

        handoff.restart(&host).await;
        assert!(host.quit_requested());

        assert_eq!(handoff.quit_policy(), QuitPolicy::LastChanceInstall);
        handoff.on_quit(artifact).unwrap();
        assert_eq!(spawner.calls().len(), 1);
    }
}
