//! Pushes route artifacts and backups to a network location.
//!
//! Protocol differences live behind [`RemoteBackend`]; the engine owns the
//! shared contract: size-based skip, bounded retry, post-upload verification,
//! state bookkeeping and cleanup.

mod rsync;
mod smb;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::adapters::{CommandOutput, CommandRunner, CommandSpec, RunError, SharedRunner};
use crate::core::models::{
    AuthInput, NetworkLocation, Protocol, RouteArtifact, TransferLogEntry, TransferLogStatus,
    TransferStage,
};
use crate::db::{TransferLog, TransferStateStore};
use crate::error::{Result, SyncError};

pub(crate) use rsync::{ABSENT as SSH_ABSENT_MARKER, sh_quote};
pub use rsync::SshBackend;
pub use smb::SmbBackend;

pub const MILESTONE_INIT: u8 = 0;
pub const MILESTONE_RLOG: u8 = 25;
pub const MILESTONE_QLOG: u8 = 50;
pub const MILESTONE_CONCATENATED: u8 = 75;
pub const MILESTONE_UPLOADED: u8 = 90;

/// Outcome of a connectivity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Valid,
    Unreachable(String),
    AuthFailed(String),
}

impl ProbeResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn into_result(self, target: &str) -> Result<()> {
        match self {
            Self::Valid => Ok(()),
            Self::Unreachable(detail) => Err(SyncError::Unreachable {
                target: target.to_string(),
                detail,
            }),
            Self::AuthFailed(detail) => Err(SyncError::AuthFailed {
                target: target.to_string(),
                detail,
            }),
        }
    }
}

/// A local file queued for upload, named as it will appear remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFile {
    pub name: String,
    pub path: PathBuf,
    pub byte_size: u64,
}

impl TransferFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)
            .map_err(|e| SyncError::io(format!("stat {}", path.display()), e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                SyncError::io(
                    format!("{} has no file name", path.display()),
                    std::io::Error::from(std::io::ErrorKind::InvalidInput),
                )
            })?;
        Ok(Self {
            name,
            path: path.to_path_buf(),
            byte_size: meta.len(),
        })
    }
}

impl From<&RouteArtifact> for TransferFile {
    fn from(artifact: &RouteArtifact) -> Self {
        Self {
            name: artifact.file_name(),
            path: artifact.path.clone(),
            byte_size: artifact.byte_size,
        }
    }
}

/// Timeouts applied to every remote command.
#[derive(Debug, Clone, Copy)]
pub struct RemoteOptions {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(3600),
        }
    }
}

/// Protocol-specific remote operations. Paths are relative to the share for
/// SMB and absolute (or home-relative) for SSH.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Human readable target for messages.
    fn target(&self) -> String;

    /// Non-mutating reachability and authentication check.
    async fn probe(&self) -> ProbeResult;

    /// Create `remote_dir` and its parents; existing directories are fine.
    async fn ensure_dir(&self, remote_dir: &str) -> Result<()>;

    /// Size of a remote file, `None` if it does not exist.
    async fn remote_size(&self, remote_dir: &str, file_name: &str) -> Result<Option<u64>>;

    /// Copy one local file into `remote_dir`, overwriting.
    async fn upload(&self, file: &TransferFile, remote_dir: &str) -> Result<()>;

    /// Delete files in `remote_dir` that are not in `keep`. Backends that
    /// only merge leave this as a no-op.
    async fn prune(&self, _remote_dir: &str, _keep: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Build the backend for a location with its decrypted credential.
pub fn create_backend(
    location: &NetworkLocation,
    auth: &AuthInput,
    runner: SharedRunner,
    options: RemoteOptions,
) -> Box<dyn RemoteBackend> {
    match location.protocol {
        Protocol::Smb => Box::new(SmbBackend::new(location, auth, runner, options)),
        Protocol::Ssh => Box::new(SshBackend::new(location, auth, runner, options)),
    }
}

/// Join a location's base path with further components.
///
/// SMB paths are share-relative so leading slashes are dropped; SSH keeps an
/// absolute base as given.
pub fn join_remote(protocol: Protocol, base: &str, parts: &[&str]) -> String {
    let mut segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    segments.extend(parts.iter().flat_map(|p| p.split('/')).filter(|s| !s.is_empty()));
    let joined = segments.join("/");
    if protocol == Protocol::Ssh && base.starts_with('/') {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Run a command, mapping runner failures to network errors.
pub(crate) async fn run_remote(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    target: &str,
) -> Result<CommandOutput> {
    match runner.run(spec).await {
        Ok(out) => Ok(out),
        Err(RunError::TimedOut { after, .. }) => Err(SyncError::Unreachable {
            target: target.to_string(),
            detail: format!("{} timed out after {}s", spec.program, after.as_secs()),
        }),
        Err(RunError::Spawn { program, source }) => {
            Err(SyncError::io(format!("failed to run {}", program), source))
        }
    }
}

/// Bounded retry-with-delay and a per-attempt timeout.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
            timeout: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Retry transient failures of `op`. Non-transient errors return at once.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Unreachable {
                    target: what.to_string(),
                    detail: format!("timed out after {}s", self.timeout.as_secs()),
                }),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        operation = %what,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Persists progress milestones for one route while a transfer runs.
///
/// Saving is skipped for transfers that are not resumable (backups).
pub struct TransferSession {
    states: Option<TransferStateStore>,
    route_base_id: String,
    location_id: String,
    progress: u8,
    stage: TransferStage,
}

impl TransferSession {
    pub fn begin(
        states: Option<TransferStateStore>,
        route_base_id: &str,
        location_id: &str,
    ) -> Result<Self> {
        let session = Self {
            states,
            route_base_id: route_base_id.to_string(),
            location_id: location_id.to_string(),
            progress: MILESTONE_INIT,
            stage: TransferStage::Init,
        };
        session.persist()?;
        Ok(session)
    }

    /// Continue from a previously saved milestone.
    pub fn resume(
        states: TransferStateStore,
        route_base_id: &str,
        location_id: &str,
        progress: u8,
        stage: TransferStage,
    ) -> Self {
        Self {
            states: Some(states),
            route_base_id: route_base_id.to_string(),
            location_id: location_id.to_string(),
            progress,
            stage,
        }
    }

    pub fn stage(&self) -> TransferStage {
        self.stage
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn route_base_id(&self) -> &str {
        &self.route_base_id
    }

    /// Enter `stage` without claiming a new milestone.
    pub fn enter(&mut self, stage: TransferStage) -> Result<()> {
        self.stage = stage;
        self.persist()
    }

    /// Record a completed milestone.
    pub fn milestone(&mut self, progress: u8) -> Result<()> {
        self.progress = self.progress.max(progress);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        if let Some(states) = &self.states {
            states.save(
                &self.route_base_id,
                &self.location_id,
                self.progress,
                self.stage,
            )?;
        }
        Ok(())
    }

    /// Wrap `error` as a failure of the current stage. State stays on disk.
    pub fn fail(&self, error: SyncError) -> SyncError {
        if matches!(error, SyncError::TransferFailed { .. }) {
            return error;
        }
        let state_preserved = match &self.states {
            Some(states) => match states.load(&self.route_base_id) {
                Ok(Some(_)) => true,
                Ok(None) => self.persist().is_ok(),
                Err(_) => false,
            },
            None => false,
        };
        SyncError::TransferFailed {
            route: self.route_base_id.clone(),
            stage: self.stage,
            state_preserved,
            source: Box::new(error),
        }
    }

    /// Transfer finished: drop the marker.
    pub fn finish(mut self) -> Result<()> {
        self.stage = TransferStage::Done;
        if let Some(states) = &self.states {
            states.clear(&self.route_base_id)?;
        }
        Ok(())
    }
}

/// Everything the engine needs to push one set of artifacts.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Route id, or the backup name for backups.
    pub route_base_id: String,
    pub location: NetworkLocation,
    pub auth: AuthInput,
    pub remote_dir: String,
    pub files: Vec<TransferFile>,
    /// Temporary directory holding the files; when set, the files and the
    /// directory are removed on success.
    pub cleanup_dir: Option<PathBuf>,
    /// `remote_dir` belongs to this transfer alone and may be pruned down to
    /// `files` when the engine mirrors.
    pub mirror: bool,
    /// `files` is only part of what should be delivered. They are uploaded,
    /// but resume state, local files and remote extras are left alone and
    /// no success entry goes to the history.
    pub partial: bool,
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub route_base_id: String,
    pub destination: String,
    pub remote_dir: String,
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
    pub total_bytes: u64,
    pub duration: Duration,
}

/// Whether failed attempts also go to the transfer history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureLogPolicy {
    #[default]
    SuccessOnly,
    LogFailures,
}

pub struct TransferEngine {
    runner: SharedRunner,
    log: TransferLog,
    retry: RetryPolicy,
    options: RemoteOptions,
    mirror_remote: bool,
    failure_policy: FailureLogPolicy,
    cancel: CancellationToken,
}

impl TransferEngine {
    pub fn new(runner: SharedRunner, log: TransferLog) -> Self {
        Self {
            runner,
            log,
            retry: RetryPolicy::default(),
            options: RemoteOptions::default(),
            mirror_remote: true,
            failure_policy: FailureLogPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_options(mut self, options: RemoteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_mirror(mut self, mirror_remote: bool) -> Self {
        self.mirror_remote = mirror_remote;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailureLogPolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Upload, verify and finalize. `session` tracks the route's resumable
    /// state; on failure it is left on disk and the error names the stage.
    pub async fn transfer(
        &self,
        req: &TransferRequest,
        mut session: TransferSession,
    ) -> Result<TransferOutcome> {
        let span = info_span!(
            "transfer",
            route = %req.route_base_id,
            destination = %req.location.destination()
        );
        let start = Instant::now();

        let result = async {
            let backend = create_backend(
                &req.location,
                &req.auth,
                self.runner.clone(),
                self.options,
            );
            self.push(req, backend.as_ref(), &mut session).await
        }
        .instrument(span)
        .await;

        match result {
            Ok((uploaded, skipped)) if req.partial => {
                info!(
                    route = %req.route_base_id,
                    uploaded = uploaded.len(),
                    skipped = skipped.len(),
                    "Uploaded partial artifact set, keeping state"
                );
                Ok(TransferOutcome {
                    route_base_id: req.route_base_id.clone(),
                    destination: req.location.destination(),
                    remote_dir: req.remote_dir.clone(),
                    uploaded,
                    skipped,
                    total_bytes: req.files.iter().map(|f| f.byte_size).sum(),
                    duration: start.elapsed(),
                })
            }
            Ok((uploaded, skipped)) => {
                let total_bytes = req.files.iter().map(|f| f.byte_size).sum();
                let outcome = TransferOutcome {
                    route_base_id: req.route_base_id.clone(),
                    destination: req.location.destination(),
                    remote_dir: req.remote_dir.clone(),
                    uploaded,
                    skipped,
                    total_bytes,
                    duration: start.elapsed(),
                };
                self.complete(req, &outcome, session)?;
                Ok(outcome)
            }
            Err(e) => {
                let err = session.fail(e);
                self.record_failure(req, &err, start.elapsed());
                warn!(route = %req.route_base_id, error = %err, "Transfer failed");
                Err(err)
            }
        }
    }

    async fn push(
        &self,
        req: &TransferRequest,
        backend: &dyn RemoteBackend,
        session: &mut TransferSession,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let target = backend.target();
        session.enter(TransferStage::Uploading)?;

        // One connectivity check per batch, not per file.
        let target_ref = &target;
        self.retry
            .run(&format!("probe {}", target), || async move {
                backend.probe().await.into_result(target_ref)
            })
            .await?;

        self.retry
            .run(&format!("mkdir {}", req.remote_dir), || {
                backend.ensure_dir(&req.remote_dir)
            })
            .await?;

        let mut uploaded = Vec::new();
        let mut skipped = Vec::new();

        for file in &req.files {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Interrupted);
            }
            let name = file.name.clone();

            let remote = self
                .retry
                .run(&format!("stat {}", name), || {
                    backend.remote_size(&req.remote_dir, &name)
                })
                .await?;

            if remote == Some(file.byte_size) {
                info!(file = %name, size = file.byte_size, "Remote copy matches, skipping");
                skipped.push(name);
                continue;
            }

            debug!(
                file = %name,
                local_size = file.byte_size,
                remote_size = ?remote,
                "Uploading"
            );
            let what = format!("upload {}", name);
            let upload = self
                .retry
                .run(&what, || backend.upload(file, &req.remote_dir));
            // Dropping the upload kills the child process.
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Interrupted),
                result = upload => result?,
            }
            info!(file = %name, size = file.byte_size, "Uploaded");
            uploaded.push(name);
        }

        if !req.partial {
            session.milestone(MILESTONE_UPLOADED)?;
        }
        session.enter(TransferStage::Verifying)?;

        for file in req.files.iter().filter(|f| uploaded.contains(&f.name)) {
            let name = file.name.clone();
            let remote = self
                .retry
                .run(&format!("verify {}", name), || {
                    backend.remote_size(&req.remote_dir, &name)
                })
                .await?;
            if remote != Some(file.byte_size) {
                return Err(SyncError::UploadFailed {
                    artifact: name,
                    detail: format!(
                        "remote size {:?} does not match local size {}",
                        remote, file.byte_size
                    ),
                });
            }
        }

        if self.mirror_remote && req.mirror && !req.partial {
            let keep: Vec<String> = req.files.iter().map(|f| f.name.clone()).collect();
            self.retry
                .run(&format!("prune {}", req.remote_dir), || {
                    backend.prune(&req.remote_dir, &keep)
                })
                .await?;
        }

        Ok((uploaded, skipped))
    }

    fn complete(
        &self,
        req: &TransferRequest,
        outcome: &TransferOutcome,
        session: TransferSession,
    ) -> Result<()> {
        let entry = self.log_entry(
            req,
            TransferLogStatus::Success,
            outcome.total_bytes,
            outcome.duration,
            None,
        );
        // History is best effort once the data is delivered.
        if let Err(e) = self.log.append(entry) {
            warn!(error = %e, "Failed to record transfer in history");
        }
        session.finish()?;

        if let Some(dir) = &req.cleanup_dir {
            for file in &req.files {
                if let Err(e) = std::fs::remove_file(&file.path) {
                    debug!(path = %file.path.display(), error = %e, "Failed to remove artifact");
                }
            }
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "Failed to remove work directory");
                }
            }
        }

        info!(
            route = %outcome.route_base_id,
            uploaded = outcome.uploaded.len(),
            skipped = outcome.skipped.len(),
            total_bytes = outcome.total_bytes,
            duration_secs = outcome.duration.as_secs(),
            "Transfer complete"
        );
        Ok(())
    }

    /// Append a failure entry when the policy asks for it.
    pub fn record_failure(&self, req: &TransferRequest, error: &SyncError, duration: Duration) {
        if self.failure_policy != FailureLogPolicy::LogFailures {
            return;
        }
        let entry = self.log_entry(
            req,
            TransferLogStatus::Failure,
            req.files.iter().map(|f| f.byte_size).sum(),
            duration,
            Some(error.to_string()),
        );
        if let Err(log_err) = self.log.append(entry) {
            warn!(error = %log_err, "Failed to record failed transfer");
        }
    }

    fn log_entry(
        &self,
        req: &TransferRequest,
        status: TransferLogStatus,
        total_size: u64,
        duration: Duration,
        error: Option<String>,
    ) -> TransferLogEntry {
        TransferLogEntry {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            route_base_id: req.route_base_id.clone(),
            location_id: req.location.location_id.clone(),
            status,
            destination: req.location.destination(),
            total_size,
            duration_secs: duration.as_secs(),
            error,
        }
    }
}
