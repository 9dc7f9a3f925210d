//! Entry points for the CLI and scheduled jobs.
//!
//! Everything outside the core goes through [`Orchestrator`]: choosing or
//! configuring a location, syncing one or all routes, and pushing a device
//! backup. Questions that need a human (resume an interrupted transfer,
//! delete originals) go through [`Prompt`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::context::AppContext;
use crate::core::concat::Concatenator;
use crate::core::device::read_device_id;
use crate::core::models::{
    ArtifactKind, NetworkLocation, NewLocation, Role, RouteArtifact, TransferStage, TransferState,
};
use crate::core::prober::ConnectivityProber;
use crate::core::registry::{self, LocationRegistry, ReplacePolicy};
use crate::core::transfer_engine::{
    MILESTONE_CONCATENATED, MILESTONE_QLOG, MILESTONE_RLOG, ProbeResult, TransferEngine,
    TransferFile, TransferOutcome, TransferRequest, TransferSession, join_remote,
};
use crate::db::{TransferLog, TransferStateStore};
use crate::error::{Result, SyncError};

/// What to do with a transfer that a previous run left unfinished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeChoice {
    Resume,
    Restart,
}

pub trait Prompt: Send + Sync {
    fn resume_or_restart(&self, state: &TransferState) -> ResumeChoice;

    /// Yes/no for destructive actions. Anything but an explicit yes is no.
    fn confirm(&self, question: &str) -> bool;

    /// Collect a new location for `role`, or `None` to give up.
    fn configure_location(&self, role: Role) -> Option<NewLocation>;
}

/// Answers for runs with nobody watching: resume, never delete, never
/// configure.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unattended;

impl Prompt for Unattended {
    fn resume_or_restart(&self, _state: &TransferState) -> ResumeChoice {
        ResumeChoice::Resume
    }

    fn confirm(&self, _question: &str) -> bool {
        false
    }

    fn configure_location(&self, _role: Role) -> Option<NewLocation> {
        None
    }
}

/// Result of syncing every route found on the device.
#[derive(Debug, Default)]
pub struct SyncSummary {
    pub synced: Vec<TransferOutcome>,
    /// Routes whose remote copies already matched; nothing was uploaded.
    pub skipped: Vec<String>,
    pub failed: Vec<(String, SyncError)>,
}

/// Artifacts ready for upload, and the kinds that could not be built.
struct Prepared {
    session: TransferSession,
    artifacts: Vec<RouteArtifact>,
    failed: Vec<SyncError>,
}

pub struct Orchestrator {
    ctx: AppContext,
    registry: LocationRegistry,
    prober: ConnectivityProber,
    concatenator: Concatenator,
    engine: TransferEngine,
    states: TransferStateStore,
    log: TransferLog,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            registry: ctx.registry(),
            prober: ctx.prober(),
            concatenator: ctx.concatenator(),
            engine: ctx.engine(),
            states: ctx.transfer_states(),
            log: ctx.transfer_log(),
            ctx,
        }
    }

    pub fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    pub fn transfer_log(&self) -> &TransferLog {
        &self.log
    }

    /// Probe a new location and store it if reachable.
    pub async fn configure_location(
        &self,
        new: NewLocation,
        policy: ReplacePolicy,
    ) -> Result<NetworkLocation> {
        registry::validate(&new)?;
        let candidate = registry::preview(&new);
        let target = candidate.destination();

        let prober = &self.prober;
        let (candidate_ref, auth, target_ref) = (&candidate, &new.auth, &target);
        self.ctx
            .config
            .retry_policy()
            .run(&format!("probe {}", target), || async move {
                prober
                    .probe_with(candidate_ref, auth)
                    .await
                    .into_result(target_ref)
            })
            .await?;

        self.registry.add(new, policy)
    }

    /// The configured location for `role`, asking for one if there is none.
    pub async fn select_or_configure_location(
        &self,
        role: Role,
        prompt: &dyn Prompt,
    ) -> Result<NetworkLocation> {
        if let Some(location) = self.registry.get(role)? {
            info!(role = %role, label = %location.label, "Using configured location");
            return Ok(location);
        }

        let new = prompt
            .configure_location(role)
            .ok_or_else(|| SyncError::LocationNotFound(role.to_string()))?;
        if new.role != role {
            return Err(SyncError::InvalidLocation(format!(
                "expected a {} location, got {}",
                role, new.role
            )));
        }
        self.configure_location(new, ReplacePolicy::Reject).await
    }

    pub async fn probe_location(&self, location_id: &str) -> Result<ProbeResult> {
        let location = self.registry.get_by_id(location_id)?;
        self.prober.probe(&location).await
    }

    pub fn get_location_label(&self, location_id: &str) -> Result<String> {
        self.registry.label(location_id)
    }

    fn work_dir(&self, route_base_id: &str) -> PathBuf {
        self.ctx.config.work_dir.join(route_base_id)
    }

    /// Concatenate one route and push it to `<remote_path>/<device>/<route>`.
    pub async fn sync_route(
        &self,
        route_base_id: &str,
        location_id: &str,
        prompt: &dyn Prompt,
    ) -> Result<TransferOutcome> {
        let location = self.registry.get_by_id(location_id)?;
        let device_id = read_device_id(&self.ctx.config.device_id_file)?;
        let auth = self.registry.resolve(&location)?;

        if self
            .concatenator
            .discover_segments(route_base_id)?
            .is_empty()
        {
            return Err(SyncError::RouteNotFound(route_base_id.to_string()));
        }

        let delete_originals = prompt.confirm(&format!(
            "Delete the original segment files of {} once it is uploaded?",
            route_base_id
        ));

        let work = self.work_dir(route_base_id);
        let Prepared {
            session,
            artifacts,
            failed,
        } = self
            .prepare(route_base_id, location_id, &work, prompt)
            .await?;
        let partial = !failed.is_empty();
        let progress = session.progress();

        let remote_dir = join_remote(
            location.protocol,
            &location.remote_path,
            &[device_id.as_str(), route_base_id],
        );
        let request = TransferRequest {
            route_base_id: route_base_id.to_string(),
            location,
            auth,
            remote_dir,
            files: artifacts.iter().map(TransferFile::from).collect(),
            cleanup_dir: Some(work.clone()),
            mirror: !partial,
            partial,
        };

        let mut failed = failed.into_iter();
        match (self.engine.transfer(&request, session).await, failed.next()) {
            (Ok(outcome), None) => {
                if delete_originals {
                    self.concatenator.remove_originals(route_base_id)?;
                }
                Ok(outcome)
            }
            (Ok(outcome), Some(first)) => {
                // Delivered what could be built; the route stays pending.
                let mut session = TransferSession::resume(
                    self.states.clone(),
                    route_base_id,
                    location_id,
                    progress,
                    TransferStage::Concatenating,
                );
                session.enter(TransferStage::Concatenating)?;
                let err = session.fail(first);
                self.engine.record_failure(&request, &err, outcome.duration);
                warn!(
                    route = %route_base_id,
                    uploaded = outcome.uploaded.len(),
                    skipped = outcome.skipped.len(),
                    error = %err,
                    "Route delivered without every artifact"
                );
                Err(err)
            }
            (Err(e), _) => {
                if matches!(e.root(), SyncError::Interrupted) {
                    discard_work_dir(&work);
                }
                Err(e)
            }
        }
    }

    /// Decide between resuming and starting over, then make sure the route's
    /// artifacts exist.
    async fn prepare(
        &self,
        route_base_id: &str,
        location_id: &str,
        work: &Path,
        prompt: &dyn Prompt,
    ) -> Result<Prepared> {
        if let Some(state) = self.states.load(route_base_id)? {
            match prompt.resume_or_restart(&state) {
                ResumeChoice::Resume if state.concatenation_complete() => {
                    let expected = self.expected_kinds(route_base_id)?;
                    if let Some(artifacts) = leftover_artifacts(route_base_id, work, &expected) {
                        info!(
                            route = %route_base_id,
                            progress = state.progress_percent,
                            stage = %state.stage,
                            "Resuming interrupted transfer"
                        );
                        let session = TransferSession::resume(
                            self.states.clone(),
                            route_base_id,
                            location_id,
                            state.progress_percent,
                            state.stage,
                        );
                        return Ok(Prepared {
                            session,
                            artifacts,
                            failed: Vec::new(),
                        });
                    }
                    info!(route = %route_base_id, "Artifacts are incomplete, concatenating again");
                }
                ResumeChoice::Resume => {
                    info!(route = %route_base_id, "Resuming from concatenation");
                }
                ResumeChoice::Restart => {
                    info!(route = %route_base_id, "Restarting interrupted transfer");
                }
            }
            self.states.clear(route_base_id)?;
        }

        discard_work_dir(work);
        let mut session =
            TransferSession::begin(Some(self.states.clone()), route_base_id, location_id)?;

        match self
            .concatenate_all(route_base_id, work, &mut session)
            .await
        {
            Ok((artifacts, failed)) => Ok(Prepared {
                session,
                artifacts,
                failed,
            }),
            Err(e) => {
                if matches!(e, SyncError::Interrupted) {
                    discard_work_dir(work);
                }
                Err(session.fail(e))
            }
        }
    }

    /// Kinds with at least one segment file, in concatenation order.
    fn expected_kinds(&self, route_base_id: &str) -> Result<Vec<ArtifactKind>> {
        let segments = self.concatenator.discover_segments(route_base_id)?;
        Ok(ArtifactKind::all()
            .into_iter()
            .filter(|kind| segments.iter().any(|s| s.file(*kind).is_some()))
            .collect())
    }

    /// Build every artifact kind. A kind that fails to concatenate is
    /// reported back and the others are still built; any other error stops.
    async fn concatenate_all(
        &self,
        route_base_id: &str,
        work: &Path,
        session: &mut TransferSession,
    ) -> Result<(Vec<RouteArtifact>, Vec<SyncError>)> {
        session.enter(TransferStage::Concatenating)?;

        let mut artifacts = Vec::new();
        let mut failed = Vec::new();
        for kind in ArtifactKind::all() {
            match self
                .concatenator
                .concatenate(route_base_id, kind, work, true)
                .await
            {
                Ok(Some(artifact)) => artifacts.push(artifact),
                Ok(None) => {}
                Err(e @ SyncError::ConcatenationFailed { .. }) => {
                    warn!(route = %route_base_id, kind = %kind, error = %e, "Skipping artifact");
                    failed.push(e);
                    continue;
                }
                Err(e) => return Err(e),
            }
            if failed.is_empty() {
                match kind {
                    ArtifactKind::Rlog => session.milestone(MILESTONE_RLOG)?,
                    ArtifactKind::Qlog => session.milestone(MILESTONE_QLOG)?,
                    ArtifactKind::Video(_) => {}
                }
            }
        }

        if artifacts.is_empty() {
            return Err(failed
                .into_iter()
                .next()
                .unwrap_or_else(|| SyncError::RouteNotFound(route_base_id.to_string())));
        }
        if failed.is_empty() {
            session.milestone(MILESTONE_CONCATENATED)?;
        }
        Ok((artifacts, failed))
    }

    /// Sync every route on the device. Remote copies of matching size are
    /// not uploaded again; one route failing does not stop the others.
    pub async fn sync_all_routes(
        &self,
        location_id: &str,
        prompt: &dyn Prompt,
    ) -> Result<SyncSummary> {
        self.registry.get_by_id(location_id)?;

        let mut summary = SyncSummary::default();
        for route in self.concatenator.discover_routes()? {
            if self.ctx.cancel.is_cancelled() {
                return Err(SyncError::Interrupted);
            }

            match self.sync_route(&route, location_id, prompt).await {
                Ok(outcome) if outcome.uploaded.is_empty() => summary.skipped.push(route),
                Ok(outcome) => summary.synced.push(outcome),
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    warn!(route = %route, error = %e, "Route sync failed, continuing");
                    summary.failed.push((route, e));
                }
            }
        }

        info!(
            synced = summary.synced.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "Finished syncing routes"
        );
        Ok(summary)
    }

    /// Upload the files of `backup_dir` to `<remote_path>/<device>/backups`.
    /// Local files are kept and no resume state is written.
    pub async fn transfer_backup(
        &self,
        backup_dir: &Path,
        location_id: &str,
    ) -> Result<TransferOutcome> {
        let location = self.registry.get_by_id(location_id)?;
        let device_id = read_device_id(&self.ctx.config.device_id_file)?;
        let auth = self.registry.resolve(&location)?;

        let name = backup_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup".to_string());
        let files = backup_files(backup_dir)?;

        let remote_dir = join_remote(
            location.protocol,
            &location.remote_path,
            &[device_id.as_str(), "backups"],
        );
        let request = TransferRequest {
            route_base_id: name.clone(),
            location,
            auth,
            remote_dir,
            files,
            cleanup_dir: None,
            mirror: false,
            partial: false,
        };
        let session = TransferSession::begin(None, &name, location_id)?;
        self.engine.transfer(&request, session).await
    }
}

/// Errors that would repeat for every remaining route.
fn is_fatal(error: &SyncError) -> bool {
    matches!(
        error.root(),
        SyncError::Interrupted
            | SyncError::AuthFailed { .. }
            | SyncError::VaultUnavailable(_)
            | SyncError::DecryptionFailed { .. }
            | SyncError::DeviceIdUnavailable { .. }
            | SyncError::ConfigCorrupt { .. }
            | SyncError::InsufficientLocalSpace { .. }
    )
}

/// Artifacts a previous run left in the work directory, or `None` unless
/// every expected kind is there.
fn leftover_artifacts(
    route_base_id: &str,
    work: &Path,
    expected: &[ArtifactKind],
) -> Option<Vec<RouteArtifact>> {
    if expected.is_empty() {
        return None;
    }
    expected
        .iter()
        .map(|&kind| {
            let path = work.join(kind.artifact_file_name());
            let meta = fs::metadata(&path).ok().filter(|m| m.is_file())?;
            Some(RouteArtifact {
                route_base_id: route_base_id.to_string(),
                kind,
                path,
                byte_size: meta.len(),
            })
        })
        .collect()
}

fn backup_files(dir: &Path) -> Result<Vec<TransferFile>> {
    let entries =
        fs::read_dir(dir).map_err(|e| SyncError::io(format!("list {}", dir.display()), e))?;

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            paths.push(path);
        } else {
            warn!(path = %path.display(), "Skipping non-file in backup directory");
        }
    }
    paths.sort();

    if paths.is_empty() {
        return Err(SyncError::io(
            format!("backup directory {} has no files", dir.display()),
            io::Error::from(io::ErrorKind::NotFound),
        ));
    }
    paths.iter().map(|p| TransferFile::from_path(p)).collect()
}

fn discard_work_dir(work: &Path) {
    match fs::remove_dir_all(work) {
        Ok(()) => info!(dir = %work.display(), "Removed temporary concatenation directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %work.display(), error = %e, "Failed to remove work directory"),
    }
}
