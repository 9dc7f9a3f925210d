mod common;

use std::fs;
use std::sync::Arc;

use common::{DEVICE, FakeShare, ROUTE, config, home_nas, segment};
use routesync::context::AppContext;
use routesync::core::models::{
    ArtifactKind, Camera, NewLocation, Role, TransferLogStatus, TransferStage, TransferState,
};
use routesync::core::registry::ReplacePolicy;
use routesync::core::transfer_engine::MILESTONE_CONCATENATED;
use routesync::core::{Orchestrator, Prompt, ResumeChoice, Unattended};
use routesync::error::SyncError;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn remote(file: &str) -> String {
    format!("comma/{}/{}/{}", DEVICE, ROUTE, file)
}

fn record_route(config: &routesync::config::AppConfig) {
    segment(config, ROUTE, 0, "rlog", b"first rlog");
    segment(config, ROUTE, 1, "rlog", b"second rlog");
    segment(config, ROUTE, 0, "qlog", &[1u8; 2048]);
    segment(config, ROUTE, 1, "qlog", &[2u8; 2048]);
}

fn context(config: routesync::config::AppConfig, share: &FakeShare) -> (AppContext, String) {
    let ctx = AppContext::with_runner(config, Arc::new(share.runner()));
    let location = ctx
        .registry()
        .add(home_nas(Role::RouteSync, "Home NAS"), ReplacePolicy::Reject)
        .unwrap();
    (ctx, location.location_id)
}

#[tokio::test]
async fn route_is_uploaded_under_device_and_route() {
    let temp = tempdir().unwrap();
    let config = config(temp.path());
    record_route(&config);
    let share = FakeShare::default();
    let (ctx, location_id) = context(config.clone(), &share);

    let outcome = Orchestrator::new(ctx.clone())
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap();

    assert_eq!(outcome.uploaded, vec!["rlog", "qlog"]);
    assert!(outcome.skipped.is_empty());
    assert_eq!(share.size(&remote("qlog")), Some(4096));
    let rlog = share.size(&remote("rlog")).unwrap();
    assert_eq!(outcome.total_bytes, rlog + 4096);

    assert!(ctx.transfer_states().load(ROUTE).unwrap().is_none());
    assert!(!config.work_dir.join(ROUTE).exists());
    assert!(config.routes_root.join(format!("{}--0", ROUTE)).join("rlog").exists());

    let history = ctx.transfer_log().query_by_route(ROUTE).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TransferLogStatus::Success);
    assert_eq!(history[0].location_id, location_id);
}

#[tokio::test]
async fn equal_remote_size_is_skipped_and_different_is_replaced() {
    let temp = tempdir().unwrap();
    let config = config(temp.path());
    record_route(&config);
    let share = FakeShare::default();
    share.seed(&remote("qlog"), 4096);
    let (ctx, location_id) = context(config, &share);

    let outcome = Orchestrator::new(ctx)
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap();

    assert_eq!(outcome.uploaded, vec!["rlog"]);
    assert_eq!(outcome.skipped, vec!["qlog"]);

    let temp = tempdir().unwrap();
    let config = config_with_route(temp.path());
    let share = FakeShare::default();
    share.seed(&remote("qlog"), 2048);
    let (ctx, location_id) = context(config, &share);

    let outcome = Orchestrator::new(ctx)
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap();

    assert_eq!(outcome.uploaded, vec!["rlog", "qlog"]);
    assert_eq!(share.size(&remote("qlog")), Some(4096));
}

fn config_with_route(dir: &std::path::Path) -> routesync::config::AppConfig {
    let config = config(dir);
    record_route(&config);
    config
}

#[tokio::test]
async fn second_run_uploads_nothing() {
    let temp = tempdir().unwrap();
    let config = config_with_route(temp.path());
    let share = FakeShare::default();
    let (ctx, location_id) = context(config, &share);
    let orchestrator = Orchestrator::new(ctx);

    let first = orchestrator
        .sync_all_routes(&location_id, &Unattended)
        .await
        .unwrap();
    assert_eq!(first.synced.len(), 1);
    assert_eq!(share.puts().len(), 2);

    let second = orchestrator
        .sync_all_routes(&location_id, &Unattended)
        .await
        .unwrap();
    assert!(second.synced.is_empty());
    assert_eq!(second.skipped, vec![ROUTE.to_string()]);

    let again = orchestrator
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap();
    assert!(again.uploaded.is_empty());
    assert_eq!(again.skipped.len(), 2);
    assert_eq!(share.puts().len(), 2);
}

#[tokio::test]
async fn interrupted_upload_keeps_state_and_resumes() {
    let temp = tempdir().unwrap();
    let config = config_with_route(temp.path());
    let share = FakeShare::default();

    let token = CancellationToken::new();
    let cancel = token.clone();
    let mut ctx = AppContext::with_runner(
        config.clone(),
        Arc::new(share.runner_with(move || {
            cancel.cancel();
            true
        })),
    );
    ctx.cancel = token;
    let location_id = ctx
        .registry()
        .add(home_nas(Role::RouteSync, "Home NAS"), ReplacePolicy::Reject)
        .unwrap()
        .location_id;

    let err = Orchestrator::new(ctx.clone())
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap_err();

    assert!(matches!(err.root(), SyncError::Interrupted));
    assert!(err.state_preserved());
    let state = ctx.transfer_states().load(ROUTE).unwrap().unwrap();
    assert_eq!(state.progress_percent, MILESTONE_CONCATENATED);
    assert_eq!(state.stage, TransferStage::Uploading);
    assert_eq!(state.location_id, location_id);
    assert!(!config.work_dir.join(ROUTE).exists());
    assert!(ctx.transfer_log().query_all().unwrap().is_empty());

    let resumed = AppContext::with_runner(config.clone(), Arc::new(share.runner()));
    let outcome = Orchestrator::new(resumed.clone())
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap();

    assert_eq!(outcome.skipped, vec!["rlog"]);
    assert_eq!(outcome.uploaded, vec!["qlog"]);
    assert!(resumed.transfer_states().load(ROUTE).unwrap().is_none());
}

#[tokio::test]
async fn failed_upload_keeps_artifacts_for_retry() {
    let temp = tempdir().unwrap();
    let config = config_with_route(temp.path());
    let share = FakeShare::default();
    let ctx = AppContext::with_runner(config.clone(), Arc::new(share.runner_with(|| false)));
    let location_id = ctx
        .registry()
        .add(home_nas(Role::RouteSync, "Home NAS"), ReplacePolicy::Reject)
        .unwrap()
        .location_id;

    let err = Orchestrator::new(ctx.clone())
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap_err();

    assert!(matches!(err.root(), SyncError::UploadFailed { .. }));
    assert_eq!(err.stage(), Some(TransferStage::Uploading));
    assert!(err.state_preserved());
    assert!(config.work_dir.join(ROUTE).join("rlog").is_file());
    assert!(ctx.transfer_states().load(ROUTE).unwrap().is_some());

    let retry = AppContext::with_runner(config.clone(), Arc::new(share.runner()));
    let outcome = Orchestrator::new(retry)
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap();
    assert_eq!(outcome.uploaded, vec!["rlog", "qlog"]);
    assert!(!config.work_dir.join(ROUTE).exists());
}

#[tokio::test]
async fn unknown_route_is_reported() {
    let temp = tempdir().unwrap();
    let config = config(temp.path());
    let share = FakeShare::default();
    let (ctx, location_id) = context(config, &share);

    let err = Orchestrator::new(ctx)
        .sync_route("2020-01-01--00-00-00", &location_id, &Unattended)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::RouteNotFound(_)));
    assert!(share.puts().is_empty());
}

/// Fixed answers for an attended run.
struct Answers {
    choice: ResumeChoice,
    delete: bool,
}

impl Prompt for Answers {
    fn resume_or_restart(&self, _state: &TransferState) -> ResumeChoice {
        self.choice
    }

    fn confirm(&self, _question: &str) -> bool {
        self.delete
    }

    fn configure_location(&self, _role: Role) -> Option<NewLocation> {
        None
    }
}

#[tokio::test]
async fn confirmed_delete_removes_segments_after_upload() {
    let temp = tempdir().unwrap();
    let config = config_with_route(temp.path());
    let share = FakeShare::default();
    let (ctx, location_id) = context(config.clone(), &share);
    let prompt = Answers {
        choice: ResumeChoice::Resume,
        delete: true,
    };

    let outcome = Orchestrator::new(ctx)
        .sync_route(ROUTE, &location_id, &prompt)
        .await
        .unwrap();

    assert_eq!(outcome.uploaded, vec!["rlog", "qlog"]);
    assert_eq!(share.size(&remote("qlog")), Some(4096));
    for index in 0..2 {
        let dir = config.routes_root.join(format!("{}--{}", ROUTE, index));
        assert!(!dir.join("rlog").exists());
        assert!(!dir.join("qlog").exists());
    }
}

#[tokio::test]
async fn failed_upload_never_deletes_segments() {
    let temp = tempdir().unwrap();
    let config = config_with_route(temp.path());
    let share = FakeShare::default();
    let ctx = AppContext::with_runner(config.clone(), Arc::new(share.runner_with(|| false)));
    let location_id = ctx
        .registry()
        .add(home_nas(Role::RouteSync, "Home NAS"), ReplacePolicy::Reject)
        .unwrap()
        .location_id;
    let prompt = Answers {
        choice: ResumeChoice::Resume,
        delete: true,
    };

    Orchestrator::new(ctx)
        .sync_route(ROUTE, &location_id, &prompt)
        .await
        .unwrap_err();

    let first = config.routes_root.join(format!("{}--0", ROUTE));
    assert!(first.join("rlog").is_file());
    assert!(first.join("qlog").is_file());
}

#[tokio::test]
async fn failures_are_logged_when_enabled() {
    let temp = tempdir().unwrap();
    let mut config = config_with_route(temp.path());
    config.log_failed_transfers = true;
    let share = FakeShare::default();
    let ctx = AppContext::with_runner(config, Arc::new(share.runner_with(|| false)));
    let location_id = ctx
        .registry()
        .add(home_nas(Role::RouteSync, "Home NAS"), ReplacePolicy::Reject)
        .unwrap()
        .location_id;

    Orchestrator::new(ctx.clone())
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap_err();

    let history = ctx.transfer_log().query_by_route(ROUTE).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TransferLogStatus::Failure);
    assert_eq!(history[0].location_id, location_id);
    assert!(history[0].error.as_deref().unwrap().contains("NT_STATUS_DISK_FULL"));
}

#[tokio::test]
async fn restart_discards_leftover_artifacts() {
    let temp = tempdir().unwrap();
    let config = config_with_route(temp.path());
    let share = FakeShare::default();
    let ctx = AppContext::with_runner(config.clone(), Arc::new(share.runner_with(|| false)));
    let location_id = ctx
        .registry()
        .add(home_nas(Role::RouteSync, "Home NAS"), ReplacePolicy::Reject)
        .unwrap()
        .location_id;
    Orchestrator::new(ctx)
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap_err();

    let leftover = config.work_dir.join(ROUTE).join("rlog");
    fs::write(&leftover, b"tampered").unwrap();

    let retry = AppContext::with_runner(config.clone(), Arc::new(share.runner()));
    let prompt = Answers {
        choice: ResumeChoice::Restart,
        delete: false,
    };
    let outcome = Orchestrator::new(retry.clone())
        .sync_route(ROUTE, &location_id, &prompt)
        .await
        .unwrap();

    assert_eq!(outcome.uploaded, vec!["rlog", "qlog"]);
    let rlog = share.size(&remote("rlog")).unwrap();
    assert_ne!(rlog, b"tampered".len() as u64);
    assert_eq!(rlog + 4096, outcome.total_bytes);
    assert!(retry.transfer_states().load(ROUTE).unwrap().is_none());
}

#[tokio::test]
async fn resume_with_missing_artifact_concatenates_again() {
    let temp = tempdir().unwrap();
    let config = config_with_route(temp.path());
    let share = FakeShare::default();
    let ctx = AppContext::with_runner(config.clone(), Arc::new(share.runner_with(|| false)));
    let location_id = ctx
        .registry()
        .add(home_nas(Role::RouteSync, "Home NAS"), ReplacePolicy::Reject)
        .unwrap()
        .location_id;
    Orchestrator::new(ctx)
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap_err();

    fs::remove_file(config.work_dir.join(ROUTE).join("qlog")).unwrap();

    let retry = AppContext::with_runner(config.clone(), Arc::new(share.runner()));
    let outcome = Orchestrator::new(retry)
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap();

    assert_eq!(outcome.uploaded, vec!["rlog", "qlog"]);
    assert_eq!(share.size(&remote("qlog")), Some(4096));
    assert!(share.puts().contains(&remote("qlog")));
}

#[tokio::test]
async fn broken_camera_does_not_hold_back_logs() {
    let temp = tempdir().unwrap();
    let config = config_with_route(temp.path());
    segment(&config, ROUTE, 0, "dcamera.hevc", b"not really video");
    let share = FakeShare::default();
    let (ctx, location_id) = context(config.clone(), &share);

    let err = Orchestrator::new(ctx.clone())
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap_err();

    assert!(matches!(
        err.root(),
        SyncError::ConcatenationFailed {
            kind: ArtifactKind::Video(Camera::Driver),
            ..
        }
    ));
    assert!(err.state_preserved());
    assert_eq!(err.stage(), Some(TransferStage::Concatenating));

    assert!(share.size(&remote("rlog")).is_some());
    assert_eq!(share.size(&remote("qlog")), Some(4096));
    assert_eq!(share.size(&remote("dcamera.hevc")), None);

    let state = ctx.transfer_states().load(ROUTE).unwrap().unwrap();
    assert!(state.progress_percent < MILESTONE_CONCATENATED);
    assert!(ctx.transfer_log().query_all().unwrap().is_empty());
    assert!(config.routes_root.join(format!("{}--0", ROUTE)).join("rlog").is_file());
}

#[tokio::test]
async fn grown_route_is_uploaded_again() {
    let temp = tempdir().unwrap();
    let config = config(temp.path());
    segment(&config, ROUTE, 0, "qlog", &[1u8; 10]);
    let share = FakeShare::default();
    let (ctx, location_id) = context(config.clone(), &share);
    let orchestrator = Orchestrator::new(ctx);

    let first = orchestrator
        .sync_all_routes(&location_id, &Unattended)
        .await
        .unwrap();
    assert_eq!(first.synced.len(), 1);
    assert_eq!(share.size(&remote("qlog")), Some(10));

    segment(&config, ROUTE, 1, "qlog", &[2u8; 10]);
    let second = orchestrator
        .sync_all_routes(&location_id, &Unattended)
        .await
        .unwrap();
    assert_eq!(second.synced.len(), 1);
    assert!(second.skipped.is_empty());
    assert_eq!(share.size(&remote("qlog")), Some(20));
}

#[tokio::test]
async fn simulation_run_completes_against_dry_run_remote() {
    let temp = tempdir().unwrap();
    let mut config = config_with_route(temp.path());
    segment(&config, ROUTE, 0, "fcamera.hevc", b"road");
    config.simulation = true;
    let ctx = AppContext::new(config.clone());
    let location_id = ctx
        .registry()
        .add(home_nas(Role::RouteSync, "Home NAS"), ReplacePolicy::Reject)
        .unwrap()
        .location_id;
    let orchestrator = Orchestrator::new(ctx.clone());

    let outcome = orchestrator
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap();
    assert_eq!(outcome.uploaded, vec!["rlog", "qlog", "fcamera.hevc"]);
    assert!(ctx.transfer_states().load(ROUTE).unwrap().is_none());

    let history = ctx.transfer_log().query_by_route(ROUTE).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, TransferLogStatus::Success);

    let again = orchestrator
        .sync_route(ROUTE, &location_id, &Unattended)
        .await
        .unwrap();
    assert!(again.uploaded.is_empty());
    assert_eq!(again.skipped.len(), 3);
}
