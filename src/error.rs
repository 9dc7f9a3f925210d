//! Error types shared by the core subsystems.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::models::{ArtifactKind, Role, TransferStage};
use crate::db::StoreError;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("credential vault unavailable: key file {} is missing", .0.display())]
    VaultUnavailable(PathBuf),

    #[error("failed to decrypt credential {}: corrupt blob or changed key file", .path.display())]
    DecryptionFailed { path: PathBuf },

    #[error("location config {} was corrupt; moved to {} and reinitialized", .path.display(), .backup.display())]
    ConfigCorrupt { path: PathBuf, backup: PathBuf },

    #[error("no network location found for {0}")]
    LocationNotFound(String),

    #[error("a {role} location already exists ({label}); replacing it must be confirmed")]
    DuplicateRoleConflict { role: Role, label: String },

    #[error("no segments found for route {0}")]
    RouteNotFound(String),

    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("{target} is unreachable: {detail}")]
    Unreachable { target: String, detail: String },

    #[error("authentication to {target} failed: {detail}")]
    AuthFailed { target: String, detail: String },

    #[error("concatenation of {kind} failed: {detail}")]
    ConcatenationFailed { kind: ArtifactKind, detail: String },

    #[error("upload of {artifact} failed: {detail}")]
    UploadFailed { artifact: String, detail: String },

    #[error(
        "insufficient local space in {}: need {needed} bytes, {available} available",
        .path.display()
    )]
    InsufficientLocalSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("device id unavailable at {}: {reason}", .path.display())]
    DeviceIdUnavailable { path: PathBuf, reason: String },

    #[error(
        "transfer of {route} failed during {stage} ({}): {source}",
        .state_preserved.then_some("state preserved for resume").unwrap_or("no state saved")
    )]
    TransferFailed {
        route: String,
        stage: TransferStage,
        state_preserved: bool,
        #[source]
        source: Box<SyncError>,
    },

    #[error("operation interrupted")]
    Interrupted,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl SyncError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Stage a failed transfer stopped in, if this is a transfer failure.
    pub fn stage(&self) -> Option<TransferStage> {
        match self {
            Self::TransferFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Whether resumable transfer state survived the failure.
    pub fn state_preserved(&self) -> bool {
        matches!(
            self,
            Self::TransferFailed {
                state_preserved: true,
                ..
            }
        )
    }

    /// Innermost error for transfer failures, `self` otherwise.
    pub fn root(&self) -> &SyncError {
        match self {
            Self::TransferFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Network errors worth retrying; auth failures never are.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::UploadFailed { .. })
    }
}

/// Map an I/O error raised while writing local output, turning a full disk
/// into `InsufficientLocalSpace`.
pub fn classify_write_error(path: &std::path::Path, context: &str, e: io::Error) -> SyncError {
    if e.raw_os_error() == Some(libc::ENOSPC) {
        let available = crate::core::concat::available_space(path).unwrap_or(0);
        return SyncError::InsufficientLocalSpace {
            path: path.to_path_buf(),
            needed: 0,
            available,
        };
    }
    SyncError::io(format!("{}: {}", context, path.display()), e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_failure_reports_stage_and_preservation() {
        let err = SyncError::TransferFailed {
            route: "00001".to_string(),
            stage: TransferStage::Uploading,
            state_preserved: true,
            source: Box::new(SyncError::Unreachable {
                target: "nas.local".to_string(),
                detail: "timed out".to_string(),
            }),
        };

        assert_eq!(err.stage(), Some(TransferStage::Uploading));
        assert!(err.state_preserved());
        assert!(matches!(err.root(), SyncError::Unreachable { .. }));

        let msg = err.to_string();
        assert!(msg.contains("uploading"));
        assert!(msg.contains("state preserved"));
    }

    #[test]
    fn auth_failures_are_not_transient() {
        let err = SyncError::AuthFailed {
            target: "nas".to_string(),
            detail: "NT_STATUS_LOGON_FAILURE".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn enospc_maps_to_insufficient_space() {
        let dir = tempfile::tempdir().unwrap();
        let err = classify_write_error(
            dir.path(),
            "write",
            io::Error::from_raw_os_error(libc::ENOSPC),
        );
        assert!(matches!(err, SyncError::InsufficientLocalSpace { .. }));

        let err = classify_write_error(
            dir.path(),
            "write",
            io::Error::from_raw_os_error(libc::EACCES),
        );
        assert!(matches!(err, SyncError::Io { .. }));
    }
}
