use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Remote protocol spoken to a network location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Smb,
    Ssh,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smb => "smb",
            Self::Ssh => "ssh",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Purpose a location serves. At most one location exists per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    RouteSync,
    DeviceBackup,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RouteSync => "route_sync",
            Self::DeviceBackup => "device_backup",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SMB share name or SSH port, depending on protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Endpoint {
    Share { share: String },
    Port { port: u16 },
}

impl Endpoint {
    /// The share-or-port value used for identity hashing.
    pub fn key(&self) -> String {
        match self {
            Self::Share { share } => share.clone(),
            Self::Port { port } => port.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "auth_type", rename_all = "snake_case")]
pub enum Auth {
    /// File name of the encrypted credential inside the credentials directory.
    Password { credential_ref: String },
    Key { key_path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLocation {
    pub location_id: String,
    pub protocol: Protocol,
    pub role: Role,
    pub server: String,
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub remote_path: String,
    pub label: String,
    pub username: String,
    #[serde(flatten)]
    pub auth: Auth,
}

impl NetworkLocation {
    /// Human readable destination, e.g. `smb://nas.local/routes/comma`.
    pub fn destination(&self) -> String {
        let path = self.remote_path.trim_matches('/');
        match &self.endpoint {
            Endpoint::Share { share } => format!("smb://{}/{}/{}", self.server, share, path),
            Endpoint::Port { port } => {
                format!("ssh://{}@{}:{}/{}", self.username, self.server, port, path)
            }
        }
    }
}

/// Credential material for a location, before it is stored.
#[derive(Clone)]
pub enum AuthInput {
    Password(String),
    Key(PathBuf),
}

impl fmt::Debug for AuthInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::Key(path) => f.debug_tuple("Key").field(path).finish(),
        }
    }
}

/// User supplied parameters for a new location.
#[derive(Debug, Clone)]
pub struct NewLocation {
    pub protocol: Protocol,
    pub role: Role,
    pub server: String,
    pub endpoint: Endpoint,
    pub remote_path: String,
    pub label: String,
    pub username: String,
    pub auth: AuthInput,
}

/// One of the four fixed camera channels recorded per segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Camera {
    Road,
    WideRoad,
    Driver,
    Preview,
}

impl Camera {
    pub const ALL: [Camera; 4] = [Self::Road, Self::WideRoad, Self::Driver, Self::Preview];

    /// Per-segment file name, which also fixes the container extension.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Road => "fcamera.hevc",
            Self::WideRoad => "ecamera.hevc",
            Self::Driver => "dcamera.hevc",
            Self::Preview => "qcamera.ts",
        }
    }
}

impl fmt::Display for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.file_name();
        f.write_str(name.split('.').next().unwrap_or(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Rlog,
    Qlog,
    Video(Camera),
}

impl ArtifactKind {
    /// Every kind a route can produce, in concatenation order.
    pub fn all() -> Vec<ArtifactKind> {
        let mut kinds = vec![Self::Rlog, Self::Qlog];
        kinds.extend(Camera::ALL.into_iter().map(Self::Video));
        kinds
    }

    /// File name looked up inside each segment directory.
    pub fn segment_file_name(&self) -> &'static str {
        match self {
            Self::Rlog => "rlog",
            Self::Qlog => "qlog",
            Self::Video(camera) => camera.file_name(),
        }
    }

    /// File name of the concatenated artifact.
    pub fn artifact_file_name(&self) -> &'static str {
        self.segment_file_name()
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rlog => f.write_str("rlog"),
            Self::Qlog => f.write_str("qlog"),
            Self::Video(camera) => write!(f, "video ({})", camera),
        }
    }
}

/// A segment directory discovered under the routes root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSegment {
    pub route_base_id: String,
    pub segment_index: u32,
    pub path: PathBuf,
}

impl RouteSegment {
    pub fn file(&self, kind: ArtifactKind) -> Option<PathBuf> {
        let path = self.path.join(kind.segment_file_name());
        path.is_file().then_some(path)
    }
}

/// A concatenated, per-route output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteArtifact {
    pub route_base_id: String,
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub byte_size: u64,
}

impl RouteArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.kind.artifact_file_name().to_string())
    }
}

/// Stages of a route transfer. `Failed` is carried by the error, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStage {
    Init,
    Concatenating,
    Uploading,
    Verifying,
    Done,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Concatenating => "concatenating",
            Self::Uploading => "uploading",
            Self::Verifying => "verifying",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Persisted marker of an in-flight or interrupted route transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub route_base_id: String,
    pub location_id: String,
    pub progress_percent: u8,
    pub stage: TransferStage,
    pub timestamp: DateTime<Utc>,
}

impl TransferState {
    /// Concatenation finished before the interruption.
    pub fn concatenation_complete(&self) -> bool {
        self.progress_percent >= super::transfer_engine::MILESTONE_CONCATENATED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferLogStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub route_base_id: String,
    pub location_id: String,
    pub status: TransferLogStatus,
    pub destination: String,
    pub total_size: u64,
    pub duration_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
