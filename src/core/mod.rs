pub mod concat;
pub mod device;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod prober;
pub mod progress;
pub mod registry;
pub mod transfer_engine;
pub mod vault;

pub use concat::Concatenator;
pub use health::{Issue, IssueKind, RemedyRegistry, detect_issues};
pub use models::{NetworkLocation, NewLocation, Protocol, Role, TransferState};
pub use orchestrator::{Orchestrator, Prompt, ResumeChoice, SyncSummary, Unattended};
pub use prober::ConnectivityProber;
pub use registry::{LocationRegistry, ReplacePolicy};
pub use transfer_engine::TransferEngine;
pub use vault::CredentialVault;
