//! Consistency checks over the on-device state, and their fixes.
//!
//! [`detect_issues`] only reads. Each [`IssueKind`] maps to one [`Remedy`]
//! in a [`RemedyRegistry`]; applying it is a separate, explicit step.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tracing::info;

use crate::context::AppContext;
use crate::core::models::{Auth, Role};
use crate::db::StoreError;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueKind {
    MissingKeyFile,
    CorruptRegistry,
    CorruptTransferLog,
    MissingCredential,
    OrphanedCredential,
    InterruptedTransfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub description: String,
    /// What the issue is about: a role, credential file or route id.
    pub subject: Option<String>,
}

impl Issue {
    fn new(kind: IssueKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
            subject: None,
        }
    }

    fn about(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    fn subject(&self) -> Result<&str> {
        self.subject
            .as_deref()
            .ok_or_else(|| SyncError::InvalidLocation(format!("{:?} has no subject", self.kind)))
    }
}

/// Inspect keys, locations, credentials and transfer state. Nothing is
/// modified.
pub fn detect_issues(ctx: &AppContext) -> Result<Vec<Issue>> {
    let mut issues = Vec::new();
    let registry = ctx.registry();
    let vault = ctx.vault();
    let stored: BTreeSet<String> = vault.list()?.into_iter().collect();

    if !vault.key_file().exists() && !stored.is_empty() {
        issues.push(Issue::new(
            IssueKind::MissingKeyFile,
            Severity::Critical,
            format!(
                "key file {} is missing; {} stored credential(s) cannot be decrypted",
                vault.key_file().display(),
                stored.len()
            ),
        ));
    }

    let locations = match registry.inspect() {
        Ok(doc) => doc.locations,
        Err(StoreError::Corrupt { path, .. }) => {
            issues.push(Issue::new(
                IssueKind::CorruptRegistry,
                Severity::Critical,
                format!("location config {} is not valid JSON", path.display()),
            ));
            Vec::new()
        }
        Err(e) => return Err(e.into()),
    };

    let mut referenced = BTreeSet::new();
    for location in &locations {
        if let Auth::Password { credential_ref } = &location.auth {
            referenced.insert(credential_ref.clone());
            if !stored.contains(credential_ref) {
                issues.push(
                    Issue::new(
                        IssueKind::MissingCredential,
                        Severity::Warning,
                        format!(
                            "{} location {:?} has no credential file {}",
                            location.role, location.label, credential_ref
                        ),
                    )
                    .about(location.role.as_str()),
                );
            }
        }
    }

    // A corrupt registry references nothing; leave its credentials alone.
    if issues.iter().all(|i| i.kind != IssueKind::CorruptRegistry) {
        for orphan in stored.difference(&referenced) {
            issues.push(
                Issue::new(
                    IssueKind::OrphanedCredential,
                    Severity::Info,
                    format!("credential file {} belongs to no location", orphan),
                )
                .about(orphan.as_str()),
            );
        }
    }

    let log = ctx.transfer_log();
    match log.inspect() {
        Ok(_) => {}
        Err(StoreError::Corrupt { path, .. }) => issues.push(Issue::new(
            IssueKind::CorruptTransferLog,
            Severity::Warning,
            format!("transfer log {} is not valid JSON", path.display()),
        )),
        Err(e) => return Err(e.into()),
    }

    for state in ctx.transfer_states().list()? {
        issues.push(
            Issue::new(
                IssueKind::InterruptedTransfer,
                Severity::Info,
                format!(
                    "transfer of {} stopped at {}% ({}) on {}",
                    state.route_base_id,
                    state.progress_percent,
                    state.stage,
                    state.timestamp.format("%Y-%m-%d %H:%M:%S")
                ),
            )
            .about(state.route_base_id.as_str()),
        );
    }

    issues.sort_by(|a, b| b.severity.cmp(&a.severity));
    Ok(issues)
}

pub trait Remedy: Send + Sync {
    /// What applying the remedy will do, for confirmation prompts.
    fn describe(&self, issue: &Issue) -> String;

    /// Fix the issue; returns a summary of what changed.
    fn apply(&self, ctx: &AppContext, issue: &Issue) -> Result<String>;
}

struct GenerateKeyFile;

impl Remedy for GenerateKeyFile {
    fn describe(&self, _issue: &Issue) -> String {
        "generate a new key file; stored passwords must be entered again".to_string()
    }

    fn apply(&self, ctx: &AppContext, _issue: &Issue) -> Result<String> {
        let vault = ctx.vault();
        vault.ensure_key_file()?;
        Ok(format!("created {}", vault.key_file().display()))
    }
}

struct ResetRegistry;

impl Remedy for ResetRegistry {
    fn describe(&self, _issue: &Issue) -> String {
        "move the corrupt location config aside and start an empty one".to_string()
    }

    fn apply(&self, ctx: &AppContext, _issue: &Issue) -> Result<String> {
        match ctx.registry().list_all() {
            Err(SyncError::ConfigCorrupt { backup, .. }) => {
                Ok(format!("old config saved as {}", backup.display()))
            }
            Ok(_) => Ok("config is readable again, nothing to do".to_string()),
            Err(e) => Err(e),
        }
    }
}

struct ResetTransferLog;

impl Remedy for ResetTransferLog {
    fn describe(&self, _issue: &Issue) -> String {
        "move the corrupt transfer log aside and start an empty history".to_string()
    }

    fn apply(&self, ctx: &AppContext, _issue: &Issue) -> Result<String> {
        let backup = ctx.transfer_log().quarantine()?;
        Ok(format!("old history saved as {}", backup.display()))
    }
}

struct RemoveDanglingLocation;

impl Remedy for RemoveDanglingLocation {
    fn describe(&self, issue: &Issue) -> String {
        format!(
            "remove the {} location so it can be configured again",
            issue.subject.as_deref().unwrap_or("affected")
        )
    }

    fn apply(&self, ctx: &AppContext, issue: &Issue) -> Result<String> {
        let role = match issue.subject()? {
            "route_sync" => Role::RouteSync,
            "device_backup" => Role::DeviceBackup,
            other => return Err(SyncError::LocationNotFound(other.to_string())),
        };
        let removed = ctx.registry().remove(role)?;
        Ok(format!("removed location {:?}", removed.label))
    }
}

struct DeleteOrphanedCredential;

impl Remedy for DeleteOrphanedCredential {
    fn describe(&self, issue: &Issue) -> String {
        format!(
            "delete credential file {}",
            issue.subject.as_deref().unwrap_or("?")
        )
    }

    fn apply(&self, ctx: &AppContext, issue: &Issue) -> Result<String> {
        let credential_ref = issue.subject()?;
        ctx.vault().remove(credential_ref)?;
        Ok(format!("deleted {}", credential_ref))
    }
}

struct ClearTransferState;

impl Remedy for ClearTransferState {
    fn describe(&self, issue: &Issue) -> String {
        format!(
            "forget the interrupted transfer of {}; the next sync starts over",
            issue.subject.as_deref().unwrap_or("?")
        )
    }

    fn apply(&self, ctx: &AppContext, issue: &Issue) -> Result<String> {
        let route = issue.subject()?;
        ctx.transfer_states().clear(route)?;
        let work = ctx.config.work_dir.join(route);
        if work.exists() {
            std::fs::remove_dir_all(&work)
                .map_err(|e| SyncError::io(format!("remove {}", work.display()), e))?;
        }
        Ok(format!("cleared state for {}", route))
    }
}

pub struct RemedyRegistry {
    remedies: HashMap<IssueKind, Box<dyn Remedy>>,
}

impl Default for RemedyRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(IssueKind::MissingKeyFile, GenerateKeyFile);
        registry.register(IssueKind::CorruptRegistry, ResetRegistry);
        registry.register(IssueKind::CorruptTransferLog, ResetTransferLog);
        registry.register(IssueKind::MissingCredential, RemoveDanglingLocation);
        registry.register(IssueKind::OrphanedCredential, DeleteOrphanedCredential);
        registry.register(IssueKind::InterruptedTransfer, ClearTransferState);
        registry
    }
}

impl RemedyRegistry {
    pub fn empty() -> Self {
        Self {
            remedies: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: IssueKind, remedy: impl Remedy + 'static) {
        self.remedies.insert(kind, Box::new(remedy));
    }

    pub fn get(&self, kind: IssueKind) -> Option<&dyn Remedy> {
        self.remedies.get(&kind).map(|r| r.as_ref())
    }

    /// Apply the remedy registered for `issue.kind`; `None` if there is none.
    pub fn apply(&self, ctx: &AppContext, issue: &Issue) -> Option<Result<String>> {
        let remedy = self.get(issue.kind)?;
        let result = remedy.apply(ctx, issue);
        if let Ok(summary) = &result {
            info!(kind = ?issue.kind, summary = %summary, "Applied remedy");
        }
        Some(result)
    }
}
