use std::io::{Write, stdin, stdout};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use routesync::config::AppConfig;
use routesync::context::AppContext;
use routesync::core::models::{AuthInput, Endpoint, NewLocation, Protocol, Role, TransferState};
use routesync::core::{
    Orchestrator, Prompt, RemedyRegistry, ReplacePolicy, ResumeChoice, Unattended, detect_issues,
};
use routesync::error::SyncError;
use routesync::logging::{self, LogConfig};
use routesync::service::Job;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "routesync")]
#[command(about = "Push drive recordings and device backups to network storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

/// Flags that override config. Unset flags are skipped so lower layers win.
#[derive(Args, Serialize)]
struct GlobalArgs {
    #[serde(skip)]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Answer every question with the unattended default.
    #[serde(skip)]
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage network locations.
    #[command(subcommand)]
    Location(LocationCommand),
    /// Concatenate and upload one route.
    SyncRoute {
        route: String,
        #[arg(long)]
        location_id: Option<String>,
    },
    /// Upload every route not yet delivered to the location.
    SyncAll {
        #[arg(long)]
        location_id: Option<String>,
    },
    /// Upload the files of a backup directory.
    Backup {
        #[arg(long)]
        backup_dir: PathBuf,
        #[arg(long)]
        location_id: Option<String>,
    },
    /// Print the label of a location.
    Label { location_id: String },
    /// Show the transfer history.
    History {
        #[arg(long)]
        route: Option<String>,
    },
    /// Manage scheduled jobs in the launch environment file.
    #[command(subcommand)]
    Job(JobCommand),
    /// Check keys, locations, credentials and transfer state.
    Doctor {
        #[arg(long)]
        fix: bool,
    },
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum LocationCommand {
    Add(AddLocationArgs),
    Remove { role: Role },
    List,
    Probe { location_id: String },
}

#[derive(Args)]
struct AddLocationArgs {
    #[arg(long, value_enum)]
    protocol: Protocol,
    #[arg(long, value_enum)]
    role: Role,
    #[arg(long)]
    server: String,
    /// SMB share name.
    #[arg(long)]
    share: Option<String>,
    /// SSH port.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value = "")]
    remote_path: String,
    #[arg(long)]
    label: String,
    #[arg(long)]
    username: String,
    /// SSH private key; without it a password is used.
    #[arg(long)]
    key: Option<PathBuf>,
    /// Read the password from this environment variable instead of stdin.
    #[arg(long)]
    password_env: Option<String>,
    /// Replace an existing location for the role without asking.
    #[arg(long)]
    replace: bool,
}

#[derive(Subcommand)]
enum JobCommand {
    Install {
        role: Role,
        #[arg(long)]
        location_id: String,
        /// Required for device_backup jobs.
        #[arg(long)]
        backup_dir: Option<PathBuf>,
    },
    Remove {
        role: Role,
    },
    Show,
}

#[derive(Subcommand)]
enum ConfigCommand {
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.global.config.as_deref(), Some(&cli.global))
        .context("Failed to load configuration")?;
    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let ctx = AppContext::new(config);
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after cleanup");
            cancel.cancel();
        }
    });

    let prompt: Box<dyn Prompt> = if cli.global.yes {
        Box::new(Unattended)
    } else {
        Box::new(StdinPrompt)
    };

    match cli.command {
        Commands::Location(cmd) => run_location(ctx, cmd, prompt.as_ref()).await,
        Commands::SyncRoute { route, location_id } => {
            let orchestrator = Orchestrator::new(ctx);
            let location_id =
                resolve_location(&orchestrator, location_id, Role::RouteSync, prompt.as_ref())
                    .await?;
            let outcome = orchestrator
                .sync_route(&route, &location_id, prompt.as_ref())
                .await
                .with_context(|| format!("Failed to sync route {}", route))?;
            println!(
                "{}: uploaded {}, skipped {} ({} bytes) to {}",
                outcome.route_base_id,
                outcome.uploaded.len(),
                outcome.skipped.len(),
                outcome.total_bytes,
                outcome.destination
            );
            Ok(())
        }
        Commands::SyncAll { location_id } => {
            let orchestrator = Orchestrator::new(ctx);
            let location_id =
                resolve_location(&orchestrator, location_id, Role::RouteSync, prompt.as_ref())
                    .await?;
            let summary = orchestrator
                .sync_all_routes(&location_id, prompt.as_ref())
                .await
                .context("Route sync aborted")?;
            println!(
                "synced {}, already delivered {}, failed {}",
                summary.synced.len(),
                summary.skipped.len(),
                summary.failed.len()
            );
            for (route, error) in &summary.failed {
                println!("  {}: {}", route, error);
            }
            if !summary.failed.is_empty() {
                bail!("{} route(s) failed", summary.failed.len());
            }
            Ok(())
        }
        Commands::Backup {
            backup_dir,
            location_id,
        } => {
            let orchestrator = Orchestrator::new(ctx);
            let location_id = resolve_location(
                &orchestrator,
                location_id,
                Role::DeviceBackup,
                prompt.as_ref(),
            )
            .await?;
            let outcome = orchestrator
                .transfer_backup(&backup_dir, &location_id)
                .await
                .with_context(|| format!("Failed to back up {}", backup_dir.display()))?;
            println!(
                "uploaded {}, skipped {} to {}",
                outcome.uploaded.len(),
                outcome.skipped.len(),
                outcome.destination
            );
            Ok(())
        }
        Commands::Label { location_id } => {
            let label = Orchestrator::new(ctx).get_location_label(&location_id)?;
            println!("{}", label);
            Ok(())
        }
        Commands::History { route } => {
            let log = ctx.transfer_log();
            let entries = match route {
                Some(route) => log.query_by_route(&route)?,
                None => log.query_all()?,
            };
            for e in entries {
                println!(
                    "{}  {:<8} {}  {} bytes  {}s  {}{}",
                    e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    format!("{:?}", e.status).to_lowercase(),
                    e.route_base_id,
                    e.total_size,
                    e.duration_secs,
                    e.destination,
                    e.error.map(|m| format!("  ({})", m)).unwrap_or_default()
                );
            }
            Ok(())
        }
        Commands::Job(cmd) => run_job(&ctx, cmd),
        Commands::Doctor { fix } => run_doctor(&ctx, fix),
        Commands::Config(ConfigCommand::Show) => {
            print!("{}", ctx.config.to_toml()?);
            Ok(())
        }
    }
}

async fn resolve_location(
    orchestrator: &Orchestrator,
    location_id: Option<String>,
    role: Role,
    prompt: &dyn Prompt,
) -> Result<String> {
    match location_id {
        Some(id) => Ok(id),
        None => Ok(orchestrator
            .select_or_configure_location(role, prompt)
            .await
            .with_context(|| format!("No usable {} location", role))?
            .location_id),
    }
}

async fn run_location(ctx: AppContext, cmd: LocationCommand, prompt: &dyn Prompt) -> Result<()> {
    let orchestrator = Orchestrator::new(ctx);
    match cmd {
        LocationCommand::Add(args) => {
            let replace = args.replace;
            let new = new_location(args)?;
            let policy = if replace {
                ReplacePolicy::Replace
            } else {
                ReplacePolicy::Reject
            };

            let location = match orchestrator.configure_location(new.clone(), policy).await {
                Err(SyncError::DuplicateRoleConflict { role, label })
                    if prompt.confirm(&format!(
                        "A {} location ({}) already exists. Replace it?",
                        role, label
                    )) =>
                {
                    orchestrator
                        .configure_location(new, ReplacePolicy::Replace)
                        .await?
                }
                other => other?,
            };
            println!("{}  {}  {}", location.location_id, location.label, location.destination());
            Ok(())
        }
        LocationCommand::Remove { role } => {
            let Some(location) = orchestrator.registry().get(role)? else {
                bail!("no {} location configured", role);
            };
            if !prompt.confirm(&format!(
                "Remove {} location {} ({})?",
                role,
                location.label,
                location.destination()
            )) {
                println!("Keeping {}", location.label);
                return Ok(());
            }
            orchestrator.registry().remove(role)?;
            info!(role = %role, label = %location.label, "Location removed");
            Ok(())
        }
        LocationCommand::List => {
            for location in orchestrator.registry().list_all()? {
                println!(
                    "{}  {:<13} {:<12} {}",
                    location.location_id,
                    location.role,
                    location.label,
                    location.destination()
                );
            }
            Ok(())
        }
        LocationCommand::Probe { location_id } => {
            let result = orchestrator.probe_location(&location_id).await?;
            let label = orchestrator.get_location_label(&location_id)?;
            result
                .into_result(&label)
                .with_context(|| format!("Location {} failed its probe", label))?;
            println!("{}: reachable, credentials accepted", label);
            Ok(())
        }
    }
}

fn new_location(args: AddLocationArgs) -> Result<NewLocation> {
    let endpoint = match (args.protocol, args.share, args.port) {
        (Protocol::Smb, Some(share), _) => Endpoint::Share { share },
        (Protocol::Smb, None, _) => bail!("--share is required for smb"),
        (Protocol::Ssh, _, port) => Endpoint::Port {
            port: port.unwrap_or(22),
        },
    };
    let auth = match (args.key, args.password_env) {
        (Some(key), _) => AuthInput::Key(key),
        (None, Some(var)) => AuthInput::Password(
            std::env::var(&var).with_context(|| format!("{} is not set", var))?,
        ),
        (None, None) => AuthInput::Password(ask("Password: ")?),
    };
    Ok(NewLocation {
        protocol: args.protocol,
        role: args.role,
        server: args.server,
        endpoint,
        remote_path: args.remote_path,
        label: args.label,
        username: args.username,
        auth,
    })
}

fn run_job(ctx: &AppContext, cmd: JobCommand) -> Result<()> {
    let scheduler = ctx.scheduler();
    match cmd {
        JobCommand::Install {
            role,
            location_id,
            backup_dir,
        } => {
            // Refuse to schedule a location that does not exist.
            ctx.registry().get_by_id(&location_id)?;
            let binary = std::env::current_exe().context("Failed to locate own binary")?;
            let job = match (role, backup_dir) {
                (Role::RouteSync, _) => Job::route_sync(&binary, &location_id),
                (Role::DeviceBackup, Some(dir)) => Job::device_backup(&binary, &location_id, &dir),
                (Role::DeviceBackup, None) => bail!("--backup-dir is required for device_backup"),
            };
            if scheduler.install(&job)? {
                println!("Installed {} job in {}", role, scheduler.path().display());
            } else {
                println!("{} job already up to date", role);
            }
            Ok(())
        }
        JobCommand::Remove { role } => {
            if scheduler.remove(role)? {
                println!("Removed {} job", role);
            } else {
                println!("No {} job installed", role);
            }
            Ok(())
        }
        JobCommand::Show => {
            for role in [Role::RouteSync, Role::DeviceBackup] {
                match scheduler.installed(role)? {
                    Some(line) => println!("{}: {}", role, line),
                    None => println!("{}: not installed", role),
                }
            }
            Ok(())
        }
    }
}

fn run_doctor(ctx: &AppContext, fix: bool) -> Result<()> {
    let issues = detect_issues(ctx)?;
    if issues.is_empty() {
        println!("No issues found");
        return Ok(());
    }

    let remedies = RemedyRegistry::default();
    let mut unresolved = 0;
    for issue in &issues {
        println!("[{}] {}", issue.severity, issue.description);
        if !fix {
            if let Some(remedy) = remedies.get(issue.kind) {
                println!("    fix: {}", remedy.describe(issue));
            }
            unresolved += 1;
            continue;
        }
        match remedies.apply(ctx, issue) {
            Some(Ok(done)) => println!("    fixed: {}", done),
            Some(Err(e)) => {
                println!("    fix failed: {}", e);
                unresolved += 1;
            }
            None => unresolved += 1,
        }
    }

    if unresolved > 0 {
        bail!("{} issue(s) remain", unresolved);
    }
    Ok(())
}

/// Interactive answers on the controlling terminal.
struct StdinPrompt;

fn ask(question: &str) -> Result<String> {
    print!("{}", question);
    stdout().flush()?;
    let mut input = String::new();
    stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

impl Prompt for StdinPrompt {
    fn resume_or_restart(&self, state: &TransferState) -> ResumeChoice {
        println!(
            "Transfer of {} was interrupted at {}% ({}), {}.",
            state.route_base_id,
            state.progress_percent,
            state.stage,
            state.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        match ask("Resume it? [Y/n] ") {
            Ok(answer) if answer.eq_ignore_ascii_case("n") => ResumeChoice::Restart,
            _ => ResumeChoice::Resume,
        }
    }

    fn confirm(&self, question: &str) -> bool {
        ask(&format!("{} [y/N] ", question))
            .map(|answer| answer.eq_ignore_ascii_case("y"))
            .unwrap_or(false)
    }

    fn configure_location(&self, role: Role) -> Option<NewLocation> {
        println!("No {} location is configured.", role);
        if !self.confirm("Set one up now?") {
            return None;
        }
        let protocol = match ask("Protocol (smb/ssh): ").ok()?.to_lowercase().as_str() {
            "smb" => Protocol::Smb,
            "ssh" => Protocol::Ssh,
            _ => return None,
        };
        let server = ask("Server: ").ok()?;
        let endpoint = match protocol {
            Protocol::Smb => Endpoint::Share {
                share: ask("Share: ").ok()?,
            },
            Protocol::Ssh => Endpoint::Port {
                port: ask("Port [22]: ").ok()?.parse().unwrap_or(22),
            },
        };
        let remote_path = ask("Remote path: ").ok()?;
        let label = ask("Label: ").ok()?;
        let username = ask("Username: ").ok()?;
        let auth = match protocol {
            Protocol::Ssh => match ask("Private key path (empty for password): ").ok()? {
                key if !key.is_empty() => AuthInput::Key(PathBuf::from(key)),
                _ => AuthInput::Password(ask("Password: ").ok()?),
            },
            Protocol::Smb => AuthInput::Password(ask("Password: ").ok()?),
        };
        Some(NewLocation {
            protocol,
            role,
            server,
            endpoint,
            remote_path,
            label,
            username,
            auth,
        })
    }
}
