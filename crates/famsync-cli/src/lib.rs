//! `famsync` command surface for a single device.
//!
//! Every command opens (and migrates) the local `SQLite` store, runs against
//! it and prints pretty JSON on stdout. Logs go to stderr through `tracing`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use famsync_core::{
    ChildId, ChildProfile, DayKey, Family, FamilyId, FamilyInvite, InviteLink, Routine, RoutineId,
    StepId, SystemClock, User, UserId, UserRole,
};
use famsync_store_sqlite::SqliteLocalStore;
use famsync_sync::{CompletionTracker, EntityStore, InviteLifecycle, SyncConfig, Synchronizer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::Duration;

pub mod remote;

pub use remote::HttpRemoteStore;

#[derive(Debug, Parser)]
#[command(name = "famsync")]
#[command(about = "Offline-first family routine tracker")]
pub struct Cli {
    #[arg(long, default_value = "./famsync.sqlite3")]
    db: PathBuf,

    /// JSON file with `sync`, `invite_scheme` and `remote_timeout_ms`.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Family {
        #[command(subcommand)]
        command: FamilyCommand,
    },
    Child {
        #[command(subcommand)]
        command: ChildCommand,
    },
    Routine {
        #[command(subcommand)]
        command: RoutineCommand,
    },
    Step {
        #[command(subcommand)]
        command: StepCommand,
    },
    Status(StatusArgs),
    Invite {
        #[command(subcommand)]
        command: InviteCommand,
    },
    Sync(SyncArgs),
}

#[derive(Debug, Subcommand)]
pub enum FamilyCommand {
    Init(FamilyInitArgs),
}

#[derive(Debug, Args)]
pub struct FamilyInitArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "UTC")]
    time_zone: String,
    /// Display name of the first parent.
    #[arg(long)]
    parent: String,
}

#[derive(Debug, Subcommand)]
pub enum ChildCommand {
    Add(ChildAddArgs),
}

#[derive(Debug, Args)]
pub struct ChildAddArgs {
    #[arg(long)]
    family: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    avatar: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum RoutineCommand {
    Create(RoutineCreateArgs),
    List(RoutineListArgs),
    Assign(RoutineAssignArgs),
    Delete(RoutineDeleteArgs),
}

#[derive(Debug, Args)]
pub struct RoutineCreateArgs {
    #[arg(long)]
    family: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    icon: Option<String>,
    #[arg(long = "step")]
    steps: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RoutineListArgs {
    #[arg(long)]
    family: String,
    #[arg(long)]
    include_deleted: bool,
}

#[derive(Debug, Args)]
pub struct RoutineAssignArgs {
    #[arg(long)]
    routine: String,
    #[arg(long)]
    child: String,
}

#[derive(Debug, Args)]
pub struct RoutineDeleteArgs {
    #[arg(long)]
    routine: String,
}

#[derive(Debug, Subcommand)]
pub enum StepCommand {
    Complete(StepArgs),
    Undo(StepArgs),
}

#[derive(Debug, Args)]
pub struct StepArgs {
    #[arg(long)]
    child: String,
    #[arg(long)]
    routine: String,
    #[arg(long)]
    step: String,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long)]
    child: String,
    #[arg(long)]
    routine: Option<String>,
    /// Requires `--routine`.
    #[arg(long)]
    step: Option<String>,
    /// `YYYY-MM-DD`; defaults to today in the family's time zone.
    #[arg(long)]
    day: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum InviteCommand {
    Create(InviteCreateArgs),
    Redeem(InviteRedeemArgs),
    Deactivate(InviteTokenArgs),
    Prune(InviteFamilyArgs),
    Link(InviteLinkArgs),
    List(InviteFamilyArgs),
}

#[derive(Debug, Args)]
pub struct InviteCreateArgs {
    #[arg(long)]
    family: String,
    #[arg(long)]
    by: String,
    #[arg(long, default_value_t = 24 * 7)]
    ttl_hours: i64,
    #[arg(long)]
    max_uses: Option<u32>,
}

#[derive(Debug, Args)]
pub struct InviteRedeemArgs {
    /// Short code, token or join link.
    invite: String,
    #[arg(long)]
    name: String,
    #[arg(long, value_enum, default_value_t = RoleArg::Caregiver)]
    role: RoleArg,
}

#[derive(Debug, Args)]
pub struct InviteTokenArgs {
    #[arg(long)]
    token: String,
}

#[derive(Debug, Args)]
pub struct InviteFamilyArgs {
    #[arg(long)]
    family: String,
}

#[derive(Debug, Args)]
pub struct InviteLinkArgs {
    /// Short code or token.
    invite: String,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    #[arg(long)]
    remote: String,
    #[arg(long)]
    family: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Parent,
    Caregiver,
}

impl From<RoleArg> for UserRole {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Parent => Self::Parent,
            RoleArg::Caregiver => Self::Caregiver,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CliConfig {
    pub sync: SyncConfig,
    pub invite_scheme: String,
    pub remote_timeout_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            invite_scheme: "famsync".to_string(),
            remote_timeout_ms: 10_000,
        }
    }
}

impl CliConfig {
    /// # Errors
    /// Returns an error for malformed JSON or out-of-range values.
    pub fn from_json(value: &Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|err| anyhow!("invalid config JSON payload: {err}"))?;
        config.sync.validate()?;
        if config.remote_timeout_ms == 0 {
            return Err(anyhow!("remote_timeout_ms MUST be >= 1"));
        }
        if config.invite_scheme.is_empty()
            || !config
                .invite_scheme
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
        {
            return Err(anyhow!(
                "invite_scheme `{}` is not a valid URL scheme",
                config.invite_scheme
            ));
        }
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("config file {} is not JSON", path.display()))?;
        Self::from_json(&value)
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration, store open/migrate or the command
/// itself fails. A sync whose remote is unreachable still succeeds; the
/// failures are in the printed report.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = CliConfig::load(cli.config.as_deref())?;
    let store = SqliteLocalStore::open_migrated(&cli.db)?;
    let value = run_command(cli.command, &store, &config)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Executes one command against an existing store and returns its JSON output.
///
/// # Errors
/// Returns an error when argument parsing or the requested operation fails.
pub fn run_command(
    command: Command,
    store: &SqliteLocalStore,
    config: &CliConfig,
) -> Result<Value> {
    match command {
        Command::Family { command } => run_family(command, store),
        Command::Child { command } => run_child(command, store),
        Command::Routine { command } => run_routine(command, store),
        Command::Step { command } => run_step(command, store),
        Command::Status(args) => run_status(&args, store),
        Command::Invite { command } => run_invite(command, store, config),
        Command::Sync(args) => {
            let family_id = parse_family_id(&args.family)?;
            let remote = HttpRemoteStore::new(&args.remote, config.remote_timeout_ms);
            let report = Synchronizer::new(store, &remote, &SystemClock, config.sync.clone())
                .sync_family(family_id);
            Ok(serde_json::to_value(report)?)
        }
    }
}

fn run_family(command: FamilyCommand, store: &SqliteLocalStore) -> Result<Value> {
    match command {
        FamilyCommand::Init(args) => {
            let entities = EntityStore::new(store, &SystemClock);
            let family = entities.create(&Family::new(&args.name, &args.time_zone, now())?)?;
            let parent = User::new(family.id, &args.parent, UserRole::Parent, now());
            let parent = entities.create(&parent)?;
            Ok(json!({ "family": family, "parent": parent }))
        }
    }
}

fn run_child(command: ChildCommand, store: &SqliteLocalStore) -> Result<Value> {
    match command {
        ChildCommand::Add(args) => {
            let entities = EntityStore::new(store, &SystemClock);
            let family_id = parse_family_id(&args.family)?;
            entities.require::<Family>(&family_id.to_string())?;
            let child = ChildProfile::new(family_id, &args.name, args.avatar, now());
            let child = entities.create(&child)?;
            Ok(serde_json::to_value(child)?)
        }
    }
}

fn run_routine(command: RoutineCommand, store: &SqliteLocalStore) -> Result<Value> {
    let entities = EntityStore::new(store, &SystemClock);
    match command {
        RoutineCommand::Create(args) => {
            let family_id = parse_family_id(&args.family)?;
            let labels: Vec<&str> = args.steps.iter().map(String::as_str).collect();
            let (routine, steps) =
                entities.create_routine(family_id, &args.title, args.icon, &labels)?;
            Ok(json!({ "routine": routine, "steps": steps }))
        }
        RoutineCommand::List(args) => {
            let family_id = parse_family_id(&args.family)?;
            let routines: Vec<Routine> = entities.list_by_family(family_id, args.include_deleted)?;
            let mut listed = Vec::with_capacity(routines.len());
            for routine in routines {
                let steps = entities.live_steps(routine.id)?;
                listed.push(json!({ "routine": routine, "steps": steps }));
            }
            Ok(Value::Array(listed))
        }
        RoutineCommand::Assign(args) => {
            let routine_id = parse_routine_id(&args.routine)?;
            let routine: Routine = entities.require(&routine_id.to_string())?;
            let assignment = entities.assign(&routine, parse_child_id(&args.child)?)?;
            Ok(serde_json::to_value(assignment)?)
        }
        RoutineCommand::Delete(args) => {
            let routine_id = parse_routine_id(&args.routine)?;
            let routine: Routine = entities.soft_delete(&routine_id.to_string())?;
            Ok(serde_json::to_value(routine)?)
        }
    }
}

fn run_step(command: StepCommand, store: &SqliteLocalStore) -> Result<Value> {
    let tracker = CompletionTracker::new(store, &SystemClock)?;
    let event = match command {
        StepCommand::Complete(args) => {
            let (child, routine, step) = parse_step_args(&args)?;
            tracker.complete_step(child, routine, step)?
        }
        StepCommand::Undo(args) => {
            let (child, routine, step) = parse_step_args(&args)?;
            tracker.undo_step(child, routine, step)?
        }
    };
    Ok(serde_json::to_value(event)?)
}

fn run_status(args: &StatusArgs, store: &SqliteLocalStore) -> Result<Value> {
    let entities = EntityStore::new(store, &SystemClock);
    let tracker = CompletionTracker::new(store, &SystemClock)?;
    let child_id = parse_child_id(&args.child)?;
    let day = match &args.day {
        Some(raw) => DayKey::parse(raw)?,
        None => {
            let child: ChildProfile = entities.require(&child_id.to_string())?;
            tracker.today(child.family_id)?
        }
    };

    match (&args.routine, &args.step) {
        (Some(routine), Some(step)) => {
            let routine_id = parse_routine_id(routine)?;
            let step_id = parse_step_id(step)?;
            let complete = tracker.is_step_complete(child_id, routine_id, step_id, &day)?;
            Ok(json!({
                "child_id": child_id,
                "routine_id": routine_id,
                "step_id": step_id,
                "day": day,
                "complete": complete,
            }))
        }
        (Some(routine), None) => {
            let routine_id = parse_routine_id(routine)?;
            let step_ids: Vec<StepId> = entities
                .live_steps(routine_id)?
                .into_iter()
                .map(|step| step.id)
                .collect();
            let complete = tracker.is_routine_complete(routine_id, child_id, &step_ids, &day)?;
            Ok(json!({
                "child_id": child_id,
                "routine_id": routine_id,
                "day": day,
                "steps": step_ids,
                "complete": complete,
            }))
        }
        (None, Some(_)) => Err(anyhow!("--step requires --routine")),
        (None, None) => Ok(serde_json::to_value(tracker.day_progress(child_id, &day)?)?),
    }
}

fn run_invite(
    command: InviteCommand,
    store: &SqliteLocalStore,
    config: &CliConfig,
) -> Result<Value> {
    let invites = InviteLifecycle::new(store, &SystemClock);
    match command {
        InviteCommand::Create(args) => {
            if args.ttl_hours <= 0 {
                return Err(anyhow!("--ttl-hours MUST be >= 1"));
            }
            let invite = invites.create(
                parse_family_id(&args.family)?,
                parse_user_id(&args.by)?,
                Duration::hours(args.ttl_hours),
                args.max_uses,
            )?;
            Ok(invite_json(&invite, &config.invite_scheme))
        }
        InviteCommand::Redeem(args) => {
            let raw = args.invite.trim();
            let key = if raw.contains("://") {
                InviteLink::parse(raw)?.token
            } else {
                raw.to_string()
            };
            let (invite, user) = invites.join(&key, &args.name, args.role.into())?;
            Ok(json!({ "invite": invite, "user": user }))
        }
        InviteCommand::Deactivate(args) => {
            let invite = invites.deactivate(&args.token)?;
            Ok(invite_json(&invite, &config.invite_scheme))
        }
        InviteCommand::Prune(args) => {
            let family_id = parse_family_id(&args.family)?;
            let deleted = invites.delete_expired(family_id)?;
            Ok(json!({ "family_id": family_id, "deleted": deleted }))
        }
        InviteCommand::Link(args) => {
            let invite = invites
                .find(&args.invite)?
                .ok_or_else(|| anyhow!("invite not found: {}", args.invite))?;
            Ok(json!({ "url": InviteLink::for_invite(&config.invite_scheme, &invite).to_url() }))
        }
        InviteCommand::List(args) => {
            let listed = invites
                .list(parse_family_id(&args.family)?)?
                .iter()
                .map(|invite| invite_json(invite, &config.invite_scheme))
                .collect();
            Ok(Value::Array(listed))
        }
    }
}

fn invite_json(invite: &FamilyInvite, scheme: &str) -> Value {
    json!({
        "invite": invite,
        "state": invite.state(now()).as_str(),
        "url": InviteLink::for_invite(scheme, invite).to_url(),
    })
}

fn now() -> time::OffsetDateTime {
    famsync_core::truncate_to_millis(famsync_core::now_utc())
}

fn parse_step_args(args: &StepArgs) -> Result<(ChildId, RoutineId, StepId)> {
    Ok((
        parse_child_id(&args.child)?,
        parse_routine_id(&args.routine)?,
        parse_step_id(&args.step)?,
    ))
}

fn parse_family_id(raw: &str) -> Result<FamilyId> {
    FamilyId::parse(raw).map_err(|err| anyhow!("invalid --family value: {err}"))
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    UserId::parse(raw).map_err(|err| anyhow!("invalid --by value: {err}"))
}

fn parse_child_id(raw: &str) -> Result<ChildId> {
    ChildId::parse(raw).map_err(|err| anyhow!("invalid --child value: {err}"))
}

fn parse_routine_id(raw: &str) -> Result<RoutineId> {
    RoutineId::parse(raw).map_err(|err| anyhow!("invalid --routine value: {err}"))
}

fn parse_step_id(raw: &str) -> Result<StepId> {
    StepId::parse(raw).map_err(|err| anyhow!("invalid --step value: {err}"))
}
