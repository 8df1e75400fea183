use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use command_chain_api::{
    load_policy, AccessibleUnitsRequest, CommandChainApi, GrantRoleRequest, PermissionRequest,
    ReparentRequest, RevokeRoleRequest, SetAdminRequest, API_CONTRACT_VERSION,
};
use command_chain_core::{AccessLevel, Echelon, NewUnit, PrincipalId, Uic};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::{fmt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "chain")]
#[command(about = "Command chain hierarchy and permission CLI")]
struct Cli {
    #[arg(long, default_value = "./command_chain.sqlite3")]
    db: PathBuf,

    /// YAML access policy; the built-in READ < WRITE < ADMIN ordering applies when omitted.
    #[arg(long)]
    policy: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Unit {
        #[command(subcommand)]
        command: Box<UnitCommand>,
    },
    Role {
        #[command(subcommand)]
        command: Box<RoleCommand>,
    },
    Principal {
        #[command(subcommand)]
        command: Box<PrincipalCommand>,
    },
    Check {
        #[command(subcommand)]
        command: Box<CheckCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum UnitCommand {
    Create(UnitCreateArgs),
    Show(UicArgs),
    List,
    Reparent(UnitReparentArgs),
    MakeRoot(UicArgs),
    Subtree(UnitSubtreeArgs),
    Verify,
    Rebuild,
}

#[derive(Debug, Args)]
struct UnitCreateArgs {
    #[arg(long)]
    uic: String,
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    short_name: Option<String>,
    #[arg(long, default_value = "UNKNOWN")]
    echelon: String,
    #[arg(long)]
    parent: Option<String>,
}

#[derive(Debug, Args)]
struct UicArgs {
    #[arg(long)]
    uic: String,
}

#[derive(Debug, Args)]
struct UnitReparentArgs {
    #[arg(long)]
    uic: String,
    #[arg(long)]
    new_parent: String,
}

#[derive(Debug, Args)]
struct UnitSubtreeArgs {
    #[arg(long)]
    uic: String,
    #[arg(long, default_value_t = false)]
    include_self: bool,
}

#[derive(Debug, Subcommand)]
enum RoleCommand {
    Grant(RoleGrantArgs),
    Revoke(RoleRevokeArgs),
    List(RoleListArgs),
}

#[derive(Debug, Args)]
struct RoleGrantArgs {
    #[arg(long)]
    principal: String,
    #[arg(long)]
    uic: String,
    #[arg(long)]
    level: String,
    /// RFC3339 timestamp; defaults to now.
    #[arg(long)]
    granted_at: Option<String>,
}

#[derive(Debug, Args)]
struct RoleRevokeArgs {
    #[arg(long)]
    principal: String,
    #[arg(long)]
    uic: String,
}

#[derive(Debug, Args)]
struct RoleListArgs {
    #[arg(long, conflicts_with = "uic", required_unless_present = "uic")]
    principal: Option<String>,
    #[arg(long)]
    uic: Option<String>,
}

#[derive(Debug, Subcommand)]
enum PrincipalCommand {
    SetAdmin(PrincipalSetAdminArgs),
    ListAdmins,
}

#[derive(Debug, Args)]
struct PrincipalSetAdminArgs {
    #[arg(long)]
    principal: String,
    /// `true` grants the global admin flag, `false` clears it.
    #[arg(long, action = ArgAction::Set)]
    is_admin: bool,
}

#[derive(Debug, Subcommand)]
enum CheckCommand {
    Permission(CheckPermissionArgs),
    AccessibleUnits(CheckAccessibleArgs),
}

#[derive(Debug, Args)]
struct CheckPermissionArgs {
    #[arg(long)]
    principal: String,
    #[arg(long)]
    uic: String,
    #[arg(long)]
    level: String,
}

#[derive(Debug, Args)]
struct CheckAccessibleArgs {
    #[arg(long)]
    principal: String,
    #[arg(long)]
    level: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

// stdout carries the JSON contract, so logs go to stderr.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut api = CommandChainApi::new(cli.db.clone());
    if let Some(path) = &cli.policy {
        api = api.with_policy(load_policy(path)?);
    }
    tracing::debug!(db = %cli.db.display(), "running command");

    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Unit { command } => run_unit(*command, &api),
        Command::Role { command } => run_role(*command, &api),
        Command::Principal { command } => run_principal(*command, &api),
        Command::Check { command } => run_check(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &CommandChainApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let healthy = report.is_healthy();
            let mut value =
                serde_json::to_value(&report).context("failed to serialize integrity report")?;
            if let Value::Object(object) = &mut value {
                object.insert("healthy".to_string(), Value::Bool(healthy));
            }
            emit_json(value)
        }
    }
}

fn run_unit(command: UnitCommand, api: &CommandChainApi) -> Result<()> {
    match command {
        UnitCommand::Create(args) => {
            let echelon = Echelon::parse(&args.echelon)
                .ok_or_else(|| anyhow!("unknown echelon `{}`", args.echelon))?;
            let uic = Uic::parse(&args.uic)?;
            let input = NewUnit {
                short_name: args.short_name.unwrap_or_else(|| uic.as_str().to_string()),
                uic,
                display_name: args.display_name,
                echelon,
                parent_uic: args.parent.as_deref().map(Uic::parse).transpose()?,
            };
            emit(&api.create_unit(input)?)
        }
        UnitCommand::Show(args) => emit(&api.show_unit(&Uic::parse(&args.uic)?)?),
        UnitCommand::List => {
            let units = api.list_units()?;
            emit_json(serde_json::json!({ "count": units.len(), "units": units }))
        }
        UnitCommand::Reparent(args) => emit(&api.reparent(&ReparentRequest {
            uic: Uic::parse(&args.uic)?,
            new_parent: Uic::parse(&args.new_parent)?,
        })?),
        UnitCommand::MakeRoot(args) => emit(&api.make_root(&Uic::parse(&args.uic)?)?),
        UnitCommand::Subtree(args) => {
            emit(&api.subtree(&Uic::parse(&args.uic)?, args.include_self)?)
        }
        UnitCommand::Verify => emit(&api.verify()?),
        UnitCommand::Rebuild => emit(&api.rebuild()?),
    }
}

fn parse_granted_at(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(|value| {
        OffsetDateTime::parse(value, &Rfc3339)
            .with_context(|| format!("--granted-at must be RFC3339, got `{value}`"))
    })
    .transpose()
}

fn run_role(command: RoleCommand, api: &CommandChainApi) -> Result<()> {
    match command {
        RoleCommand::Grant(args) => emit(&api.grant_role(GrantRoleRequest {
            principal: PrincipalId::parse(&args.principal)?,
            uic: Uic::parse(&args.uic)?,
            access_level: AccessLevel::parse(&args.level)?,
            granted_at: parse_granted_at(args.granted_at.as_deref())?,
        })?),
        RoleCommand::Revoke(args) => emit(&api.revoke_role(RevokeRoleRequest {
            principal: PrincipalId::parse(&args.principal)?,
            uic: Uic::parse(&args.uic)?,
        })?),
        RoleCommand::List(args) => {
            let assignments = match (args.principal, args.uic) {
                (Some(principal), _) => api.roles_for(&PrincipalId::parse(&principal)?)?,
                (None, Some(uic)) => api.roles_at(&Uic::parse(&uic)?)?,
                (None, None) => return Err(anyhow!("pass --principal or --uic")),
            };
            emit_json(serde_json::json!({
                "count": assignments.len(),
                "assignments": assignments
            }))
        }
    }
}

fn run_principal(command: PrincipalCommand, api: &CommandChainApi) -> Result<()> {
    match command {
        PrincipalCommand::SetAdmin(args) => emit(&api.set_principal_admin(&SetAdminRequest {
            principal: PrincipalId::parse(&args.principal)?,
            is_admin: args.is_admin,
        })?),
        PrincipalCommand::ListAdmins => {
            let principals = api.admin_principals()?;
            emit_json(serde_json::json!({ "principals": principals }))
        }
    }
}

fn run_check(command: CheckCommand, api: &CommandChainApi) -> Result<()> {
    match command {
        CheckCommand::Permission(args) => emit(&api.check_permission(&PermissionRequest {
            principal: PrincipalId::parse(&args.principal)?,
            uic: Uic::parse(&args.uic)?,
            access_level: AccessLevel::parse(&args.level)?,
        })?),
        CheckCommand::AccessibleUnits(args) => {
            emit(&api.accessible_units(&AccessibleUnitsRequest {
                principal: PrincipalId::parse(&args.principal)?,
                access_level: AccessLevel::parse(&args.level)?,
            })?)
        }
    }
}
