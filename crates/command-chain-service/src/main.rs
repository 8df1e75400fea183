use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use command_chain_api::{
    load_policy, AccessibleUnitsRequest, AccessibleUnitsResult, CommandChainApi, GrantRoleRequest,
    MigrateResult, PermissionRequest, ReparentRequest, RevokeRoleRequest, RevokeRoleResult,
    SetAdminRequest, SubtreeResult, VerifyResult, API_CONTRACT_VERSION,
};
use command_chain_core::{
    AccessPolicy, HierarchyEdit, HierarchyError, NewUnit, PermissionDecision, PrincipalId, RoleAssignment, Uic,
    Unit,
};
use command_chain_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: CommandChainApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error_kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct SubtreeQuery {
    #[serde(default)]
    include_self: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "command-chain-service")]
#[command(about = "Local HTTP service for unit hierarchy and permission checks")]
struct Args {
    #[arg(long, default_value = "./command_chain.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Access policy YAML; defaults to READ < WRITE < ADMIN with no open units.
    #[arg(long)]
    policy: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn failure(err: anyhow::Error) -> ServiceError {
        let (status, error_kind) = match err.downcast_ref::<HierarchyError>() {
            Some(HierarchyError::UnitNotFound(_)) => (StatusCode::NOT_FOUND, "unit_not_found"),
            Some(other) => (StatusCode::BAD_REQUEST, other.kind()),
            None => (StatusCode::BAD_REQUEST, "request_failed"),
        };
        let error = format!("{err:#}");
        tracing::warn!(status = status.as_u16(), error_kind, %error, "request failed");
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_kind,
            error,
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

type Reply<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn reply<T: Serialize>(result: Result<T>) -> Reply<T> {
    result.map(|data| Json(envelope(data))).map_err(ServiceState::failure)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/policy", get(policy))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/units", get(units_list).post(units_create))
        .route("/v1/units/:uic", get(units_show))
        .route("/v1/units/:uic/make-root", post(units_make_root))
        .route("/v1/units/:uic/subtree", get(units_subtree))
        .route("/v1/units/:uic/roles", get(units_roles))
        .route("/v1/hierarchy/reparent", post(units_reparent))
        .route("/v1/hierarchy/verify", post(hierarchy_verify))
        .route("/v1/hierarchy/rebuild", post(hierarchy_rebuild))
        .route("/v1/roles/grant", post(roles_grant))
        .route("/v1/roles/revoke", post(roles_revoke))
        .route("/v1/principals/:principal/roles", get(principal_roles))
        .route("/v1/admin/principals", get(principal_list_admins).post(principal_set_admin))
        .route("/v1/permissions/check", post(permissions_check))
        .route("/v1/permissions/accessible-units", post(permissions_accessible_units))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(filter))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut api = CommandChainApi::new(args.db.clone());
    if let Some(policy_path) = &args.policy {
        api = api.with_policy(load_policy(policy_path)?);
    }
    api.migrate(false)
        .with_context(|| format!("failed to migrate database {}", args.db.display()))?;

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "command chain service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn policy(State(state): State<ServiceState>) -> Json<ServiceEnvelope<AccessPolicy>> {
    Json(envelope(state.api.policy().clone()))
}

async fn db_schema_version(State(state): State<ServiceState>) -> Reply<SchemaStatus> {
    reply(state.api.schema_status())
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Reply<MigrateResult> {
    reply(state.api.migrate(request.dry_run))
}

async fn db_integrity_check(State(state): State<ServiceState>) -> Reply<IntegrityReport> {
    reply(state.api.integrity_check())
}

async fn units_list(State(state): State<ServiceState>) -> Reply<Vec<Unit>> {
    reply(state.api.list_units())
}

async fn units_create(
    State(state): State<ServiceState>,
    Json(request): Json<NewUnit>,
) -> Reply<HierarchyEdit> {
    reply(state.api.create_unit(request))
}

async fn units_show(State(state): State<ServiceState>, Path(uic): Path<Uic>) -> Reply<Unit> {
    reply(state.api.show_unit(&uic))
}

async fn units_reparent(
    State(state): State<ServiceState>,
    Json(request): Json<ReparentRequest>,
) -> Reply<HierarchyEdit> {
    reply(state.api.reparent(&request))
}

async fn units_make_root(
    State(state): State<ServiceState>,
    Path(uic): Path<Uic>,
) -> Reply<HierarchyEdit> {
    reply(state.api.make_root(&uic))
}

async fn units_subtree(
    State(state): State<ServiceState>,
    Path(uic): Path<Uic>,
    Query(query): Query<SubtreeQuery>,
) -> Reply<SubtreeResult> {
    reply(state.api.subtree(&uic, query.include_self))
}

async fn units_roles(
    State(state): State<ServiceState>,
    Path(uic): Path<Uic>,
) -> Reply<Vec<RoleAssignment>> {
    reply(state.api.roles_at(&uic))
}

async fn hierarchy_verify(State(state): State<ServiceState>) -> Reply<VerifyResult> {
    reply(state.api.verify())
}

async fn hierarchy_rebuild(State(state): State<ServiceState>) -> Reply<HierarchyEdit> {
    reply(state.api.rebuild())
}

async fn roles_grant(
    State(state): State<ServiceState>,
    Json(request): Json<GrantRoleRequest>,
) -> Reply<RoleAssignment> {
    reply(state.api.grant_role(request))
}

async fn roles_revoke(
    State(state): State<ServiceState>,
    Json(request): Json<RevokeRoleRequest>,
) -> Reply<RevokeRoleResult> {
    reply(state.api.revoke_role(request))
}

async fn principal_roles(
    State(state): State<ServiceState>,
    Path(principal): Path<PrincipalId>,
) -> Reply<Vec<RoleAssignment>> {
    reply(state.api.roles_for(&principal))
}

async fn principal_list_admins(State(state): State<ServiceState>) -> Reply<Vec<PrincipalId>> {
    reply(state.api.admin_principals())
}

async fn principal_set_admin(
    State(state): State<ServiceState>,
    Json(request): Json<SetAdminRequest>,
) -> Reply<SetAdminRequest> {
    reply(state.api.set_principal_admin(&request))
}

async fn permissions_check(
    State(state): State<ServiceState>,
    Json(request): Json<PermissionRequest>,
) -> Reply<PermissionDecision> {
    reply(state.api.check_permission(&request))
}

async fn permissions_accessible_units(
    State(state): State<ServiceState>,
    Json(request): Json<AccessibleUnitsRequest>,
) -> Reply<AccessibleUnitsResult> {
    reply(state.api.accessible_units(&request))
}
