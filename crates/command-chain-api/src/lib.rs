use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use command_chain_core::{
    grant_role, revoke_role, AccessLevel, AccessPolicy, HierarchyEdit, NewUnit,
    PermissionDecision, PermissionResolver, PrincipalId, RoleAssignment, RoleStore, StaleUnit,
    Uic, Unit, UnitHierarchyIndex, UnitStore,
};
use command_chain_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReparentRequest {
    pub uic: Uic,
    pub new_parent: Uic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubtreeResult {
    pub uic: Uic,
    pub include_self: bool,
    pub uics: Vec<Uic>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyResult {
    pub consistent: bool,
    pub stale_units: Vec<StaleUnit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrantRoleRequest {
    pub principal: PrincipalId,
    pub uic: Uic,
    pub access_level: AccessLevel,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub granted_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevokeRoleRequest {
    pub principal: PrincipalId,
    pub uic: Uic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevokeRoleResult {
    pub principal: PrincipalId,
    pub uic: Uic,
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetAdminRequest {
    pub principal: PrincipalId,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionRequest {
    pub principal: PrincipalId,
    pub uic: Uic,
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessibleUnitsRequest {
    pub principal: PrincipalId,
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessibleUnitsResult {
    pub principal: PrincipalId,
    pub access_level: AccessLevel,
    pub uics: Vec<Uic>,
}

/// Load an access policy document (YAML or JSON).
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or describes an
/// invalid level ordering.
pub fn load_policy(path: &Path) -> Result<AccessPolicy> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read access policy {}", path.display()))?;
    let policy: AccessPolicy = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse access policy {}", path.display()))?;
    policy
        .ordering()
        .with_context(|| format!("invalid level ordering in {}", path.display()))?;
    tracing::debug!(path = %path.display(), levels = policy.levels.len(), "loaded access policy");
    Ok(policy)
}

#[derive(Debug, Clone)]
pub struct CommandChainApi {
    db_path: PathBuf,
    policy: AccessPolicy,
}

impl CommandChainApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, policy: AccessPolicy::default() }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or an integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when the code is taken, the parent is missing, or persistence fails.
    pub fn create_unit(&self, input: NewUnit) -> Result<HierarchyEdit> {
        let mut index = UnitHierarchyIndex::new(self.migrated_store()?);
        Ok(index.create_unit(input)?)
    }

    /// # Errors
    /// Returns an error when the unit does not exist.
    pub fn show_unit(&self, uic: &Uic) -> Result<Unit> {
        let store = self.migrated_store()?;
        Ok(store.require_unit(uic)?)
    }

    /// # Errors
    /// Returns an error when units cannot be read.
    pub fn list_units(&self) -> Result<Vec<Unit>> {
        let store = self.migrated_store()?;
        Ok(store.list_units()?)
    }

    /// Move a unit and its subtree under a new parent.
    ///
    /// # Errors
    /// Returns an error when the move would create a cycle, a unit is missing,
    /// or persistence fails.
    pub fn reparent(&self, input: &ReparentRequest) -> Result<HierarchyEdit> {
        let mut index = UnitHierarchyIndex::new(self.migrated_store()?);
        Ok(index.reparent(&input.uic, &input.new_parent)?)
    }

    /// # Errors
    /// Returns an error when the unit is missing or persistence fails.
    pub fn make_root(&self, uic: &Uic) -> Result<HierarchyEdit> {
        let mut index = UnitHierarchyIndex::new(self.migrated_store()?);
        Ok(index.make_root(uic)?)
    }

    /// # Errors
    /// Returns an error when the unit is missing.
    pub fn subtree(&self, uic: &Uic, include_self: bool) -> Result<SubtreeResult> {
        let store = self.migrated_store()?;
        let uics = UnitHierarchyIndex::new(&store).subtree(uic, include_self)?;
        Ok(SubtreeResult { uic: uic.clone(), include_self, uics: uics.into_iter().collect() })
    }

    /// # Errors
    /// Returns an error when closures cannot be recomputed.
    pub fn verify(&self) -> Result<VerifyResult> {
        let store = self.migrated_store()?;
        let stale_units = UnitHierarchyIndex::new(&store).verify()?;
        Ok(VerifyResult { consistent: stale_units.is_empty(), stale_units })
    }

    /// # Errors
    /// Returns an error when closures cannot be recomputed or persisted.
    pub fn rebuild(&self) -> Result<HierarchyEdit> {
        let mut index = UnitHierarchyIndex::new(self.migrated_store()?);
        Ok(index.rebuild()?)
    }

    /// # Errors
    /// Returns an error when the level is not configured, the unit is missing,
    /// or persistence fails.
    pub fn grant_role(&self, input: GrantRoleRequest) -> Result<RoleAssignment> {
        let mut store = self.migrated_store()?;
        let ordering = self.policy.ordering()?;
        Ok(grant_role(
            &mut store,
            &ordering,
            input.principal,
            input.uic,
            input.access_level,
            input.granted_at.unwrap_or_else(OffsetDateTime::now_utc),
        )?)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn revoke_role(&self, input: RevokeRoleRequest) -> Result<RevokeRoleResult> {
        let mut store = self.migrated_store()?;
        let removed = revoke_role(&mut store, &input.principal, &input.uic)?;
        Ok(RevokeRoleResult { principal: input.principal, uic: input.uic, removed })
    }

    /// # Errors
    /// Returns an error when assignments cannot be read.
    pub fn roles_for(&self, principal: &PrincipalId) -> Result<Vec<RoleAssignment>> {
        let store = self.migrated_store()?;
        Ok(store.role_assignments_for(principal)?)
    }

    /// # Errors
    /// Returns an error when the unit is missing or assignments cannot be read.
    pub fn roles_at(&self, uic: &Uic) -> Result<Vec<RoleAssignment>> {
        let store = self.migrated_store()?;
        store.require_unit(uic)?;
        Ok(store.role_assignments_at(uic)?)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn set_principal_admin(&self, input: &SetAdminRequest) -> Result<SetAdminRequest> {
        let mut store = self.migrated_store()?;
        store.set_principal_admin(&input.principal, input.is_admin)?;
        Ok(input.clone())
    }

    /// # Errors
    /// Returns an error when admin flags cannot be read.
    pub fn admin_principals(&self) -> Result<Vec<PrincipalId>> {
        self.migrated_store()?.admin_principals()
    }

    /// Decide whether the principal may act at the unit, with the deciding rule.
    ///
    /// # Errors
    /// Returns an error for unknown units, unconfigured levels, or storage failures.
    pub fn check_permission(&self, input: &PermissionRequest) -> Result<PermissionDecision> {
        let store = self.migrated_store()?;
        let resolver = PermissionResolver::from_policy(&self.policy)?.with_privilege(&store);
        let index = UnitHierarchyIndex::new(&store);
        Ok(resolver.explain_permission(&index, &input.principal, &input.uic, &input.access_level)?)
    }

    /// # Errors
    /// Returns an error for unconfigured levels or storage failures.
    pub fn accessible_units(&self, input: &AccessibleUnitsRequest) -> Result<AccessibleUnitsResult> {
        let store = self.migrated_store()?;
        let resolver = PermissionResolver::from_policy(&self.policy)?;
        let index = UnitHierarchyIndex::new(&store);
        let uics = resolver.accessible_units(&index, &input.principal, &input.access_level)?;
        Ok(AccessibleUnitsResult {
            principal: input.principal.clone(),
            access_level: input.access_level.clone(),
            uics: uics.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use command_chain_core::{DecisionReason, Echelon, HierarchyError, LogicalTime};

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("command-chain-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn uic(value: &str) -> Result<Uic> {
        Ok(Uic::parse(value)?)
    }

    fn unit(code: &str, echelon: Echelon, parent: Option<&str>) -> Result<NewUnit> {
        Ok(NewUnit {
            uic: uic(code)?,
            display_name: format!("{code} headquarters"),
            short_name: code.to_string(),
            echelon,
            parent_uic: parent.map(uic).transpose()?,
        })
    }

    fn seed_brigade(api: &CommandChainApi) -> Result<()> {
        api.create_unit(unit("BDE", Echelon::Brigade, None)?)?;
        api.create_unit(unit("BN1", Echelon::Battalion, Some("BDE"))?)?;
        api.create_unit(unit("BN2", Echelon::Battalion, Some("BDE"))?)?;
        api.create_unit(unit("CO1", Echelon::Company, Some("BN1"))?)?;
        Ok(())
    }

    fn sqlite_file(db_path: &Path, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", db_path.display(), suffix))
    }

    fn remove_db_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = sqlite_file(db_path, suffix);
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    fn check(api: &CommandChainApi, who: &str, at: &str, level: &str) -> Result<bool> {
        Ok(api
            .check_permission(&PermissionRequest {
                principal: PrincipalId::parse(who)?,
                uic: uic(at)?,
                access_level: AccessLevel::parse(level)?,
            })?
            .granted)
    }

    // Test IDs: TAPI-001
    #[test]
    fn api_grant_and_check_follow_the_chain_of_command() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = CommandChainApi::new(db_path.clone());
        seed_brigade(&api)?;

        api.grant_role(GrantRoleRequest {
            principal: PrincipalId::parse("P")?,
            uic: uic("BN1")?,
            access_level: AccessLevel::parse("WRITE")?,
            granted_at: None,
        })?;

        assert!(check(&api, "P", "CO1", "WRITE")?);
        assert!(!check(&api, "P", "BN2", "WRITE")?);
        assert!(!check(&api, "P", "BDE", "WRITE")?);

        let edit = api.reparent(&ReparentRequest { uic: uic("CO1")?, new_parent: uic("BN2")? })?;
        assert_eq!(edit.logical_time, LogicalTime(5));
        assert!(!check(&api, "P", "CO1", "WRITE")?);

        let accessible = api.accessible_units(&AccessibleUnitsRequest {
            principal: PrincipalId::parse("P")?,
            access_level: AccessLevel::parse("READ")?,
        })?;
        assert_eq!(accessible.uics, vec![uic("BN1")?]);

        remove_db_files(&db_path)?;
        for suffix in ["", "-wal", "-shm"] {
            assert!(!sqlite_file(&db_path, suffix).exists());
        }
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn api_errors_keep_their_hierarchy_kind() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = CommandChainApi::new(db_path.clone());
        seed_brigade(&api)?;

        let Err(missing) = api.show_unit(&uic("NOPE")?) else {
            panic!("expected missing unit error");
        };
        assert!(matches!(
            missing.downcast_ref::<HierarchyError>(),
            Some(HierarchyError::UnitNotFound(_))
        ));

        let Err(cycle) = api.reparent(&ReparentRequest { uic: uic("BDE")?, new_parent: uic("CO1")? })
        else {
            panic!("expected invalid reparenting error");
        };
        assert!(matches!(
            cycle.downcast_ref::<HierarchyError>(),
            Some(HierarchyError::InvalidReparenting { .. })
        ));

        let Err(level) = api.check_permission(&PermissionRequest {
            principal: PrincipalId::parse("P")?,
            uic: uic("BN1")?,
            access_level: AccessLevel::parse("OWNER")?,
        }) else {
            panic!("expected unknown level error");
        };
        assert!(matches!(
            level.downcast_ref::<HierarchyError>(),
            Some(HierarchyError::UnknownAccessLevel(_))
        ));

        remove_db_files(&db_path)?;
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn api_admin_flag_and_open_units_grant_access() -> Result<()> {
        let db_path = unique_temp_db_path();
        let policy = AccessPolicy { open_units: vec![uic("BN2")?], ..AccessPolicy::default() };
        let api = CommandChainApi::new(db_path.clone()).with_policy(policy);
        seed_brigade(&api)?;

        assert!(check(&api, "anyone", "BN2", "ADMIN")?);
        assert!(!check(&api, "anyone", "BN1", "READ")?);

        api.set_principal_admin(&SetAdminRequest {
            principal: PrincipalId::parse("root")?,
            is_admin: true,
        })?;
        let decision = api.check_permission(&PermissionRequest {
            principal: PrincipalId::parse("root")?,
            uic: uic("CO1")?,
            access_level: AccessLevel::parse("ADMIN")?,
        })?;
        assert_eq!(decision.reason, DecisionReason::GlobalPrivilege);
        assert_eq!(api.admin_principals()?, vec![PrincipalId::parse("root")?]);

        remove_db_files(&db_path)?;
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn api_migrate_dry_run_reports_plan_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = CommandChainApi::new(db_path.clone());

        let plan = api.migrate(true)?;
        assert_eq!(plan.would_apply_versions, vec![1, 2]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.integrity_check()?.is_healthy());

        remove_db_files(&db_path)?;
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn load_policy_reads_yaml_and_rejects_bad_orderings() -> Result<()> {
        let dir = std::env::temp_dir();
        let good = dir.join(format!("command-chain-policy-{}.yaml", ulid::Ulid::new()));
        std::fs::write(
            &good,
            "levels: [viewer, evaluator, manager, admin]\nalso_satisfies:\n  manager: [evaluator]\nopen_units: [trans01]\n",
        )?;
        let policy = load_policy(&good)?;
        let ordering = policy.ordering()?;
        assert_eq!(ordering.levels().len(), 4);
        assert_eq!(policy.open_units, vec![uic("TRANS01")?]);

        let bad = dir.join(format!("command-chain-policy-{}.yaml", ulid::Ulid::new()));
        std::fs::write(&bad, "levels: [read, read]\n")?;
        assert!(load_policy(&bad).is_err());

        let unknown = dir.join(format!("command-chain-policy-{}.yaml", ulid::Ulid::new()));
        std::fs::write(&unknown, "levels: [read]\nretention_days: 3\n")?;
        assert!(load_policy(&unknown).is_err());

        for path in [good, bad, unknown] {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn permission_decisions_serialize_with_reason_kind() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = CommandChainApi::new(db_path.clone());
        seed_brigade(&api)?;
        api.grant_role(GrantRoleRequest {
            principal: PrincipalId::parse("P")?,
            uic: uic("BDE")?,
            access_level: AccessLevel::parse("READ")?,
            granted_at: None,
        })?;

        let decision = api.check_permission(&PermissionRequest {
            principal: PrincipalId::parse("P")?,
            uic: uic("CO1")?,
            access_level: AccessLevel::parse("READ")?,
        })?;
        let value = serde_json::to_value(&decision)?;
        assert_eq!(value["granted"], serde_json::json!(true));
        assert_eq!(value["reason"]["kind"], serde_json::json!("inherited_role"));
        assert_eq!(value["reason"]["granted_at_uic"], serde_json::json!("BDE"));

        remove_db_files(&db_path)?;
        Ok(())
    }
}
