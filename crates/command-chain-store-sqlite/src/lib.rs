use std::path::Path;

use anyhow::{anyhow, Context, Result};
use command_chain_core::{
    AccessLevel, Commit, Echelon, GlobalPrivilege, HierarchyError, LogicalTime, PrincipalId,
    RoleAssignment, RoleStore, RoleWriter, StaleUnit, Transactional, Uic, Unit,
    UnitHierarchyIndex, UnitStore, UnitWriter,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS units (
  uic TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  short_name TEXT NOT NULL,
  echelon TEXT NOT NULL CHECK (echelon IN (
    'TEAM','SQUAD','PLATOON','COMPANY','BATTALION','BRIGADE','DIVISION',
    'CORPS','ACOM','STATE','TASK_FORCE','UNKNOWN'
  )),
  parent_uic TEXT,
  parent_uics_json TEXT NOT NULL,
  child_uics_json TEXT NOT NULL,
  subordinate_uics_json TEXT NOT NULL,
  as_of_logical_time INTEGER NOT NULL CHECK (as_of_logical_time >= 0),
  CHECK (parent_uic IS NULL OR parent_uic <> uic),
  FOREIGN KEY (parent_uic) REFERENCES units(uic)
);

CREATE TABLE IF NOT EXISTS logical_clock (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  value INTEGER NOT NULL CHECK (value >= 0)
);

INSERT OR IGNORE INTO logical_clock(id, value) VALUES (1, 0);

CREATE INDEX IF NOT EXISTS idx_units_parent_uic ON units(parent_uic);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS role_assignments (
  principal TEXT NOT NULL,
  uic TEXT NOT NULL,
  access_level TEXT NOT NULL,
  granted_at TEXT NOT NULL,
  PRIMARY KEY (principal, uic),
  FOREIGN KEY (uic) REFERENCES units(uic)
);

CREATE TABLE IF NOT EXISTS principals (
  principal TEXT PRIMARY KEY,
  is_admin INTEGER NOT NULL CHECK (is_admin IN (0, 1)),
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_role_assignments_uic ON role_assignments(uic);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

const UNIT_COLUMNS: &str = "uic, display_name, short_name, echelon, parent_uic,
    parent_uics_json, child_uics_json, subordinate_uics_json, as_of_logical_time";

const ROLE_COLUMNS: &str = "principal, uic, access_level, granted_at";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Units whose cached closure disagrees with the parent pointers.
    pub stale_units: Vec<StaleUnit>,
    /// Set when closures could not be recomputed at all, e.g. a parent cycle.
    pub closure_error: Option<String>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.stale_units.is_empty()
            && self.closure_error.is_none()
            && self.schema_status.pending_versions.is_empty()
    }
}

impl SqliteStore {
    /// Open a SQLite-backed unit store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        tracing::debug!(path = %path.display(), "opened sqlite store");
        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = MIGRATIONS
            .iter()
            .map(|(version, _)| *version)
            .filter(|version| *version > current_version)
            .collect();

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or any
    /// migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let current = current_schema_version(&self.conn)?;
        if current > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {current}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{version} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
            record_schema_version(&tx, version)?;
            tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
            tracing::info!(version, "applied schema migration");
        }

        Ok(())
    }

    /// Current value of the logical clock.
    ///
    /// # Errors
    /// Returns an error when the clock row cannot be read.
    pub fn logical_time(&self) -> Result<LogicalTime> {
        read_clock(&self.conn).map_err(anyhow::Error::from)
    }

    /// Set or clear the persisted global admin flag for `principal`.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn set_principal_admin(&mut self, principal: &PrincipalId, is_admin: bool) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO principals(principal, is_admin, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(principal) DO UPDATE SET
                   is_admin = excluded.is_admin,
                   updated_at = excluded.updated_at",
                params![principal.as_str(), is_admin, now_rfc3339()?],
            )
            .with_context(|| format!("failed to update admin flag for {principal}"))?;
        tracing::info!(%principal, is_admin, "updated principal admin flag");
        Ok(())
    }

    /// Principals currently flagged as global admins, ascending.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn admin_principals(&self) -> Result<Vec<PrincipalId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT principal FROM principals WHERE is_admin = 1 ORDER BY principal ASC")
            .context("failed to prepare admin principal query")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut principals = Vec::new();
        for row in rows {
            let raw = row?;
            principals.push(
                PrincipalId::parse(&raw)
                    .with_context(|| format!("invalid principal stored in principals: {raw}"))?,
            );
        }
        Ok(principals)
    }

    /// Run quick-check, foreign-key-check, closure and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let (stale_units, closure_error) = if schema_status.current_version >= 1 {
            match UnitHierarchyIndex::new(self).verify() {
                Ok(stale) => (stale, None),
                Err(HierarchyError::Storage(message)) => {
                    return Err(anyhow!("failed to verify unit closures: {message}"));
                }
                Err(err) => (Vec::new(), Some(err.to_string())),
            }
        } else {
            (Vec::new(), None)
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            stale_units,
            closure_error,
            schema_status,
        })
    }
}

/// One structural edit, opened with `BEGIN IMMEDIATE` so concurrent edits
/// serialize on the database write lock.
#[derive(Debug)]
pub struct SqliteTx<'a> {
    tx: Transaction<'a>,
}

impl Transactional for SqliteStore {
    type Tx<'a> = SqliteTx<'a>;

    fn begin(&mut self) -> Result<Self::Tx<'_>, HierarchyError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(HierarchyError::storage)?;
        Ok(SqliteTx { tx })
    }
}

impl Commit for SqliteTx<'_> {
    fn commit(self) -> Result<(), HierarchyError> {
        self.tx.commit().map_err(HierarchyError::storage)?;
        tracing::debug!("committed structural edit");
        Ok(())
    }
}

impl UnitStore for SqliteStore {
    fn load_unit(&self, uic: &Uic) -> Result<Option<Unit>, HierarchyError> {
        load_unit_in(&self.conn, uic)
    }

    fn children_of(&self, uic: &Uic) -> Result<Vec<Unit>, HierarchyError> {
        children_in(&self.conn, uic)
    }

    fn list_units(&self) -> Result<Vec<Unit>, HierarchyError> {
        list_units_in(&self.conn)
    }
}

impl UnitStore for SqliteTx<'_> {
    fn load_unit(&self, uic: &Uic) -> Result<Option<Unit>, HierarchyError> {
        load_unit_in(&self.tx, uic)
    }

    fn children_of(&self, uic: &Uic) -> Result<Vec<Unit>, HierarchyError> {
        children_in(&self.tx, uic)
    }

    fn list_units(&self) -> Result<Vec<Unit>, HierarchyError> {
        list_units_in(&self.tx)
    }
}

impl UnitWriter for SqliteTx<'_> {
    fn insert_unit(&mut self, unit: &Unit) -> Result<(), HierarchyError> {
        if load_unit_in(&self.tx, &unit.uic)?.is_some() {
            return Err(HierarchyError::UnitAlreadyExists(unit.uic.clone()));
        }
        let row = UnitRow::from_unit(unit)?;
        self.tx
            .execute(
                "INSERT INTO units(
                    uic, display_name, short_name, echelon, parent_uic,
                    parent_uics_json, child_uics_json, subordinate_uics_json, as_of_logical_time
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row.uic,
                    row.display_name,
                    row.short_name,
                    row.echelon,
                    row.parent_uic,
                    row.parent_uics_json,
                    row.child_uics_json,
                    row.subordinate_uics_json,
                    row.as_of_logical_time,
                ],
            )
            .map_err(HierarchyError::storage)?;
        Ok(())
    }

    fn save_unit(&mut self, unit: &Unit) -> Result<(), HierarchyError> {
        let row = UnitRow::from_unit(unit)?;
        let updated = self
            .tx
            .execute(
                "UPDATE units SET
                    display_name = ?2,
                    short_name = ?3,
                    echelon = ?4,
                    parent_uic = ?5,
                    parent_uics_json = ?6,
                    child_uics_json = ?7,
                    subordinate_uics_json = ?8,
                    as_of_logical_time = ?9
                 WHERE uic = ?1",
                params![
                    row.uic,
                    row.display_name,
                    row.short_name,
                    row.echelon,
                    row.parent_uic,
                    row.parent_uics_json,
                    row.child_uics_json,
                    row.subordinate_uics_json,
                    row.as_of_logical_time,
                ],
            )
            .map_err(HierarchyError::storage)?;
        if updated == 0 {
            return Err(HierarchyError::UnitNotFound(unit.uic.clone()));
        }
        Ok(())
    }

    fn advance_clock(&mut self) -> Result<LogicalTime, HierarchyError> {
        self.tx
            .execute("UPDATE logical_clock SET value = value + 1 WHERE id = 1", [])
            .map_err(HierarchyError::storage)?;
        read_clock(&self.tx)
    }
}

impl RoleStore for SqliteStore {
    fn role_assignments_for(
        &self,
        principal: &PrincipalId,
    ) -> Result<Vec<RoleAssignment>, HierarchyError> {
        query_roles(
            &self.conn,
            &format!(
                "SELECT {ROLE_COLUMNS} FROM role_assignments WHERE principal = ?1 ORDER BY uic ASC"
            ),
            principal.as_str(),
        )
    }

    fn role_assignments_at(&self, uic: &Uic) -> Result<Vec<RoleAssignment>, HierarchyError> {
        query_roles(
            &self.conn,
            &format!(
                "SELECT {ROLE_COLUMNS} FROM role_assignments WHERE uic = ?1 ORDER BY principal ASC"
            ),
            uic.as_str(),
        )
    }
}

impl RoleWriter for SqliteStore {
    fn upsert_role(&mut self, assignment: &RoleAssignment) -> Result<(), HierarchyError> {
        if load_unit_in(&self.conn, &assignment.uic)?.is_none() {
            return Err(HierarchyError::UnitNotFound(assignment.uic.clone()));
        }
        self.conn
            .execute(
                "INSERT INTO role_assignments(principal, uic, access_level, granted_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(principal, uic) DO UPDATE SET
                   access_level = excluded.access_level,
                   granted_at = excluded.granted_at",
                params![
                    assignment.principal.as_str(),
                    assignment.uic.as_str(),
                    assignment.access_level.as_str(),
                    rfc3339(assignment.granted_at).map_err(HierarchyError::storage)?,
                ],
            )
            .map_err(HierarchyError::storage)?;
        Ok(())
    }

    fn revoke_role(
        &mut self,
        principal: &PrincipalId,
        uic: &Uic,
    ) -> Result<bool, HierarchyError> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM role_assignments WHERE principal = ?1 AND uic = ?2",
                params![principal.as_str(), uic.as_str()],
            )
            .map_err(HierarchyError::storage)?;
        Ok(removed > 0)
    }
}

/// The persisted `is_admin` flag acts as the global privilege.
impl GlobalPrivilege for SqliteStore {
    fn is_globally_privileged(&self, principal: &PrincipalId) -> Result<bool, HierarchyError> {
        let flag = self
            .conn
            .query_row(
                "SELECT is_admin FROM principals WHERE principal = ?1",
                params![principal.as_str()],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .map_err(HierarchyError::storage)?;
        Ok(flag.unwrap_or(false))
    }
}

struct UnitRow {
    uic: String,
    display_name: String,
    short_name: String,
    echelon: String,
    parent_uic: Option<String>,
    parent_uics_json: String,
    child_uics_json: String,
    subordinate_uics_json: String,
    as_of_logical_time: i64,
}

impl UnitRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uic: row.get(0)?,
            display_name: row.get(1)?,
            short_name: row.get(2)?,
            echelon: row.get(3)?,
            parent_uic: row.get(4)?,
            parent_uics_json: row.get(5)?,
            child_uics_json: row.get(6)?,
            subordinate_uics_json: row.get(7)?,
            as_of_logical_time: row.get(8)?,
        })
    }

    fn from_unit(unit: &Unit) -> Result<Self, HierarchyError> {
        Ok(Self {
            uic: unit.uic.to_string(),
            display_name: unit.display_name.clone(),
            short_name: unit.short_name.clone(),
            echelon: unit.echelon.as_str().to_string(),
            parent_uic: unit.parent_uic.as_ref().map(ToString::to_string),
            parent_uics_json: serde_json::to_string(&unit.parent_uics)
                .map_err(HierarchyError::storage)?,
            child_uics_json: serde_json::to_string(&unit.child_uics)
                .map_err(HierarchyError::storage)?,
            subordinate_uics_json: serde_json::to_string(&unit.subordinate_uics)
                .map_err(HierarchyError::storage)?,
            as_of_logical_time: i64::try_from(unit.as_of_logical_time.0)
                .map_err(HierarchyError::storage)?,
        })
    }

    fn into_unit(self) -> Result<Unit, HierarchyError> {
        let echelon = Echelon::parse(&self.echelon).ok_or_else(|| {
            HierarchyError::Storage(format!("unknown echelon stored for {}: {}", self.uic, self.echelon))
        })?;
        Ok(Unit {
            uic: stored_uic(&self.uic)?,
            display_name: self.display_name,
            short_name: self.short_name,
            echelon,
            parent_uic: self.parent_uic.as_deref().map(stored_uic).transpose()?,
            parent_uics: decode_uics(&self.parent_uics_json)?,
            child_uics: decode_uics(&self.child_uics_json)?,
            subordinate_uics: decode_uics(&self.subordinate_uics_json)?,
            as_of_logical_time: LogicalTime(
                u64::try_from(self.as_of_logical_time).map_err(HierarchyError::storage)?,
            ),
        })
    }
}

fn stored_uic(raw: &str) -> Result<Uic, HierarchyError> {
    Uic::parse(raw).map_err(|err| HierarchyError::Storage(format!("invalid stored uic {raw}: {err}")))
}

fn decode_uics(raw: &str) -> Result<Vec<Uic>, HierarchyError> {
    serde_json::from_str(raw).map_err(HierarchyError::storage)
}

fn load_unit_in(conn: &Connection, uic: &Uic) -> Result<Option<Unit>, HierarchyError> {
    conn.query_row(
        &format!("SELECT {UNIT_COLUMNS} FROM units WHERE uic = ?1"),
        params![uic.as_str()],
        UnitRow::read,
    )
    .optional()
    .map_err(HierarchyError::storage)?
    .map(UnitRow::into_unit)
    .transpose()
}

fn children_in(conn: &Connection, uic: &Uic) -> Result<Vec<Unit>, HierarchyError> {
    query_units(
        conn,
        &format!("SELECT {UNIT_COLUMNS} FROM units WHERE parent_uic = ?1 ORDER BY uic ASC"),
        Some(uic.as_str()),
    )
}

fn list_units_in(conn: &Connection) -> Result<Vec<Unit>, HierarchyError> {
    query_units(conn, &format!("SELECT {UNIT_COLUMNS} FROM units ORDER BY uic ASC"), None)
}

fn query_units(
    conn: &Connection,
    sql: &str,
    param: Option<&str>,
) -> Result<Vec<Unit>, HierarchyError> {
    let mut stmt = conn.prepare(sql).map_err(HierarchyError::storage)?;
    let rows = match param {
        Some(value) => stmt.query_map(params![value], UnitRow::read),
        None => stmt.query_map([], UnitRow::read),
    }
    .map_err(HierarchyError::storage)?;

    let mut units = Vec::new();
    for row in rows {
        units.push(row.map_err(HierarchyError::storage)?.into_unit()?);
    }
    Ok(units)
}

fn query_roles(
    conn: &Connection,
    sql: &str,
    param: &str,
) -> Result<Vec<RoleAssignment>, HierarchyError> {
    let mut stmt = conn.prepare(sql).map_err(HierarchyError::storage)?;
    let rows = stmt
        .query_map(params![param], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(HierarchyError::storage)?;

    let mut assignments = Vec::new();
    for row in rows {
        let (principal, uic, access_level, granted_at) = row.map_err(HierarchyError::storage)?;
        assignments.push(RoleAssignment {
            principal: PrincipalId::parse(&principal).map_err(HierarchyError::storage)?,
            uic: stored_uic(&uic)?,
            access_level: AccessLevel::parse(&access_level).map_err(HierarchyError::storage)?,
            granted_at: parse_rfc3339(&granted_at).map_err(HierarchyError::storage)?,
        });
    }
    Ok(assignments)
}

fn read_clock(conn: &Connection) -> Result<LogicalTime, HierarchyError> {
    let value = conn
        .query_row("SELECT value FROM logical_clock WHERE id = 1", [], |row| row.get::<_, i64>(0))
        .map_err(HierarchyError::storage)?;
    Ok(LogicalTime(u64::try_from(value).map_err(HierarchyError::storage)?))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
