mod access;
mod hierarchy;
mod memory;
mod permission;
mod store;
mod unit;

pub use access::{AccessLevel, AccessPolicy, LevelOrdering, Satisfies};
pub use hierarchy::{recompute_closure, HierarchyEdit, StaleUnit, UnitHierarchyIndex};
pub use memory::{MemoryStore, MemoryTx};
pub use permission::{
    grant_role, revoke_role, DecisionReason, GlobalPrivilege, NoGlobalPrivilege,
    PermissionDecision, PermissionResolver, PrivilegedPrincipals, RoleAssignment,
};
pub use store::{Commit, RoleStore, RoleWriter, Transactional, UnitStore, UnitWriter};
pub use unit::{Echelon, LogicalTime, NewUnit, PrincipalId, Uic, Unit, UnitClosure};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HierarchyError {
    #[error("unit not found: {0}")]
    UnitNotFound(Uic),
    #[error("unit already exists: {0}")]
    UnitAlreadyExists(Uic),
    #[error("cycle detected at unit {uic} while walking {path:?}")]
    CycleDetected { uic: Uic, path: Vec<Uic> },
    #[error("invalid reparenting of {uic} under {new_parent}: {reason}")]
    InvalidReparenting { uic: Uic, new_parent: Uic, reason: String },
    #[error("unknown access level: {0}")]
    UnknownAccessLevel(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl HierarchyError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Stable snake_case name used in machine-readable error output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnitNotFound(_) => "unit_not_found",
            Self::UnitAlreadyExists(_) => "unit_already_exists",
            Self::CycleDetected { .. } => "cycle_detected",
            Self::InvalidReparenting { .. } => "invalid_reparenting",
            Self::UnknownAccessLevel(_) => "unknown_access_level",
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
        }
    }
}
