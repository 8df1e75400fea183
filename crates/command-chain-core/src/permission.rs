use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    AccessLevel, AccessPolicy, HierarchyError, LevelOrdering, PrincipalId, RoleStore, RoleWriter,
    Satisfies, Uic, UnitHierarchyIndex, UnitStore,
};

/// Grants `principal` the `access_level` at `uic` and, implicitly, at every
/// unit below it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RoleAssignment {
    pub principal: PrincipalId,
    pub uic: Uic,
    pub access_level: AccessLevel,
    #[serde(with = "time::serde::rfc3339")]
    pub granted_at: OffsetDateTime,
}

/// Strategy consulted before any role lookup.
pub trait GlobalPrivilege {
    /// # Errors
    /// Returns [`HierarchyError::Storage`] when the flag cannot be read.
    fn is_globally_privileged(&self, principal: &PrincipalId) -> Result<bool, HierarchyError>;
}

impl<T: GlobalPrivilege + ?Sized> GlobalPrivilege for &T {
    fn is_globally_privileged(&self, principal: &PrincipalId) -> Result<bool, HierarchyError> {
        (**self).is_globally_privileged(principal)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoGlobalPrivilege;

impl GlobalPrivilege for NoGlobalPrivilege {
    fn is_globally_privileged(&self, _principal: &PrincipalId) -> Result<bool, HierarchyError> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrivilegedPrincipals(BTreeSet<PrincipalId>);

impl PrivilegedPrincipals {
    #[must_use]
    pub fn new(principals: impl IntoIterator<Item = PrincipalId>) -> Self {
        Self(principals.into_iter().collect())
    }
}

impl GlobalPrivilege for PrivilegedPrincipals {
    fn is_globally_privileged(&self, principal: &PrincipalId) -> Result<bool, HierarchyError> {
        Ok(self.0.contains(principal))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionReason {
    GlobalPrivilege,
    OpenUnit,
    DirectRole { access_level: AccessLevel },
    InheritedRole { granted_at_uic: Uic, access_level: AccessLevel },
    NoMatchingRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PermissionDecision {
    pub principal: PrincipalId,
    pub uic: Uic,
    pub required_level: AccessLevel,
    pub granted: bool,
    pub reason: DecisionReason,
}

/// Decides whether role assignments meet a required level at a unit.
///
/// Roles cascade downward only: an assignment at a unit covers that unit and
/// its subordinates, never its siblings or ancestors.
#[derive(Debug, Clone)]
pub struct PermissionResolver<O = LevelOrdering, P = NoGlobalPrivilege> {
    ordering: O,
    privilege: P,
    open_units: BTreeSet<Uic>,
}

impl PermissionResolver {
    /// # Errors
    /// Returns the ordering validation errors of [`AccessPolicy::ordering`].
    pub fn from_policy(policy: &AccessPolicy) -> Result<Self, HierarchyError> {
        Ok(Self::new(policy.ordering()?, NoGlobalPrivilege)
            .with_open_units(policy.open_units.iter().cloned()))
    }
}

impl<O: Satisfies, P: GlobalPrivilege> PermissionResolver<O, P> {
    pub fn new(ordering: O, privilege: P) -> Self {
        Self { ordering, privilege, open_units: BTreeSet::new() }
    }

    #[must_use]
    pub fn with_open_units(mut self, open_units: impl IntoIterator<Item = Uic>) -> Self {
        self.open_units.extend(open_units);
        self
    }

    pub fn with_privilege<Q: GlobalPrivilege>(self, privilege: Q) -> PermissionResolver<O, Q> {
        PermissionResolver { ordering: self.ordering, privilege, open_units: self.open_units }
    }

    /// # Errors
    /// See [`PermissionResolver::explain_permission`].
    pub fn has_permission<S>(
        &self,
        index: &UnitHierarchyIndex<S>,
        principal: &PrincipalId,
        uic: &Uic,
        required: &AccessLevel,
    ) -> Result<bool, HierarchyError>
    where
        S: UnitStore + RoleStore,
    {
        Ok(self.explain_permission(index, principal, uic, required)?.granted)
    }

    /// Decide and report which rule produced the decision.
    ///
    /// Privileged principals and open units pass before the level or the unit
    /// is looked at.
    ///
    /// # Errors
    /// Returns [`HierarchyError::UnknownAccessLevel`] when `required` is not
    /// configured and [`HierarchyError::UnitNotFound`] when `uic` does not exist.
    pub fn explain_permission<S>(
        &self,
        index: &UnitHierarchyIndex<S>,
        principal: &PrincipalId,
        uic: &Uic,
        required: &AccessLevel,
    ) -> Result<PermissionDecision, HierarchyError>
    where
        S: UnitStore + RoleStore,
    {
        let decision = |granted: bool, reason: DecisionReason| PermissionDecision {
            principal: principal.clone(),
            uic: uic.clone(),
            required_level: required.clone(),
            granted,
            reason,
        };

        if self.privilege.is_globally_privileged(principal)? {
            return Ok(decision(true, DecisionReason::GlobalPrivilege));
        }
        if self.open_units.contains(uic) {
            return Ok(decision(true, DecisionReason::OpenUnit));
        }

        let acceptable = self.ordering.acceptable_levels(required)?;
        let unit = index.unit(uic)?;

        let held: BTreeMap<Uic, AccessLevel> = index
            .store()
            .role_assignments_for(principal)?
            .into_iter()
            .map(|assignment| (assignment.uic, assignment.access_level))
            .collect();

        if let Some(level) = held.get(&unit.uic).filter(|level| acceptable.contains(*level)) {
            return Ok(decision(true, DecisionReason::DirectRole { access_level: level.clone() }));
        }
        for ancestor in &unit.parent_uics {
            if let Some(level) = held.get(ancestor).filter(|level| acceptable.contains(*level)) {
                return Ok(decision(
                    true,
                    DecisionReason::InheritedRole {
                        granted_at_uic: ancestor.clone(),
                        access_level: level.clone(),
                    },
                ));
            }
        }

        tracing::debug!(%principal, %uic, %required, "no role satisfies request");
        Ok(decision(false, DecisionReason::NoMatchingRole))
    }

    /// Units reachable through the principal's satisfying role assignments:
    /// each assigned unit plus its subordinates.
    ///
    /// # Errors
    /// Returns [`HierarchyError::UnknownAccessLevel`] for an unconfigured level,
    /// or storage errors.
    pub fn accessible_units<S>(
        &self,
        index: &UnitHierarchyIndex<S>,
        principal: &PrincipalId,
        required: &AccessLevel,
    ) -> Result<BTreeSet<Uic>, HierarchyError>
    where
        S: UnitStore + RoleStore,
    {
        let acceptable = self.ordering.acceptable_levels(required)?;
        let mut units = BTreeSet::new();
        for assignment in index.store().role_assignments_for(principal)? {
            if acceptable.contains(&assignment.access_level) {
                units.extend(index.subtree(&assignment.uic, true)?);
            }
        }
        Ok(units)
    }
}

/// Create or replace the assignment for `(principal, uic)`.
///
/// # Errors
/// Returns [`HierarchyError::UnknownAccessLevel`] for an unconfigured level,
/// [`HierarchyError::UnitNotFound`] for a missing unit, or storage errors.
pub fn grant_role<S, O>(
    store: &mut S,
    ordering: &O,
    principal: PrincipalId,
    uic: Uic,
    access_level: AccessLevel,
    granted_at: OffsetDateTime,
) -> Result<RoleAssignment, HierarchyError>
where
    S: UnitStore + RoleWriter,
    O: Satisfies + ?Sized,
{
    if !ordering.is_known(&access_level) {
        return Err(HierarchyError::UnknownAccessLevel(access_level.to_string()));
    }
    store.require_unit(&uic)?;

    let assignment = RoleAssignment { principal, uic, access_level, granted_at };
    store.upsert_role(&assignment)?;
    tracing::info!(
        principal = %assignment.principal,
        uic = %assignment.uic,
        level = %assignment.access_level,
        "granted role"
    );
    Ok(assignment)
}

/// # Errors
/// Returns storage errors from the backing store.
pub fn revoke_role<S>(store: &mut S, principal: &PrincipalId, uic: &Uic) -> Result<bool, HierarchyError>
where
    S: RoleWriter + ?Sized,
{
    let removed = store.revoke_role(principal, uic)?;
    tracing::info!(%principal, %uic, removed, "revoked role");
    Ok(removed)
}
