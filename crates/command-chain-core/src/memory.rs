use std::collections::{BTreeMap, BTreeSet};

use crate::{
    Commit, HierarchyError, LogicalTime, PrincipalId, RoleAssignment, RoleStore, RoleWriter,
    Transactional, Uic, Unit, UnitStore, UnitWriter,
};

type ChildIndex = BTreeMap<Uic, BTreeSet<Uic>>;

/// Arena-style store keyed by unit code. Used by tests, benchmarks and
/// embedders that keep the hierarchy in process.
///
/// Children are indexed by parent code so a downward walk touches only the
/// subtree it visits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStore {
    units: BTreeMap<Uic, Unit>,
    children: ChildIndex,
    roles: BTreeMap<(PrincipalId, Uic), RoleAssignment>,
    clock: LogicalTime,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn logical_time(&self) -> LogicalTime {
        self.clock
    }

    #[cfg(test)]
    pub(crate) fn replace_unit_unchecked(&mut self, unit: Unit) {
        let previous = self.units.get(&unit.uic).and_then(|old| old.parent_uic.clone());
        if let Some(parent) = previous {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(&unit.uic);
            }
        }
        if let Some(parent) = &unit.parent_uic {
            self.children.entry(parent.clone()).or_default().insert(unit.uic.clone());
        }
        self.units.insert(unit.uic.clone(), unit);
    }
}

impl UnitStore for MemoryStore {
    fn load_unit(&self, uic: &Uic) -> Result<Option<Unit>, HierarchyError> {
        Ok(self.units.get(uic).cloned())
    }

    fn children_of(&self, uic: &Uic) -> Result<Vec<Unit>, HierarchyError> {
        let Some(codes) = self.children.get(uic) else {
            return Ok(Vec::new());
        };
        Ok(codes.iter().filter_map(|code| self.units.get(code)).cloned().collect())
    }

    fn list_units(&self) -> Result<Vec<Unit>, HierarchyError> {
        Ok(self.units.values().cloned().collect())
    }
}

impl RoleStore for MemoryStore {
    fn role_assignments_for(
        &self,
        principal: &PrincipalId,
    ) -> Result<Vec<RoleAssignment>, HierarchyError> {
        Ok(self
            .roles
            .iter()
            .filter(|((holder, _), _)| holder == principal)
            .map(|(_, assignment)| assignment.clone())
            .collect())
    }

    fn role_assignments_at(&self, uic: &Uic) -> Result<Vec<RoleAssignment>, HierarchyError> {
        Ok(self
            .roles
            .iter()
            .filter(|((_, at), _)| at == uic)
            .map(|(_, assignment)| assignment.clone())
            .collect())
    }
}

impl RoleWriter for MemoryStore {
    fn upsert_role(&mut self, assignment: &RoleAssignment) -> Result<(), HierarchyError> {
        if !self.units.contains_key(&assignment.uic) {
            return Err(HierarchyError::UnitNotFound(assignment.uic.clone()));
        }
        self.roles.insert(
            (assignment.principal.clone(), assignment.uic.clone()),
            assignment.clone(),
        );
        Ok(())
    }

    fn revoke_role(
        &mut self,
        principal: &PrincipalId,
        uic: &Uic,
    ) -> Result<bool, HierarchyError> {
        Ok(self.roles.remove(&(principal.clone(), uic.clone())).is_some())
    }
}

/// Writes staged over the store; reads fall through to it. Applied on commit.
///
/// Only touched units and touched children sets are copied, so an edit costs
/// what it writes rather than the size of the arena.
#[derive(Debug)]
pub struct MemoryTx<'a> {
    target: &'a mut MemoryStore,
    units: BTreeMap<Uic, Unit>,
    children: ChildIndex,
    clock: LogicalTime,
}

impl Transactional for MemoryStore {
    type Tx<'a> = MemoryTx<'a>;

    fn begin(&mut self) -> Result<Self::Tx<'_>, HierarchyError> {
        Ok(MemoryTx {
            units: BTreeMap::new(),
            children: ChildIndex::new(),
            clock: self.clock,
            target: self,
        })
    }
}

impl MemoryTx<'_> {
    fn staged(&self, uic: &Uic) -> Option<&Unit> {
        self.units.get(uic).or_else(|| self.target.units.get(uic))
    }

    fn children_mut(&mut self, parent: &Uic) -> &mut BTreeSet<Uic> {
        let committed = &self.target.children;
        self.children
            .entry(parent.clone())
            .or_insert_with(|| committed.get(parent).cloned().unwrap_or_default())
    }
}

impl UnitStore for MemoryTx<'_> {
    fn load_unit(&self, uic: &Uic) -> Result<Option<Unit>, HierarchyError> {
        Ok(self.staged(uic).cloned())
    }

    fn children_of(&self, uic: &Uic) -> Result<Vec<Unit>, HierarchyError> {
        let Some(codes) = self.children.get(uic).or_else(|| self.target.children.get(uic)) else {
            return Ok(Vec::new());
        };
        Ok(codes.iter().filter_map(|code| self.staged(code)).cloned().collect())
    }

    fn list_units(&self) -> Result<Vec<Unit>, HierarchyError> {
        let mut merged: BTreeMap<&Uic, &Unit> = self.target.units.iter().collect();
        merged.extend(self.units.iter());
        Ok(merged.into_values().cloned().collect())
    }
}

impl UnitWriter for MemoryTx<'_> {
    fn insert_unit(&mut self, unit: &Unit) -> Result<(), HierarchyError> {
        if self.staged(&unit.uic).is_some() {
            return Err(HierarchyError::UnitAlreadyExists(unit.uic.clone()));
        }
        if let Some(parent) = &unit.parent_uic {
            self.children_mut(parent).insert(unit.uic.clone());
        }
        self.units.insert(unit.uic.clone(), unit.clone());
        Ok(())
    }

    fn save_unit(&mut self, unit: &Unit) -> Result<(), HierarchyError> {
        let Some(previous) = self.staged(&unit.uic) else {
            return Err(HierarchyError::UnitNotFound(unit.uic.clone()));
        };
        let old_parent = previous.parent_uic.clone();
        if old_parent != unit.parent_uic {
            if let Some(parent) = &old_parent {
                self.children_mut(parent).remove(&unit.uic);
            }
            if let Some(parent) = &unit.parent_uic {
                self.children_mut(parent).insert(unit.uic.clone());
            }
        }
        self.units.insert(unit.uic.clone(), unit.clone());
        Ok(())
    }

    fn advance_clock(&mut self) -> Result<LogicalTime, HierarchyError> {
        self.clock = self.clock.next();
        Ok(self.clock)
    }
}

impl Commit for MemoryTx<'_> {
    fn commit(self) -> Result<(), HierarchyError> {
        self.target.units.extend(self.units);
        for (parent, codes) in self.children {
            if codes.is_empty() {
                self.target.children.remove(&parent);
            } else {
                self.target.children.insert(parent, codes);
            }
        }
        self.target.clock = self.clock;
        Ok(())
    }
}
