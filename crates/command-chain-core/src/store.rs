use crate::{HierarchyError, LogicalTime, PrincipalId, RoleAssignment, Uic, Unit};

/// Read access to persisted units.
pub trait UnitStore {
    /// Load one unit by code, `None` when absent.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Storage`] when the backing store fails.
    fn load_unit(&self, uic: &Uic) -> Result<Option<Unit>, HierarchyError>;

    /// Units whose live parent pointer is `uic`, in ascending code order.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Storage`] when the backing store fails.
    fn children_of(&self, uic: &Uic) -> Result<Vec<Unit>, HierarchyError>;

    /// Every unit, in ascending code order.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Storage`] when the backing store fails.
    fn list_units(&self) -> Result<Vec<Unit>, HierarchyError>;

    /// Like [`UnitStore::load_unit`] but absence is an error.
    ///
    /// # Errors
    /// Returns [`HierarchyError::UnitNotFound`] when no unit has this code.
    fn require_unit(&self, uic: &Uic) -> Result<Unit, HierarchyError> {
        self.load_unit(uic)?.ok_or_else(|| HierarchyError::UnitNotFound(uic.clone()))
    }
}

impl<T: UnitStore + ?Sized> UnitStore for &T {
    fn load_unit(&self, uic: &Uic) -> Result<Option<Unit>, HierarchyError> {
        (**self).load_unit(uic)
    }

    fn children_of(&self, uic: &Uic) -> Result<Vec<Unit>, HierarchyError> {
        (**self).children_of(uic)
    }

    fn list_units(&self) -> Result<Vec<Unit>, HierarchyError> {
        (**self).list_units()
    }
}

/// Write access used inside one structural edit.
pub trait UnitWriter: UnitStore {
    /// Insert a unit whose code is not yet in use.
    ///
    /// # Errors
    /// Returns [`HierarchyError::UnitAlreadyExists`] on a duplicate code, or a
    /// storage error.
    fn insert_unit(&mut self, unit: &Unit) -> Result<(), HierarchyError>;

    /// Overwrite an existing unit, including its parent pointer and closure.
    ///
    /// # Errors
    /// Returns [`HierarchyError::UnitNotFound`] when the unit does not exist, or a
    /// storage error.
    fn save_unit(&mut self, unit: &Unit) -> Result<(), HierarchyError>;

    /// Advance the logical clock by one and return the new value.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Storage`] when the counter cannot be updated.
    fn advance_clock(&mut self) -> Result<LogicalTime, HierarchyError>;
}

/// Finish a transaction. Dropping it without calling `commit` rolls back.
pub trait Commit {
    /// # Errors
    /// Returns [`HierarchyError::Storage`] when the commit fails; no staged
    /// change is applied in that case.
    fn commit(self) -> Result<(), HierarchyError>;
}

pub trait Transactional {
    type Tx<'a>: UnitWriter + Commit
    where
        Self: 'a;

    /// Begin a transaction covering one structural edit.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Storage`] when the transaction cannot start.
    fn begin(&mut self) -> Result<Self::Tx<'_>, HierarchyError>;
}

pub trait RoleStore {
    /// All assignments held by `principal`, in ascending unit order.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Storage`] when the backing store fails.
    fn role_assignments_for(
        &self,
        principal: &PrincipalId,
    ) -> Result<Vec<RoleAssignment>, HierarchyError>;

    /// All assignments granted at `uic`, in ascending principal order.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Storage`] when the backing store fails.
    fn role_assignments_at(&self, uic: &Uic) -> Result<Vec<RoleAssignment>, HierarchyError>;
}

impl<T: RoleStore + ?Sized> RoleStore for &T {
    fn role_assignments_for(
        &self,
        principal: &PrincipalId,
    ) -> Result<Vec<RoleAssignment>, HierarchyError> {
        (**self).role_assignments_for(principal)
    }

    fn role_assignments_at(&self, uic: &Uic) -> Result<Vec<RoleAssignment>, HierarchyError> {
        (**self).role_assignments_at(uic)
    }
}

pub trait RoleWriter: RoleStore {
    /// Insert the assignment or replace the one for the same principal and unit.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Storage`] when the write fails.
    fn upsert_role(&mut self, assignment: &RoleAssignment) -> Result<(), HierarchyError>;

    /// Remove the assignment for `(principal, uic)`. Returns whether one existed.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Storage`] when the delete fails.
    fn revoke_role(&mut self, principal: &PrincipalId, uic: &Uic)
        -> Result<bool, HierarchyError>;
}
