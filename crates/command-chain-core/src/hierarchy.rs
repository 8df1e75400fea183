use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{
    Commit, HierarchyError, LogicalTime, NewUnit, Transactional, Uic, Unit, UnitClosure,
    UnitStore, UnitWriter,
};

/// Outcome of one structural edit.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HierarchyEdit {
    pub logical_time: LogicalTime,
    /// Every unit whose closure was recomputed, ascending.
    pub affected_uics: Vec<Uic>,
}

/// A unit whose cached closure no longer matches the live parent pointers.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StaleUnit {
    pub uic: Uic,
    pub as_of_logical_time: LogicalTime,
    pub cached: UnitClosure,
    pub expected: UnitClosure,
}

/// Derive a unit's closure from live parent pointers and children lists.
///
/// Cached closure fields are never read, so the result is independent of the
/// order in which units touched by an edit are recomputed.
///
/// # Errors
/// Returns [`HierarchyError::UnitNotFound`] when the unit or one of its
/// ancestors is missing, and [`HierarchyError::CycleDetected`] when either walk
/// revisits a unit.
pub fn recompute_closure<S>(store: &S, uic: &Uic) -> Result<UnitClosure, HierarchyError>
where
    S: UnitStore + ?Sized,
{
    let unit = store.require_unit(uic)?;
    let parent_uics = ancestor_chain(store, &unit)?;

    let children = store.children_of(uic)?;
    let mut child_uics: Vec<Uic> = children.iter().map(|child| child.uic.clone()).collect();
    child_uics.sort();
    let subordinate_uics = descendants(store, uic, children)?;

    Ok(UnitClosure { parent_uics, child_uics, subordinate_uics })
}

fn ancestor_chain<S>(store: &S, unit: &Unit) -> Result<Vec<Uic>, HierarchyError>
where
    S: UnitStore + ?Sized,
{
    let mut chain: Vec<Uic> = Vec::new();
    let mut seen = BTreeSet::from([unit.uic.clone()]);
    let mut next = unit.parent_uic.clone();

    while let Some(parent_uic) = next {
        if !seen.insert(parent_uic.clone()) {
            let mut path = Vec::with_capacity(chain.len() + 2);
            path.push(unit.uic.clone());
            path.extend(chain);
            path.push(parent_uic.clone());
            tracing::error!(uic = %parent_uic, ?path, "parent walk revisited a unit");
            return Err(HierarchyError::CycleDetected { uic: parent_uic, path });
        }
        let parent = store.require_unit(&parent_uic)?;
        chain.push(parent_uic);
        next = parent.parent_uic;
    }

    Ok(chain)
}

fn descendants<S>(store: &S, root: &Uic, children: Vec<Unit>) -> Result<Vec<Uic>, HierarchyError>
where
    S: UnitStore + ?Sized,
{
    let mut seen: BTreeSet<Uic> = BTreeSet::new();
    let mut queue: VecDeque<Unit> = children.into();

    while let Some(unit) = queue.pop_front() {
        if unit.uic == *root || seen.contains(&unit.uic) {
            tracing::error!(uic = %unit.uic, root = %root, "child walk revisited a unit");
            return Err(HierarchyError::CycleDetected {
                uic: unit.uic.clone(),
                path: vec![root.clone(), unit.uic],
            });
        }
        queue.extend(store.children_of(&unit.uic)?);
        seen.insert(unit.uic);
    }

    Ok(seen.into_iter().collect())
}

fn recompute_affected<T>(
    tx: &mut T,
    affected: &BTreeSet<Uic>,
    as_of: LogicalTime,
) -> Result<(), HierarchyError>
where
    T: UnitWriter,
{
    for uic in affected {
        let closure = recompute_closure(&*tx, uic)?;
        let mut unit = tx.require_unit(uic)?;
        unit.apply_closure(closure, as_of);
        tx.save_unit(&unit)?;
    }
    tracing::debug!(count = affected.len(), %as_of, "recomputed unit closures");
    Ok(())
}

/// Keeps every unit's cached closure consistent with the parent-pointer tree.
#[derive(Debug, Clone, Default)]
pub struct UnitHierarchyIndex<S> {
    store: S,
}

impl<S> UnitHierarchyIndex<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S: UnitStore> UnitHierarchyIndex<S> {
    /// # Errors
    /// Returns [`HierarchyError::UnitNotFound`] when no unit has this code.
    pub fn unit(&self, uic: &Uic) -> Result<Unit, HierarchyError> {
        self.store.require_unit(uic)
    }

    /// # Errors
    /// See [`recompute_closure`].
    pub fn recompute_closure(&self, uic: &Uic) -> Result<UnitClosure, HierarchyError> {
        recompute_closure(&self.store, uic)
    }

    /// Whether `candidate` is in `unit`'s cached ancestor chain.
    ///
    /// # Errors
    /// Returns [`HierarchyError::UnitNotFound`] when `unit` does not exist.
    pub fn is_ancestor_of(&self, candidate: &Uic, unit: &Uic) -> Result<bool, HierarchyError> {
        Ok(self.store.require_unit(unit)?.parent_uics.contains(candidate))
    }

    /// Whether `candidate` is in `unit`'s cached subordinate set.
    ///
    /// # Errors
    /// Returns [`HierarchyError::UnitNotFound`] when `unit` does not exist.
    pub fn is_descendant_of(&self, candidate: &Uic, unit: &Uic) -> Result<bool, HierarchyError> {
        Ok(self.store.require_unit(unit)?.subordinate_uics.contains(candidate))
    }

    /// # Errors
    /// Returns [`HierarchyError::UnitNotFound`] when `unit` does not exist.
    pub fn subtree(&self, uic: &Uic, include_self: bool) -> Result<BTreeSet<Uic>, HierarchyError> {
        let unit = self.store.require_unit(uic)?;
        let mut members: BTreeSet<Uic> = unit.subordinate_uics.into_iter().collect();
        if include_self {
            members.insert(unit.uic);
        }
        Ok(members)
    }

    /// Compare every cached closure with a fresh recomputation.
    ///
    /// # Errors
    /// Propagates storage failures and cycle detection from [`recompute_closure`].
    pub fn verify(&self) -> Result<Vec<StaleUnit>, HierarchyError> {
        let mut stale = Vec::new();
        for unit in self.store.list_units()? {
            let expected = recompute_closure(&self.store, &unit.uic)?;
            if !same_closure(&unit.closure(), &expected) {
                stale.push(StaleUnit {
                    as_of_logical_time: unit.as_of_logical_time,
                    cached: unit.closure(),
                    uic: unit.uic,
                    expected,
                });
            }
        }
        if !stale.is_empty() {
            tracing::warn!(count = stale.len(), "units with stale closures");
        }
        Ok(stale)
    }
}

fn same_closure(cached: &UnitClosure, expected: &UnitClosure) -> bool {
    fn as_set(values: &[Uic]) -> BTreeSet<&Uic> {
        values.iter().collect()
    }

    cached.parent_uics == expected.parent_uics
        && as_set(&cached.child_uics) == as_set(&expected.child_uics)
        && as_set(&cached.subordinate_uics) == as_set(&expected.subordinate_uics)
}

impl<S: Transactional> UnitHierarchyIndex<S> {
    /// Insert a unit and grow its ancestors' closures in one transaction.
    ///
    /// # Errors
    /// Returns [`HierarchyError::UnitAlreadyExists`] for a used code,
    /// [`HierarchyError::UnitNotFound`] for a missing parent,
    /// [`HierarchyError::Validation`] for invalid attributes, or a storage error.
    pub fn create_unit(&mut self, new_unit: NewUnit) -> Result<HierarchyEdit, HierarchyError> {
        let unit = new_unit.into_unit();
        unit.validate()?;

        let mut tx = self.store.begin()?;
        if tx.load_unit(&unit.uic)?.is_some() {
            return Err(HierarchyError::UnitAlreadyExists(unit.uic));
        }

        let mut affected = BTreeSet::from([unit.uic.clone()]);
        if let Some(parent_uic) = &unit.parent_uic {
            let parent = tx.require_unit(parent_uic)?;
            affected.extend(ancestor_chain(&tx, &parent)?);
            affected.insert(parent.uic);
        }

        tx.insert_unit(&unit)?;
        let as_of = tx.advance_clock()?;
        recompute_affected(&mut tx, &affected, as_of)?;
        tx.commit()?;

        tracing::info!(uic = %unit.uic, parent = ?unit.parent_uic, %as_of, "created unit");
        Ok(HierarchyEdit { logical_time: as_of, affected_uics: affected.into_iter().collect() })
    }

    /// Move `uic` (with its subtree) under `new_parent` in one transaction.
    ///
    /// # Errors
    /// Returns [`HierarchyError::InvalidReparenting`] when `new_parent` is the
    /// unit itself or one of its subordinates; nothing is written in that case.
    /// Returns [`HierarchyError::UnitNotFound`] when either unit is missing.
    pub fn reparent(
        &mut self,
        uic: &Uic,
        new_parent: &Uic,
    ) -> Result<HierarchyEdit, HierarchyError> {
        self.move_unit(uic, Some(new_parent))
    }

    /// Detach `uic` from its parent so it becomes a root.
    ///
    /// # Errors
    /// Returns [`HierarchyError::UnitNotFound`] when the unit is missing.
    pub fn make_root(&mut self, uic: &Uic) -> Result<HierarchyEdit, HierarchyError> {
        self.move_unit(uic, None)
    }

    fn move_unit(
        &mut self,
        uic: &Uic,
        new_parent: Option<&Uic>,
    ) -> Result<HierarchyEdit, HierarchyError> {
        let mut tx = self.store.begin()?;
        let mut unit = tx.require_unit(uic)?;
        let before = recompute_closure(&tx, uic)?;

        let mut affected = BTreeSet::from([uic.clone()]);
        affected.extend(before.subordinate_uics.iter().cloned());
        affected.extend(before.parent_uics.iter().cloned());

        if let Some(new_parent) = new_parent {
            if new_parent == uic {
                return Err(HierarchyError::InvalidReparenting {
                    uic: uic.clone(),
                    new_parent: new_parent.clone(),
                    reason: "a unit cannot be its own parent".to_string(),
                });
            }
            if before.subordinate_uics.contains(new_parent) {
                return Err(HierarchyError::InvalidReparenting {
                    uic: uic.clone(),
                    new_parent: new_parent.clone(),
                    reason: "new parent is a subordinate of the unit".to_string(),
                });
            }
            let parent = tx.require_unit(new_parent)?;
            affected.extend(ancestor_chain(&tx, &parent)?);
            affected.insert(parent.uic);
        }

        let old_parent = unit.parent_uic.take();
        unit.parent_uic = new_parent.cloned();
        tx.save_unit(&unit)?;
        let as_of = tx.advance_clock()?;
        recompute_affected(&mut tx, &affected, as_of)?;
        tx.commit()?;

        tracing::info!(
            uic = %uic,
            from = ?old_parent,
            to = ?new_parent,
            affected = affected.len(),
            %as_of,
            "moved unit"
        );
        Ok(HierarchyEdit { logical_time: as_of, affected_uics: affected.into_iter().collect() })
    }

    /// Recompute and rewrite every unit's closure as one edit.
    ///
    /// # Errors
    /// Propagates storage failures and cycle detection; nothing is written then.
    pub fn rebuild(&mut self) -> Result<HierarchyEdit, HierarchyError> {
        let mut tx = self.store.begin()?;
        let affected: BTreeSet<Uic> = tx.list_units()?.into_iter().map(|unit| unit.uic).collect();
        let as_of = tx.advance_clock()?;
        recompute_affected(&mut tx, &affected, as_of)?;
        tx.commit()?;

        tracing::info!(units = affected.len(), %as_of, "rebuilt unit closures");
        Ok(HierarchyEdit { logical_time: as_of, affected_uics: affected.into_iter().collect() })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::{Echelon, MemoryStore};

    fn uic(value: &str) -> Uic {
        Uic::parse(value).unwrap_or_else(|err| panic!("fixture uic {value} invalid: {err}"))
    }

    fn uics(values: &[&str]) -> Vec<Uic> {
        values.iter().map(|value| uic(value)).collect()
    }

    fn new_unit(code: &str, echelon: Echelon, parent: Option<&str>) -> NewUnit {
        NewUnit {
            uic: uic(code),
            display_name: format!("{code} headquarters"),
            short_name: code.to_string(),
            echelon,
            parent_uic: parent.map(uic),
        }
    }

    /// BDE -> BN1, BN2; BN1 -> CO1.
    fn brigade() -> Result<UnitHierarchyIndex<MemoryStore>, HierarchyError> {
        let mut index = UnitHierarchyIndex::new(MemoryStore::new());
        index.create_unit(new_unit("BDE", Echelon::Brigade, None))?;
        index.create_unit(new_unit("BN1", Echelon::Battalion, Some("BDE")))?;
        index.create_unit(new_unit("BN2", Echelon::Battalion, Some("BDE")))?;
        index.create_unit(new_unit("CO1", Echelon::Company, Some("BN1")))?;
        Ok(index)
    }

    #[test]
    fn brigade_closures_match_tree() -> Result<(), HierarchyError> {
        let index = brigade()?;

        assert_eq!(index.unit(&uic("BDE"))?.subordinate_uics, uics(&["BN1", "BN2", "CO1"]));
        assert_eq!(index.unit(&uic("BDE"))?.child_uics, uics(&["BN1", "BN2"]));
        assert_eq!(index.unit(&uic("BN1"))?.subordinate_uics, uics(&["CO1"]));
        assert_eq!(index.unit(&uic("CO1"))?.parent_uics, uics(&["BN1", "BDE"]));
        assert!(index.unit(&uic("BDE"))?.parent_uics.is_empty());
        assert!(index.unit(&uic("BN2"))?.child_uics.is_empty());
        assert!(index.unit(&uic("BN2"))?.subordinate_uics.is_empty());
        Ok(())
    }

    #[test]
    fn creating_a_unit_stamps_only_its_chain() -> Result<(), HierarchyError> {
        let index = brigade()?;
        let clock = index.store().logical_time();
        assert_eq!(clock, LogicalTime(4));

        assert_eq!(index.unit(&uic("CO1"))?.as_of_logical_time, LogicalTime(4));
        assert_eq!(index.unit(&uic("BN1"))?.as_of_logical_time, LogicalTime(4));
        assert_eq!(index.unit(&uic("BDE"))?.as_of_logical_time, LogicalTime(4));
        assert_eq!(index.unit(&uic("BN2"))?.as_of_logical_time, LogicalTime(3));
        Ok(())
    }

    #[test]
    fn duplicate_and_orphan_creates_are_rejected() -> Result<(), HierarchyError> {
        let mut index = brigade()?;

        let duplicate = index.create_unit(new_unit("BN1", Echelon::Battalion, Some("BDE")));
        assert_eq!(duplicate, Err(HierarchyError::UnitAlreadyExists(uic("BN1"))));

        let orphan = index.create_unit(new_unit("CO9", Echelon::Company, Some("BN9")));
        assert_eq!(orphan, Err(HierarchyError::UnitNotFound(uic("BN9"))));
        assert!(index.store().load_unit(&uic("CO9"))?.is_none());
        assert_eq!(index.store().logical_time(), LogicalTime(4));
        Ok(())
    }

    #[test]
    fn reparent_moves_company_between_battalions() -> Result<(), HierarchyError> {
        let mut index = brigade()?;

        let edit = index.reparent(&uic("CO1"), &uic("BN2"))?;
        assert_eq!(edit.logical_time, LogicalTime(5));
        assert_eq!(edit.affected_uics, uics(&["BDE", "BN1", "BN2", "CO1"]));

        assert!(index.unit(&uic("BN1"))?.subordinate_uics.is_empty());
        assert!(index.unit(&uic("BN1"))?.child_uics.is_empty());
        assert_eq!(index.unit(&uic("BN2"))?.subordinate_uics, uics(&["CO1"]));
        assert_eq!(index.unit(&uic("CO1"))?.parent_uics, uics(&["BN2", "BDE"]));
        assert_eq!(index.unit(&uic("BDE"))?.subordinate_uics, uics(&["BN1", "BN2", "CO1"]));
        for code in ["BDE", "BN1", "BN2", "CO1"] {
            assert_eq!(index.unit(&uic(code))?.as_of_logical_time, LogicalTime(5));
        }
        Ok(())
    }

    #[test]
    fn reparent_under_own_grandchild_is_rejected_without_changes() -> Result<(), HierarchyError> {
        let mut index = brigade()?;
        let before = index.store().list_units()?;

        let result = index.reparent(&uic("BDE"), &uic("CO1"));
        assert!(matches!(result, Err(HierarchyError::InvalidReparenting { .. })));

        let self_parent = index.reparent(&uic("BN1"), &uic("BN1"));
        assert!(matches!(self_parent, Err(HierarchyError::InvalidReparenting { .. })));

        assert_eq!(index.store().list_units()?, before);
        assert_eq!(index.store().logical_time(), LogicalTime(4));
        Ok(())
    }

    #[test]
    fn reparent_to_missing_unit_reports_not_found() -> Result<(), HierarchyError> {
        let mut index = brigade()?;
        let result = index.reparent(&uic("CO1"), &uic("BN7"));
        assert_eq!(result, Err(HierarchyError::UnitNotFound(uic("BN7"))));
        assert_eq!(index.unit(&uic("CO1"))?.parent_uic, Some(uic("BN1")));
        Ok(())
    }

    #[test]
    fn make_root_detaches_subtree() -> Result<(), HierarchyError> {
        let mut index = brigade()?;
        let edit = index.make_root(&uic("BN1"))?;
        assert_eq!(edit.affected_uics, uics(&["BDE", "BN1", "CO1"]));

        assert!(index.unit(&uic("BN1"))?.parent_uics.is_empty());
        assert_eq!(index.unit(&uic("CO1"))?.parent_uics, uics(&["BN1"]));
        assert_eq!(index.unit(&uic("BDE"))?.subordinate_uics, uics(&["BN2"]));
        Ok(())
    }

    #[test]
    fn membership_queries_read_cached_sets() -> Result<(), HierarchyError> {
        let index = brigade()?;

        assert!(index.is_ancestor_of(&uic("BDE"), &uic("CO1"))?);
        assert!(!index.is_ancestor_of(&uic("BN2"), &uic("CO1"))?);
        assert!(index.is_descendant_of(&uic("CO1"), &uic("BDE"))?);
        assert!(!index.is_descendant_of(&uic("BDE"), &uic("CO1"))?);

        let with_self = index.subtree(&uic("BN1"), true)?;
        assert_eq!(with_self, uics(&["BN1", "CO1"]).into_iter().collect());
        let without_self = index.subtree(&uic("BN1"), false)?;
        assert_eq!(without_self, uics(&["CO1"]).into_iter().collect());

        assert_eq!(
            index.is_ancestor_of(&uic("BDE"), &uic("XX1")),
            Err(HierarchyError::UnitNotFound(uic("XX1")))
        );
        Ok(())
    }

    #[test]
    fn recompute_detects_parent_cycle_instead_of_looping() -> Result<(), HierarchyError> {
        let mut index = brigade()?;
        let mut bde = index.unit(&uic("BDE"))?;
        bde.parent_uic = Some(uic("CO1"));
        index.store_mut().replace_unit_unchecked(bde);

        let result = index.recompute_closure(&uic("CO1"));
        assert!(matches!(result, Err(HierarchyError::CycleDetected { .. })));
        assert!(matches!(index.verify(), Err(HierarchyError::CycleDetected { .. })));
        Ok(())
    }

    #[test]
    fn verify_reports_and_rebuild_repairs_stale_closures() -> Result<(), HierarchyError> {
        let mut index = brigade()?;
        let mut bn2 = index.unit(&uic("BN2"))?;
        bn2.subordinate_uics = uics(&["CO1"]);
        index.store_mut().replace_unit_unchecked(bn2);

        let stale = index.verify()?;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].uic, uic("BN2"));
        assert!(stale[0].expected.subordinate_uics.is_empty());

        let edit = index.rebuild()?;
        assert_eq!(edit.affected_uics.len(), 4);
        assert!(index.verify()?.is_empty());
        assert_eq!(index.unit(&uic("BN2"))?.as_of_logical_time, edit.logical_time);
        Ok(())
    }

    fn expected_closures(units: &[Unit]) -> BTreeMap<Uic, UnitClosure> {
        let parents: BTreeMap<Uic, Option<Uic>> =
            units.iter().map(|unit| (unit.uic.clone(), unit.parent_uic.clone())).collect();
        let mut closures: BTreeMap<Uic, UnitClosure> =
            units.iter().map(|unit| (unit.uic.clone(), UnitClosure::default())).collect();

        for unit in units {
            let mut next = unit.parent_uic.clone();
            let mut first = true;
            while let Some(parent) = next {
                if let Some(closure) = closures.get_mut(&unit.uic) {
                    closure.parent_uics.push(parent.clone());
                }
                if let Some(closure) = closures.get_mut(&parent) {
                    if first {
                        closure.child_uics.push(unit.uic.clone());
                    }
                    closure.subordinate_uics.push(unit.uic.clone());
                }
                first = false;
                next = parents.get(&parent).cloned().flatten();
            }
        }
        for closure in closures.values_mut() {
            closure.child_uics.sort();
            closure.subordinate_uics.sort();
        }
        closures
    }

    fn assert_invariants(store: &MemoryStore) -> Result<(), HierarchyError> {
        let units = store.list_units()?;
        let expected = expected_closures(&units);
        for unit in &units {
            assert!(!unit.parent_uics.contains(&unit.uic));
            assert!(!unit.subordinate_uics.contains(&unit.uic));
            for child in &unit.child_uics {
                assert!(unit.subordinate_uics.contains(child));
                assert_eq!(store.require_unit(child)?.parent_uic.as_ref(), Some(&unit.uic));
            }
            let mut from_children: BTreeSet<Uic> = BTreeSet::new();
            for child in &unit.child_uics {
                from_children.insert(child.clone());
                from_children.extend(store.require_unit(child)?.subordinate_uics);
            }
            assert_eq!(from_children, unit.subordinate_uics.iter().cloned().collect());
            assert_eq!(Some(&unit.closure()), expected.get(&unit.uic));
        }
        Ok(())
    }

    fn forest_strategy() -> impl Strategy<Value = Vec<Option<usize>>> {
        (1_usize..24).prop_flat_map(|len| {
            (0..len)
                .map(|position| {
                    if position == 0 {
                        Just(None).boxed()
                    } else {
                        proptest::option::of(0..position).boxed()
                    }
                })
                .collect::<Vec<_>>()
        })
    }

    fn build_forest(
        parents: &[Option<usize>],
    ) -> Result<UnitHierarchyIndex<MemoryStore>, HierarchyError> {
        let mut index = UnitHierarchyIndex::new(MemoryStore::new());
        for (position, parent) in parents.iter().enumerate() {
            let code = format!("U{position:02}");
            let parent_code = parent.map(|parent| format!("U{parent:02}"));
            index.create_unit(new_unit(&code, Echelon::Unknown, parent_code.as_deref()))?;
        }
        Ok(index)
    }

    proptest! {
        #[test]
        fn property_created_forest_satisfies_closure_invariants(parents in forest_strategy()) {
            let index = build_forest(&parents).map_err(|err| TestCaseError::fail(err.to_string()))?;
            assert_invariants(index.store()).map_err(|err| TestCaseError::fail(err.to_string()))?;
        }
    }

    proptest! {
        #[test]
        fn property_reparent_sequences_preserve_invariants(
            parents in forest_strategy(),
            moves in proptest::collection::vec((any::<prop::sample::Index>(), any::<prop::sample::Index>()), 1..12),
        ) {
            let mut index = build_forest(&parents).map_err(|err| TestCaseError::fail(err.to_string()))?;
            let codes: Vec<Uic> = (0..parents.len()).map(|position| uic(&format!("U{position:02}"))).collect();

            for (unit_pick, parent_pick) in moves {
                let moved = unit_pick.get(&codes).clone();
                let target = parent_pick.get(&codes).clone();
                let in_subtree = index
                    .subtree(&moved, true)
                    .map_err(|err| TestCaseError::fail(err.to_string()))?
                    .contains(&target);
                let old_ancestors = index
                    .unit(&moved)
                    .map_err(|err| TestCaseError::fail(err.to_string()))?
                    .parent_uics;
                let before = index.store().clone();

                match index.reparent(&moved, &target) {
                    Ok(_) => {
                        prop_assert!(!in_subtree);
                        let moved_unit = index.unit(&moved).map_err(|err| TestCaseError::fail(err.to_string()))?;
                        prop_assert_eq!(moved_unit.parent_uics.first(), Some(&target));
                        let target_unit = index.unit(&target).map_err(|err| TestCaseError::fail(err.to_string()))?;
                        prop_assert!(target_unit.child_uics.contains(&moved));
                        let mut new_chain = vec![target.clone()];
                        new_chain.extend(target_unit.parent_uics.clone());
                        for ancestor in &new_chain {
                            prop_assert!(index.is_descendant_of(&moved, ancestor).map_err(|err| TestCaseError::fail(err.to_string()))?);
                        }
                        for former in old_ancestors.iter().filter(|former| !new_chain.contains(former)) {
                            prop_assert!(!index.is_descendant_of(&moved, former).map_err(|err| TestCaseError::fail(err.to_string()))?);
                        }
                    }
                    Err(HierarchyError::InvalidReparenting { .. }) => {
                        prop_assert!(in_subtree);
                        prop_assert_eq!(index.store(), &before);
                    }
                    Err(other) => return Err(TestCaseError::fail(other.to_string())),
                }
                assert_invariants(index.store()).map_err(|err| TestCaseError::fail(err.to_string()))?;
            }
        }
    }
}
