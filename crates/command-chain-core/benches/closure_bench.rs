use command_chain_core::{
    grant_role, AccessLevel, AccessPolicy, Echelon, HierarchyError, MemoryStore, NewUnit,
    PermissionResolver, PrincipalId, Uic, UnitHierarchyIndex,
};
use criterion::{criterion_group, criterion_main, Criterion};
use time::OffsetDateTime;

fn mk_unit(code: &str, echelon: Echelon, parent: Option<&str>) -> Result<NewUnit, HierarchyError> {
    Ok(NewUnit {
        uic: Uic::parse(code)?,
        display_name: format!("{code} headquarters"),
        short_name: code.to_string(),
        echelon,
        parent_uic: parent.map(Uic::parse).transpose()?,
    })
}

/// One division of 4 brigades, 4 battalions each, 5 companies per battalion
/// and 4 platoons per company.
fn mk_division() -> Result<UnitHierarchyIndex<MemoryStore>, HierarchyError> {
    let mut index = UnitHierarchyIndex::new(MemoryStore::new());
    index.create_unit(mk_unit("DIV", Echelon::Division, None)?)?;
    for bde in 0..4 {
        let bde_code = format!("B{bde}");
        index.create_unit(mk_unit(&bde_code, Echelon::Brigade, Some("DIV"))?)?;
        for bn in 0..4 {
            let bn_code = format!("{bde_code}N{bn}");
            index.create_unit(mk_unit(&bn_code, Echelon::Battalion, Some(&bde_code))?)?;
            for co in 0..5 {
                let co_code = format!("{bn_code}C{co}");
                index.create_unit(mk_unit(&co_code, Echelon::Company, Some(&bn_code))?)?;
                for plt in 0..4 {
                    let plt_code = format!("{co_code}P{plt}");
                    index.create_unit(mk_unit(&plt_code, Echelon::Platoon, Some(&co_code))?)?;
                }
            }
        }
    }
    Ok(index)
}

fn bench_reparent(c: &mut Criterion) {
    let mut index = match mk_division() {
        Ok(index) => index,
        Err(err) => panic!("division fixture failed: {err}"),
    };
    let (Ok(battalion), Ok(west), Ok(east)) =
        (Uic::parse("B0N0"), Uic::parse("B1"), Uic::parse("B0"))
    else {
        panic!("fixture codes invalid");
    };

    c.bench_function("reparent_battalion_division_of_400_units", |b| {
        let mut toggle = false;
        b.iter(|| {
            toggle = !toggle;
            let target = if toggle { &west } else { &east };
            if let Err(err) = index.reparent(&battalion, target) {
                panic!("reparent benchmark failed: {err}");
            }
        });
    });
}

fn bench_permission(c: &mut Criterion) {
    let mut index = match mk_division() {
        Ok(index) => index,
        Err(err) => panic!("division fixture failed: {err}"),
    };
    let policy = AccessPolicy::default();
    let (Ok(ordering), Ok(resolver)) = (policy.ordering(), PermissionResolver::from_policy(&policy))
    else {
        panic!("default policy invalid");
    };
    let (Ok(principal), Ok(brigade), Ok(platoon), Ok(write)) = (
        PrincipalId::parse("bench-user"),
        Uic::parse("B3"),
        Uic::parse("B3N3C4P3"),
        AccessLevel::parse("WRITE"),
    ) else {
        panic!("fixture values invalid");
    };
    if let Err(err) = grant_role(
        index.store_mut(),
        &ordering,
        principal.clone(),
        brigade,
        write.clone(),
        OffsetDateTime::UNIX_EPOCH,
    ) {
        panic!("grant failed: {err}");
    }

    c.bench_function("has_permission_inherited_platoon", |b| {
        b.iter(|| match resolver.has_permission(&index, &principal, &platoon, &write) {
            Ok(true) => {}
            Ok(false) => panic!("expected inherited grant"),
            Err(err) => panic!("permission benchmark failed: {err}"),
        });
    });
}

criterion_group!(closure_benches, bench_reparent, bench_permission);
criterion_main!(closure_benches);
