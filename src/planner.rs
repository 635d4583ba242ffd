use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::error::MigrationError;
use crate::migration::{Migration, MigrationId, MigrationRegistry};

/// Orders the migrations of `registry` that are not in `applied`.
///
/// The order is topological over `depends_on`, with the lowest ready id
/// always taken first, so migrations without a dependency edge between
/// them run in id order. Dependencies already applied count as satisfied.
/// Strategy never influences the order.
pub fn plan<'r>(
    registry: &'r MigrationRegistry,
    applied: &BTreeSet<MigrationId>,
) -> Result<Vec<&'r Migration>, MigrationError> {
    let pending: BTreeMap<MigrationId, &Migration> = registry
        .all()
        .filter(|m| !applied.contains(&m.id()))
        .map(|m| (m.id(), m))
        .collect();

    let order = topological(pending, |dep| applied.contains(&dep))?;
    check_conflicts(&order)?;
    Ok(order)
}

/// Orders the applied migrations the way `plan` ran them: topologically,
/// lowest ready id first. Reversing it gives a safe rollback order.
pub fn applied_order<'r>(
    registry: &'r MigrationRegistry,
    applied: &BTreeSet<MigrationId>,
) -> Result<Vec<&'r Migration>, MigrationError> {
    let mut candidates = BTreeMap::new();
    for &id in applied {
        let migration = registry.get(id).ok_or(MigrationError::NotFound(id))?;
        candidates.insert(id, migration);
    }

    topological(candidates, |dep| !applied.contains(&dep))
}

/// Kahn's algorithm over `candidates`. Dependencies for which `satisfied`
/// holds are ignored; any other dependency must itself be a candidate.
fn topological<'r>(
    candidates: BTreeMap<MigrationId, &'r Migration>,
    satisfied: impl Fn(MigrationId) -> bool,
) -> Result<Vec<&'r Migration>, MigrationError> {
    let mut waiting_on: BTreeMap<MigrationId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<MigrationId, Vec<MigrationId>> = BTreeMap::new();

    for (&id, migration) in &candidates {
        let mut count = 0;
        for &dep in migration.depends_on() {
            if satisfied(dep) {
                continue;
            }
            if !candidates.contains_key(&dep) {
                return Err(MigrationError::NotFound(dep));
            }
            count += 1;
            dependents.entry(dep).or_default().push(id);
        }
        waiting_on.insert(id, count);
    }

    let mut ready: BinaryHeap<Reverse<MigrationId>> = waiting_on
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&id, _)| Reverse(id))
        .collect();

    let mut order = Vec::with_capacity(candidates.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(candidates[&id]);
        waiting_on.remove(&id);
        for dependent in dependents.get(&id).into_iter().flatten() {
            if let Some(count) = waiting_on.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.push(Reverse(*dependent));
                }
            }
        }
    }

    if !waiting_on.is_empty() {
        return Err(MigrationError::DependencyCycle(find_cycle(
            &candidates,
            &waiting_on,
        )));
    }

    Ok(order)
}

/// Walks unresolved dependencies from the lowest stuck id until an id
/// repeats. Every stuck migration has at least one stuck dependency, so
/// the walk always closes a loop.
fn find_cycle(
    pending: &BTreeMap<MigrationId, &Migration>,
    stuck: &BTreeMap<MigrationId, usize>,
) -> Vec<MigrationId> {
    let mut path: Vec<MigrationId> = Vec::new();
    let mut current = stuck.keys().next().copied();

    while let Some(id) = current {
        if let Some(start) = path.iter().position(|&seen| seen == id) {
            return path.split_off(start);
        }
        path.push(id);
        current = pending.get(&id).and_then(|m| {
            m.depends_on()
                .iter()
                .find(|dep| stuck.contains_key(dep))
                .copied()
        });
    }

    stuck.keys().copied().collect()
}

/// Rejects pending migrations of different strategies that change the same
/// table without either one depending on the other.
fn check_conflicts(order: &[&Migration]) -> Result<(), MigrationError> {
    let mut ancestors: BTreeMap<MigrationId, BTreeSet<MigrationId>> = BTreeMap::new();
    for migration in order {
        let mut set = BTreeSet::new();
        for dep in migration.depends_on() {
            if let Some(inherited) = ancestors.get(dep) {
                set.insert(*dep);
                set.extend(inherited.iter().copied());
            }
        }
        ancestors.insert(migration.id(), set);
    }

    let related = |a: MigrationId, b: MigrationId| {
        ancestors.get(&a).is_some_and(|set| set.contains(&b))
            || ancestors.get(&b).is_some_and(|set| set.contains(&a))
    };

    for (i, first) in order.iter().enumerate() {
        let first_tables = first.tables();
        for second in &order[i + 1..] {
            if first.strategy() == second.strategy() || related(first.id(), second.id()) {
                continue;
            }
            if let Some(table) = second
                .tables()
                .into_iter()
                .find(|table| first_tables.contains(table))
            {
                let (low, high) = if first.id() < second.id() {
                    (first.id(), second.id())
                } else {
                    (second.id(), first.id())
                };
                return Err(MigrationError::StructuralConflict {
                    table: table.to_string(),
                    first: low,
                    second: high,
                });
            }
        }
    }

    Ok(())
}
