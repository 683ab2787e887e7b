//! Contingent roles: holding a trigger role forces the absence of its
//! contingent roles. Roles taken away because of a trigger are remembered so
//! they can be given back once the trigger goes.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::warn;

use super::events::RoleId;
use crate::db::models::{ActiveContingentRoleRow, ContingentRoleRow};

/// Maximum number of resolution rounds for one transition.
pub const MAX_ROUNDS: usize = 8;

/// Static per-guild table: trigger role → contingent roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContingentTable {
    triggers: HashMap<RoleId, HashSet<RoleId>>,
}

impl ContingentTable {
    pub fn from_rows(rows: &[ContingentRoleRow]) -> Self {
        let mut table = Self::default();
        for row in rows {
            table.insert(row.role_id as u64, [row.contingent_role_id as u64]);
        }
        table
    }

    pub fn insert(&mut self, trigger: RoleId, contingents: impl IntoIterator<Item = RoleId>) {
        self.triggers.entry(trigger).or_default().extend(contingents);
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn contingents(&self, trigger: RoleId) -> Option<&HashSet<RoleId>> {
        self.triggers.get(&trigger)
    }

    fn is_trigger(&self, role: RoleId) -> bool {
        self.triggers.contains_key(&role)
    }
}

/// Per-user record of roles suppressed by each trigger.
pub type SuppressionMap = HashMap<RoleId, HashSet<RoleId>>;

pub fn suppression_from_rows(rows: &[ActiveContingentRoleRow]) -> SuppressionMap {
    let mut map = SuppressionMap::new();
    for row in rows {
        map.entry(row.role_id as u64)
            .or_default()
            .insert(row.contingent_role_id as u64);
    }
    map
}

/// A change to the suppression map that must be written through, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressionChange {
    Recorded {
        trigger: RoleId,
        roles: BTreeSet<RoleId>,
    },
    Cleared {
        trigger: RoleId,
    },
}

/// Outcome of resolving one role-set transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub final_roles: HashSet<RoleId>,
    /// Roles to add on top of the requested set (`final − after`).
    pub to_add: HashSet<RoleId>,
    /// Requested roles to take away again (`after − final`).
    pub to_remove: HashSet<RoleId>,
    /// Net change relative to the starting set.
    pub net_added: HashSet<RoleId>,
    pub net_removed: HashSet<RoleId>,
    pub suppression_changes: Vec<SuppressionChange>,
    pub rounds: usize,
    pub converged: bool,
}

impl Resolution {
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Resolve the transition `before → after` to a fixed point, updating
/// `suppression` in place.
pub fn resolve(
    table: &ContingentTable,
    suppression: &mut SuppressionMap,
    before: &HashSet<RoleId>,
    after: &HashSet<RoleId>,
) -> Resolution {
    let mut changes = Vec::new();
    let mut round_before = before.clone();
    let mut round_after = after.clone();
    let mut rounds = 0;
    let mut converged = table.is_empty();

    while !converged && rounds < MAX_ROUNDS {
        rounds += 1;
        let mut working = round_after.clone();
        let added: HashSet<RoleId> = round_after.difference(&round_before).copied().collect();
        let removed: HashSet<RoleId> = round_before.difference(&round_after).copied().collect();

        // A trigger being added this round is never suppressed by another trigger of the round.
        let protected: HashSet<RoleId> = added
            .iter()
            .copied()
            .filter(|r| table.is_trigger(*r))
            .collect();

        if !added.is_empty() {
            for (&trigger, contingents) in &table.triggers {
                if !working.contains(&trigger) {
                    continue;
                }
                let suppressed: BTreeSet<RoleId> = if added.contains(&trigger) {
                    contingents
                        .iter()
                        .filter(|r| working.contains(r) && !protected.contains(r))
                        .copied()
                        .collect()
                } else {
                    // Held trigger: newly added contingents are taken away again.
                    contingents
                        .iter()
                        .filter(|r| added.contains(r) && !protected.contains(r))
                        .copied()
                        .collect()
                };
                if suppressed.is_empty() {
                    continue;
                }
                for role in &suppressed {
                    working.remove(role);
                }
                record(suppression, &mut changes, trigger, suppressed);
            }
        }

        for trigger in &removed {
            let Some(recorded) = suppression.remove(trigger) else {
                continue;
            };
            changes.push(SuppressionChange::Cleared { trigger: *trigger });

            for role in recorded {
                let holder = table.triggers.iter().find(|(other, contingents)| {
                    *other != trigger && working.contains(*other) && contingents.contains(&role)
                });
                match holder {
                    Some((&other, _)) => {
                        record(suppression, &mut changes, other, BTreeSet::from([role]));
                    }
                    None => {
                        working.insert(role);
                    }
                }
            }
        }

        if working == round_after {
            converged = true;
        } else {
            round_before = std::mem::replace(&mut round_after, working);
        }
    }

    if !converged {
        warn!(
            rounds,
            "contingent role resolution hit the round limit before converging"
        );
    }

    let final_roles = round_after;
    Resolution {
        to_add: final_roles.difference(after).copied().collect(),
        to_remove: after.difference(&final_roles).copied().collect(),
        net_added: final_roles.difference(before).copied().collect(),
        net_removed: before.difference(&final_roles).copied().collect(),
        final_roles,
        suppression_changes: changes,
        rounds,
        converged,
    }
}

fn record(
    suppression: &mut SuppressionMap,
    changes: &mut Vec<SuppressionChange>,
    trigger: RoleId,
    roles: BTreeSet<RoleId>,
) {
    suppression
        .entry(trigger)
        .or_default()
        .extend(roles.iter().copied());
    changes.push(SuppressionChange::Recorded { trigger, roles });
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: RoleId = 1;
    const B: RoleId = 2;
    const C: RoleId = 3;
    const D: RoleId = 4;

    fn set(roles: &[RoleId]) -> HashSet<RoleId> {
        roles.iter().copied().collect()
    }

    fn table_a_bc() -> ContingentTable {
        let mut table = ContingentTable::default();
        table.insert(A, [B, C]);
        table
    }

    #[test]
    fn test_adding_trigger_suppresses_requested_contingent() {
        let table = table_a_bc();
        let mut suppression = SuppressionMap::new();

        let res = resolve(&table, &mut suppression, &set(&[]), &set(&[A, B]));

        assert!(res.converged);
        assert_eq!(res.final_roles, set(&[A]));
        assert_eq!(res.to_remove, set(&[B]));
        assert!(res.to_add.is_empty());
        assert_eq!(res.net_added, set(&[A]));
        assert_eq!(suppression.get(&A), Some(&set(&[B])));
        assert_eq!(
            res.suppression_changes,
            vec![SuppressionChange::Recorded {
                trigger: A,
                roles: BTreeSet::from([B]),
            }]
        );
    }

    #[test]
    fn test_removing_trigger_restores_suppressed_roles() {
        let table = table_a_bc();
        let mut suppression = SuppressionMap::from([(A, set(&[B]))]);

        let res = resolve(&table, &mut suppression, &set(&[A]), &set(&[]));

        assert!(res.converged);
        assert_eq!(res.to_add, set(&[B]));
        assert_eq!(res.final_roles, set(&[B]));
        assert!(suppression.is_empty());
        assert_eq!(
            res.suppression_changes,
            vec![SuppressionChange::Cleared { trigger: A }]
        );
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let table = table_a_bc();
        let mut suppression = SuppressionMap::new();
        let after = set(&[A, B, D]);

        let first = resolve(&table, &mut suppression, &set(&[B, D]), &after);
        let snapshot = suppression.clone();
        let second = resolve(&table, &mut suppression, &after, &first.final_roles);

        assert!(second.is_noop());
        assert_eq!(second.final_roles, first.final_roles);
        assert!(second.suppression_changes.is_empty());
        assert_eq!(suppression, snapshot);
    }

    #[test]
    fn test_held_trigger_blocks_new_contingent() {
        let table = table_a_bc();
        let mut suppression = SuppressionMap::new();

        let res = resolve(&table, &mut suppression, &set(&[A]), &set(&[A, C]));

        assert_eq!(res.to_remove, set(&[C]));
        assert_eq!(res.final_roles, set(&[A]));
        assert_eq!(suppression.get(&A), Some(&set(&[C])));
    }

    #[test]
    fn test_restoration_defers_to_other_present_trigger() {
        let mut table = table_a_bc();
        table.insert(D, [B]);
        let mut suppression = SuppressionMap::from([(A, set(&[B])), (D, set(&[B]))]);

        let res = resolve(&table, &mut suppression, &set(&[A, D]), &set(&[D]));

        assert!(res.is_noop());
        assert!(!suppression.contains_key(&A));
        assert_eq!(suppression.get(&D), Some(&set(&[B])));
    }

    #[test]
    fn test_chained_restoration_reaches_fixed_point() {
        // A suppresses B, B suppresses C.
        let mut table = ContingentTable::default();
        table.insert(A, [B]);
        table.insert(B, [C]);
        let mut suppression = SuppressionMap::from([(A, set(&[B]))]);

        // Removing A gives back B, which in turn takes C away.
        let res = resolve(&table, &mut suppression, &set(&[A, C]), &set(&[C]));

        assert!(res.converged);
        assert_eq!(res.final_roles, set(&[B]));
        assert_eq!(res.to_add, set(&[B]));
        assert_eq!(res.to_remove, set(&[C]));
        assert_eq!(suppression.get(&B), Some(&set(&[C])));
        assert!(res.rounds >= 2);
    }

    #[test]
    fn test_simultaneous_triggers_do_not_suppress_each_other() {
        let mut table = ContingentTable::default();
        table.insert(A, [B]);
        table.insert(B, [A]);
        let mut suppression = SuppressionMap::new();

        let res = resolve(&table, &mut suppression, &set(&[]), &set(&[A, B]));

        assert!(res.is_noop());
        assert!(suppression.is_empty());
    }

    #[test]
    fn test_cyclic_table_stops_at_round_limit() {
        // B takes C away, C takes D away, D takes B away.
        let mut table = ContingentTable::default();
        table.insert(B, [C]);
        table.insert(C, [D]);
        table.insert(D, [B]);
        let mut suppression = SuppressionMap::from([(D, set(&[B])), (B, set(&[C]))]);

        // Each restoration hands back a trigger that suppresses the next role,
        // so the working set cycles with period six and never settles.
        let res = resolve(&table, &mut suppression, &set(&[B, C]), &set(&[D]));

        assert!(!res.converged);
        assert_eq!(res.rounds, MAX_ROUNDS);
        assert_eq!(res.final_roles, set(&[C]));
        assert_eq!(res.to_add, set(&[C]));
        assert_eq!(res.to_remove, set(&[D]));
        assert!(res.net_added.is_empty());
        assert_eq!(res.net_removed, set(&[B]));
        assert_eq!(
            suppression,
            SuppressionMap::from([(D, set(&[B])), (C, set(&[D]))])
        );
    }

    #[test]
    fn test_empty_table_is_noop() {
        let mut suppression = SuppressionMap::new();
        let res = resolve(
            &ContingentTable::default(),
            &mut suppression,
            &set(&[A]),
            &set(&[B]),
        );
        assert!(res.is_noop());
        assert!(res.converged);
        assert_eq!(res.rounds, 0);
        assert_eq!(res.net_added, set(&[B]));
        assert_eq!(res.net_removed, set(&[A]));
    }

    #[test]
    fn test_from_rows_groups_by_trigger() {
        let rows = vec![
            ContingentRoleRow {
                server_id: 1,
                role_id: 10,
                contingent_role_id: 11,
            },
            ContingentRoleRow {
                server_id: 1,
                role_id: 10,
                contingent_role_id: 12,
            },
        ];
        let table = ContingentTable::from_rows(&rows);
        assert_eq!(table.contingents(10), Some(&set(&[11, 12])));
        assert!(table.contingents(11).is_none());
    }
}
