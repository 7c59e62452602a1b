//! Filter evaluation against in-memory tables.
//!
//! Joins are walked in declaration order starting from the filtered row. A
//! row is selected if at least one combination of joined rows satisfies
//! every where-clause.
//!
//! Tombstones are matched leniently: a joined row that no longer exists
//! binds nothing, and where-clauses on an unbound table pass. A delete whose
//! parent was deleted in the same window is still sent, otherwise the
//! parent's delete would fail on the client's foreign key.

use super::database::Database;
use crate::filter::{BoundFilter, FilterJoin, JoinKind};
use rowsync_codec::Value;
use std::collections::BTreeMap;

type Binding = (String, Option<BTreeMap<String, Value>>);

/// Returns true if `row` of the filtered table passes the filter.
pub(crate) fn row_matches(db: &Database, filter: &BoundFilter, row: &BTreeMap<String, Value>) -> bool {
    let mut bindings: Vec<Binding> = vec![(filter.filter.table.clone(), Some(row.clone()))];
    expand(db, filter, &filter.filter.joins, &mut bindings, false)
}

/// Returns true if a tombstone, rebuilt from its key and tracked filter
/// values, passes the filter.
pub(crate) fn tombstone_matches(db: &Database, filter: &BoundFilter, row: &BTreeMap<String, Value>) -> bool {
    let mut bindings: Vec<Binding> = vec![(filter.filter.table.clone(), Some(row.clone()))];
    expand(db, filter, &filter.filter.joins, &mut bindings, true)
}

fn unbound(bindings: &[Binding], table: &str) -> bool {
    matches!(bindings.iter().rev().find(|(name, _)| name == table), Some((_, None)))
}

fn lookup<'a>(bindings: &'a [Binding], table: &str, column: &str) -> Option<&'a Value> {
    bindings
        .iter()
        .rev()
        .find(|(name, _)| name == table)
        .and_then(|(_, row)| row.as_ref())
        .and_then(|row| row.get(column))
}

fn expand(
    db: &Database,
    filter: &BoundFilter,
    joins: &[FilterJoin],
    bindings: &mut Vec<Binding>,
    lenient: bool,
) -> bool {
    let Some((join, rest)) = joins.split_first() else {
        return filter.filter.wheres.iter().all(|clause| {
            (lenient && unbound(bindings, &clause.table))
                || filter.clause_matches(clause, lookup(bindings, &clause.table, &clause.column))
        });
    };
    let Some((target, other)) = join.sides() else {
        return false;
    };

    let candidates: Vec<BTreeMap<String, Value>> = match (lookup(bindings, &other.0, &other.1), db.tables.get(&join.table)) {
        (Some(value), Some(data)) if !value.is_null() => data
            .rows
            .values()
            .map(|values| data.row_map(values))
            .filter(|candidate| candidate.get(&target.1) == Some(value))
            .collect(),
        _ => Vec::new(),
    };

    if candidates.is_empty() {
        return match join.kind {
            JoinKind::Inner | JoinKind::Right if !lenient => false,
            _ => {
                bindings.push((join.table.clone(), None));
                let matched = expand(db, filter, rest, bindings, lenient);
                bindings.pop();
                matched
            }
        };
    }

    candidates.into_iter().any(|candidate| {
        bindings.push((join.table.clone(), Some(candidate)));
        let matched = expand(db, filter, rest, bindings, lenient);
        bindings.pop();
        matched
    })
}
