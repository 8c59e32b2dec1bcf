//! Entity store - per-entity CRUD with validation and signal emission.
//!
//! Each submodule exposes the same shape: public `create`/`update`/`delete`
//! functions that own a transaction and run the deferred work, plus `*_in`
//! variants that operate inside a caller-owned transaction (the bulk framework
//! and the duplication engine build on those). List functions apply the common
//! `?search=` / `?ids=` / `?ordering=` query parameters.

pub mod account;
pub mod actual;
pub mod budget;
pub mod collaborator;
pub mod fringe;
pub mod group;
pub mod markup;
pub mod subaccount;

use crate::errors::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// Common list-endpoint query parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    /// Case-insensitive substring filter over the entity's documented fields
    pub search: Option<String>,
    /// Restrict the listing to these ids
    pub ids: Option<Vec<i64>>,
    /// Field to order by; defaults to the row's `order` key
    pub ordering: Option<String>,
}

impl ListQuery {
    /// True when `haystacks` contains the search term (case-insensitively), or
    /// no search is set.
    #[must_use]
    pub fn matches(&self, haystacks: &[Option<&str>]) -> bool {
        let Some(term) = self.search.as_deref() else {
            return true;
        };
        let needle = term.to_lowercase();
        haystacks
            .iter()
            .flatten()
            .any(|h| h.to_lowercase().contains(&needle))
    }

    /// True when the id passes the `?ids=` filter.
    #[must_use]
    pub fn includes_id(&self, id: i64) -> bool {
        self.ids.as_ref().is_none_or(|ids| ids.contains(&id))
    }
}

/// Deserializer distinguishing an absent field from an explicit null, for
/// nullable fields in partial-update payloads: missing stays `None`, `null`
/// becomes `Some(None)`, a value becomes `Some(Some(v))`.
pub(crate) fn double_option<'de, T, D>(
    deserializer: D,
) -> std::result::Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Merges a deterministic linear ordering out of grouped and ungrouped rows.
///
/// Grouped rows come first, clustered by group; groups sort by the minimum
/// `order` among their members and members sort by `order` within the group.
/// Ungrouped rows follow in `order` order. All rows must share one table key;
/// mixing tables is an invariant violation.
pub fn order_with_groups<T, K, FK, FO, FG>(
    rows: Vec<T>,
    table_key: FK,
    order: FO,
    group: FG,
) -> Result<Vec<T>>
where
    K: PartialEq + std::fmt::Debug,
    FK: Fn(&T) -> K,
    FO: Fn(&T) -> &str,
    FG: Fn(&T) -> Option<i64>,
{
    if let Some(first) = rows.first() {
        let key = table_key(first);
        if let Some(stray) = rows.iter().find(|r| table_key(r) != key) {
            return Err(Error::InvariantViolation {
                message: format!(
                    "order_with_groups called across tables: {key:?} vs {:?}",
                    table_key(stray)
                ),
            });
        }
    }

    let mut grouped: BTreeMap<i64, Vec<T>> = BTreeMap::new();
    let mut ungrouped: Vec<T> = Vec::new();
    for row in rows {
        match group(&row) {
            Some(group_id) => grouped.entry(group_id).or_default().push(row),
            None => ungrouped.push(row),
        }
    }

    let mut clusters: Vec<Vec<T>> = grouped.into_values().collect();
    for cluster in &mut clusters {
        cluster.sort_by(|a, b| order(a).cmp(order(b)));
    }
    // Group position is the minimum member order, which after the sort above
    // is the first member's key.
    clusters.sort_by(|a, b| {
        let a_min = a.first().map_or("", |r| order(r));
        let b_min = b.first().map_or("", |r| order(r));
        a_min.cmp(b_min)
    });
    ungrouped.sort_by(|a, b| order(a).cmp(order(b)));

    let mut out: Vec<T> = clusters.into_iter().flatten().collect();
    out.extend(ungrouped);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Clone)]
    struct Row {
        table: i64,
        order: &'static str,
        group: Option<i64>,
        name: &'static str,
    }

    fn row(order: &'static str, group: Option<i64>, name: &'static str) -> Row {
        Row {
            table: 1,
            order,
            group,
            name,
        }
    }

    fn run(rows: Vec<Row>) -> Vec<&'static str> {
        order_with_groups(rows, |r| r.table, |r| r.order, |r| r.group)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect()
    }

    #[test]
    fn grouped_rows_cluster_before_ungrouped() {
        let rows = vec![
            row("b", None, "loose1"),
            row("d", Some(2), "g2a"),
            row("c", Some(1), "g1a"),
            row("f", Some(1), "g1b"),
            row("e", None, "loose2"),
        ];
        // Group 1's minimum order "c" < group 2's "d"
        assert_eq!(run(rows), vec!["g1a", "g1b", "g2a", "loose1", "loose2"]);
    }

    #[test]
    fn members_sort_by_order_within_their_group() {
        let rows = vec![row("f", Some(1), "late"), row("b", Some(1), "early")];
        assert_eq!(run(rows), vec!["early", "late"]);
    }

    #[test]
    fn mixed_tables_raise() {
        let mut rows = vec![row("b", None, "a")];
        rows.push(Row {
            table: 2,
            order: "c",
            group: None,
            name: "other",
        });
        assert!(order_with_groups(rows, |r| r.table, |r| r.order, |r| r.group).is_err());
    }

    #[test]
    fn list_query_search_is_case_insensitive() {
        let query = ListQuery {
            search: Some("CAM".to_string()),
            ..Default::default()
        };
        assert!(query.matches(&[Some("Camera Dept"), None]));
        assert!(!query.matches(&[Some("Sound"), None]));
        assert!(ListQuery::default().matches(&[None]));
    }
}
