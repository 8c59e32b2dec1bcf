//! Bulk-operation framework.
//!
//! Every bulk call follows the same protocol: open one transaction, push a
//! suspension scope so per-row save signals stay quiet, run the per-row store
//! functions, pop the scope, queue the deferred work the silenced signals
//! would have queued (dirty marks, creation history, cache keys), and let the
//! context run exactly one recompute pass before commit. Field-change signals
//! are never silenced, so per-field history and dirty marking flow through
//! the ordinary receivers even under a bulk scope.
//!
//! Duplicate ids in a bulk update are coalesced field-wise, later entries
//! winning, so each row is written and recorded once.

pub mod accounts;
pub mod actuals;
pub mod fringes;
pub mod markups;
pub mod subaccounts;

use crate::entities::BudgetModel;
use serde::Serialize;

/// Response envelope for bulk create/update calls: the touched rows plus the
/// budget with its refreshed aggregates.
#[derive(Debug, Clone, Serialize)]
pub struct BulkResponse<T> {
    /// The created or updated rows, in request order
    pub children: Vec<T>,
    /// The budget after recomputation
    pub budget: BudgetModel,
}

/// Response envelope for bulk delete calls.
#[derive(Debug, Clone, Serialize)]
pub struct BulkDeleteResponse {
    /// The budget after recomputation
    pub budget: BudgetModel,
}

/// Field-wise merge of two partial updates, the later one winning.
pub trait MergePatch {
    /// Overlays `later` onto `self`.
    fn merge(&mut self, later: Self);
}

/// Overlay helper for one patch slot.
pub(crate) fn over<T>(slot: &mut Option<T>, later: Option<T>) {
    if later.is_some() {
        *slot = later;
    }
}

/// Coalesces duplicate ids in a bulk update, preserving first-seen order.
pub(crate) fn coalesce<P: MergePatch>(updates: Vec<(i64, P)>) -> Vec<(i64, P)> {
    let mut out: Vec<(i64, P)> = Vec::with_capacity(updates.len());
    for (id, patch) in updates {
        if let Some((_, existing)) = out.iter_mut().find(|(seen, _)| *seen == id) {
            existing.merge(patch);
        } else {
            out.push((id, patch));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Patch {
        a: Option<i64>,
        b: Option<i64>,
    }

    impl MergePatch for Patch {
        fn merge(&mut self, later: Self) {
            over(&mut self.a, later.a);
            over(&mut self.b, later.b);
        }
    }

    #[test]
    fn duplicate_ids_coalesce_with_later_fields_winning() {
        let updates = vec![
            (1, Patch { a: Some(1), b: None }),
            (2, Patch { a: Some(9), b: None }),
            (1, Patch { a: Some(2), b: Some(3) }),
        ];
        let merged = coalesce(updates);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], (1, Patch { a: Some(2), b: Some(3) }));
        assert_eq!(merged[1], (2, Patch { a: Some(9), b: None }));
    }

    #[test]
    fn merge_keeps_earlier_fields_the_later_patch_omits() {
        let mut first = Patch { a: Some(1), b: Some(2) };
        first.merge(Patch { a: None, b: Some(5) });
        assert_eq!(first, Patch { a: Some(1), b: Some(5) });
    }
}
