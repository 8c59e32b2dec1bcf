//! Account business logic - top-level rows directly under a budget root.

use crate::entities::{
    account, Account, AccountColumn, AccountModel, EntityKind, Group, GroupColumn, NodeRef,
    ParentKind, ParentRef,
};
use crate::errors::{Error, Result};
use crate::ordering;
use crate::signals::{Ctx, SignalEvent};
use crate::store::{order_with_groups, ListQuery};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait, Unchanged,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Attributes for creating an account row.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAccount {
    /// User-facing account number, unique within the budget
    pub identifier: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Group to cluster the row under
    #[serde(default)]
    pub group: Option<i64>,
}

/// Partial update for an account row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountPatch {
    /// New account number
    pub identifier: Option<String>,
    /// New description; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub description: Option<Option<String>>,
    /// New group; explicit null ungroups the row
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub group: Option<Option<i64>>,
    /// Reorder target: the sibling to place this row after, or null for the
    /// top of the table
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub previous: Option<Option<i64>>,
}

/// Finds an account by id or errors with `not_found`.
pub async fn require_account<C: ConnectionTrait>(db: &C, id: i64) -> Result<AccountModel> {
    Account::find_by_id(id)
        .one(db)
        .await?
        .ok_or(Error::NotFound { kind: "account", id })
}

/// Lists a budget's accounts in presentation order: grouped rows clustered
/// first, ungrouped rows after, each sorted by order key.
pub async fn get_accounts_for_budget<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
    query: &ListQuery,
) -> Result<Vec<AccountModel>> {
    let mut rows = Account::find()
        .filter(AccountColumn::BudgetId.eq(budget_id))
        .order_by_asc(AccountColumn::Order)
        .all(db)
        .await?;
    rows.retain(|a| {
        query.includes_id(a.id)
            && query.matches(&[Some(&a.identifier), a.description.as_deref()])
    });
    order_with_groups(rows, |a| a.budget_id, |a| &a.order, |a| a.group_id)
}

async fn check_identifier_free<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
    identifier: &str,
    exclude: Option<i64>,
) -> Result<()> {
    let clash = Account::find()
        .filter(AccountColumn::BudgetId.eq(budget_id))
        .filter(AccountColumn::Identifier.eq(identifier))
        .one(db)
        .await?;
    if clash.is_some_and(|c| Some(c.id) != exclude) {
        return Err(Error::Conflict {
            message: format!("account number {identifier} is already in use"),
        });
    }
    Ok(())
}

async fn validate_group<C: ConnectionTrait>(db: &C, budget_id: i64, group_id: i64) -> Result<()> {
    let group = crate::store::group::require_group(db, group_id).await?;
    let expected = ParentRef::budget(budget_id);
    let actual = ParentRef {
        kind: group.parent_kind,
        id: group.parent_id,
    };
    if actual != expected {
        return Err(Error::Integrity {
            message: format!("group {group_id} does not cluster accounts of budget {budget_id}"),
        });
    }
    Ok(())
}

pub(crate) async fn next_order<C: ConnectionTrait>(db: &C, budget_id: i64) -> Result<String> {
    let max = Account::find()
        .filter(AccountColumn::BudgetId.eq(budget_id))
        .order_by_desc(AccountColumn::Order)
        .one(db)
        .await?
        .map(|a| a.order);
    ordering::midpoint(max.as_deref(), None)
}

/// Creates an account inside a caller-owned transaction.
pub async fn create_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    budget_id: i64,
    payload: CreateAccount,
) -> Result<AccountModel> {
    crate::store::budget::require_budget(db, budget_id).await?;
    let identifier = payload.identifier.trim().to_string();
    if identifier.is_empty() {
        return Err(Error::FieldValidation {
            field: "identifier".to_string(),
            message: "identifier may not be blank".to_string(),
        });
    }
    check_identifier_free(db, budget_id, &identifier, None).await?;
    if let Some(group_id) = payload.group {
        validate_group(db, budget_id, group_id).await?;
    }
    let order = next_order(db, budget_id).await?;

    let model = account::ActiveModel {
        budget_id: Set(budget_id),
        identifier: Set(identifier),
        description: Set(payload.description),
        group_id: Set(payload.group),
        order: Set(order),
        nominal_value: Set(0.0),
        markup_contribution: Set(0.0),
        accumulated_fringe_contribution: Set(0.0),
        accumulated_markup_contribution: Set(0.0),
        accumulated_value: Set(0.0),
        actual: Set(0.0),
        ..Default::default()
    }
    .insert(db)
    .await?;

    ctx.emit(
        &SignalEvent::post_save(EntityKind::Account, model.id, budget_id, true)
            .with_parent(ParentRef::budget(budget_id))
            .with_affected(vec![NodeRef::account(model.id)]),
    );
    debug!(account_id = model.id, budget_id, "created account");
    Ok(model)
}

/// Creates an account in its own transaction.
pub async fn create_account(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    payload: CreateAccount,
) -> Result<AccountModel> {
    let txn = db.begin().await?;
    let model = create_in(&txn, ctx, budget_id, payload).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Computes the order key that places a row after `previous` (or at the top
/// when `previous` is `None`) among `siblings`, which must be sorted by order
/// and exclude the row being moved.
pub(crate) fn reorder_key(
    siblings: &[(i64, String)],
    previous: Option<i64>,
) -> Result<String> {
    match previous {
        None => {
            let first = siblings.first().map(|(_, o)| o.as_str());
            ordering::midpoint(None, first)
        }
        Some(prev_id) => {
            let idx = siblings
                .iter()
                .position(|(id, _)| *id == prev_id)
                .ok_or(Error::BadRequest {
                    message: format!("previous row {prev_id} is not a sibling"),
                })?;
            let lower = Some(siblings[idx].1.as_str());
            let upper = siblings.get(idx + 1).map(|(_, o)| o.as_str());
            ordering::midpoint(lower, upper)
        }
    }
}

/// Applies a partial update inside a caller-owned transaction.
pub async fn update_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    id: i64,
    patch: AccountPatch,
) -> Result<AccountModel> {
    let model = require_account(db, id).await?;
    let budget_id = model.budget_id;

    let mut am = account::ActiveModel {
        id: Unchanged(id),
        ..Default::default()
    };
    let mut changes: Vec<(&'static str, serde_json::Value, serde_json::Value)> = Vec::new();
    let mut group_hint: Option<i64> = None;

    if let Some(identifier) = patch.identifier {
        let identifier = identifier.trim().to_string();
        if identifier.is_empty() {
            return Err(Error::FieldValidation {
                field: "identifier".to_string(),
                message: "identifier may not be blank".to_string(),
            });
        }
        if identifier != model.identifier {
            check_identifier_free(db, budget_id, &identifier, Some(id)).await?;
            changes.push(("identifier", json!(model.identifier), json!(identifier)));
            am.identifier = Set(identifier);
        }
    }
    if let Some(description) = patch.description {
        if description != model.description {
            changes.push(("description", json!(model.description), json!(description)));
            am.description = Set(description);
        }
    }
    if let Some(group) = patch.group {
        if group != model.group_id {
            if let Some(group_id) = group {
                validate_group(db, budget_id, group_id).await?;
            }
            changes.push(("group", json!(model.group_id), json!(group)));
            group_hint = model.group_id;
            am.group_id = Set(group);
        }
    }
    if let Some(previous) = patch.previous {
        let siblings: Vec<(i64, String)> = Account::find()
            .filter(AccountColumn::BudgetId.eq(budget_id))
            .filter(AccountColumn::Id.ne(id))
            .order_by_asc(AccountColumn::Order)
            .all(db)
            .await?
            .into_iter()
            .map(|a| (a.id, a.order))
            .collect();
        let order = reorder_key(&siblings, previous)?;
        if order != model.order {
            changes.push(("order", json!(model.order), json!(order)));
            am.order = Set(order);
        }
    }

    if changes.is_empty() {
        return Ok(model);
    }
    let updated = am.update(db).await?;

    for (field, old, new) in changes {
        let mut event = SignalEvent::field_changed(EntityKind::Account, id, budget_id, field, old, new)
            .with_affected(vec![NodeRef::account(id)]);
        if field == "group" {
            if let Some(old_group) = group_hint {
                event = event.with_group_hint(old_group);
            }
        }
        ctx.emit(&event);
    }
    ctx.emit(
        &SignalEvent::post_save(EntityKind::Account, id, budget_id, false)
            .with_parent(ParentRef::budget(budget_id)),
    );
    Ok(updated)
}

/// Applies a partial update in its own transaction.
pub async fn update_account(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    id: i64,
    patch: AccountPatch,
) -> Result<AccountModel> {
    let txn = db.begin().await?;
    let model = update_in(&txn, ctx, id, patch).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Deletes an account and its whole subtree inside a caller-owned
/// transaction. Budget-level aggregates are marked dirty; the row's group gets
/// a prune check.
pub async fn delete_in<C: ConnectionTrait>(db: &C, ctx: &mut Ctx, id: i64) -> Result<()> {
    let model = require_account(db, id).await?;
    let budget_id = model.budget_id;

    ctx.emit(&SignalEvent::pre_delete(EntityKind::Account, id, budget_id));

    let root = NodeRef::account(id);
    let descendants = crate::store::subaccount::collect_descendants(db, &[root]).await?;
    crate::store::subaccount::purge_subaccounts(db, ctx, &descendants, budget_id).await?;
    crate::store::markup::detach_children(db, ctx, &[root], budget_id).await?;
    Group::delete_many()
        .filter(GroupColumn::ParentKind.eq(ParentKind::Account))
        .filter(GroupColumn::ParentId.eq(id))
        .exec(db)
        .await?;
    Account::delete_by_id(id).exec(db).await?;

    let mut event = SignalEvent::post_delete(EntityKind::Account, id, budget_id)
        .with_parent(ParentRef::budget(budget_id))
        .with_budget_dirty();
    if let Some(group_id) = model.group_id {
        event = event.with_group_hint(group_id);
    }
    ctx.emit(&event);
    debug!(account_id = id, budget_id, "deleted account subtree");
    Ok(())
}

/// Deletes an account subtree in its own transaction.
pub async fn delete_account(db: &DatabaseConnection, ctx: &mut Ctx, id: i64) -> Result<()> {
    let txn = db.begin().await?;
    delete_in(&txn, ctx, id).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sib(id: i64, order: &str) -> (i64, String) {
        (id, order.to_string())
    }

    #[test]
    fn reorder_to_top_goes_before_the_first_sibling() {
        let siblings = vec![sib(1, "n"), sib(2, "t")];
        let key = reorder_key(&siblings, None).unwrap();
        assert!(key.as_str() < "n");
    }

    #[test]
    fn reorder_after_a_sibling_lands_between_it_and_the_next() {
        let siblings = vec![sib(1, "n"), sib(2, "t")];
        let key = reorder_key(&siblings, Some(1)).unwrap();
        assert!(key.as_str() > "n" && key.as_str() < "t");
    }

    #[test]
    fn reorder_after_the_last_sibling_appends() {
        let siblings = vec![sib(1, "n")];
        let key = reorder_key(&siblings, Some(1)).unwrap();
        assert!(key.as_str() > "n");
    }

    #[test]
    fn reorder_after_unknown_sibling_is_a_bad_request() {
        assert!(reorder_key(&[sib(1, "n")], Some(9)).is_err());
    }

    #[tokio::test]
    async fn duplicate_identifier_is_a_conflict() {
        let db = crate::test_utils::setup_test_db().await.unwrap();
        let mut ctx = crate::test_utils::test_ctx();
        let budget = crate::test_utils::create_test_budget(&db, &mut ctx, "Pilot")
            .await
            .unwrap();
        crate::test_utils::create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();

        let err = crate::test_utils::create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }), "unexpected error: {err:?}");
        assert_eq!(err.code(), "conflict");
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn same_identifier_is_fine_across_budgets() {
        let db = crate::test_utils::setup_test_db().await.unwrap();
        let mut ctx = crate::test_utils::test_ctx();
        let first = crate::test_utils::create_test_budget(&db, &mut ctx, "One")
            .await
            .unwrap();
        let second = crate::test_utils::create_test_budget(&db, &mut ctx, "Two")
            .await
            .unwrap();
        crate::test_utils::create_test_account(&db, &mut ctx, first.id, "1000")
            .await
            .unwrap();
        assert!(
            crate::test_utils::create_test_account(&db, &mut ctx, second.id, "1000")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn reordering_via_previous_moves_the_row_in_the_listing() {
        let db = crate::test_utils::setup_test_db().await.unwrap();
        let mut ctx = crate::test_utils::test_ctx();
        let budget = crate::test_utils::create_test_budget(&db, &mut ctx, "Pilot")
            .await
            .unwrap();
        let a = crate::test_utils::create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let b = crate::test_utils::create_test_account(&db, &mut ctx, budget.id, "2000")
            .await
            .unwrap();
        let c = crate::test_utils::create_test_account(&db, &mut ctx, budget.id, "3000")
            .await
            .unwrap();

        // Move c to the top, then a after b
        update_account(
            &db,
            &mut ctx,
            c.id,
            AccountPatch {
                previous: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        update_account(
            &db,
            &mut ctx,
            a.id,
            AccountPatch {
                previous: Some(Some(b.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let listing = get_accounts_for_budget(&db, budget.id, &ListQuery::default())
            .await
            .unwrap();
        let ids: Vec<i64> = listing.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![c.id, b.id, a.id]);
    }

    #[tokio::test]
    async fn deleting_an_account_removes_its_subtree_and_updates_totals() {
        let db = crate::test_utils::setup_test_db().await.unwrap();
        let mut ctx = crate::test_utils::test_ctx();
        let budget = crate::test_utils::create_test_budget(&db, &mut ctx, "Pilot")
            .await
            .unwrap();
        let doomed = crate::test_utils::create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let kept = crate::test_utils::create_test_account(&db, &mut ctx, budget.id, "2000")
            .await
            .unwrap();
        let leaf = crate::test_utils::create_test_leaf(
            &db,
            &mut ctx,
            NodeRef::account(doomed.id),
            2.0,
            10.0,
            1.0,
        )
        .await
        .unwrap();
        crate::test_utils::create_test_leaf(&db, &mut ctx, NodeRef::account(kept.id), 1.0, 7.0, 1.0)
            .await
            .unwrap();

        delete_account(&db, &mut ctx, doomed.id).await.unwrap();

        assert!(require_account(&db, doomed.id).await.is_err());
        assert!(
            crate::store::subaccount::require_subaccount(&db, leaf.id)
                .await
                .is_err()
        );
        let budget = crate::store::budget::require_budget(&db, budget.id)
            .await
            .unwrap();
        assert!((budget.nominal_value - 7.0).abs() < 1e-9);
    }
}
