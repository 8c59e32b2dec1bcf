//! Actual business logic - recorded expenditures, budget domain only.
//!
//! An actual always counts toward the budget total; when it is charged to a
//! subaccount or markup it also surfaces in that row's actual column, so
//! owner and value changes dirty both the owning row and the budget.

use crate::entities::{
    actual, Actual, ActualColumn, ActualModel, BudgetKind, EntityKind, NodeRef, OwnerKind,
    OwnerRef,
};
use crate::errors::{Error, Result};
use crate::ordering;
use crate::signals::{Ctx, SignalEvent};
use crate::store::ListQuery;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait, Unchanged,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Attributes for creating an actual.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateActual {
    /// Short name of the expenditure
    #[serde(default)]
    pub name: Option<String>,
    /// Free-form notes
    #[serde(default)]
    pub notes: Option<String>,
    /// Date the expenditure occurred
    #[serde(default)]
    pub date: Option<chrono::NaiveDate>,
    /// Amount spent
    #[serde(default)]
    pub value: Option<f64>,
    /// External payment reference
    #[serde(default)]
    pub payment_id: Option<String>,
    /// Purchase order number
    #[serde(default)]
    pub purchase_order: Option<String>,
    /// Expenditure type tag
    #[serde(default)]
    pub actual_type: Option<String>,
    /// Linked contact
    #[serde(default)]
    pub contact: Option<i64>,
    /// Row to charge the expenditure to
    #[serde(default)]
    pub owner: Option<OwnerRef>,
}

/// Partial update for an actual.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActualPatch {
    /// New name; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub name: Option<Option<String>>,
    /// New notes; explicit null clears them
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub notes: Option<Option<String>>,
    /// New date; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub date: Option<Option<chrono::NaiveDate>>,
    /// New value; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub value: Option<Option<f64>>,
    /// New payment reference; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub payment_id: Option<Option<String>>,
    /// New purchase order; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub purchase_order: Option<Option<String>>,
    /// New type tag; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub actual_type: Option<Option<String>>,
    /// New contact; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub contact: Option<Option<i64>>,
    /// New owner; explicit null unassigns the actual
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub owner: Option<Option<OwnerRef>>,
    /// Reorder target: the sibling to place this row after, or null for the
    /// top of the table
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub previous: Option<Option<i64>>,
}

/// Finds an actual by id or errors with `not_found`.
pub async fn require_actual<C: ConnectionTrait>(db: &C, id: i64) -> Result<ActualModel> {
    Actual::find_by_id(id)
        .one(db)
        .await?
        .ok_or(Error::NotFound { kind: "actual", id })
}

/// Lists a budget's actuals in order-key order.
pub async fn get_actuals_for_budget<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
    query: &ListQuery,
) -> Result<Vec<ActualModel>> {
    let mut rows = Actual::find()
        .filter(ActualColumn::BudgetId.eq(budget_id))
        .order_by_asc(ActualColumn::Order)
        .all(db)
        .await?;
    rows.retain(|a| {
        query.includes_id(a.id)
            && query.matches(&[
                a.name.as_deref(),
                a.notes.as_deref(),
                a.purchase_order.as_deref(),
            ])
    });
    Ok(rows)
}

/// Lists the actuals charged to one owner row.
pub async fn get_actuals_for_owner<C: ConnectionTrait>(
    db: &C,
    owner: OwnerRef,
) -> Result<Vec<ActualModel>> {
    Actual::find()
        .filter(ActualColumn::OwnerKind.eq(owner.kind))
        .filter(ActualColumn::OwnerId.eq(owner.id))
        .order_by_asc(ActualColumn::Order)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Actuals only exist in the budget domain.
async fn validate_domain<C: ConnectionTrait>(db: &C, budget_id: i64) -> Result<()> {
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if budget.kind != BudgetKind::Budget {
        return Err(Error::BadRequest {
            message: "templates cannot carry actuals".to_string(),
        });
    }
    Ok(())
}

/// Checks the owner row exists and is inside `budget_id`.
async fn validate_owner<C: ConnectionTrait>(db: &C, budget_id: i64, owner: OwnerRef) -> Result<()> {
    let owner_budget = match owner.kind {
        OwnerKind::Subaccount => {
            crate::store::subaccount::require_subaccount(db, owner.id)
                .await?
                .budget_id
        }
        OwnerKind::Markup => crate::store::markup::require_markup(db, owner.id).await?.budget_id,
    };
    if owner_budget != budget_id {
        return Err(Error::Integrity {
            message: format!("owner {owner:?} is outside budget {budget_id}"),
        });
    }
    Ok(())
}

/// The tree node an owner change dirties: the owning subaccount, or the row a
/// markup hangs off.
async fn owner_footprint<C: ConnectionTrait>(
    db: &C,
    owner: Option<OwnerRef>,
) -> Result<Vec<NodeRef>> {
    match owner {
        None => Ok(Vec::new()),
        Some(OwnerRef {
            kind: OwnerKind::Subaccount,
            id,
        }) => Ok(vec![NodeRef::subaccount(id)]),
        Some(OwnerRef {
            kind: OwnerKind::Markup,
            id,
        }) => {
            let markup = crate::store::markup::require_markup(db, id).await?;
            Ok(markup.parent().as_node().into_iter().collect())
        }
    }
}

async fn next_order<C: ConnectionTrait>(db: &C, budget_id: i64) -> Result<String> {
    let max = Actual::find()
        .filter(ActualColumn::BudgetId.eq(budget_id))
        .order_by_desc(ActualColumn::Order)
        .one(db)
        .await?
        .map(|a| a.order);
    ordering::midpoint(max.as_deref(), None)
}

/// Creates an actual inside a caller-owned transaction.
pub async fn create_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    budget_id: i64,
    payload: CreateActual,
) -> Result<ActualModel> {
    validate_domain(db, budget_id).await?;
    if let Some(owner) = payload.owner {
        validate_owner(db, budget_id, owner).await?;
    }
    let order = next_order(db, budget_id).await?;

    let model = actual::ActiveModel {
        budget_id: Set(budget_id),
        owner_kind: Set(payload.owner.map(|o| o.kind)),
        owner_id: Set(payload.owner.map(|o| o.id)),
        name: Set(payload.name),
        notes: Set(payload.notes),
        date: Set(payload.date),
        value: Set(payload.value),
        payment_id: Set(payload.payment_id),
        purchase_order: Set(payload.purchase_order),
        actual_type: Set(payload.actual_type),
        contact: Set(payload.contact),
        order: Set(order),
        ..Default::default()
    }
    .insert(db)
    .await?;

    let affected = owner_footprint(db, model.owner()).await?;
    ctx.emit(
        &SignalEvent::post_save(EntityKind::Actual, model.id, budget_id, true)
            .with_affected(affected)
            .with_budget_dirty(),
    );
    debug!(actual_id = model.id, budget_id, "created actual");
    Ok(model)
}

/// Creates an actual in its own transaction.
pub async fn create_actual(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    payload: CreateActual,
) -> Result<ActualModel> {
    let txn = db.begin().await?;
    let model = create_in(&txn, ctx, budget_id, payload).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Applies a partial update inside a caller-owned transaction.
#[allow(clippy::too_many_lines)]
pub async fn update_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    id: i64,
    patch: ActualPatch,
) -> Result<ActualModel> {
    let model = require_actual(db, id).await?;
    let budget_id = model.budget_id;

    let mut am = actual::ActiveModel {
        id: Unchanged(id),
        ..Default::default()
    };
    let mut changes: Vec<(&'static str, serde_json::Value, serde_json::Value)> = Vec::new();
    let mut affected = owner_footprint(db, model.owner()).await?;

    if let Some(name) = patch.name {
        if name != model.name {
            changes.push(("name", json!(model.name), json!(name)));
            am.name = Set(name);
        }
    }
    if let Some(notes) = patch.notes {
        if notes != model.notes {
            changes.push(("notes", json!(model.notes), json!(notes)));
            am.notes = Set(notes);
        }
    }
    if let Some(date) = patch.date {
        if date != model.date {
            changes.push(("date", json!(model.date), json!(date)));
            am.date = Set(date);
        }
    }
    if let Some(value) = patch.value {
        if value != model.value {
            changes.push(("value", json!(model.value), json!(value)));
            am.value = Set(value);
        }
    }
    if let Some(payment_id) = patch.payment_id {
        if payment_id != model.payment_id {
            changes.push(("payment_id", json!(model.payment_id), json!(payment_id)));
            am.payment_id = Set(payment_id);
        }
    }
    if let Some(purchase_order) = patch.purchase_order {
        if purchase_order != model.purchase_order {
            changes.push((
                "purchase_order",
                json!(model.purchase_order),
                json!(purchase_order),
            ));
            am.purchase_order = Set(purchase_order);
        }
    }
    if let Some(actual_type) = patch.actual_type {
        if actual_type != model.actual_type {
            changes.push(("actual_type", json!(model.actual_type), json!(actual_type)));
            am.actual_type = Set(actual_type);
        }
    }
    if let Some(contact) = patch.contact {
        if contact != model.contact {
            changes.push(("contact", json!(model.contact), json!(contact)));
            am.contact = Set(contact);
        }
    }
    if let Some(owner) = patch.owner {
        if owner != model.owner() {
            if let Some(new_owner) = owner {
                validate_owner(db, budget_id, new_owner).await?;
            }
            changes.push(("owner", json!(model.owner()), json!(owner)));
            am.owner_kind = Set(owner.map(|o| o.kind));
            am.owner_id = Set(owner.map(|o| o.id));
            // Both the old and the new owning rows change value
            affected.extend(owner_footprint(db, owner).await?);
        }
    }
    if let Some(previous) = patch.previous {
        let siblings: Vec<(i64, String)> = Actual::find()
            .filter(ActualColumn::BudgetId.eq(budget_id))
            .filter(ActualColumn::Id.ne(id))
            .order_by_asc(ActualColumn::Order)
            .all(db)
            .await?
            .into_iter()
            .map(|a| (a.id, a.order))
            .collect();
        let order = crate::store::account::reorder_key(&siblings, previous)?;
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
        ctx.emit(
            &SignalEvent::field_changed(EntityKind::Actual, id, budget_id, field, old, new)
                .with_affected(affected.clone())
                .with_budget_dirty(),
        );
    }
    ctx.emit(&SignalEvent::post_save(EntityKind::Actual, id, budget_id, false));
    Ok(updated)
}

/// Applies a partial update in its own transaction.
pub async fn update_actual(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    id: i64,
    patch: ActualPatch,
) -> Result<ActualModel> {
    let txn = db.begin().await?;
    let model = update_in(&txn, ctx, id, patch).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Deletes an actual inside a caller-owned transaction.
pub async fn delete_in<C: ConnectionTrait>(db: &C, ctx: &mut Ctx, id: i64) -> Result<()> {
    let model = require_actual(db, id).await?;
    let budget_id = model.budget_id;

    ctx.emit(&SignalEvent::pre_delete(EntityKind::Actual, id, budget_id));
    let affected = owner_footprint(db, model.owner()).await?;
    Actual::delete_by_id(id).exec(db).await?;
    ctx.emit(
        &SignalEvent::post_delete(EntityKind::Actual, id, budget_id)
            .with_affected(affected)
            .with_budget_dirty(),
    );
    debug!(actual_id = id, budget_id, "deleted actual");
    Ok(())
}

/// Deletes an actual in its own transaction.
pub async fn delete_actual(db: &DatabaseConnection, ctx: &mut Ctx, id: i64) -> Result<()> {
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
    use crate::store::subaccount::require_subaccount;
    use crate::test_utils::{
        create_test_account, create_test_budget, create_test_leaf, create_test_template,
        setup_test_db, test_ctx,
    };

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn every_actual_counts_toward_the_budget_total() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let leaf = create_test_leaf(&db, &mut ctx, NodeRef::account(account.id), 1.0, 100.0, 1.0)
            .await
            .unwrap();

        create_actual(
            &db,
            &mut ctx,
            budget.id,
            CreateActual {
                value: Some(40.0),
                owner: Some(OwnerRef::subaccount(leaf.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        // Unassigned spend still counts at the budget level
        create_actual(
            &db,
            &mut ctx,
            budget.id,
            CreateActual {
                value: Some(30.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let budget = crate::store::budget::require_budget(&db, budget.id)
            .await
            .unwrap();
        assert!(close(budget.actual, 70.0));
        let leaf = require_subaccount(&db, leaf.id).await.unwrap();
        assert!(close(leaf.actual, 40.0));
        let account = crate::store::account::require_account(&db, account.id)
            .await
            .unwrap();
        assert!(close(account.actual, 40.0));
    }

    #[tokio::test]
    async fn moving_an_actual_recomputes_both_owners() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let parent = NodeRef::account(account.id);
        let first = create_test_leaf(&db, &mut ctx, parent, 1.0, 10.0, 1.0)
            .await
            .unwrap();
        let second = create_test_leaf(&db, &mut ctx, parent, 1.0, 20.0, 1.0)
            .await
            .unwrap();
        let actual = create_actual(
            &db,
            &mut ctx,
            budget.id,
            CreateActual {
                value: Some(15.0),
                owner: Some(OwnerRef::subaccount(first.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        update_actual(
            &db,
            &mut ctx,
            actual.id,
            ActualPatch {
                owner: Some(Some(OwnerRef::subaccount(second.id))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let first = require_subaccount(&db, first.id).await.unwrap();
        assert!(close(first.actual, 0.0));
        let second = require_subaccount(&db, second.id).await.unwrap();
        assert!(close(second.actual, 15.0));
    }

    #[tokio::test]
    async fn templates_cannot_carry_actuals() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let template = create_test_template(&db, &mut ctx, "Base").await.unwrap();

        let err = create_actual(
            &db,
            &mut ctx,
            template.id,
            CreateActual {
                value: Some(10.0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[tokio::test]
    async fn owner_must_live_in_the_same_budget() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let first = create_test_budget(&db, &mut ctx, "One").await.unwrap();
        let second = create_test_budget(&db, &mut ctx, "Two").await.unwrap();
        let account = create_test_account(&db, &mut ctx, second.id, "1000")
            .await
            .unwrap();
        let leaf = create_test_leaf(&db, &mut ctx, NodeRef::account(account.id), 1.0, 5.0, 1.0)
            .await
            .unwrap();

        let err = create_actual(
            &db,
            &mut ctx,
            first.id,
            CreateActual {
                value: Some(5.0),
                owner: Some(OwnerRef::subaccount(leaf.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[tokio::test]
    async fn deleting_an_actual_releases_its_spend() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let actual = create_actual(
            &db,
            &mut ctx,
            budget.id,
            CreateActual {
                value: Some(25.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        delete_actual(&db, &mut ctx, actual.id).await.unwrap();

        let budget = crate::store::budget::require_budget(&db, budget.id)
            .await
            .unwrap();
        assert!(close(budget.actual, 0.0));
    }
}
