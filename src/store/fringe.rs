//! Fringe business logic - reusable cost modifiers applied to leaf rows.
//!
//! A fringe belongs to a budget and attaches to any number of subaccounts
//! through a join table. Changing its rate, cutoff or unit dirties every
//! linked row.

use crate::entities::{
    fringe, EntityKind, Fringe, FringeColumn, FringeModel, FringeUnit, NodeRef, ParentRef,
    SubaccountFringe, SubaccountFringeColumn,
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

/// Attributes for creating a fringe.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateFringe {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Application ceiling; percent fringes only
    #[serde(default)]
    pub cutoff: Option<f64>,
    /// Rate; null contributes nothing
    #[serde(default)]
    pub rate: Option<f64>,
    /// Percent or flat
    #[serde(default = "default_unit")]
    pub unit: FringeUnit,
    /// Display color
    #[serde(default)]
    pub color: Option<String>,
    /// Subaccounts to attach the fringe to at creation
    #[serde(default)]
    pub subaccounts: Vec<i64>,
}

const fn default_unit() -> FringeUnit {
    FringeUnit::Percent
}

/// Partial update for a fringe.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FringePatch {
    /// New display name
    pub name: Option<String>,
    /// New description; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub description: Option<Option<String>>,
    /// New cutoff; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub cutoff: Option<Option<f64>>,
    /// New rate; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub rate: Option<Option<f64>>,
    /// New unit
    pub unit: Option<FringeUnit>,
    /// New color; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub color: Option<Option<String>>,
    /// Reorder target: the sibling to place this row after, or null for the
    /// top of the table
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub previous: Option<Option<i64>>,
}

/// Finds a fringe by id or errors with `not_found`.
pub async fn require_fringe<C: ConnectionTrait>(db: &C, id: i64) -> Result<FringeModel> {
    Fringe::find_by_id(id)
        .one(db)
        .await?
        .ok_or(Error::NotFound { kind: "fringe", id })
}

/// Lists a budget's fringes in order-key order.
pub async fn get_fringes_for_budget<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
    query: &ListQuery,
) -> Result<Vec<FringeModel>> {
    let mut rows = Fringe::find()
        .filter(FringeColumn::BudgetId.eq(budget_id))
        .order_by_asc(FringeColumn::Order)
        .all(db)
        .await?;
    rows.retain(|f| {
        query.includes_id(f.id) && query.matches(&[Some(&f.name), f.description.as_deref()])
    });
    Ok(rows)
}

/// The tree nodes of every subaccount this fringe is attached to.
pub(crate) async fn linked_nodes<C: ConnectionTrait>(db: &C, fringe_id: i64) -> Result<Vec<NodeRef>> {
    Ok(SubaccountFringe::find()
        .filter(SubaccountFringeColumn::FringeId.eq(fringe_id))
        .all(db)
        .await?
        .into_iter()
        .map(|j| NodeRef::subaccount(j.subaccount_id))
        .collect())
}

/// Flat fringes carry no cutoff; it is forced to null on save.
const fn effective_cutoff(unit: FringeUnit, cutoff: Option<f64>) -> Option<f64> {
    match unit {
        FringeUnit::Flat => None,
        FringeUnit::Percent => cutoff,
    }
}

/// Fringe names are unique within a budget.
async fn check_name_free<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
    name: &str,
    exclude: Option<i64>,
) -> Result<()> {
    let clash = Fringe::find()
        .filter(FringeColumn::BudgetId.eq(budget_id))
        .filter(FringeColumn::Name.eq(name))
        .one(db)
        .await?;
    if clash.is_some_and(|f| Some(f.id) != exclude) {
        return Err(Error::Conflict {
            message: format!("fringe name '{name}' is already in use"),
        });
    }
    Ok(())
}

async fn next_order<C: ConnectionTrait>(db: &C, budget_id: i64) -> Result<String> {
    let max = Fringe::find()
        .filter(FringeColumn::BudgetId.eq(budget_id))
        .order_by_desc(FringeColumn::Order)
        .one(db)
        .await?
        .map(|f| f.order);
    ordering::midpoint(max.as_deref(), None)
}

/// Creates a fringe inside a caller-owned transaction.
pub async fn create_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    budget_id: i64,
    payload: CreateFringe,
) -> Result<FringeModel> {
    crate::store::budget::require_budget(db, budget_id).await?;
    check_name_free(db, budget_id, &payload.name, None).await?;
    let cutoff = effective_cutoff(payload.unit, payload.cutoff);
    let order = next_order(db, budget_id).await?;

    let model = fringe::ActiveModel {
        budget_id: Set(budget_id),
        name: Set(payload.name),
        description: Set(payload.description),
        cutoff: Set(cutoff),
        rate: Set(payload.rate),
        unit: Set(payload.unit),
        color: Set(payload.color),
        order: Set(order),
        ..Default::default()
    }
    .insert(db)
    .await?;

    let mut affected = Vec::new();
    for subaccount_id in payload.subaccounts {
        let row = crate::store::subaccount::require_subaccount(db, subaccount_id).await?;
        if row.budget_id != budget_id {
            return Err(Error::Integrity {
                message: format!("subaccount {subaccount_id} is outside budget {budget_id}"),
            });
        }
        crate::entities::subaccount_fringe::ActiveModel {
            subaccount_id: Set(subaccount_id),
            fringe_id: Set(model.id),
            ..Default::default()
        }
        .insert(db)
        .await?;
        affected.push(NodeRef::subaccount(subaccount_id));
    }

    ctx.emit(
        &SignalEvent::post_save(EntityKind::Fringe, model.id, budget_id, true)
            .with_parent(ParentRef::budget(budget_id))
            .with_affected(affected),
    );
    debug!(fringe_id = model.id, budget_id, "created fringe");
    Ok(model)
}

/// Creates a fringe in its own transaction.
pub async fn create_fringe(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    payload: CreateFringe,
) -> Result<FringeModel> {
    let txn = db.begin().await?;
    let model = create_in(&txn, ctx, budget_id, payload).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Applies a partial update inside a caller-owned transaction.
pub async fn update_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    id: i64,
    patch: FringePatch,
) -> Result<FringeModel> {
    let model = require_fringe(db, id).await?;
    let budget_id = model.budget_id;

    let unit = patch.unit.unwrap_or(model.unit);
    let cutoff = effective_cutoff(unit, patch.cutoff.unwrap_or(model.cutoff));

    let mut am = fringe::ActiveModel {
        id: Unchanged(id),
        ..Default::default()
    };
    let mut changes: Vec<(&'static str, serde_json::Value, serde_json::Value)> = Vec::new();

    if let Some(name) = patch.name {
        if name != model.name {
            check_name_free(db, budget_id, &name, Some(id)).await?;
            changes.push(("name", json!(model.name), json!(name)));
            am.name = Set(name);
        }
    }
    if let Some(description) = patch.description {
        if description != model.description {
            changes.push(("description", json!(model.description), json!(description)));
            am.description = Set(description);
        }
    }
    if cutoff != model.cutoff {
        changes.push(("cutoff", json!(model.cutoff), json!(cutoff)));
        am.cutoff = Set(cutoff);
    }
    if let Some(rate) = patch.rate {
        if rate != model.rate {
            changes.push(("rate", json!(model.rate), json!(rate)));
            am.rate = Set(rate);
        }
    }
    if let Some(new_unit) = patch.unit {
        if new_unit != model.unit {
            changes.push(("unit", json!(model.unit), json!(new_unit)));
            am.unit = Set(new_unit);
        }
    }
    if let Some(color) = patch.color {
        if color != model.color {
            changes.push(("color", json!(model.color), json!(color)));
            am.color = Set(color);
        }
    }
    if let Some(previous) = patch.previous {
        let siblings: Vec<(i64, String)> = Fringe::find()
            .filter(FringeColumn::BudgetId.eq(budget_id))
            .filter(FringeColumn::Id.ne(id))
            .order_by_asc(FringeColumn::Order)
            .all(db)
            .await?
            .into_iter()
            .map(|f| (f.id, f.order))
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

    let affected = linked_nodes(db, id).await?;
    for (field, old, new) in changes {
        ctx.emit(
            &SignalEvent::field_changed(EntityKind::Fringe, id, budget_id, field, old, new)
                .with_affected(affected.clone()),
        );
    }
    ctx.emit(
        &SignalEvent::post_save(EntityKind::Fringe, id, budget_id, false)
            .with_parent(ParentRef::budget(budget_id)),
    );
    Ok(updated)
}

/// Applies a partial update in its own transaction.
pub async fn update_fringe(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    id: i64,
    patch: FringePatch,
) -> Result<FringeModel> {
    let txn = db.begin().await?;
    let model = update_in(&txn, ctx, id, patch).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Deletes a fringe inside a caller-owned transaction, detaching it from
/// every linked subaccount and dirtying those rows.
pub async fn delete_in<C: ConnectionTrait>(db: &C, ctx: &mut Ctx, id: i64) -> Result<()> {
    let model = require_fringe(db, id).await?;
    let budget_id = model.budget_id;

    ctx.emit(&SignalEvent::pre_delete(EntityKind::Fringe, id, budget_id));
    let affected = linked_nodes(db, id).await?;
    SubaccountFringe::delete_many()
        .filter(SubaccountFringeColumn::FringeId.eq(id))
        .exec(db)
        .await?;
    Fringe::delete_by_id(id).exec(db).await?;
    ctx.emit(
        &SignalEvent::post_delete(EntityKind::Fringe, id, budget_id)
            .with_parent(ParentRef::budget(budget_id))
            .with_affected(affected),
    );
    debug!(fringe_id = id, budget_id, "deleted fringe");
    Ok(())
}

/// Deletes a fringe in its own transaction.
pub async fn delete_fringe(db: &DatabaseConnection, ctx: &mut Ctx, id: i64) -> Result<()> {
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
        create_test_account, create_test_budget, create_test_leaf, setup_test_db, test_ctx,
    };

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn percent_fringe_applies_its_rate_up_to_the_cutoff() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let parent = NodeRef::account(account.id);
        let small = create_test_leaf(&db, &mut ctx, parent, 1.0, 10.0, 1.0)
            .await
            .unwrap();
        let large = create_test_leaf(&db, &mut ctx, parent, 1.0, 100.0, 1.0)
            .await
            .unwrap();

        create_fringe(
            &db,
            &mut ctx,
            budget.id,
            CreateFringe {
                name: "Payroll".to_string(),
                rate: Some(0.1),
                cutoff: Some(50.0),
                unit: FringeUnit::Percent,
                subaccounts: vec![small.id, large.id],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // 10 is below the cutoff; 100 is capped at 50
        let small = require_subaccount(&db, small.id).await.unwrap();
        assert!(close(small.fringe_contribution, 1.0));
        let large = require_subaccount(&db, large.id).await.unwrap();
        assert!(close(large.fringe_contribution, 5.0));
        let account = crate::store::account::require_account(&db, account.id)
            .await
            .unwrap();
        assert!(close(account.accumulated_fringe_contribution, 6.0));
        let budget = crate::store::budget::require_budget(&db, budget.id)
            .await
            .unwrap();
        assert!(close(budget.accumulated_fringe_contribution, 6.0));
    }

    #[tokio::test]
    async fn flat_fringe_adds_its_rate_and_drops_the_cutoff() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let leaf = create_test_leaf(&db, &mut ctx, NodeRef::account(account.id), 1.0, 10.0, 1.0)
            .await
            .unwrap();

        let fringe = create_fringe(
            &db,
            &mut ctx,
            budget.id,
            CreateFringe {
                name: "Kit fee".to_string(),
                rate: Some(25.0),
                cutoff: Some(50.0),
                unit: FringeUnit::Flat,
                subaccounts: vec![leaf.id],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(fringe.cutoff.is_none());

        let leaf = require_subaccount(&db, leaf.id).await.unwrap();
        assert!(close(leaf.fringe_contribution, 25.0));
    }

    #[tokio::test]
    async fn changing_a_rate_recomputes_every_linked_row() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let leaf = create_test_leaf(&db, &mut ctx, NodeRef::account(account.id), 1.0, 100.0, 1.0)
            .await
            .unwrap();
        let fringe = create_fringe(
            &db,
            &mut ctx,
            budget.id,
            CreateFringe {
                name: "Payroll".to_string(),
                rate: Some(0.1),
                unit: FringeUnit::Percent,
                subaccounts: vec![leaf.id],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        update_fringe(
            &db,
            &mut ctx,
            fringe.id,
            FringePatch {
                rate: Some(Some(0.2)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let leaf = require_subaccount(&db, leaf.id).await.unwrap();
        assert!(close(leaf.fringe_contribution, 20.0));
    }

    #[tokio::test]
    async fn a_row_that_gains_children_stops_contributing_its_fringe() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let row = create_test_leaf(&db, &mut ctx, NodeRef::account(account.id), 1.0, 100.0, 1.0)
            .await
            .unwrap();
        create_fringe(
            &db,
            &mut ctx,
            budget.id,
            CreateFringe {
                name: "Payroll".to_string(),
                rate: Some(0.1),
                unit: FringeUnit::Percent,
                subaccounts: vec![row.id],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let fetched = require_subaccount(&db, row.id).await.unwrap();
        assert!(close(fetched.fringe_contribution, 10.0));

        // A child turns the row into an aggregate; its leaf inputs go
        // unobserved and the fringe no longer applies.
        create_test_leaf(&db, &mut ctx, NodeRef::subaccount(row.id), 1.0, 40.0, 1.0)
            .await
            .unwrap();

        let fetched = require_subaccount(&db, row.id).await.unwrap();
        assert!(close(fetched.fringe_contribution, 0.0));
        assert!(close(fetched.nominal_value, 40.0));
        let account = crate::store::account::require_account(&db, account.id)
            .await
            .unwrap();
        assert!(close(account.accumulated_fringe_contribution, 0.0));
        let budget = crate::store::budget::require_budget(&db, budget.id)
            .await
            .unwrap();
        assert!(close(budget.accumulated_fringe_contribution, 0.0));
    }

    #[tokio::test]
    async fn fringe_names_are_unique_within_a_budget() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        create_fringe(
            &db,
            &mut ctx,
            budget.id,
            CreateFringe {
                name: "Payroll".to_string(),
                rate: Some(0.1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let err = create_fringe(
            &db,
            &mut ctx,
            budget.id,
            CreateFringe {
                name: "Payroll".to_string(),
                rate: Some(0.2),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(err.code(), "conflict");

        // The same name is fine in another budget.
        let other = create_test_budget(&db, &mut ctx, "Second").await.unwrap();
        create_fringe(
            &db,
            &mut ctx,
            other.id,
            CreateFringe {
                name: "Payroll".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Renaming onto a sibling's name conflicts as well.
        let kit = create_fringe(
            &db,
            &mut ctx,
            other.id,
            CreateFringe {
                name: "Kit fee".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let err = update_fringe(
            &db,
            &mut ctx,
            kit.id,
            FringePatch {
                name: Some("Payroll".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn deleting_a_fringe_removes_its_contributions() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let leaf = create_test_leaf(&db, &mut ctx, NodeRef::account(account.id), 1.0, 100.0, 1.0)
            .await
            .unwrap();
        let fringe = create_fringe(
            &db,
            &mut ctx,
            budget.id,
            CreateFringe {
                name: "Payroll".to_string(),
                rate: Some(0.1),
                unit: FringeUnit::Percent,
                subaccounts: vec![leaf.id],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        delete_fringe(&db, &mut ctx, fringe.id).await.unwrap();

        let leaf = require_subaccount(&db, leaf.id).await.unwrap();
        assert!(close(leaf.fringe_contribution, 0.0));
        assert!(
            crate::store::subaccount::fringe_ids(&db, leaf.id)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
