//! Markup business logic - flat and percent additive costs.
//!
//! A percent markup names at least one child row (a sibling set under its
//! parent) and contributes `rate × child.nominal` through each child's
//! markup contribution. A flat markup has no children and adds its rate once
//! to its parent's accumulated bucket. A percent markup whose last child is
//! detached is pruned.

use crate::entities::{
    markup, markup_child, Account, AccountColumn, Actual, ActualColumn, EntityKind, Markup,
    MarkupChild, MarkupChildColumn, MarkupColumn, MarkupModel, MarkupUnit, NodeKind, NodeRef,
    OwnerKind, ParentKind, ParentRef, Subaccount, SubaccountColumn,
};
use crate::errors::{Error, Result};
use crate::ordering;
use crate::signals::{Ctx, SignalEvent};
use crate::store::ListQuery;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, sea_query::Expr, Set, TransactionTrait, Unchanged,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Attributes for creating a markup under a parent row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateMarkup {
    /// User-facing label
    #[serde(default)]
    pub identifier: Option<String>,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Rate; null contributes nothing
    #[serde(default)]
    pub rate: Option<f64>,
    /// Percent or flat
    #[serde(default = "default_unit")]
    pub unit: MarkupUnit,
    /// Child rows a percent markup applies to; ignored for flat markups
    #[serde(default)]
    pub children: Vec<i64>,
}

const fn default_unit() -> MarkupUnit {
    MarkupUnit::Percent
}

/// Partial update for a markup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarkupPatch {
    /// New label; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub identifier: Option<Option<String>>,
    /// New description; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub description: Option<Option<String>>,
    /// New rate; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub rate: Option<Option<f64>>,
    /// New unit
    pub unit: Option<MarkupUnit>,
    /// Replacement child set; percent markups only
    pub children: Option<Vec<i64>>,
    /// Reorder target: the sibling to place this row after, or null for the
    /// top of the table
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub previous: Option<Option<i64>>,
}

/// Finds a markup by id or errors with `not_found`.
pub async fn require_markup<C: ConnectionTrait>(db: &C, id: i64) -> Result<MarkupModel> {
    Markup::find_by_id(id)
        .one(db)
        .await?
        .ok_or(Error::NotFound { kind: "markup", id })
}

/// Lists the markups under one parent row, in order-key order.
pub async fn get_markups_for_parent<C: ConnectionTrait>(
    db: &C,
    parent: ParentRef,
    query: &ListQuery,
) -> Result<Vec<MarkupModel>> {
    let mut rows = Markup::find()
        .filter(MarkupColumn::ParentKind.eq(parent.kind))
        .filter(MarkupColumn::ParentId.eq(parent.id))
        .order_by_asc(MarkupColumn::Order)
        .all(db)
        .await?;
    rows.retain(|m| {
        query.includes_id(m.id)
            && query.matches(&[m.identifier.as_deref(), m.description.as_deref()])
    });
    Ok(rows)
}

/// The tree nodes a markup currently applies to.
pub async fn child_nodes<C: ConnectionTrait>(db: &C, markup_id: i64) -> Result<Vec<NodeRef>> {
    Ok(MarkupChild::find()
        .filter(MarkupChildColumn::MarkupId.eq(markup_id))
        .all(db)
        .await?
        .into_iter()
        .map(|j| j.child())
        .collect())
}

/// The node kind a markup's children take, determined by its parent: markups
/// on the budget root apply to accounts, all others to subaccounts.
const fn child_kind_for(parent: ParentRef) -> NodeKind {
    match parent.kind {
        ParentKind::Budget => NodeKind::Account,
        ParentKind::Account | ParentKind::Subaccount => NodeKind::Subaccount,
    }
}

/// Checks each child id is a direct child row of `parent` and returns the
/// corresponding nodes.
async fn validate_children<C: ConnectionTrait>(
    db: &C,
    parent: ParentRef,
    children: &[i64],
) -> Result<Vec<NodeRef>> {
    let kind = child_kind_for(parent);
    let valid: Vec<i64> = match parent.kind {
        ParentKind::Budget => Account::find()
            .filter(AccountColumn::BudgetId.eq(parent.id))
            .all(db)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect(),
        ParentKind::Account | ParentKind::Subaccount => Subaccount::find()
            .filter(SubaccountColumn::ParentKind.eq(match parent.kind {
                ParentKind::Account => NodeKind::Account,
                _ => NodeKind::Subaccount,
            }))
            .filter(SubaccountColumn::ParentId.eq(parent.id))
            .all(db)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect(),
    };
    let mut nodes = Vec::with_capacity(children.len());
    for child_id in children {
        if !valid.contains(child_id) {
            return Err(Error::Integrity {
                message: format!("row {child_id} is not a direct child of {parent:?}"),
            });
        }
        nodes.push(NodeRef {
            kind,
            id: *child_id,
        });
    }
    Ok(nodes)
}

async fn next_order<C: ConnectionTrait>(db: &C, parent: ParentRef) -> Result<String> {
    let max = Markup::find()
        .filter(MarkupColumn::ParentKind.eq(parent.kind))
        .filter(MarkupColumn::ParentId.eq(parent.id))
        .order_by_desc(MarkupColumn::Order)
        .one(db)
        .await?
        .map(|m| m.order);
    ordering::midpoint(max.as_deref(), None)
}

/// Nodes dirtied by a markup change: its children plus its parent node, with
/// the budget directly dirty when the markup hangs off the root.
fn dirty_footprint(parent: ParentRef, children: &[NodeRef]) -> (Vec<NodeRef>, bool) {
    let mut affected = children.to_vec();
    let budget_dirty = match parent.as_node() {
        Some(node) => {
            affected.push(node);
            false
        }
        None => true,
    };
    (affected, budget_dirty)
}

/// Creates a markup inside a caller-owned transaction.
pub async fn create_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    parent: ParentRef,
    payload: CreateMarkup,
) -> Result<MarkupModel> {
    let budget_id = crate::store::group::budget_of_parent(db, parent).await?;
    let children = match payload.unit {
        MarkupUnit::Percent => {
            if payload.children.is_empty() {
                return Err(Error::FieldValidation {
                    field: "children".to_string(),
                    message: "a percent markup requires at least one child".to_string(),
                });
            }
            validate_children(db, parent, &payload.children).await?
        }
        MarkupUnit::Flat => Vec::new(),
    };
    let order = next_order(db, parent).await?;

    let model = markup::ActiveModel {
        budget_id: Set(budget_id),
        parent_kind: Set(parent.kind),
        parent_id: Set(parent.id),
        identifier: Set(payload.identifier),
        description: Set(payload.description),
        rate: Set(payload.rate),
        unit: Set(payload.unit),
        order: Set(order),
        ..Default::default()
    }
    .insert(db)
    .await?;

    for node in &children {
        markup_child::ActiveModel {
            markup_id: Set(model.id),
            child_kind: Set(node.kind),
            child_id: Set(node.id),
            ..Default::default()
        }
        .insert(db)
        .await?;
    }

    let (affected, budget_dirty) = dirty_footprint(parent, &children);
    let mut event = SignalEvent::post_save(EntityKind::Markup, model.id, budget_id, true)
        .with_parent(parent)
        .with_affected(affected);
    if budget_dirty {
        event = event.with_budget_dirty();
    }
    ctx.emit(&event);
    debug!(markup_id = model.id, ?parent, unit = ?model.unit, "created markup");
    Ok(model)
}

/// Creates a markup in its own transaction.
pub async fn create_markup(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    parent: ParentRef,
    payload: CreateMarkup,
) -> Result<MarkupModel> {
    let txn = db.begin().await?;
    let model = create_in(&txn, ctx, parent, payload).await?;
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
    patch: MarkupPatch,
) -> Result<MarkupModel> {
    let model = require_markup(db, id).await?;
    let budget_id = model.budget_id;
    let parent = model.parent();
    let unit = patch.unit.unwrap_or(model.unit);

    let mut am = markup::ActiveModel {
        id: Unchanged(id),
        ..Default::default()
    };
    let mut changes: Vec<(&'static str, serde_json::Value, serde_json::Value)> = Vec::new();

    if let Some(identifier) = patch.identifier {
        if identifier != model.identifier {
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
    if let Some(rate) = patch.rate {
        if rate != model.rate {
            changes.push(("rate", json!(model.rate), json!(rate)));
            am.rate = Set(rate);
        }
    }
    if unit != model.unit {
        changes.push(("unit", json!(model.unit), json!(unit)));
        am.unit = Set(unit);
    }
    if let Some(previous) = patch.previous {
        let siblings: Vec<(i64, String)> = Markup::find()
            .filter(MarkupColumn::ParentKind.eq(parent.kind))
            .filter(MarkupColumn::ParentId.eq(parent.id))
            .filter(MarkupColumn::Id.ne(id))
            .order_by_asc(MarkupColumn::Order)
            .all(db)
            .await?
            .into_iter()
            .map(|m| (m.id, m.order))
            .collect();
        let order = crate::store::account::reorder_key(&siblings, previous)?;
        if order != model.order {
            changes.push(("order", json!(model.order), json!(order)));
            am.order = Set(order);
        }
    }

    let before = child_nodes(db, id).await?;
    let mut children = before.clone();
    let mut children_changed = false;
    match unit {
        MarkupUnit::Percent => {
            if let Some(wanted) = &patch.children {
                let nodes = validate_children(db, parent, wanted).await?;
                if nodes.is_empty() {
                    return Err(Error::FieldValidation {
                        field: "children".to_string(),
                        message: "a percent markup requires at least one child".to_string(),
                    });
                }
                if nodes != before {
                    MarkupChild::delete_many()
                        .filter(MarkupChildColumn::MarkupId.eq(id))
                        .exec(db)
                        .await?;
                    for node in &nodes {
                        markup_child::ActiveModel {
                            markup_id: Set(id),
                            child_kind: Set(node.kind),
                            child_id: Set(node.id),
                            ..Default::default()
                        }
                        .insert(db)
                        .await?;
                    }
                    children = nodes;
                    children_changed = true;
                }
            } else if model.unit == MarkupUnit::Flat {
                return Err(Error::FieldValidation {
                    field: "children".to_string(),
                    message: "switching to percent requires a child set".to_string(),
                });
            }
        }
        MarkupUnit::Flat => {
            if !before.is_empty() {
                MarkupChild::delete_many()
                    .filter(MarkupChildColumn::MarkupId.eq(id))
                    .exec(db)
                    .await?;
                children = Vec::new();
                children_changed = true;
            }
        }
    }

    if changes.is_empty() && !children_changed {
        return Ok(model);
    }
    let updated = if changes.is_empty() {
        model
    } else {
        am.update(db).await?
    };

    // Rows that were children before or after the change are both dirtied
    let mut union = before;
    for node in &children {
        if !union.contains(node) {
            union.push(*node);
        }
    }
    let (affected, budget_dirty) = dirty_footprint(parent, &union);

    if children_changed {
        let mut event = SignalEvent::m2m_changed(EntityKind::Markup, id, budget_id)
            .with_parent(parent)
            .with_affected(affected.clone());
        if budget_dirty {
            event = event.with_budget_dirty();
        }
        ctx.emit(&event);
    }
    for (field, old, new) in changes {
        let mut event =
            SignalEvent::field_changed(EntityKind::Markup, id, budget_id, field, old, new)
                .with_affected(affected.clone());
        if budget_dirty {
            event = event.with_budget_dirty();
        }
        ctx.emit(&event);
    }
    ctx.emit(
        &SignalEvent::post_save(EntityKind::Markup, id, budget_id, false).with_parent(parent),
    );
    Ok(updated)
}

/// Applies a partial update in its own transaction.
pub async fn update_markup(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    id: i64,
    patch: MarkupPatch,
) -> Result<MarkupModel> {
    let txn = db.begin().await?;
    let model = update_in(&txn, ctx, id, patch).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Deletes one markup row and its references: child links go away, owned
/// actuals survive unowned on the budget.
async fn delete_row<C: ConnectionTrait>(db: &C, ctx: &mut Ctx, model: &MarkupModel) -> Result<()> {
    let budget_id = model.budget_id;
    let parent = model.parent();
    let children = child_nodes(db, model.id).await?;

    MarkupChild::delete_many()
        .filter(MarkupChildColumn::MarkupId.eq(model.id))
        .exec(db)
        .await?;
    Actual::update_many()
        .col_expr(ActualColumn::OwnerKind, Expr::value(Option::<OwnerKind>::None))
        .col_expr(ActualColumn::OwnerId, Expr::value(Option::<i64>::None))
        .filter(ActualColumn::OwnerKind.eq(OwnerKind::Markup))
        .filter(ActualColumn::OwnerId.eq(model.id))
        .exec(db)
        .await?;
    Markup::delete_by_id(model.id).exec(db).await?;

    let (affected, _) = dirty_footprint(parent, &children);
    // Actual ownership moved to the budget, so budget totals are always dirty
    ctx.emit(
        &SignalEvent::post_delete(EntityKind::Markup, model.id, budget_id)
            .with_parent(parent)
            .with_affected(affected)
            .with_budget_dirty(),
    );
    Ok(())
}

/// Deletes a markup inside a caller-owned transaction.
pub async fn delete_in<C: ConnectionTrait>(db: &C, ctx: &mut Ctx, id: i64) -> Result<()> {
    let model = require_markup(db, id).await?;
    ctx.emit(&SignalEvent::pre_delete(EntityKind::Markup, id, model.budget_id));
    delete_row(db, ctx, &model).await?;
    debug!(markup_id = id, "deleted markup");
    Ok(())
}

/// Deletes a markup in its own transaction.
pub async fn delete_markup(db: &DatabaseConnection, ctx: &mut Ctx, id: i64) -> Result<()> {
    let txn = db.begin().await?;
    delete_in(&txn, ctx, id).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(())
}

/// Detaches the given nodes from every markup that lists them and prunes
/// percent markups left childless. Used when rows are deleted.
pub(crate) async fn detach_children<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    nodes: &[NodeRef],
    budget_id: i64,
) -> Result<()> {
    if nodes.is_empty() {
        return Ok(());
    }
    let mut touched: Vec<i64> = Vec::new();
    for node in nodes {
        let links = MarkupChild::find()
            .filter(MarkupChildColumn::ChildKind.eq(node.kind))
            .filter(MarkupChildColumn::ChildId.eq(node.id))
            .all(db)
            .await?;
        for link in links {
            if !touched.contains(&link.markup_id) {
                touched.push(link.markup_id);
            }
            MarkupChild::delete_by_id(link.id).exec(db).await?;
        }
    }
    for markup_id in touched {
        let Some(markup) = Markup::find_by_id(markup_id).one(db).await? else {
            continue;
        };
        let remaining = child_nodes(db, markup_id).await?;
        if markup.unit == MarkupUnit::Percent && remaining.is_empty() {
            delete_row(db, ctx, &markup).await?;
            debug!(markup_id, budget_id, "pruned childless markup");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        create_test_account, create_test_budget, create_test_leaf, setup_test_db, test_ctx,
    };

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn percent_markup_on_the_root_contributes_through_its_accounts() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let parent = NodeRef::account(account.id);
        create_test_leaf(&db, &mut ctx, parent, 1.0, 10.0, 1.0)
            .await
            .unwrap();
        create_test_leaf(&db, &mut ctx, parent, 2.0, 50.0, 2.0)
            .await
            .unwrap();

        create_markup(
            &db,
            &mut ctx,
            ParentRef::budget(budget.id),
            CreateMarkup {
                rate: Some(0.5),
                unit: MarkupUnit::Percent,
                children: vec![account.id],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let budget = crate::store::budget::require_budget(&db, budget.id)
            .await
            .unwrap();
        assert!(close(budget.accumulated_markup_contribution, 105.0));
        let account = crate::store::account::require_account(&db, account.id)
            .await
            .unwrap();
        assert!(close(account.markup_contribution, 105.0));
    }

    #[tokio::test]
    async fn percent_markup_without_children_is_rejected() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();

        let err = create_markup(
            &db,
            &mut ctx,
            ParentRef::budget(budget.id),
            CreateMarkup {
                rate: Some(0.1),
                unit: MarkupUnit::Percent,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::FieldValidation { field, .. } if field == "children"));
    }

    #[tokio::test]
    async fn flat_markup_adds_its_rate_once_to_the_parent_bucket() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        create_markup(
            &db,
            &mut ctx,
            ParentRef::budget(budget.id),
            CreateMarkup {
                rate: Some(500.0),
                unit: MarkupUnit::Flat,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let budget = crate::store::budget::require_budget(&db, budget.id)
            .await
            .unwrap();
        assert!(close(budget.accumulated_markup_contribution, 500.0));
    }

    #[tokio::test]
    async fn markup_children_must_be_direct_children_of_its_parent() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let other = create_test_budget(&db, &mut ctx, "Other").await.unwrap();
        let foreign = create_test_account(&db, &mut ctx, other.id, "1000")
            .await
            .unwrap();

        // A budget-level markup only applies to that budget's own accounts
        let err = create_markup(
            &db,
            &mut ctx,
            ParentRef::budget(budget.id),
            CreateMarkup {
                rate: Some(0.2),
                unit: MarkupUnit::Percent,
                children: vec![foreign.id],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));

        // An account-level markup applies to direct subaccounts, not to
        // grandchildren further down the tree
        let middle =
            crate::test_utils::create_test_subaccount(&db, &mut ctx, NodeRef::account(account.id))
                .await
                .unwrap();
        let grandchild =
            create_test_leaf(&db, &mut ctx, NodeRef::subaccount(middle.id), 1.0, 5.0, 1.0)
                .await
                .unwrap();
        let err = create_markup(
            &db,
            &mut ctx,
            ParentRef::account(account.id),
            CreateMarkup {
                rate: Some(0.2),
                unit: MarkupUnit::Percent,
                children: vec![grandchild.id],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
    }

    #[tokio::test]
    async fn deleting_the_last_child_prunes_a_percent_markup() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let parent = NodeRef::account(account.id);
        let leaf = create_test_leaf(&db, &mut ctx, parent, 1.0, 100.0, 1.0)
            .await
            .unwrap();
        let markup = create_markup(
            &db,
            &mut ctx,
            ParentRef::account(account.id),
            CreateMarkup {
                rate: Some(0.1),
                unit: MarkupUnit::Percent,
                children: vec![leaf.id],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        crate::store::subaccount::delete_subaccount(&db, &mut ctx, leaf.id)
            .await
            .unwrap();

        assert!(require_markup(&db, markup.id).await.is_err());
        let budget = crate::store::budget::require_budget(&db, budget.id)
            .await
            .unwrap();
        assert!(close(budget.accumulated_markup_contribution, 0.0));
        assert!(close(budget.nominal_value, 0.0));
    }

    #[tokio::test]
    async fn switching_a_percent_markup_to_flat_clears_its_children() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let markup = create_markup(
            &db,
            &mut ctx,
            ParentRef::budget(budget.id),
            CreateMarkup {
                rate: Some(0.1),
                unit: MarkupUnit::Percent,
                children: vec![account.id],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        update_markup(
            &db,
            &mut ctx,
            markup.id,
            MarkupPatch {
                unit: Some(MarkupUnit::Flat),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(child_nodes(&db, markup.id).await.unwrap().is_empty());

        // Going back to percent needs an explicit child set
        let err = update_markup(
            &db,
            &mut ctx,
            markup.id,
            MarkupPatch {
                unit: Some(MarkupUnit::Percent),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::FieldValidation { field, .. } if field == "children"));
    }
}
