//! Subaccount business logic - the recursive line items of the budget tree.
//!
//! A subaccount hangs off an account or another subaccount. Rows with no
//! children are leaves and derive their value from `quantity × rate ×
//! multiplier`; rows with children aggregate them and their own estimate
//! fields go dormant. Fringes attach through a join table and only apply at
//! leaves.

use crate::entities::{
    subaccount, Actual, ActualColumn, BudgetKind, EntityKind, Fringe, FringeColumn, Group,
    GroupColumn, NodeKind, NodeRef, OwnerKind, ParentKind, ParentRef, Subaccount,
    SubaccountColumn, SubaccountFringe, SubaccountFringeColumn, SubaccountModel,
    subaccount_fringe,
};
use crate::errors::{Error, Result};
use crate::ordering;
use crate::signals::{Ctx, SignalEvent};
use crate::store::{order_with_groups, ListQuery};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, sea_query::Expr, Set, TransactionTrait, Unchanged,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Attributes for creating a subaccount row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSubaccount {
    /// User-facing line number
    #[serde(default)]
    pub identifier: Option<String>,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Estimate: quantity (null acts as 1)
    #[serde(default)]
    pub quantity: Option<f64>,
    /// Estimate: rate (null acts as 0)
    #[serde(default)]
    pub rate: Option<f64>,
    /// Estimate: multiplier (null acts as 1)
    #[serde(default)]
    pub multiplier: Option<f64>,
    /// Display unit label
    #[serde(default)]
    pub unit: Option<String>,
    /// Linked contact; budget domain only
    #[serde(default)]
    pub contact: Option<i64>,
    /// Group to cluster the row under
    #[serde(default)]
    pub group: Option<i64>,
    /// Fringes to apply, by id
    #[serde(default)]
    pub fringes: Vec<i64>,
}

/// Partial update for a subaccount row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubaccountPatch {
    /// New line number; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub identifier: Option<Option<String>>,
    /// New description; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub description: Option<Option<String>>,
    /// New quantity; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub quantity: Option<Option<f64>>,
    /// New rate; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub rate: Option<Option<f64>>,
    /// New multiplier; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub multiplier: Option<Option<f64>>,
    /// New unit label; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub unit: Option<Option<String>>,
    /// New contact; explicit null clears it; budget domain only
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub contact: Option<Option<i64>>,
    /// New group; explicit null ungroups the row
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub group: Option<Option<i64>>,
    /// Replacement fringe set
    pub fringes: Option<Vec<i64>>,
    /// Reorder target: the sibling to place this row after, or null for the
    /// top of the table
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub previous: Option<Option<i64>>,
}

/// Finds a subaccount by id or errors with `not_found`.
pub async fn require_subaccount<C: ConnectionTrait>(db: &C, id: i64) -> Result<SubaccountModel> {
    Subaccount::find_by_id(id)
        .one(db)
        .await?
        .ok_or(Error::NotFound {
            kind: "subaccount",
            id,
        })
}

/// Lists a node's child subaccounts in presentation order.
pub async fn get_subaccounts_for_parent<C: ConnectionTrait>(
    db: &C,
    parent: NodeRef,
    query: &ListQuery,
) -> Result<Vec<SubaccountModel>> {
    let mut rows = Subaccount::find()
        .filter(SubaccountColumn::ParentKind.eq(parent.kind))
        .filter(SubaccountColumn::ParentId.eq(parent.id))
        .order_by_asc(SubaccountColumn::Order)
        .all(db)
        .await?;
    rows.retain(|s| {
        query.includes_id(s.id)
            && query.matches(&[s.identifier.as_deref(), s.description.as_deref()])
    });
    order_with_groups(
        rows,
        |s| (s.parent_kind, s.parent_id),
        |s| &s.order,
        |s| s.group_id,
    )
}

/// The fringe ids currently applied to a subaccount.
pub async fn fringe_ids<C: ConnectionTrait>(db: &C, subaccount_id: i64) -> Result<Vec<i64>> {
    Ok(SubaccountFringe::find()
        .filter(SubaccountFringeColumn::SubaccountId.eq(subaccount_id))
        .all(db)
        .await?
        .into_iter()
        .map(|j| j.fringe_id)
        .collect())
}

/// Resolves the budget a node belongs to, checking the node exists.
pub(crate) async fn budget_of_node<C: ConnectionTrait>(db: &C, node: NodeRef) -> Result<i64> {
    match node.kind {
        NodeKind::Account => Ok(crate::store::account::require_account(db, node.id)
            .await?
            .budget_id),
        NodeKind::Subaccount => Ok(require_subaccount(db, node.id).await?.budget_id),
    }
}

async fn validate_contact<C: ConnectionTrait>(db: &C, budget_id: i64) -> Result<()> {
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if budget.kind != BudgetKind::Budget {
        return Err(Error::FieldValidation {
            field: "contact".to_string(),
            message: "contacts are not available on templates".to_string(),
        });
    }
    Ok(())
}

async fn validate_group<C: ConnectionTrait>(db: &C, parent: NodeRef, group_id: i64) -> Result<()> {
    let group = crate::store::group::require_group(db, group_id).await?;
    let actual = ParentRef {
        kind: group.parent_kind,
        id: group.parent_id,
    };
    if actual != ParentRef::from(parent) {
        return Err(Error::Integrity {
            message: format!("group {group_id} does not cluster children of {parent:?}"),
        });
    }
    Ok(())
}

async fn validate_fringes<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
    fringe_ids: &[i64],
) -> Result<()> {
    if fringe_ids.is_empty() {
        return Ok(());
    }
    let found = Fringe::find()
        .filter(FringeColumn::Id.is_in(fringe_ids.to_vec()))
        .filter(FringeColumn::BudgetId.eq(budget_id))
        .all(db)
        .await?;
    if found.len() != fringe_ids.len() {
        return Err(Error::Integrity {
            message: format!("fringe set contains rows outside budget {budget_id}"),
        });
    }
    Ok(())
}

async fn next_order<C: ConnectionTrait>(db: &C, parent: NodeRef) -> Result<String> {
    let max = Subaccount::find()
        .filter(SubaccountColumn::ParentKind.eq(parent.kind))
        .filter(SubaccountColumn::ParentId.eq(parent.id))
        .order_by_desc(SubaccountColumn::Order)
        .one(db)
        .await?
        .map(|s| s.order);
    ordering::midpoint(max.as_deref(), None)
}

/// Replaces the join rows linking a subaccount to its fringes.
async fn replace_fringes<C: ConnectionTrait>(
    db: &C,
    subaccount_id: i64,
    fringe_ids: &[i64],
) -> Result<()> {
    SubaccountFringe::delete_many()
        .filter(SubaccountFringeColumn::SubaccountId.eq(subaccount_id))
        .exec(db)
        .await?;
    for fringe_id in fringe_ids {
        subaccount_fringe::ActiveModel {
            subaccount_id: Set(subaccount_id),
            fringe_id: Set(*fringe_id),
            ..Default::default()
        }
        .insert(db)
        .await?;
    }
    Ok(())
}

/// Creates a subaccount under `parent` inside a caller-owned transaction.
pub async fn create_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    parent: NodeRef,
    payload: CreateSubaccount,
) -> Result<SubaccountModel> {
    let budget_id = budget_of_node(db, parent).await?;
    if payload.contact.is_some() {
        validate_contact(db, budget_id).await?;
    }
    if let Some(group_id) = payload.group {
        validate_group(db, parent, group_id).await?;
    }
    validate_fringes(db, budget_id, &payload.fringes).await?;
    let order = next_order(db, parent).await?;

    let model = subaccount::ActiveModel {
        budget_id: Set(budget_id),
        parent_kind: Set(parent.kind),
        parent_id: Set(parent.id),
        identifier: Set(payload.identifier),
        description: Set(payload.description),
        quantity: Set(payload.quantity),
        rate: Set(payload.rate),
        multiplier: Set(payload.multiplier),
        unit: Set(payload.unit),
        contact: Set(payload.contact),
        group_id: Set(payload.group),
        order: Set(order),
        nominal_value: Set(0.0),
        fringe_contribution: Set(0.0),
        markup_contribution: Set(0.0),
        accumulated_fringe_contribution: Set(0.0),
        accumulated_markup_contribution: Set(0.0),
        accumulated_value: Set(0.0),
        actual: Set(0.0),
        ..Default::default()
    }
    .insert(db)
    .await?;

    if !payload.fringes.is_empty() {
        replace_fringes(db, model.id, &payload.fringes).await?;
    }

    // A row gaining its first child stops being a leaf; its own estimate
    // fields are cleared rather than left dormant
    if parent.kind == NodeKind::Subaccount {
        let parent_row = require_subaccount(db, parent.id).await?;
        if parent_row.quantity.is_some()
            || parent_row.rate.is_some()
            || parent_row.multiplier.is_some()
            || parent_row.unit.is_some()
        {
            subaccount::ActiveModel {
                id: Unchanged(parent.id),
                quantity: Set(None),
                rate: Set(None),
                multiplier: Set(None),
                unit: Set(None),
                ..Default::default()
            }
            .update(db)
            .await?;
        }
    }

    ctx.emit(
        &SignalEvent::post_save(EntityKind::Subaccount, model.id, budget_id, true)
            .with_parent(ParentRef::from(parent))
            .with_affected(vec![NodeRef::subaccount(model.id), parent]),
    );
    debug!(subaccount_id = model.id, ?parent, "created subaccount");
    Ok(model)
}

/// Creates a subaccount in its own transaction.
pub async fn create_subaccount(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    parent: NodeRef,
    payload: CreateSubaccount,
) -> Result<SubaccountModel> {
    let txn = db.begin().await?;
    let model = create_in(&txn, ctx, parent, payload).await?;
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
    patch: SubaccountPatch,
) -> Result<SubaccountModel> {
    let model = require_subaccount(db, id).await?;
    let budget_id = model.budget_id;
    let parent = model.parent();

    let mut am = subaccount::ActiveModel {
        id: Unchanged(id),
        ..Default::default()
    };
    let mut changes: Vec<(&'static str, serde_json::Value, serde_json::Value)> = Vec::new();
    let mut group_hint: Option<i64> = None;

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
    if let Some(quantity) = patch.quantity {
        if quantity != model.quantity {
            changes.push(("quantity", json!(model.quantity), json!(quantity)));
            am.quantity = Set(quantity);
        }
    }
    if let Some(rate) = patch.rate {
        if rate != model.rate {
            changes.push(("rate", json!(model.rate), json!(rate)));
            am.rate = Set(rate);
        }
    }
    if let Some(multiplier) = patch.multiplier {
        if multiplier != model.multiplier {
            changes.push(("multiplier", json!(model.multiplier), json!(multiplier)));
            am.multiplier = Set(multiplier);
        }
    }
    if let Some(unit) = patch.unit {
        if unit != model.unit {
            changes.push(("unit", json!(model.unit), json!(unit)));
            am.unit = Set(unit);
        }
    }
    if let Some(contact) = patch.contact {
        if contact != model.contact {
            if contact.is_some() {
                validate_contact(db, budget_id).await?;
            }
            changes.push(("contact", json!(model.contact), json!(contact)));
            am.contact = Set(contact);
        }
    }
    if let Some(group) = patch.group {
        if group != model.group_id {
            if let Some(group_id) = group {
                validate_group(db, parent, group_id).await?;
            }
            changes.push(("group", json!(model.group_id), json!(group)));
            group_hint = model.group_id;
            am.group_id = Set(group);
        }
    }
    if let Some(previous) = patch.previous {
        let siblings: Vec<(i64, String)> = Subaccount::find()
            .filter(SubaccountColumn::ParentKind.eq(parent.kind))
            .filter(SubaccountColumn::ParentId.eq(parent.id))
            .filter(SubaccountColumn::Id.ne(id))
            .order_by_asc(SubaccountColumn::Order)
            .all(db)
            .await?
            .into_iter()
            .map(|s| (s.id, s.order))
            .collect();
        let order = crate::store::account::reorder_key(&siblings, previous)?;
        if order != model.order {
            changes.push(("order", json!(model.order), json!(order)));
            am.order = Set(order);
        }
    }

    let fringes_changed = if let Some(fringes) = &patch.fringes {
        let mut current = fringe_ids(db, id).await?;
        current.sort_unstable();
        let mut wanted = fringes.clone();
        wanted.sort_unstable();
        wanted != current
    } else {
        false
    };

    if changes.is_empty() && !fringes_changed {
        return Ok(model);
    }

    let updated = if changes.is_empty() {
        model
    } else {
        am.update(db).await?
    };

    if fringes_changed {
        let fringes = patch.fringes.as_deref().unwrap_or_default();
        validate_fringes(db, budget_id, fringes).await?;
        replace_fringes(db, id, fringes).await?;
        ctx.emit(
            &SignalEvent::m2m_changed(EntityKind::Subaccount, id, budget_id)
                .with_parent(ParentRef::from(parent))
                .with_affected(vec![NodeRef::subaccount(id)]),
        );
    }

    for (field, old, new) in changes {
        let mut event =
            SignalEvent::field_changed(EntityKind::Subaccount, id, budget_id, field, old, new)
                .with_affected(vec![NodeRef::subaccount(id)]);
        if field == "group" {
            if let Some(old_group) = group_hint {
                event = event.with_group_hint(old_group);
            }
        }
        ctx.emit(&event);
    }
    ctx.emit(
        &SignalEvent::post_save(EntityKind::Subaccount, id, budget_id, false)
            .with_parent(ParentRef::from(parent)),
    );
    Ok(updated)
}

/// Applies a partial update in its own transaction.
pub async fn update_subaccount(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    id: i64,
    patch: SubaccountPatch,
) -> Result<SubaccountModel> {
    let txn = db.begin().await?;
    let model = update_in(&txn, ctx, id, patch).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Collects every subaccount id strictly below the given roots, walking the
/// tree level by level.
pub(crate) async fn collect_descendants<C: ConnectionTrait>(
    db: &C,
    roots: &[NodeRef],
) -> Result<Vec<i64>> {
    let mut out: Vec<i64> = Vec::new();
    let mut frontier: Vec<NodeRef> = roots.to_vec();
    while !frontier.is_empty() {
        let mut next: Vec<NodeRef> = Vec::new();
        for node in frontier {
            let children = Subaccount::find()
                .filter(SubaccountColumn::ParentKind.eq(node.kind))
                .filter(SubaccountColumn::ParentId.eq(node.id))
                .all(db)
                .await?;
            for child in children {
                out.push(child.id);
                next.push(NodeRef::subaccount(child.id));
            }
        }
        frontier = next;
    }
    Ok(out)
}

/// Removes subaccount rows and everything that references them: fringe joins,
/// markup child links (pruning markups left childless), groups hung off them,
/// and actual ownership (the actuals themselves survive on the budget).
pub(crate) async fn purge_subaccounts<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    ids: &[i64],
    budget_id: i64,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    SubaccountFringe::delete_many()
        .filter(SubaccountFringeColumn::SubaccountId.is_in(ids.to_vec()))
        .exec(db)
        .await?;
    Actual::update_many()
        .col_expr(ActualColumn::OwnerKind, Expr::value(Option::<OwnerKind>::None))
        .col_expr(ActualColumn::OwnerId, Expr::value(Option::<i64>::None))
        .filter(ActualColumn::OwnerKind.eq(OwnerKind::Subaccount))
        .filter(ActualColumn::OwnerId.is_in(ids.to_vec()))
        .exec(db)
        .await?;
    let nodes: Vec<NodeRef> = ids.iter().map(|id| NodeRef::subaccount(*id)).collect();
    crate::store::markup::detach_children(db, ctx, &nodes, budget_id).await?;
    Group::delete_many()
        .filter(GroupColumn::ParentKind.eq(ParentKind::Subaccount))
        .filter(GroupColumn::ParentId.is_in(ids.to_vec()))
        .exec(db)
        .await?;
    Subaccount::delete_many()
        .filter(SubaccountColumn::Id.is_in(ids.to_vec()))
        .exec(db)
        .await?;
    Ok(())
}

/// Deletes a subaccount and its subtree inside a caller-owned transaction.
/// The parent node's aggregates are marked dirty; the row's group gets a prune
/// check.
pub async fn delete_in<C: ConnectionTrait>(db: &C, ctx: &mut Ctx, id: i64) -> Result<()> {
    let model = require_subaccount(db, id).await?;
    let budget_id = model.budget_id;
    let parent = model.parent();

    ctx.emit(&SignalEvent::pre_delete(EntityKind::Subaccount, id, budget_id));

    let mut subtree = collect_descendants(db, &[NodeRef::subaccount(id)]).await?;
    subtree.push(id);
    purge_subaccounts(db, ctx, &subtree, budget_id).await?;

    let mut event = SignalEvent::post_delete(EntityKind::Subaccount, id, budget_id)
        .with_parent(ParentRef::from(parent))
        .with_affected(vec![parent]);
    if let Some(group_id) = model.group_id {
        event = event.with_group_hint(group_id);
    }
    ctx.emit(&event);
    debug!(subaccount_id = id, budget_id, "deleted subaccount subtree");
    Ok(())
}

/// Deletes a subaccount subtree in its own transaction.
pub async fn delete_subaccount(db: &DatabaseConnection, ctx: &mut Ctx, id: i64) -> Result<()> {
    let txn = db.begin().await?;
    delete_in(&txn, ctx, id).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(())
}
