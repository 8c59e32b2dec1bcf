//! Group business logic - clustering sibling rows under a named header.
//!
//! A group on a budget clusters accounts; a group on an account or subaccount
//! clusters that row's child subaccounts. Membership lives on the member rows
//! (`group_id`), so moving a row between groups is a member update, and a
//! group whose last member leaves is pruned when the context flushes.

use crate::entities::{
    account, group, subaccount, Account, AccountColumn, EntityKind, Group, GroupColumn,
    GroupModel, ParentKind, ParentRef, Subaccount, SubaccountColumn,
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

/// Attributes for creating a group under a parent row.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroup {
    /// Display name
    pub name: String,
    /// Display color
    #[serde(default)]
    pub color: Option<String>,
    /// Sibling rows to pull into the group at creation
    #[serde(default)]
    pub children: Vec<i64>,
}

/// Partial update for a group.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupPatch {
    /// New display name
    pub name: Option<String>,
    /// New color; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub color: Option<Option<String>>,
    /// Replacement member set; rows absent from it leave the group
    pub children: Option<Vec<i64>>,
}

/// Finds a group by id or errors with `not_found`.
pub async fn require_group<C: ConnectionTrait>(db: &C, id: i64) -> Result<GroupModel> {
    Group::find_by_id(id)
        .one(db)
        .await?
        .ok_or(Error::NotFound { kind: "group", id })
}

/// Lists the groups under one parent row, in order-key order.
pub async fn get_groups_for_parent<C: ConnectionTrait>(
    db: &C,
    parent: ParentRef,
    query: &ListQuery,
) -> Result<Vec<GroupModel>> {
    let mut groups = Group::find()
        .filter(GroupColumn::ParentKind.eq(parent.kind))
        .filter(GroupColumn::ParentId.eq(parent.id))
        .order_by_asc(GroupColumn::Order)
        .all(db)
        .await?;
    groups.retain(|g| query.includes_id(g.id) && query.matches(&[Some(&g.name)]));
    Ok(groups)
}

/// Resolves the budget a parent row belongs to.
pub(crate) async fn budget_of_parent<C: ConnectionTrait>(db: &C, parent: ParentRef) -> Result<i64> {
    match parent.kind {
        ParentKind::Budget => {
            crate::store::budget::require_budget(db, parent.id).await?;
            Ok(parent.id)
        }
        ParentKind::Account => Ok(crate::store::account::require_account(db, parent.id)
            .await?
            .budget_id),
        ParentKind::Subaccount => Ok(crate::store::subaccount::require_subaccount(db, parent.id)
            .await?
            .budget_id),
    }
}

async fn next_order<C: ConnectionTrait>(db: &C, parent: ParentRef) -> Result<String> {
    let max = Group::find()
        .filter(GroupColumn::ParentKind.eq(parent.kind))
        .filter(GroupColumn::ParentId.eq(parent.id))
        .order_by_desc(GroupColumn::Order)
        .one(db)
        .await?
        .map(|g| g.order);
    ordering::midpoint(max.as_deref(), None)
}

/// Moves one member row into `group_id` (or out, when `None`), emitting the
/// membership change and a prune hint for the group it left.
async fn assign_member<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    group: &GroupModel,
    budget_id: i64,
    member_id: i64,
    group_id: Option<i64>,
) -> Result<()> {
    match group.parent_kind {
        ParentKind::Budget => {
            let row = crate::store::account::require_account(db, member_id).await?;
            if row.budget_id != group.parent_id {
                return Err(Error::Integrity {
                    message: format!("account {member_id} is not a sibling of group {}", group.id),
                });
            }
            if row.group_id == group_id {
                return Ok(());
            }
            account::ActiveModel {
                id: Unchanged(member_id),
                group_id: Set(group_id),
                ..Default::default()
            }
            .update(db)
            .await?;
            let mut event = SignalEvent::field_changed(
                EntityKind::Account,
                member_id,
                budget_id,
                "group",
                json!(row.group_id),
                json!(group_id),
            );
            if let Some(old) = row.group_id {
                event = event.with_group_hint(old);
            }
            ctx.emit(&event);
        }
        ParentKind::Account | ParentKind::Subaccount => {
            let row = crate::store::subaccount::require_subaccount(db, member_id).await?;
            let group_parent = ParentRef {
                kind: group.parent_kind,
                id: group.parent_id,
            };
            if ParentRef::from(row.parent()) != group_parent {
                return Err(Error::Integrity {
                    message: format!(
                        "subaccount {member_id} is not a sibling of group {}",
                        group.id
                    ),
                });
            }
            if row.group_id == group_id {
                return Ok(());
            }
            subaccount::ActiveModel {
                id: Unchanged(member_id),
                group_id: Set(group_id),
                ..Default::default()
            }
            .update(db)
            .await?;
            let mut event = SignalEvent::field_changed(
                EntityKind::Subaccount,
                member_id,
                budget_id,
                "group",
                json!(row.group_id),
                json!(group_id),
            );
            if let Some(old) = row.group_id {
                event = event.with_group_hint(old);
            }
            ctx.emit(&event);
        }
    }
    Ok(())
}

/// Creates a group inside a caller-owned transaction.
pub async fn create_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    parent: ParentRef,
    payload: CreateGroup,
) -> Result<GroupModel> {
    if payload.name.trim().is_empty() {
        return Err(Error::FieldValidation {
            field: "name".to_string(),
            message: "name may not be blank".to_string(),
        });
    }
    let budget_id = budget_of_parent(db, parent).await?;
    let order = next_order(db, parent).await?;

    let model = group::ActiveModel {
        parent_kind: Set(parent.kind),
        parent_id: Set(parent.id),
        name: Set(payload.name.trim().to_string()),
        color: Set(payload.color),
        order: Set(order),
        ..Default::default()
    }
    .insert(db)
    .await?;

    for member_id in payload.children {
        assign_member(db, ctx, &model, budget_id, member_id, Some(model.id)).await?;
    }

    ctx.emit(
        &SignalEvent::post_save(EntityKind::Group, model.id, budget_id, true)
            .with_parent(parent),
    );
    debug!(group_id = model.id, ?parent, "created group");
    Ok(model)
}

/// Creates a group in its own transaction.
pub async fn create_group(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    parent: ParentRef,
    payload: CreateGroup,
) -> Result<GroupModel> {
    let txn = db.begin().await?;
    let model = create_in(&txn, ctx, parent, payload).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Applies a partial update inside a caller-owned transaction. When `children`
/// is given it replaces the member set; a group left empty that way is pruned
/// at flush time.
pub async fn update_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    id: i64,
    patch: GroupPatch,
) -> Result<GroupModel> {
    let model = require_group(db, id).await?;
    let parent = ParentRef {
        kind: model.parent_kind,
        id: model.parent_id,
    };
    let budget_id = budget_of_parent(db, parent).await?;

    let mut am = group::ActiveModel {
        id: Unchanged(id),
        ..Default::default()
    };
    let mut changes: Vec<(&'static str, serde_json::Value, serde_json::Value)> = Vec::new();
    if let Some(name) = patch.name {
        if name.trim().is_empty() {
            return Err(Error::FieldValidation {
                field: "name".to_string(),
                message: "name may not be blank".to_string(),
            });
        }
        if name != model.name {
            changes.push(("name", json!(model.name), json!(name)));
            am.name = Set(name.trim().to_string());
        }
    }
    if let Some(color) = patch.color {
        if color != model.color {
            changes.push(("color", json!(model.color), json!(color)));
            am.color = Set(color);
        }
    }

    let updated = if changes.is_empty() {
        model.clone()
    } else {
        am.update(db).await?
    };

    let mut touched = !changes.is_empty();
    if let Some(children) = patch.children {
        let current = member_ids(db, &model).await?;
        for member_id in &children {
            assign_member(db, ctx, &model, budget_id, *member_id, Some(id)).await?;
        }
        for member_id in current {
            if !children.contains(&member_id) {
                assign_member(db, ctx, &model, budget_id, member_id, None).await?;
            }
        }
        touched = true;
        if children.is_empty() {
            // Replacement with an empty set leaves the group memberless
            ctx.emit(
                &SignalEvent::field_changed(
                    EntityKind::Group,
                    id,
                    budget_id,
                    "children",
                    json!(null),
                    json!([]),
                )
                .with_group_hint(id),
            );
        }
    }

    for (field, old, new) in changes {
        ctx.emit(&SignalEvent::field_changed(
            EntityKind::Group,
            id,
            budget_id,
            field,
            old,
            new,
        ));
    }
    if touched {
        ctx.emit(
            &SignalEvent::post_save(EntityKind::Group, id, budget_id, false).with_parent(parent),
        );
    }
    Ok(updated)
}

/// Applies a partial update in its own transaction.
pub async fn update_group(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    id: i64,
    patch: GroupPatch,
) -> Result<GroupModel> {
    let txn = db.begin().await?;
    let model = update_in(&txn, ctx, id, patch).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Deletes a group inside a caller-owned transaction. Members survive with
/// their `group_id` cleared; no calculated value changes.
pub async fn delete_in<C: ConnectionTrait>(db: &C, ctx: &mut Ctx, id: i64) -> Result<()> {
    let model = require_group(db, id).await?;
    let parent = ParentRef {
        kind: model.parent_kind,
        id: model.parent_id,
    };
    let budget_id = budget_of_parent(db, parent).await?;

    ctx.emit(&SignalEvent::pre_delete(EntityKind::Group, id, budget_id));
    match model.parent_kind {
        ParentKind::Budget => {
            Account::update_many()
                .col_expr(AccountColumn::GroupId, sea_orm::sea_query::Expr::value(Option::<i64>::None))
                .filter(AccountColumn::GroupId.eq(id))
                .exec(db)
                .await?;
        }
        ParentKind::Account | ParentKind::Subaccount => {
            Subaccount::update_many()
                .col_expr(
                    SubaccountColumn::GroupId,
                    sea_orm::sea_query::Expr::value(Option::<i64>::None),
                )
                .filter(SubaccountColumn::GroupId.eq(id))
                .exec(db)
                .await?;
        }
    }
    Group::delete_by_id(id).exec(db).await?;
    ctx.emit(&SignalEvent::post_delete(EntityKind::Group, id, budget_id).with_parent(parent));
    debug!(group_id = id, "deleted group");
    Ok(())
}

/// Deletes a group in its own transaction.
pub async fn delete_group(db: &DatabaseConnection, ctx: &mut Ctx, id: i64) -> Result<()> {
    let txn = db.begin().await?;
    delete_in(&txn, ctx, id).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(())
}

async fn member_ids<C: ConnectionTrait>(db: &C, group: &GroupModel) -> Result<Vec<i64>> {
    match group.parent_kind {
        ParentKind::Budget => Ok(Account::find()
            .filter(AccountColumn::GroupId.eq(group.id))
            .all(db)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect()),
        ParentKind::Account | ParentKind::Subaccount => Ok(Subaccount::find()
            .filter(SubaccountColumn::GroupId.eq(group.id))
            .all(db)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect()),
    }
}

/// Deletes the group when it has no members left. Returns whether it pruned.
/// A group already deleted by other means counts as not pruned.
pub async fn prune_if_empty<C: ConnectionTrait>(db: &C, group_id: i64) -> Result<bool> {
    let Some(group) = Group::find_by_id(group_id).one(db).await? else {
        return Ok(false);
    };
    if member_ids(db, &group).await?.is_empty() {
        Group::delete_by_id(group_id).exec(db).await?;
        debug!(group_id, "pruned empty group");
        return Ok(true);
    }
    Ok(false)
}
