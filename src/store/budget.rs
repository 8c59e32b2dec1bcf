//! Budget business logic - create, update, delete and list budget roots.
//!
//! Budgets and templates share one table, discriminated by `kind`. Community
//! and hidden flags only make sense for templates and are permission-guarded;
//! deleting a budget cascades over every descendant row.

use crate::entities::{
    budget, Account, AccountColumn, Actual, ActualColumn, Budget, BudgetColumn, BudgetKind,
    BudgetModel, Collaborator, CollaboratorColumn, EntityKind, Event, EventColumn, Fringe,
    FringeColumn, Group, GroupColumn, Markup, MarkupChild, MarkupChildColumn, MarkupColumn,
    ParentKind, Subaccount, SubaccountColumn, SubaccountFringe, SubaccountFringeColumn,
};
use crate::errors::{Error, Result};
use crate::signals::{Ctx, SignalEvent};
use crate::store::ListQuery;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait, Unchanged,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Attributes for creating a budget or template.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBudget {
    /// Budget or template
    #[serde(default = "default_kind")]
    pub kind: BudgetKind,
    /// Display name
    pub name: String,
    /// Optional cover image reference
    #[serde(default)]
    pub image: Option<String>,
    /// Community flag; templates only, staff only
    #[serde(default)]
    pub is_community: bool,
}

const fn default_kind() -> BudgetKind {
    BudgetKind::Budget
}

/// Partial update for a budget root.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BudgetPatch {
    /// New display name
    pub name: Option<String>,
    /// New image reference; explicit null clears it
    #[serde(default, deserialize_with = "crate::store::double_option")]
    pub image: Option<Option<String>>,
    /// Archive toggle
    pub is_archived: Option<bool>,
    /// Community toggle; templates only, staff only
    pub is_community: Option<bool>,
    /// Hidden toggle; community templates only
    pub is_hidden: Option<bool>,
}

/// Finds a budget by id.
pub async fn get_budget_by_id<C: ConnectionTrait>(
    db: &C,
    id: i64,
) -> Result<Option<BudgetModel>> {
    Budget::find_by_id(id).one(db).await.map_err(Into::into)
}

/// Finds a budget by id or errors with `not_found`.
pub async fn require_budget<C: ConnectionTrait>(db: &C, id: i64) -> Result<BudgetModel> {
    get_budget_by_id(db, id)
        .await?
        .ok_or(Error::NotFound { kind: "budget", id })
}

/// Lists the budgets of one kind visible to a user: their own plus (in the
/// budget domain) budgets shared with them through collaborator grants.
/// Archived budgets are excluded unless requested.
pub async fn get_budgets_for_user<C: ConnectionTrait>(
    db: &C,
    user_id: i64,
    kind: BudgetKind,
    include_archived: bool,
    query: &ListQuery,
) -> Result<Vec<BudgetModel>> {
    let mut own = Budget::find()
        .filter(BudgetColumn::Kind.eq(kind))
        .filter(BudgetColumn::CreatedBy.eq(user_id))
        .order_by_desc(BudgetColumn::UpdatedAt)
        .all(db)
        .await?;

    if kind == BudgetKind::Budget {
        let shared_ids: Vec<i64> = Collaborator::find()
            .filter(CollaboratorColumn::UserId.eq(user_id))
            .all(db)
            .await?
            .into_iter()
            .map(|c| c.budget_id)
            .collect();
        if !shared_ids.is_empty() {
            let shared = Budget::find()
                .filter(BudgetColumn::Kind.eq(kind))
                .filter(BudgetColumn::Id.is_in(shared_ids))
                .all(db)
                .await?;
            own.extend(shared);
        }
    }

    own.retain(|b| {
        (include_archived || !b.is_archived)
            && query.includes_id(b.id)
            && query.matches(&[Some(&b.name)])
    });
    Ok(own)
}

/// Lists community templates; hidden ones are visible to staff only.
pub async fn get_community_templates<C: ConnectionTrait>(
    db: &C,
    is_staff: bool,
    query: &ListQuery,
) -> Result<Vec<BudgetModel>> {
    let mut templates = Budget::find()
        .filter(BudgetColumn::Kind.eq(BudgetKind::Template))
        .filter(BudgetColumn::IsCommunity.eq(true))
        .order_by_desc(BudgetColumn::UpdatedAt)
        .all(db)
        .await?;
    templates.retain(|t| {
        (is_staff || !t.is_hidden) && query.includes_id(t.id) && query.matches(&[Some(&t.name)])
    });
    Ok(templates)
}

/// Creates a budget root inside a caller-owned transaction.
pub async fn create_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    payload: CreateBudget,
) -> Result<BudgetModel> {
    if payload.name.trim().is_empty() {
        return Err(Error::FieldValidation {
            field: "name".to_string(),
            message: "name may not be blank".to_string(),
        });
    }
    if payload.is_community {
        if payload.kind != BudgetKind::Template {
            return Err(Error::BadRequest {
                message: "only templates can be community".to_string(),
            });
        }
        if !ctx.is_staff {
            return Err(Error::Permission {
                message: "staff privilege required for community templates".to_string(),
                force_logout: false,
            });
        }
    }

    let now = chrono::Utc::now();
    let model = budget::ActiveModel {
        kind: Set(payload.kind),
        name: Set(payload.name.trim().to_string()),
        image: Set(payload.image),
        is_community: Set(payload.is_community),
        is_hidden: Set(false),
        is_archived: Set(false),
        created_by: Set(ctx.user_id),
        updated_by: Set(ctx.user_id),
        created_at: Set(now),
        updated_at: Set(now),
        nominal_value: Set(0.0),
        accumulated_fringe_contribution: Set(0.0),
        accumulated_markup_contribution: Set(0.0),
        actual: Set(0.0),
        ..Default::default()
    }
    .insert(db)
    .await?;

    ctx.emit(&SignalEvent::post_save(
        EntityKind::Budget,
        model.id,
        model.id,
        true,
    ));
    debug!(budget_id = model.id, kind = ?model.kind, "created budget");
    Ok(model)
}

/// Creates a budget root in its own transaction and runs the deferred work.
pub async fn create_budget(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    payload: CreateBudget,
) -> Result<BudgetModel> {
    let txn = db.begin().await?;
    let model = create_in(&txn, ctx, payload).await?;
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
    patch: BudgetPatch,
) -> Result<BudgetModel> {
    let model = require_budget(db, id).await?;

    let mut am = budget::ActiveModel {
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
    if let Some(image) = patch.image {
        if image != model.image {
            changes.push(("image", json!(model.image), json!(image)));
            am.image = Set(image);
        }
    }

    let community = patch.is_community.unwrap_or(model.is_community);
    if community != model.is_community {
        if model.kind != BudgetKind::Template {
            return Err(Error::BadRequest {
                message: "only templates can be community".to_string(),
            });
        }
        if !ctx.is_staff {
            return Err(Error::Permission {
                message: "staff privilege required for community templates".to_string(),
                force_logout: false,
            });
        }
        changes.push(("is_community", json!(model.is_community), json!(community)));
        am.is_community = Set(community);
    }
    if let Some(hidden) = patch.is_hidden {
        if hidden != model.is_hidden {
            if !community || model.kind != BudgetKind::Template {
                return Err(Error::BadRequest {
                    message: "only community templates can be hidden".to_string(),
                });
            }
            changes.push(("is_hidden", json!(model.is_hidden), json!(hidden)));
            am.is_hidden = Set(hidden);
        }
    }
    if let Some(archived) = patch.is_archived {
        if archived != model.is_archived {
            changes.push(("is_archived", json!(model.is_archived), json!(archived)));
            am.is_archived = Set(archived);
        }
    }

    if changes.is_empty() {
        return Ok(model);
    }
    am.updated_by = Set(ctx.user_id);
    am.updated_at = Set(chrono::Utc::now());
    let updated = am.update(db).await?;

    for (field, old, new) in changes {
        ctx.emit(&SignalEvent::field_changed(
            EntityKind::Budget,
            id,
            id,
            field,
            old,
            new,
        ));
    }
    ctx.emit(&SignalEvent::post_save(EntityKind::Budget, id, id, false));
    Ok(updated)
}

/// Applies a partial update in its own transaction.
pub async fn update_budget(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    id: i64,
    patch: BudgetPatch,
) -> Result<BudgetModel> {
    let txn = db.begin().await?;
    let model = update_in(&txn, ctx, id, patch).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Deletes a budget and every descendant row inside a caller-owned
/// transaction.
pub async fn delete_in<C: ConnectionTrait>(db: &C, ctx: &mut Ctx, id: i64) -> Result<()> {
    let model = require_budget(db, id).await?;
    ctx.emit(&SignalEvent::pre_delete(EntityKind::Budget, id, id));

    let account_ids: Vec<i64> = Account::find()
        .filter(AccountColumn::BudgetId.eq(id))
        .all(db)
        .await?
        .into_iter()
        .map(|a| a.id)
        .collect();
    let subaccount_ids: Vec<i64> = Subaccount::find()
        .filter(SubaccountColumn::BudgetId.eq(id))
        .all(db)
        .await?
        .into_iter()
        .map(|s| s.id)
        .collect();
    let markup_ids: Vec<i64> = Markup::find()
        .filter(MarkupColumn::BudgetId.eq(id))
        .all(db)
        .await?
        .into_iter()
        .map(|m| m.id)
        .collect();

    if !subaccount_ids.is_empty() {
        SubaccountFringe::delete_many()
            .filter(SubaccountFringeColumn::SubaccountId.is_in(subaccount_ids.clone()))
            .exec(db)
            .await?;
    }
    if !markup_ids.is_empty() {
        MarkupChild::delete_many()
            .filter(MarkupChildColumn::MarkupId.is_in(markup_ids))
            .exec(db)
            .await?;
    }
    // Groups hang off the budget root or off rows inside it
    Group::delete_many()
        .filter(
            GroupColumn::ParentKind
                .eq(ParentKind::Budget)
                .and(GroupColumn::ParentId.eq(id)),
        )
        .exec(db)
        .await?;
    if !account_ids.is_empty() {
        Group::delete_many()
            .filter(
                GroupColumn::ParentKind
                    .eq(ParentKind::Account)
                    .and(GroupColumn::ParentId.is_in(account_ids)),
            )
            .exec(db)
            .await?;
    }
    if !subaccount_ids.is_empty() {
        Group::delete_many()
            .filter(
                GroupColumn::ParentKind
                    .eq(ParentKind::Subaccount)
                    .and(GroupColumn::ParentId.is_in(subaccount_ids)),
            )
            .exec(db)
            .await?;
    }

    Actual::delete_many()
        .filter(ActualColumn::BudgetId.eq(id))
        .exec(db)
        .await?;
    Markup::delete_many()
        .filter(MarkupColumn::BudgetId.eq(id))
        .exec(db)
        .await?;
    Subaccount::delete_many()
        .filter(SubaccountColumn::BudgetId.eq(id))
        .exec(db)
        .await?;
    Account::delete_many()
        .filter(AccountColumn::BudgetId.eq(id))
        .exec(db)
        .await?;
    Fringe::delete_many()
        .filter(FringeColumn::BudgetId.eq(id))
        .exec(db)
        .await?;
    Collaborator::delete_many()
        .filter(CollaboratorColumn::BudgetId.eq(id))
        .exec(db)
        .await?;
    Event::delete_many()
        .filter(EventColumn::BudgetId.eq(id))
        .exec(db)
        .await?;
    Budget::delete_by_id(id).exec(db).await?;

    ctx.emit(&SignalEvent::post_delete(EntityKind::Budget, id, id));
    debug!(budget_id = id, name = %model.name, "deleted budget tree");
    Ok(())
}

/// Deletes a budget tree in its own transaction.
pub async fn delete_budget(db: &DatabaseConnection, ctx: &mut Ctx, id: i64) -> Result<()> {
    let txn = db.begin().await?;
    delete_in(&txn, ctx, id).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(())
}
