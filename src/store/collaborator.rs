//! Collaborator business logic - per-budget access grants.
//!
//! Collaboration exists in the budget domain only. The budget's creator is
//! its implicit owner and never appears as a collaborator row; everyone else
//! gets an explicit grant with one of three access levels.

use crate::entities::{
    collaborator, AccessType, BudgetKind, Collaborator, CollaboratorColumn, CollaboratorModel,
    EntityKind,
};
use crate::errors::{Error, Result};
use crate::signals::{Ctx, SignalEvent};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait, Unchanged,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Attributes for granting a user access to a budget.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCollaborator {
    /// User receiving access
    pub user_id: i64,
    /// Access level granted
    pub access_type: AccessType,
}

/// Partial update for a collaborator grant.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollaboratorPatch {
    /// New access level
    pub access_type: Option<AccessType>,
}

/// Finds a collaborator grant by id or errors with `not_found`.
pub async fn require_collaborator<C: ConnectionTrait>(
    db: &C,
    id: i64,
) -> Result<CollaboratorModel> {
    Collaborator::find_by_id(id)
        .one(db)
        .await?
        .ok_or(Error::NotFound {
            kind: "collaborator",
            id,
        })
}

/// Lists a budget's collaborator grants.
pub async fn get_collaborators_for_budget<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
) -> Result<Vec<CollaboratorModel>> {
    Collaborator::find()
        .filter(CollaboratorColumn::BudgetId.eq(budget_id))
        .order_by_asc(CollaboratorColumn::CreatedAt)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Resolves a user's access to a budget: the creator is its owner, everyone
/// else needs a grant.
pub async fn access_for<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
    user_id: i64,
) -> Result<Option<AccessType>> {
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if budget.created_by == user_id {
        return Ok(Some(AccessType::Owner));
    }
    Ok(Collaborator::find()
        .filter(CollaboratorColumn::BudgetId.eq(budget_id))
        .filter(CollaboratorColumn::UserId.eq(user_id))
        .one(db)
        .await?
        .map(|c| c.access_type))
}

/// Grants access inside a caller-owned transaction.
pub async fn create_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    budget_id: i64,
    payload: CreateCollaborator,
) -> Result<CollaboratorModel> {
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if budget.kind != BudgetKind::Budget {
        return Err(Error::BadRequest {
            message: "templates cannot be shared".to_string(),
        });
    }
    if payload.user_id == budget.created_by {
        return Err(Error::BadRequest {
            message: "the budget's creator already owns it".to_string(),
        });
    }
    let existing = Collaborator::find()
        .filter(CollaboratorColumn::BudgetId.eq(budget_id))
        .filter(CollaboratorColumn::UserId.eq(payload.user_id))
        .one(db)
        .await?;
    if existing.is_some() {
        return Err(Error::Conflict {
            message: format!("user {} already collaborates on this budget", payload.user_id),
        });
    }

    let now = chrono::Utc::now();
    let model = collaborator::ActiveModel {
        budget_id: Set(budget_id),
        user_id: Set(payload.user_id),
        access_type: Set(payload.access_type),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;

    ctx.emit(&SignalEvent::post_save(
        EntityKind::Collaborator,
        model.id,
        budget_id,
        true,
    ));
    debug!(collaborator_id = model.id, budget_id, user_id = model.user_id, "granted access");
    Ok(model)
}

/// Grants access in its own transaction.
pub async fn create_collaborator(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    payload: CreateCollaborator,
) -> Result<CollaboratorModel> {
    let txn = db.begin().await?;
    let model = create_in(&txn, ctx, budget_id, payload).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Changes a grant's access level inside a caller-owned transaction.
pub async fn update_in<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    id: i64,
    patch: CollaboratorPatch,
) -> Result<CollaboratorModel> {
    let model = require_collaborator(db, id).await?;
    let Some(access_type) = patch.access_type else {
        return Ok(model);
    };
    if access_type == model.access_type {
        return Ok(model);
    }

    let updated = collaborator::ActiveModel {
        id: Unchanged(id),
        access_type: Set(access_type),
        updated_at: Set(chrono::Utc::now()),
        ..Default::default()
    }
    .update(db)
    .await?;

    ctx.emit(&SignalEvent::field_changed(
        EntityKind::Collaborator,
        id,
        model.budget_id,
        "access_type",
        json!(model.access_type),
        json!(access_type),
    ));
    ctx.emit(&SignalEvent::post_save(
        EntityKind::Collaborator,
        id,
        model.budget_id,
        false,
    ));
    Ok(updated)
}

/// Changes a grant's access level in its own transaction.
pub async fn update_collaborator(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    id: i64,
    patch: CollaboratorPatch,
) -> Result<CollaboratorModel> {
    let txn = db.begin().await?;
    let model = update_in(&txn, ctx, id, patch).await?;
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    Ok(model)
}

/// Revokes a grant inside a caller-owned transaction.
pub async fn delete_in<C: ConnectionTrait>(db: &C, ctx: &mut Ctx, id: i64) -> Result<()> {
    let model = require_collaborator(db, id).await?;
    ctx.emit(&SignalEvent::pre_delete(
        EntityKind::Collaborator,
        id,
        model.budget_id,
    ));
    Collaborator::delete_by_id(id).exec(db).await?;
    ctx.emit(&SignalEvent::post_delete(
        EntityKind::Collaborator,
        id,
        model.budget_id,
    ));
    debug!(collaborator_id = id, budget_id = model.budget_id, "revoked access");
    Ok(())
}

/// Revokes a grant in its own transaction.
pub async fn delete_collaborator(db: &DatabaseConnection, ctx: &mut Ctx, id: i64) -> Result<()> {
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
    use crate::test_utils::{create_test_budget, create_test_template, setup_test_db, test_ctx};

    #[tokio::test]
    async fn the_creator_is_the_implicit_owner() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();

        assert_eq!(
            access_for(&db, budget.id, 1).await.unwrap(),
            Some(AccessType::Owner)
        );
        assert_eq!(access_for(&db, budget.id, 2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn a_grant_gives_the_user_its_access_level() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let grant = create_collaborator(
            &db,
            &mut ctx,
            budget.id,
            CreateCollaborator {
                user_id: 2,
                access_type: AccessType::ViewOnly,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            access_for(&db, budget.id, 2).await.unwrap(),
            Some(AccessType::ViewOnly)
        );

        update_collaborator(
            &db,
            &mut ctx,
            grant.id,
            CollaboratorPatch {
                access_type: Some(AccessType::Editor),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            access_for(&db, budget.id, 2).await.unwrap(),
            Some(AccessType::Editor)
        );

        delete_collaborator(&db, &mut ctx, grant.id).await.unwrap();
        assert_eq!(access_for(&db, budget.id, 2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_grants_conflict() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let payload = CreateCollaborator {
            user_id: 2,
            access_type: AccessType::Editor,
        };
        create_collaborator(&db, &mut ctx, budget.id, payload.clone())
            .await
            .unwrap();

        let err = create_collaborator(&db, &mut ctx, budget.id, payload)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn the_creator_cannot_be_granted_access() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();

        let err = create_collaborator(
            &db,
            &mut ctx,
            budget.id,
            CreateCollaborator {
                user_id: 1,
                access_type: AccessType::Editor,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[tokio::test]
    async fn templates_cannot_be_shared() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let template = create_test_template(&db, &mut ctx, "Base").await.unwrap();

        let err = create_collaborator(
            &db,
            &mut ctx,
            template.id,
            CreateCollaborator {
                user_id: 2,
                access_type: AccessType::Editor,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::BadRequest { .. }));
    }

    #[tokio::test]
    async fn shared_budgets_appear_in_the_collaborator_listing() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        create_collaborator(
            &db,
            &mut ctx,
            budget.id,
            CreateCollaborator {
                user_id: 2,
                access_type: AccessType::Editor,
            },
        )
        .await
        .unwrap();

        let visible = crate::store::budget::get_budgets_for_user(
            &db,
            2,
            BudgetKind::Budget,
            false,
            &crate::store::ListQuery::default(),
        )
        .await
        .unwrap();
        assert_eq!(visible.iter().map(|b| b.id).collect::<Vec<_>>(), vec![budget.id]);
    }
}
