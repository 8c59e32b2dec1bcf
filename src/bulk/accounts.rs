//! Bulk operations over a budget's accounts.

use super::{coalesce, over, BulkDeleteResponse, BulkResponse, MergePatch};
use crate::cache::invalidations_for;
use crate::entities::{AccountModel, EntityKind, EventType, NodeRef, ParentRef};
use crate::errors::{Error, Result};
use crate::signals::{Ctx, HistoryEntry, Suspension};
use crate::store::account::{AccountPatch, CreateAccount};
use sea_orm::{DatabaseConnection, EntityTrait, TransactionTrait};
use tracing::debug;

impl MergePatch for AccountPatch {
    fn merge(&mut self, later: Self) {
        over(&mut self.identifier, later.identifier);
        over(&mut self.description, later.description);
        over(&mut self.group, later.group);
        over(&mut self.previous, later.previous);
    }
}

fn creation_entry(budget_id: i64, account_id: i64) -> HistoryEntry {
    HistoryEntry {
        event_type: EventType::Create,
        entity_kind: EntityKind::Account,
        entity_id: account_id,
        budget_id,
        field: None,
        old_value: None,
        new_value: None,
    }
}

/// Creates many accounts in one transaction with one recompute pass.
pub async fn bulk_create_accounts(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    payloads: Vec<CreateAccount>,
) -> Result<BulkResponse<AccountModel>> {
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if payloads.is_empty() {
        return Ok(BulkResponse {
            children: Vec::new(),
            budget,
        });
    }

    let txn = db.begin().await?;
    ctx.suspend(Suspension::bulk(EntityKind::Account));
    let mut children = Vec::with_capacity(payloads.len());
    let mut failure = None;
    for payload in payloads {
        match crate::store::account::create_in(&txn, ctx, budget_id, payload).await {
            Ok(model) => children.push(model),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    ctx.resume();
    if let Some(e) = failure {
        return Err(e);
    }

    for model in &children {
        ctx.mark_dirty(NodeRef::account(model.id));
        ctx.record(creation_entry(budget_id, model.id));
        ctx.invalidate(invalidations_for(
            EntityKind::Account,
            model.id,
            budget_id,
            Some(ParentRef::budget(budget_id)),
        ));
    }
    ctx.finish(&txn).await?;
    let budget = crate::store::budget::require_budget(&txn, budget_id).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    debug!(budget_id, count = children.len(), "bulk-created accounts");
    Ok(BulkResponse { children, budget })
}

/// Applies many account updates in one transaction with one recompute pass.
pub async fn bulk_update_accounts(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    updates: Vec<(i64, AccountPatch)>,
) -> Result<BulkResponse<AccountModel>> {
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if updates.is_empty() {
        return Ok(BulkResponse {
            children: Vec::new(),
            budget,
        });
    }
    let updates = coalesce(updates);

    let txn = db.begin().await?;
    ctx.suspend(Suspension::bulk(EntityKind::Account));
    let mut ids = Vec::with_capacity(updates.len());
    let mut failure = None;
    for (id, patch) in updates {
        let result = async {
            let row = crate::store::account::require_account(&txn, id).await?;
            if row.budget_id != budget_id {
                return Err(Error::Integrity {
                    message: format!("account {id} is outside budget {budget_id}"),
                });
            }
            crate::store::account::update_in(&txn, ctx, id, patch).await
        }
        .await;
        match result {
            Ok(_) => ids.push(id),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    ctx.resume();
    if let Some(e) = failure {
        return Err(e);
    }

    for id in &ids {
        ctx.invalidate(invalidations_for(
            EntityKind::Account,
            *id,
            budget_id,
            Some(ParentRef::budget(budget_id)),
        ));
    }
    ctx.finish(&txn).await?;

    // Refetch so the response carries recomputed aggregates
    let mut children = Vec::with_capacity(ids.len());
    for id in ids {
        children.push(crate::store::account::require_account(&txn, id).await?);
    }
    let budget = crate::store::budget::require_budget(&txn, budget_id).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    debug!(budget_id, count = children.len(), "bulk-updated accounts");
    Ok(BulkResponse { children, budget })
}

/// Deletes many accounts (with their subtrees) in one transaction with one
/// recompute pass. Ids already gone are skipped.
pub async fn bulk_delete_accounts(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    ids: Vec<i64>,
) -> Result<BulkDeleteResponse> {
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if ids.is_empty() {
        return Ok(BulkDeleteResponse { budget });
    }

    let txn = db.begin().await?;
    let mut failure = None;
    for id in ids {
        let result = async {
            let Some(row) = crate::entities::Account::find_by_id(id)
                .one(&txn)
                .await
                .map_err(Error::from)?
            else {
                return Ok(());
            };
            if row.budget_id != budget_id {
                return Err(Error::Integrity {
                    message: format!("account {id} is outside budget {budget_id}"),
                });
            }
            crate::store::account::delete_in(&txn, ctx, id).await
        }
        .await;
        if let Err(e) = result {
            failure = Some(e);
            break;
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }

    ctx.finish(&txn).await?;
    let budget = crate::store::budget::require_budget(&txn, budget_id).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    debug!(budget_id, "bulk-deleted accounts");
    Ok(BulkDeleteResponse { budget })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        create_test_account, create_test_budget, create_test_leaf, setup_test_db, test_ctx,
    };

    #[tokio::test]
    async fn creating_many_accounts_records_them_all() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();

        let response = bulk_create_accounts(
            &db,
            &mut ctx,
            budget.id,
            vec![
                CreateAccount {
                    identifier: "1000".to_string(),
                    description: None,
                    group: None,
                },
                CreateAccount {
                    identifier: "2000".to_string(),
                    description: Some("Camera".to_string()),
                    group: None,
                },
            ],
        )
        .await
        .unwrap();
        assert_eq!(response.children.len(), 2);

        let listing = crate::store::account::get_accounts_for_budget(
            &db,
            budget.id,
            &crate::store::ListQuery::default(),
        )
        .await
        .unwrap();
        assert_eq!(listing.len(), 2);
        let events = crate::history::events_for_budget(&db, budget.id).await.unwrap();
        let account_creations = events
            .iter()
            .filter(|e| e.entity_kind == EntityKind::Account)
            .count();
        assert_eq!(account_creations, 2);
    }

    #[tokio::test]
    async fn a_duplicate_identifier_rolls_the_whole_batch_back() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();

        let result = bulk_create_accounts(
            &db,
            &mut ctx,
            budget.id,
            vec![
                CreateAccount {
                    identifier: "1000".to_string(),
                    description: None,
                    group: None,
                },
                CreateAccount {
                    identifier: "1000".to_string(),
                    description: None,
                    group: None,
                },
            ],
        )
        .await;
        assert!(result.is_err());

        let listing = crate::store::account::get_accounts_for_budget(
            &db,
            budget.id,
            &crate::store::ListQuery::default(),
        )
        .await
        .unwrap();
        assert!(listing.is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_in_a_batch_merge_into_one_update() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();

        let response = bulk_update_accounts(
            &db,
            &mut ctx,
            budget.id,
            vec![
                (
                    account.id,
                    AccountPatch {
                        identifier: Some("1100".to_string()),
                        ..Default::default()
                    },
                ),
                (
                    account.id,
                    AccountPatch {
                        description: Some(Some("Camera".to_string())),
                        ..Default::default()
                    },
                ),
            ],
        )
        .await
        .unwrap();

        // Both patches land on the single row
        assert_eq!(response.children.len(), 1);
        assert_eq!(response.children[0].identifier, "1100");
        assert_eq!(response.children[0].description.as_deref(), Some("Camera"));
    }

    #[tokio::test]
    async fn deleting_accounts_runs_one_recompute_pass() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let a = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let b = create_test_account(&db, &mut ctx, budget.id, "2000")
            .await
            .unwrap();
        create_test_leaf(&db, &mut ctx, NodeRef::account(a.id), 1.0, 10.0, 1.0)
            .await
            .unwrap();
        create_test_leaf(&db, &mut ctx, NodeRef::account(b.id), 1.0, 20.0, 1.0)
            .await
            .unwrap();

        let before = ctx.recompute_passes;
        let response = bulk_delete_accounts(&db, &mut ctx, budget.id, vec![a.id, b.id])
            .await
            .unwrap();
        assert_eq!(ctx.recompute_passes, before + 1);
        assert!((response.budget.nominal_value).abs() < 1e-9);
    }
}
