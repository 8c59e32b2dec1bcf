//! Bulk operations over a budget's actuals.

use super::{coalesce, over, BulkDeleteResponse, BulkResponse, MergePatch};
use crate::cache::invalidations_for;
use crate::entities::{Actual, ActualModel, EntityKind, EventType};
use crate::errors::{Error, Result};
use crate::signals::{Ctx, HistoryEntry, Suspension};
use crate::store::actual::{ActualPatch, CreateActual};
use sea_orm::{DatabaseConnection, EntityTrait, TransactionTrait};
use tracing::debug;

impl MergePatch for ActualPatch {
    fn merge(&mut self, later: Self) {
        over(&mut self.name, later.name);
        over(&mut self.notes, later.notes);
        over(&mut self.date, later.date);
        over(&mut self.value, later.value);
        over(&mut self.payment_id, later.payment_id);
        over(&mut self.purchase_order, later.purchase_order);
        over(&mut self.actual_type, later.actual_type);
        over(&mut self.contact, later.contact);
        over(&mut self.owner, later.owner);
        over(&mut self.previous, later.previous);
    }
}

fn creation_entry(budget_id: i64, actual_id: i64) -> HistoryEntry {
    HistoryEntry {
        event_type: EventType::Create,
        entity_kind: EntityKind::Actual,
        entity_id: actual_id,
        budget_id,
        field: None,
        old_value: None,
        new_value: None,
    }
}

/// Creates many actuals in one transaction with one recompute pass.
pub async fn bulk_create_actuals(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    payloads: Vec<CreateActual>,
) -> Result<BulkResponse<ActualModel>> {
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if payloads.is_empty() {
        return Ok(BulkResponse {
            children: Vec::new(),
            budget,
        });
    }

    let txn = db.begin().await?;
    ctx.suspend(Suspension::bulk(EntityKind::Actual));
    let mut children = Vec::with_capacity(payloads.len());
    let mut failure = None;
    for payload in payloads {
        match crate::store::actual::create_in(&txn, ctx, budget_id, payload).await {
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
        ctx.mark_budget_dirty(budget_id);
        if let Some(owner) = model.owner() {
            if owner.kind == crate::entities::OwnerKind::Subaccount {
                ctx.mark_dirty(crate::entities::NodeRef::subaccount(owner.id));
            }
        }
        ctx.record(creation_entry(budget_id, model.id));
        ctx.invalidate(invalidations_for(EntityKind::Actual, model.id, budget_id, None));
    }
    ctx.finish(&txn).await?;
    let budget = crate::store::budget::require_budget(&txn, budget_id).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    debug!(budget_id, count = children.len(), "bulk-created actuals");
    Ok(BulkResponse { children, budget })
}

/// Applies many actual updates in one transaction with one recompute pass.
pub async fn bulk_update_actuals(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    updates: Vec<(i64, ActualPatch)>,
) -> Result<BulkResponse<ActualModel>> {
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if updates.is_empty() {
        return Ok(BulkResponse {
            children: Vec::new(),
            budget,
        });
    }
    let updates = coalesce(updates);

    let txn = db.begin().await?;
    ctx.suspend(Suspension::bulk(EntityKind::Actual));
    let mut ids = Vec::with_capacity(updates.len());
    let mut failure = None;
    for (id, patch) in updates {
        let result = async {
            let row = crate::store::actual::require_actual(&txn, id).await?;
            if row.budget_id != budget_id {
                return Err(Error::Integrity {
                    message: format!("actual {id} is outside budget {budget_id}"),
                });
            }
            crate::store::actual::update_in(&txn, ctx, id, patch).await
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
        ctx.invalidate(invalidations_for(EntityKind::Actual, *id, budget_id, None));
    }
    ctx.finish(&txn).await?;

    let mut children = Vec::with_capacity(ids.len());
    for id in ids {
        children.push(crate::store::actual::require_actual(&txn, id).await?);
    }
    let budget = crate::store::budget::require_budget(&txn, budget_id).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    debug!(budget_id, count = children.len(), "bulk-updated actuals");
    Ok(BulkResponse { children, budget })
}

/// Deletes many actuals in one transaction with one recompute pass. Ids
/// already gone are skipped.
pub async fn bulk_delete_actuals(
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
            let Some(row) = Actual::find_by_id(id).one(&txn).await.map_err(Error::from)? else {
                return Ok(());
            };
            if row.budget_id != budget_id {
                return Err(Error::Integrity {
                    message: format!("actual {id} is outside budget {budget_id}"),
                });
            }
            crate::store::actual::delete_in(&txn, ctx, id).await
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
    debug!(budget_id, "bulk-deleted actuals");
    Ok(BulkDeleteResponse { budget })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{NodeRef, OwnerRef};
    use crate::test_utils::{
        create_test_account, create_test_budget, create_test_leaf, setup_test_db, test_ctx,
    };

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn creating_many_actuals_totals_in_one_recompute_pass() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let leaf = create_test_leaf(&db, &mut ctx, NodeRef::account(account.id), 1.0, 100.0, 1.0)
            .await
            .unwrap();

        let before = ctx.recompute_passes;
        let response = bulk_create_actuals(
            &db,
            &mut ctx,
            budget.id,
            vec![
                CreateActual {
                    value: Some(40.0),
                    owner: Some(OwnerRef::subaccount(leaf.id)),
                    ..Default::default()
                },
                CreateActual {
                    value: Some(30.0),
                    ..Default::default()
                },
            ],
        )
        .await
        .unwrap();

        assert_eq!(response.children.len(), 2);
        assert_eq!(ctx.recompute_passes, before + 1);
        assert!(close(response.budget.actual, 70.0));
        let leaf = crate::store::subaccount::require_subaccount(&db, leaf.id)
            .await
            .unwrap();
        assert!(close(leaf.actual, 40.0));
    }

    #[tokio::test]
    async fn updating_many_actuals_runs_one_recompute_pass() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let first = crate::store::actual::create_actual(
            &db,
            &mut ctx,
            budget.id,
            CreateActual {
                value: Some(10.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let second = crate::store::actual::create_actual(
            &db,
            &mut ctx,
            budget.id,
            CreateActual {
                value: Some(20.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let before = ctx.recompute_passes;
        let response = bulk_update_actuals(
            &db,
            &mut ctx,
            budget.id,
            vec![
                (
                    first.id,
                    ActualPatch {
                        value: Some(Some(15.0)),
                        ..Default::default()
                    },
                ),
                (
                    second.id,
                    ActualPatch {
                        value: Some(Some(25.0)),
                        ..Default::default()
                    },
                ),
            ],
        )
        .await
        .unwrap();
        assert_eq!(ctx.recompute_passes, before + 1);
        assert!(close(response.budget.actual, 40.0));
    }

    #[tokio::test]
    async fn deleting_actuals_releases_their_spend() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let first = crate::store::actual::create_actual(
            &db,
            &mut ctx,
            budget.id,
            CreateActual {
                value: Some(10.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let kept = crate::store::actual::create_actual(
            &db,
            &mut ctx,
            budget.id,
            CreateActual {
                value: Some(20.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let response = bulk_delete_actuals(&db, &mut ctx, budget.id, vec![first.id, 999])
            .await
            .unwrap();
        assert!(close(response.budget.actual, 20.0));
        assert!(crate::store::actual::require_actual(&db, kept.id).await.is_ok());
    }
}
