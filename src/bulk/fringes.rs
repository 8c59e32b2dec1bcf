//! Bulk operations over a budget's fringes.

use super::{coalesce, over, BulkDeleteResponse, BulkResponse, MergePatch};
use crate::cache::invalidations_for;
use crate::entities::{EntityKind, EventType, Fringe, FringeModel, ParentRef};
use crate::errors::{Error, Result};
use crate::signals::{Ctx, HistoryEntry, Suspension};
use crate::store::fringe::{CreateFringe, FringePatch};
use sea_orm::{DatabaseConnection, EntityTrait, TransactionTrait};
use tracing::debug;

impl MergePatch for FringePatch {
    fn merge(&mut self, later: Self) {
        over(&mut self.name, later.name);
        over(&mut self.description, later.description);
        over(&mut self.cutoff, later.cutoff);
        over(&mut self.rate, later.rate);
        over(&mut self.unit, later.unit);
        over(&mut self.color, later.color);
        over(&mut self.previous, later.previous);
    }
}

fn creation_entry(budget_id: i64, fringe_id: i64) -> HistoryEntry {
    HistoryEntry {
        event_type: EventType::Create,
        entity_kind: EntityKind::Fringe,
        entity_id: fringe_id,
        budget_id,
        field: None,
        old_value: None,
        new_value: None,
    }
}

/// Creates many fringes in one transaction with one recompute pass.
pub async fn bulk_create_fringes(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    payloads: Vec<CreateFringe>,
) -> Result<BulkResponse<FringeModel>> {
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if payloads.is_empty() {
        return Ok(BulkResponse {
            children: Vec::new(),
            budget,
        });
    }

    let txn = db.begin().await?;
    ctx.suspend(Suspension::bulk(EntityKind::Fringe));
    let mut children = Vec::with_capacity(payloads.len());
    let mut failure = None;
    for payload in payloads {
        match crate::store::fringe::create_in(&txn, ctx, budget_id, payload).await {
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
        // A fresh fringe attached to rows at creation dirties those rows
        for node in crate::store::fringe::linked_nodes(&txn, model.id).await? {
            ctx.mark_dirty(node);
        }
        ctx.record(creation_entry(budget_id, model.id));
        ctx.invalidate(invalidations_for(
            EntityKind::Fringe,
            model.id,
            budget_id,
            Some(ParentRef::budget(budget_id)),
        ));
    }
    ctx.finish(&txn).await?;
    let budget = crate::store::budget::require_budget(&txn, budget_id).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    debug!(budget_id, count = children.len(), "bulk-created fringes");
    Ok(BulkResponse { children, budget })
}

/// Applies many fringe updates in one transaction with one recompute pass.
pub async fn bulk_update_fringes(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    updates: Vec<(i64, FringePatch)>,
) -> Result<BulkResponse<FringeModel>> {
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if updates.is_empty() {
        return Ok(BulkResponse {
            children: Vec::new(),
            budget,
        });
    }
    let updates = coalesce(updates);

    let txn = db.begin().await?;
    ctx.suspend(Suspension::bulk(EntityKind::Fringe));
    let mut ids = Vec::with_capacity(updates.len());
    let mut failure = None;
    for (id, patch) in updates {
        let result = async {
            let row = crate::store::fringe::require_fringe(&txn, id).await?;
            if row.budget_id != budget_id {
                return Err(Error::Integrity {
                    message: format!("fringe {id} is outside budget {budget_id}"),
                });
            }
            crate::store::fringe::update_in(&txn, ctx, id, patch).await
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
            EntityKind::Fringe,
            *id,
            budget_id,
            Some(ParentRef::budget(budget_id)),
        ));
    }
    ctx.finish(&txn).await?;

    let mut children = Vec::with_capacity(ids.len());
    for id in ids {
        children.push(crate::store::fringe::require_fringe(&txn, id).await?);
    }
    let budget = crate::store::budget::require_budget(&txn, budget_id).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    debug!(budget_id, count = children.len(), "bulk-updated fringes");
    Ok(BulkResponse { children, budget })
}

/// Deletes many fringes in one transaction with one recompute pass. Ids
/// already gone are skipped.
pub async fn bulk_delete_fringes(
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
            let Some(row) = Fringe::find_by_id(id).one(&txn).await.map_err(Error::from)? else {
                return Ok(());
            };
            if row.budget_id != budget_id {
                return Err(Error::Integrity {
                    message: format!("fringe {id} is outside budget {budget_id}"),
                });
            }
            crate::store::fringe::delete_in(&txn, ctx, id).await
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
    debug!(budget_id, "bulk-deleted fringes");
    Ok(BulkDeleteResponse { budget })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{FringeUnit, NodeRef};
    use crate::store::subaccount::require_subaccount;
    use crate::test_utils::{
        create_test_account, create_test_budget, create_test_leaf, setup_test_db, test_ctx,
    };

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn creating_many_fringes_runs_one_recompute_pass() {
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
        let response = bulk_create_fringes(
            &db,
            &mut ctx,
            budget.id,
            vec![
                CreateFringe {
                    name: "Payroll".to_string(),
                    rate: Some(0.1),
                    unit: FringeUnit::Percent,
                    subaccounts: vec![leaf.id],
                    ..Default::default()
                },
                CreateFringe {
                    name: "Kit fee".to_string(),
                    rate: Some(5.0),
                    unit: FringeUnit::Flat,
                    subaccounts: vec![leaf.id],
                    ..Default::default()
                },
            ],
        )
        .await
        .unwrap();

        assert_eq!(response.children.len(), 2);
        assert_eq!(ctx.recompute_passes, before + 1);
        let leaf = require_subaccount(&db, leaf.id).await.unwrap();
        assert!(close(leaf.fringe_contribution, 15.0));
        assert!(close(response.budget.accumulated_fringe_contribution, 15.0));
    }

    #[tokio::test]
    async fn updating_many_fringes_runs_one_recompute_pass() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let account = create_test_account(&db, &mut ctx, budget.id, "1000")
            .await
            .unwrap();
        let leaf = create_test_leaf(&db, &mut ctx, NodeRef::account(account.id), 1.0, 100.0, 1.0)
            .await
            .unwrap();
        let first = crate::test_utils::create_test_fringe(&db, &mut ctx, budget.id, 0.1, None)
            .await
            .unwrap();
        let second = crate::test_utils::create_test_fringe(&db, &mut ctx, budget.id, 0.2, None)
            .await
            .unwrap();
        crate::store::subaccount::update_subaccount(
            &db,
            &mut ctx,
            leaf.id,
            crate::store::subaccount::SubaccountPatch {
                fringes: Some(vec![first.id, second.id]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let before = ctx.recompute_passes;
        bulk_update_fringes(
            &db,
            &mut ctx,
            budget.id,
            vec![
                (
                    first.id,
                    FringePatch {
                        rate: Some(Some(0.3)),
                        ..Default::default()
                    },
                ),
                (
                    second.id,
                    FringePatch {
                        rate: Some(Some(0.4)),
                        ..Default::default()
                    },
                ),
            ],
        )
        .await
        .unwrap();
        assert_eq!(ctx.recompute_passes, before + 1);

        let leaf = require_subaccount(&db, leaf.id).await.unwrap();
        assert!(close(leaf.fringe_contribution, 70.0));
    }

    #[tokio::test]
    async fn deleting_fringes_skips_missing_ids() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let budget = create_test_budget(&db, &mut ctx, "Pilot").await.unwrap();
        let fringe = crate::test_utils::create_test_fringe(&db, &mut ctx, budget.id, 0.1, None)
            .await
            .unwrap();

        let before = ctx.recompute_passes;
        bulk_delete_fringes(&db, &mut ctx, budget.id, vec![fringe.id, 999])
            .await
            .unwrap();
        assert!(crate::store::fringe::require_fringe(&db, fringe.id)
            .await
            .is_err());
        // Nothing was attached, so nothing needed recomputing
        assert_eq!(ctx.recompute_passes, before);
    }
}
