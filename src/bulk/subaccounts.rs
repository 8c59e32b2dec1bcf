//! Bulk operations over a node's child subaccounts, including nested import.

use super::{coalesce, over, BulkDeleteResponse, BulkResponse, MergePatch};
use crate::cache::invalidations_for;
use crate::entities::{
    EntityKind, EventType, NodeRef, ParentRef, Subaccount, SubaccountModel,
};
use crate::errors::{Error, Result};
use crate::signals::{Ctx, HistoryEntry, Suspension};
use crate::store::subaccount::{CreateSubaccount, SubaccountPatch};
use sea_orm::{DatabaseConnection, EntityTrait, TransactionTrait};
use serde::Deserialize;
use tracing::debug;

impl MergePatch for SubaccountPatch {
    fn merge(&mut self, later: Self) {
        over(&mut self.identifier, later.identifier);
        over(&mut self.description, later.description);
        over(&mut self.quantity, later.quantity);
        over(&mut self.rate, later.rate);
        over(&mut self.multiplier, later.multiplier);
        over(&mut self.unit, later.unit);
        over(&mut self.contact, later.contact);
        over(&mut self.group, later.group);
        over(&mut self.fringes, later.fringes);
        over(&mut self.previous, later.previous);
    }
}

/// One row of a nested import: the row's own attributes plus its children,
/// recursively.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubaccountImport {
    /// Attributes of the row itself
    #[serde(flatten)]
    pub row: CreateSubaccount,
    /// Child rows to create beneath it
    #[serde(default)]
    pub children: Vec<SubaccountImport>,
}

fn creation_entry(budget_id: i64, subaccount_id: i64) -> HistoryEntry {
    HistoryEntry {
        event_type: EventType::Create,
        entity_kind: EntityKind::Subaccount,
        entity_id: subaccount_id,
        budget_id,
        field: None,
        old_value: None,
        new_value: None,
    }
}

/// Creates many direct children in one transaction with one recompute pass.
pub async fn bulk_create_children(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    parent: NodeRef,
    payloads: Vec<CreateSubaccount>,
) -> Result<BulkResponse<SubaccountModel>> {
    let imports = payloads
        .into_iter()
        .map(|row| SubaccountImport {
            row,
            children: Vec::new(),
        })
        .collect();
    bulk_import_children(db, ctx, parent, imports).await
}

/// Creates a whole nested tree of children in one transaction with one
/// recompute pass. The response lists the top-level created rows.
pub async fn bulk_import_children(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    parent: NodeRef,
    imports: Vec<SubaccountImport>,
) -> Result<BulkResponse<SubaccountModel>> {
    let budget_id = crate::store::subaccount::budget_of_node(db, parent).await?;
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if imports.is_empty() {
        return Ok(BulkResponse {
            children: Vec::new(),
            budget,
        });
    }

    let txn = db.begin().await?;
    ctx.suspend(Suspension::bulk(EntityKind::Subaccount));
    let mut roots: Vec<SubaccountModel> = Vec::with_capacity(imports.len());
    let mut created: Vec<i64> = Vec::new();
    let mut failure = None;

    // Depth-first: each created row's id becomes the parent of its children
    let mut stack: Vec<(NodeRef, SubaccountImport, bool)> = imports
        .into_iter()
        .rev()
        .map(|import| (parent, import, true))
        .collect();
    while let Some((at, import, top_level)) = stack.pop() {
        match crate::store::subaccount::create_in(&txn, ctx, at, import.row).await {
            Ok(model) => {
                let node = NodeRef::subaccount(model.id);
                created.push(model.id);
                if top_level {
                    roots.push(model);
                }
                for child in import.children.into_iter().rev() {
                    stack.push((node, child, false));
                }
            }
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

    let parent_ref = ParentRef::from(parent);
    for id in &created {
        ctx.mark_dirty(NodeRef::subaccount(*id));
        ctx.record(creation_entry(budget_id, *id));
        ctx.invalidate(invalidations_for(
            EntityKind::Subaccount,
            *id,
            budget_id,
            Some(parent_ref),
        ));
    }
    ctx.finish(&txn).await?;
    let budget = crate::store::budget::require_budget(&txn, budget_id).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    debug!(?parent, count = created.len(), "bulk-created subaccounts");
    Ok(BulkResponse {
        children: roots,
        budget,
    })
}

/// Applies many child updates in one transaction with one recompute pass.
pub async fn bulk_update_children(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    parent: NodeRef,
    updates: Vec<(i64, SubaccountPatch)>,
) -> Result<BulkResponse<SubaccountModel>> {
    let budget_id = crate::store::subaccount::budget_of_node(db, parent).await?;
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if updates.is_empty() {
        return Ok(BulkResponse {
            children: Vec::new(),
            budget,
        });
    }
    let updates = coalesce(updates);

    let txn = db.begin().await?;
    ctx.suspend(Suspension::bulk(EntityKind::Subaccount));
    let mut ids = Vec::with_capacity(updates.len());
    let mut failure = None;
    for (id, patch) in updates {
        let result = async {
            let row = crate::store::subaccount::require_subaccount(&txn, id).await?;
            if row.parent() != parent {
                return Err(Error::Integrity {
                    message: format!("subaccount {id} is not a child of {parent:?}"),
                });
            }
            crate::store::subaccount::update_in(&txn, ctx, id, patch).await
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

    let parent_ref = ParentRef::from(parent);
    for id in &ids {
        ctx.invalidate(invalidations_for(
            EntityKind::Subaccount,
            *id,
            budget_id,
            Some(parent_ref),
        ));
    }
    ctx.finish(&txn).await?;

    let mut children = Vec::with_capacity(ids.len());
    for id in ids {
        children.push(crate::store::subaccount::require_subaccount(&txn, id).await?);
    }
    let budget = crate::store::budget::require_budget(&txn, budget_id).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    debug!(?parent, count = children.len(), "bulk-updated subaccounts");
    Ok(BulkResponse { children, budget })
}

/// Deletes many children (with their subtrees) in one transaction with one
/// recompute pass. Ids already gone are skipped.
pub async fn bulk_delete_children(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    parent: NodeRef,
    ids: Vec<i64>,
) -> Result<BulkDeleteResponse> {
    let budget_id = crate::store::subaccount::budget_of_node(db, parent).await?;
    let budget = crate::store::budget::require_budget(db, budget_id).await?;
    if ids.is_empty() {
        return Ok(BulkDeleteResponse { budget });
    }

    let txn = db.begin().await?;
    let mut failure = None;
    for id in ids {
        let result = async {
            let Some(row) = Subaccount::find_by_id(id).one(&txn).await.map_err(Error::from)?
            else {
                return Ok(());
            };
            if row.parent() != parent {
                return Err(Error::Integrity {
                    message: format!("subaccount {id} is not a child of {parent:?}"),
                });
            }
            crate::store::subaccount::delete_in(&txn, ctx, id).await
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
    debug!(?parent, "bulk-deleted subaccounts");
    Ok(BulkDeleteResponse { budget })
}
