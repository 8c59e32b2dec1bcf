//! Bulk deletion of markups. Creation and update stay per-row since markup
//! child sets need individual validation.

use super::BulkDeleteResponse;
use crate::entities::Markup;
use crate::errors::{Error, Result};
use crate::signals::Ctx;
use sea_orm::{DatabaseConnection, EntityTrait, TransactionTrait};
use tracing::debug;

/// Deletes many markups in one transaction with one recompute pass. Ids
/// already gone are skipped; a markup pruned earlier in the same call (for
/// example when its last sibling child went with another markup) counts as
/// gone.
pub async fn bulk_delete_markups(
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
            let Some(row) = Markup::find_by_id(id).one(&txn).await.map_err(Error::from)? else {
                return Ok(());
            };
            if row.budget_id != budget_id {
                return Err(Error::Integrity {
                    message: format!("markup {id} is outside budget {budget_id}"),
                });
            }
            crate::store::markup::delete_in(&txn, ctx, id).await
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
    debug!(budget_id, "bulk-deleted markups");
    Ok(BulkDeleteResponse { budget })
}
