//! History log - writing queued entries and reading them back scoped.
//!
//! Entries are queued on the mutation context by the history receiver and
//! written in one batch inside the same transaction as the mutation, so a
//! rolled-back change never leaves a trace.

use crate::entities::{
    event, EntityKind, Event, EventColumn, EventModel, NodeKind, Subaccount, SubaccountColumn,
};
use crate::errors::Result;
use crate::signals::HistoryEntry;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use tracing::debug;

/// Writes queued history entries as event rows, attributed to `user_id`.
pub async fn record_entries<C: ConnectionTrait>(
    db: &C,
    user_id: i64,
    entries: Vec<HistoryEntry>,
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let now = chrono::Utc::now();
    let count = entries.len();
    let rows: Vec<event::ActiveModel> = entries
        .into_iter()
        .map(|entry| event::ActiveModel {
            event_type: Set(entry.event_type),
            entity_kind: Set(entry.entity_kind),
            entity_id: Set(entry.entity_id),
            budget_id: Set(entry.budget_id),
            user_id: Set(user_id),
            field: Set(entry.field),
            old_value: Set(entry.old_value),
            new_value: Set(entry.new_value),
            created_at: Set(now),
            ..Default::default()
        })
        .collect();
    Event::insert_many(rows).exec(db).await?;
    debug!(count, user_id, "recorded history entries");
    Ok(())
}

/// All events of a budget, newest first.
pub async fn events_for_budget<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
) -> Result<Vec<EventModel>> {
    Event::find()
        .filter(EventColumn::BudgetId.eq(budget_id))
        .order_by_desc(EventColumn::CreatedAt)
        .order_by_desc(EventColumn::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// The events of one row, newest first.
pub async fn events_for_entity<C: ConnectionTrait>(
    db: &C,
    entity_kind: EntityKind,
    entity_id: i64,
) -> Result<Vec<EventModel>> {
    Event::find()
        .filter(EventColumn::EntityKind.eq(entity_kind))
        .filter(EventColumn::EntityId.eq(entity_id))
        .order_by_desc(EventColumn::CreatedAt)
        .order_by_desc(EventColumn::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Events of the subaccounts directly under one account, newest first. The
/// table view shows this as the account's row history.
pub async fn events_for_account_rows<C: ConnectionTrait>(
    db: &C,
    account_id: i64,
) -> Result<Vec<EventModel>> {
    let child_ids: Vec<i64> = Subaccount::find()
        .filter(SubaccountColumn::ParentKind.eq(NodeKind::Account))
        .filter(SubaccountColumn::ParentId.eq(account_id))
        .all(db)
        .await?
        .into_iter()
        .map(|s| s.id)
        .collect();
    if child_ids.is_empty() {
        return Ok(Vec::new());
    }
    Event::find()
        .filter(EventColumn::EntityKind.eq(EntityKind::Subaccount))
        .filter(EventColumn::EntityId.is_in(child_ids))
        .order_by_desc(EventColumn::CreatedAt)
        .order_by_desc(EventColumn::Id)
        .all(db)
        .await
        .map_err(Into::into)
}
