//! The standard receiver set.

use super::{Effect, HistoryEntry, Receiver, SignalEvent, SignalKind};
use crate::cache::invalidations_for;
use crate::entities::{EntityKind, EventType};

/// Tracked fields whose changes dirty calculated values.
const VALUE_FIELDS: &[&str] = &[
    "quantity",
    "rate",
    "multiplier",
    "cutoff",
    "unit",
    "value",
    "owner",
    "parent",
    "fringes",
    "markups",
    "children",
];

/// Marks tree nodes dirty when value-bearing state changes.
pub struct RecomputeReceiver;

impl Receiver for RecomputeReceiver {
    fn name(&self) -> &'static str {
        "recompute"
    }

    fn wants(&self, event: &SignalEvent) -> bool {
        match event.kind {
            SignalKind::PostSave | SignalKind::PostDelete | SignalKind::M2mChanged => true,
            SignalKind::FieldChanged => event
                .field
                .is_some_and(|f| VALUE_FIELDS.contains(&f)),
            SignalKind::PreSave | SignalKind::PreDelete => false,
        }
    }

    fn handle(&self, event: &SignalEvent) -> Vec<Effect> {
        let mut effects: Vec<Effect> =
            event.affected.iter().copied().map(Effect::MarkDirty).collect();
        if event.budget_dirty {
            effects.push(Effect::MarkBudgetDirty(event.budget_id));
        }
        effects
    }
}

/// Checks a group for emptiness when a member leaves it or is deleted.
pub struct GroupPruneReceiver;

impl Receiver for GroupPruneReceiver {
    fn name(&self) -> &'static str {
        "group_prune"
    }

    fn wants(&self, event: &SignalEvent) -> bool {
        event.group_hint.is_some()
            && matches!(
                event.kind,
                SignalKind::FieldChanged | SignalKind::PostDelete
            )
    }

    fn handle(&self, event: &SignalEvent) -> Vec<Effect> {
        event.group_hint.map(Effect::CheckGroup).into_iter().collect()
    }
}

/// Records create and field-alteration events in the history log.
pub struct HistoryReceiver;

impl Receiver for HistoryReceiver {
    fn name(&self) -> &'static str {
        "history"
    }

    fn wants(&self, event: &SignalEvent) -> bool {
        match event.kind {
            SignalKind::PostSave => event.created,
            SignalKind::FieldChanged => true,
            _ => false,
        }
    }

    fn handle(&self, event: &SignalEvent) -> Vec<Effect> {
        let entry = match event.kind {
            SignalKind::PostSave => HistoryEntry {
                event_type: EventType::Create,
                entity_kind: event.entity,
                entity_id: event.entity_id,
                budget_id: event.budget_id,
                field: None,
                old_value: None,
                new_value: None,
            },
            _ => HistoryEntry {
                event_type: EventType::FieldAlteration,
                entity_kind: event.entity,
                entity_id: event.entity_id,
                budget_id: event.budget_id,
                field: event.field.map(str::to_string),
                old_value: event.old_value.clone(),
                new_value: event.new_value.clone(),
            },
        };
        vec![Effect::Record(entry)]
    }
}

/// Queues endpoint cache invalidations for saved/deleted rows.
pub struct CacheReceiver;

impl Receiver for CacheReceiver {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn wants(&self, event: &SignalEvent) -> bool {
        matches!(
            event.kind,
            SignalKind::PostSave | SignalKind::PostDelete | SignalKind::M2mChanged
        )
    }

    fn handle(&self, event: &SignalEvent) -> Vec<Effect> {
        vec![Effect::Invalidate(invalidations_for(
            event.entity,
            event.entity_id,
            event.budget_id,
            event.parent,
        ))]
    }
}
