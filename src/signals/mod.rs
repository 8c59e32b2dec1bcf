//! Signal/event bus.
//!
//! Store mutations emit [`SignalEvent`]s; receivers registered on the
//! [`SignalRegistry`] translate them into [`Effect`]s (mark a node dirty,
//! prune a group, record history, invalidate cache keys) which the
//! [`ctx::Ctx`] accumulates and applies at well-defined points. Receivers run
//! in registration order and never touch the database themselves; that keeps
//! the save → recompute → save cycle impossible by construction.
//!
//! Suspension is an explicit, stackable scope on the context (not a
//! thread-local): events matching any active suspension are discarded, and the
//! bulk framework uses this to silence per-row storms while it batches.

pub mod ctx;
pub mod receivers;

pub use ctx::{Ctx, DirtySet, Suspension};

use crate::cache::CacheKey;
use crate::entities::{EntityKind, EventType, NodeRef, ParentRef};
use serde_json::Value;

/// The event kinds the bus fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalKind {
    /// About to persist a row
    PreSave,
    /// A row was persisted; `created` distinguishes insert from update
    PostSave,
    /// About to delete a row
    PreDelete,
    /// A row was deleted
    PostDelete,
    /// One tracked field changed value
    FieldChanged,
    /// A many-to-many link set changed (fringes, markup children, collaborators)
    M2mChanged,
}

/// One emitted event.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    /// Which event kind
    pub kind: SignalKind,
    /// Entity kind of the row
    pub entity: EntityKind,
    /// Primary key of the row
    pub entity_id: i64,
    /// Root budget of the row
    pub budget_id: i64,
    /// Direct parent, when the row has one
    pub parent: Option<ParentRef>,
    /// For `PostSave`: whether the row was just created
    pub created: bool,
    /// For `FieldChanged`: the tracked field name
    pub field: Option<&'static str>,
    /// For `FieldChanged`: JSON-serialized previous value
    pub old_value: Option<Value>,
    /// For `FieldChanged`: JSON-serialized new value
    pub new_value: Option<Value>,
    /// Tree nodes whose values this event dirties
    pub affected: Vec<NodeRef>,
    /// Whether budget-level values are dirtied directly
    pub budget_dirty: bool,
    /// A group that may have lost its last member
    pub group_hint: Option<i64>,
}

impl SignalEvent {
    /// Bare event with no value/field payload.
    #[must_use]
    pub fn new(kind: SignalKind, entity: EntityKind, entity_id: i64, budget_id: i64) -> Self {
        Self {
            kind,
            entity,
            entity_id,
            budget_id,
            parent: None,
            created: false,
            field: None,
            old_value: None,
            new_value: None,
            affected: Vec::new(),
            budget_dirty: false,
            group_hint: None,
        }
    }

    /// Post-save event.
    #[must_use]
    pub fn post_save(
        entity: EntityKind,
        entity_id: i64,
        budget_id: i64,
        created: bool,
    ) -> Self {
        let mut event = Self::new(SignalKind::PostSave, entity, entity_id, budget_id);
        event.created = created;
        event
    }

    /// Per-field change event.
    #[must_use]
    pub fn field_changed(
        entity: EntityKind,
        entity_id: i64,
        budget_id: i64,
        field: &'static str,
        old_value: Value,
        new_value: Value,
    ) -> Self {
        let mut event = Self::new(SignalKind::FieldChanged, entity, entity_id, budget_id);
        event.field = Some(field);
        event.old_value = Some(old_value);
        event.new_value = Some(new_value);
        event
    }

    /// Pre-delete event.
    #[must_use]
    pub fn pre_delete(entity: EntityKind, entity_id: i64, budget_id: i64) -> Self {
        Self::new(SignalKind::PreDelete, entity, entity_id, budget_id)
    }

    /// Post-delete event.
    #[must_use]
    pub fn post_delete(entity: EntityKind, entity_id: i64, budget_id: i64) -> Self {
        Self::new(SignalKind::PostDelete, entity, entity_id, budget_id)
    }

    /// Many-to-many change event.
    #[must_use]
    pub fn m2m_changed(entity: EntityKind, entity_id: i64, budget_id: i64) -> Self {
        Self::new(SignalKind::M2mChanged, entity, entity_id, budget_id)
    }

    /// Attaches the row's direct parent.
    #[must_use]
    pub const fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Attaches the tree nodes this event dirties.
    #[must_use]
    pub fn with_affected(mut self, affected: Vec<NodeRef>) -> Self {
        self.affected = affected;
        self
    }

    /// Marks budget-level values as directly dirtied.
    #[must_use]
    pub const fn with_budget_dirty(mut self) -> Self {
        self.budget_dirty = true;
        self
    }

    /// Attaches a group that may now be empty.
    #[must_use]
    pub const fn with_group_hint(mut self, group_id: i64) -> Self {
        self.group_hint = Some(group_id);
        self
    }
}

/// A deferred history row, queued by the history receiver and written when the
/// context flushes.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Create or field-alteration
    pub event_type: EventType,
    /// Entity kind of the target row
    pub entity_kind: EntityKind,
    /// Primary key of the target row
    pub entity_id: i64,
    /// Root budget of the target row
    pub budget_id: i64,
    /// Changed field, for alterations
    pub field: Option<String>,
    /// Serialized previous value, for alterations
    pub old_value: Option<Value>,
    /// Serialized new value, for alterations
    pub new_value: Option<Value>,
}

/// What a receiver asks the context to do in response to an event.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Defer a recompute of this tree node (and its ancestors)
    MarkDirty(NodeRef),
    /// Defer a recompute of budget-level aggregates
    MarkBudgetDirty(i64),
    /// Check a group for emptiness at flush time and prune it if empty
    CheckGroup(i64),
    /// Queue a history row
    Record(HistoryEntry),
    /// Queue cache keys for post-commit invalidation
    Invalidate(Vec<CacheKey>),
}

/// A registered signal receiver.
///
/// Receivers are pure: they inspect the event and return effects. All database
/// work happens when the context applies the effects.
pub trait Receiver: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this receiver wants the event (kind, entity and field filters).
    fn wants(&self, event: &SignalEvent) -> bool;

    /// Translates the event into effects.
    fn handle(&self, event: &SignalEvent) -> Vec<Effect>;
}

/// Registry of receivers; dispatch runs them in registration order.
///
/// Registration happens at startup; the registry is read-only afterwards and
/// shared behind an `Arc`.
#[derive(Default)]
pub struct SignalRegistry {
    receivers: Vec<Box<dyn Receiver>>,
}

impl SignalRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard receiver set: recompute marking, group pruning, history
    /// recording, cache invalidation — in that order.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(receivers::RecomputeReceiver));
        registry.register(Box::new(receivers::GroupPruneReceiver));
        registry.register(Box::new(receivers::HistoryReceiver));
        registry.register(Box::new(receivers::CacheReceiver));
        registry
    }

    /// Registers a receiver at the end of the dispatch order.
    pub fn register(&mut self, receiver: Box<dyn Receiver>) {
        self.receivers.push(receiver);
    }

    /// Runs all interested receivers and collects their effects in order.
    #[must_use]
    pub fn dispatch(&self, event: &SignalEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        for receiver in &self.receivers {
            if receiver.wants(event) {
                effects.extend(receiver.handle(event));
            }
        }
        effects
    }
}

impl std::fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalRegistry")
            .field("receivers", &self.receivers.len())
            .finish()
    }
}
