//! Explicit mutation context.
//!
//! `Ctx` replaces the thread-local suspension stack of a signal-heavy ORM with
//! an explicit object passed through the call graph: it carries the acting
//! user, the receiver registry, the stack of suspension scopes, and the work
//! the receivers deferred (dirty nodes, group checks, history rows, cache
//! invalidations). One request owns one `Ctx`; [`Ctx::finish`] runs the single
//! deferred recomputation before commit, and
//! [`Ctx::flush_invalidations`] applies cache deletes after commit.

use super::{Effect, HistoryEntry, Receiver, SignalEvent, SignalKind, SignalRegistry};
use crate::cache::{CacheKey, EndpointCache};
use crate::entities::{EntityKind, NodeRef};
use crate::errors::Result;
use sea_orm::ConnectionTrait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// One stackable suspension scope. Empty filter vectors match everything.
#[derive(Debug, Clone, Default)]
pub struct Suspension {
    /// Signal kinds to silence; empty silences all kinds
    pub kinds: Vec<SignalKind>,
    /// Entity kinds to silence; empty silences all entities
    pub entities: Vec<EntityKind>,
}

impl Suspension {
    /// The scope the bulk framework uses: silence per-row post-save and
    /// many-to-many signals for the entity kind being batched.
    #[must_use]
    pub fn bulk(entity: EntityKind) -> Self {
        Self {
            kinds: vec![SignalKind::PostSave, SignalKind::M2mChanged],
            entities: vec![entity],
        }
    }

    /// Silences everything (framework-internal rebuilds, duplication).
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    fn matches(&self, event: &SignalEvent) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && (self.entities.is_empty() || self.entities.contains(&event.entity))
    }
}

/// The set of tree positions whose aggregates need recomputing.
#[derive(Debug, Clone, Default)]
pub struct DirtySet {
    /// Dirty accounts/subaccounts; ancestors are derived by the engine
    pub nodes: BTreeSet<NodeRef>,
    /// Budgets whose own-level values (flat markups, actuals) are dirty
    pub budgets: BTreeSet<i64>,
}

impl DirtySet {
    /// True when nothing is dirty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.budgets.is_empty()
    }

    /// Marks a tree node dirty.
    pub fn mark_node(&mut self, node: NodeRef) {
        self.nodes.insert(node);
    }

    /// Marks a budget's own-level values dirty.
    pub fn mark_budget(&mut self, budget_id: i64) {
        self.budgets.insert(budget_id);
    }
}

/// Per-request mutation context: acting user, signal registry, suspension
/// stack, and deferred work.
#[derive(Debug)]
pub struct Ctx {
    /// Acting user; recorded on history rows and ownership fields
    pub user_id: i64,
    /// Whether the acting user holds staff privilege (community templates)
    pub is_staff: bool,
    /// Endpoint cache to invalidate after commit
    pub cache: Arc<EndpointCache>,
    registry: Arc<SignalRegistry>,
    suspensions: Vec<Suspension>,
    dirty: DirtySet,
    pending_group_checks: BTreeSet<(i64, i64)>,
    pending_history: Vec<HistoryEntry>,
    pending_invalidations: Vec<CacheKey>,
    /// Number of recompute passes this context has run (one per operation)
    pub recompute_passes: u32,
}

impl Ctx {
    /// A context for `user_id` with an explicit registry and cache.
    #[must_use]
    pub fn new(user_id: i64, registry: Arc<SignalRegistry>, cache: Arc<EndpointCache>) -> Self {
        Self {
            user_id,
            is_staff: false,
            cache,
            registry,
            suspensions: Vec::new(),
            dirty: DirtySet::default(),
            pending_group_checks: BTreeSet::new(),
            pending_history: Vec::new(),
            pending_invalidations: Vec::new(),
            recompute_passes: 0,
        }
    }

    /// A context with the standard receiver set and a fresh cache.
    #[must_use]
    pub fn with_defaults(user_id: i64) -> Self {
        Self::new(
            user_id,
            Arc::new(SignalRegistry::standard()),
            Arc::new(EndpointCache::new()),
        )
    }

    /// Grants staff privilege to the acting user.
    #[must_use]
    pub const fn as_staff(mut self) -> Self {
        self.is_staff = true;
        self
    }

    /// Pushes a suspension scope. Scopes nest; an event is silenced if any
    /// active scope matches it.
    pub fn suspend(&mut self, scope: Suspension) {
        trace!(?scope, depth = self.suspensions.len(), "entering suspension scope");
        self.suspensions.push(scope);
    }

    /// Pops the innermost suspension scope.
    pub fn resume(&mut self) {
        self.suspensions.pop();
    }

    /// Whether any active scope silences this event.
    #[must_use]
    pub fn is_suspended(&self, event: &SignalEvent) -> bool {
        self.suspensions.iter().any(|s| s.matches(event))
    }

    /// True when a suspension scope is active (bulk work in flight).
    #[must_use]
    pub fn in_scope(&self) -> bool {
        !self.suspensions.is_empty()
    }

    /// Emits an event: silenced scopes drop it, otherwise all interested
    /// receivers run in registration order and their effects are queued.
    pub fn emit(&mut self, event: &SignalEvent) {
        if self.is_suspended(event) {
            trace!(kind = ?event.kind, entity = ?event.entity, id = event.entity_id,
                "signal suspended");
            return;
        }
        let effects = self.registry.dispatch(event);
        for effect in effects {
            self.apply(effect, event);
        }
    }

    fn apply(&mut self, effect: Effect, event: &SignalEvent) {
        match effect {
            Effect::MarkDirty(node) => self.dirty.mark_node(node),
            Effect::MarkBudgetDirty(id) => self.dirty.mark_budget(id),
            Effect::CheckGroup(group_id) => {
                self.pending_group_checks.insert((group_id, event.budget_id));
            }
            Effect::Record(entry) => self.pending_history.push(entry),
            Effect::Invalidate(keys) => self.pending_invalidations.extend(keys),
        }
    }

    /// Marks a node dirty directly (framework-internal use while signals are
    /// suspended).
    pub fn mark_dirty(&mut self, node: NodeRef) {
        self.dirty.mark_node(node);
    }

    /// Marks a budget's own-level values dirty directly.
    pub fn mark_budget_dirty(&mut self, budget_id: i64) {
        self.dirty.mark_budget(budget_id);
    }

    /// Queues a history row directly (framework-internal use).
    pub fn record(&mut self, entry: HistoryEntry) {
        self.pending_history.push(entry);
    }

    /// Queues cache keys for post-commit invalidation directly.
    pub fn invalidate(&mut self, keys: Vec<CacheKey>) {
        self.pending_invalidations.extend(keys);
    }

    /// Takes the dirty set, leaving it empty.
    #[must_use]
    pub fn take_dirty(&mut self) -> DirtySet {
        std::mem::take(&mut self.dirty)
    }

    /// Runs the deferred work inside the open transaction: prunes empty
    /// groups, writes queued history rows, and runs exactly one recompute pass
    /// over the dirty set. A no-op while a suspension scope is still active;
    /// the outermost scope owner calls this once.
    pub async fn finish<C: ConnectionTrait>(&mut self, db: &C) -> Result<()> {
        if self.in_scope() {
            trace!("finish deferred: suspension scope active");
            return Ok(());
        }

        let group_checks = std::mem::take(&mut self.pending_group_checks);
        for (group_id, budget_id) in group_checks {
            if crate::store::group::prune_if_empty(db, group_id).await? {
                self.pending_invalidations.extend(crate::cache::invalidations_for(
                    EntityKind::Group,
                    group_id,
                    budget_id,
                    None,
                ));
            }
        }

        let entries = std::mem::take(&mut self.pending_history);
        if !entries.is_empty() {
            crate::history::record_entries(db, self.user_id, entries).await?;
        }

        let dirty = self.take_dirty();
        if !dirty.is_empty() {
            crate::calc::recompute(db, &dirty).await?;
            self.recompute_passes += 1;
            debug!(passes = self.recompute_passes, "recompute pass complete");
        }
        Ok(())
    }

    /// Applies queued cache invalidations. Call after the transaction commits.
    pub async fn flush_invalidations(&mut self) {
        let mut keys = std::mem::take(&mut self.pending_invalidations);
        keys.sort_by_key(|k| (k.entity, k.id, k.endpoint as u8));
        keys.dedup();
        self.cache.invalidate(&keys).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn suspension_silences_matching_events() {
        let mut ctx = Ctx::with_defaults(1);
        ctx.suspend(Suspension::bulk(EntityKind::Subaccount));

        let suspended = SignalEvent::post_save(EntityKind::Subaccount, 1, 1, true);
        assert!(ctx.is_suspended(&suspended));

        // Other entity kinds and other signal kinds pass through
        let other_entity = SignalEvent::post_save(EntityKind::Fringe, 1, 1, true);
        assert!(!ctx.is_suspended(&other_entity));
        let field = SignalEvent::field_changed(
            EntityKind::Subaccount,
            1,
            1,
            "rate",
            json!(1.0),
            json!(2.0),
        );
        assert!(!ctx.is_suspended(&field));

        ctx.resume();
        assert!(!ctx.is_suspended(&suspended));
    }

    #[test]
    fn nested_scopes_compose() {
        let mut ctx = Ctx::with_defaults(1);
        ctx.suspend(Suspension::bulk(EntityKind::Account));
        ctx.suspend(Suspension::all());

        let event = SignalEvent::post_save(EntityKind::Fringe, 1, 1, true);
        assert!(ctx.is_suspended(&event));

        // Inner scope popped: the outer account-only scope remains
        ctx.resume();
        assert!(!ctx.is_suspended(&event));
        let account = SignalEvent::post_save(EntityKind::Account, 1, 1, true);
        assert!(ctx.is_suspended(&account));
    }

    #[test]
    fn field_change_marks_nodes_dirty_through_the_registry() {
        let mut ctx = Ctx::with_defaults(1);
        let event = SignalEvent::field_changed(
            EntityKind::Subaccount,
            5,
            1,
            "rate",
            json!(1.0),
            json!(2.0),
        )
        .with_affected(vec![NodeRef::subaccount(5)]);
        ctx.emit(&event);

        let dirty = ctx.take_dirty();
        assert!(dirty.nodes.contains(&NodeRef::subaccount(5)));
    }
}
