//! Endpoint cache layer.
//!
//! Cached endpoint responses are keyed by entity identity plus the endpoint
//! flavor. Writers never update cached bodies in place; they invalidate the
//! dependent keys after the database commit, so concurrent readers see at most
//! one generation of staleness. Search queries (`?search=`) bypass the cache
//! entirely.

use crate::entities::{EntityKind, ParentKind, ParentRef};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::trace;

/// The endpoint flavors whose bodies are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Entity detail body
    Detail,
    /// Direct children listing (accounts of a budget, subaccounts of a row)
    ChildrenList,
    /// Fringe listing
    FringeList,
    /// Markup listing
    MarkupList,
    /// Group listing
    GroupList,
    /// Actual listing
    ActualList,
    /// Collaborator listing
    CollaboratorList,
    /// Accounts-and-subaccounts tree projection
    ItemsTree,
    /// Subaccounts tree projection
    SubaccountsTree,
    /// Actual-owner tree projection
    OwnerTree,
}

/// Identity of one cached endpoint body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Entity the endpoint is rooted at
    pub entity: EntityKind,
    /// Primary key of that entity
    pub id: i64,
    /// Which endpoint body
    pub endpoint: Endpoint,
}

impl CacheKey {
    /// Key for an endpoint rooted at an entity.
    #[must_use]
    pub const fn new(entity: EntityKind, id: i64, endpoint: Endpoint) -> Self {
        Self {
            entity,
            id,
            endpoint,
        }
    }
}

/// In-memory endpoint response cache.
///
/// The backing map is read-mostly; invalidation is an atomic key delete under
/// the write lock.
#[derive(Debug, Default)]
pub struct EndpointCache {
    entries: RwLock<HashMap<CacheKey, Value>>,
    disabled: bool,
}

impl EndpointCache {
    /// Creates an enabled cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache that stores nothing (for deployments that disable it).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            disabled: true,
        }
    }

    /// Looks up a cached body. A present `search` query always bypasses the
    /// cache.
    pub async fn get(&self, key: &CacheKey, search: Option<&str>) -> Option<Value> {
        if self.disabled || search.is_some() {
            return None;
        }
        self.entries.read().await.get(key).cloned()
    }

    /// Stores a response body. Bodies produced for search queries must not be
    /// stored; callers pass the search term so the rule lives in one place.
    pub async fn put(&self, key: CacheKey, body: Value, search: Option<&str>) {
        if self.disabled || search.is_some() {
            return;
        }
        self.entries.write().await.insert(key, body);
    }

    /// Deletes a set of keys.
    pub async fn invalidate(&self, keys: &[CacheKey]) {
        if keys.is_empty() {
            return;
        }
        let mut entries = self.entries.write().await;
        for key in keys {
            if entries.remove(key).is_some() {
                trace!(?key, "invalidated cached endpoint body");
            }
        }
    }

    /// Number of cached bodies, for tests and diagnostics.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// All tree-projection keys rooted at a budget.
fn budget_tree_keys(budget_id: i64) -> impl Iterator<Item = CacheKey> {
    [
        Endpoint::ItemsTree,
        Endpoint::SubaccountsTree,
        Endpoint::OwnerTree,
    ]
    .into_iter()
    .map(move |e| CacheKey::new(EntityKind::Budget, budget_id, e))
}

/// Declares the cache keys a write to an entity invalidates.
///
/// A save to any row invalidates the root budget's detail (its aggregates
/// changed) and the tree projections; rows additionally invalidate their own
/// detail, their listing under the direct parent, and (for tree rows) the
/// parent's children listing.
#[must_use]
pub fn invalidations_for(
    entity: EntityKind,
    id: i64,
    budget_id: i64,
    parent: Option<ParentRef>,
) -> Vec<CacheKey> {
    let mut keys = vec![
        CacheKey::new(EntityKind::Budget, budget_id, Endpoint::Detail),
        CacheKey::new(entity, id, Endpoint::Detail),
    ];
    keys.extend(budget_tree_keys(budget_id));

    let parent_key = |endpoint| match parent {
        Some(p) => {
            let kind = match p.kind {
                ParentKind::Budget => EntityKind::Budget,
                ParentKind::Account => EntityKind::Account,
                ParentKind::Subaccount => EntityKind::Subaccount,
            };
            CacheKey::new(kind, p.id, endpoint)
        }
        None => CacheKey::new(EntityKind::Budget, budget_id, endpoint),
    };

    match entity {
        EntityKind::Budget => {
            keys.push(CacheKey::new(
                EntityKind::Budget,
                budget_id,
                Endpoint::ChildrenList,
            ));
        }
        EntityKind::Account | EntityKind::Subaccount => {
            keys.push(CacheKey::new(entity, id, Endpoint::ChildrenList));
            keys.push(parent_key(Endpoint::ChildrenList));
        }
        EntityKind::Fringe => keys.push(parent_key(Endpoint::FringeList)),
        EntityKind::Markup => keys.push(parent_key(Endpoint::MarkupList)),
        EntityKind::Group => keys.push(parent_key(Endpoint::GroupList)),
        EntityKind::Actual => keys.push(parent_key(Endpoint::ActualList)),
        EntityKind::Collaborator => keys.push(parent_key(Endpoint::CollaboratorList)),
    }
    keys
}
