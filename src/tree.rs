//! Read-only tree projections for the client.
//!
//! The items tree covers accounts and their subaccount subtrees; the
//! subaccounts tree starts beneath one node; the owner tree flattens every
//! row an actual can be charged to. All three share one search rule: with a
//! query present, a node stays in the result when it or any descendant
//! matches, and `in_search_path` marks only the nodes that matched
//! themselves.

use crate::entities::{
    Account, AccountColumn, AccountModel, EntityKind, Markup, MarkupColumn, MarkupModel, NodeRef,
    OwnerKind, ParentRef, Subaccount, SubaccountColumn, SubaccountModel,
};
use crate::errors::Result;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder};
use serde::Serialize;
use std::collections::HashMap;

/// One node of the items or subaccounts tree.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    /// Primary key of the row
    pub id: i64,
    /// Row kind, rendered as `type` for the client
    #[serde(rename = "type")]
    pub kind: EntityKind,
    /// User-facing row number
    pub identifier: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// Whether this node itself matched the search query
    pub in_search_path: bool,
    /// Child nodes, depth-first
    pub children: Vec<TreeNode>,
}

/// One entry of the flattened owner tree.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerTreeItem {
    /// Primary key of the row
    pub id: i64,
    /// Subaccount or markup
    #[serde(rename = "type")]
    pub kind: OwnerKind,
    /// User-facing label
    pub identifier: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// Whether this entry itself matched the search query
    pub in_search_path: bool,
}

fn matches(search: Option<&str>, identifier: Option<&str>, description: Option<&str>) -> bool {
    let Some(term) = search else {
        return false;
    };
    let needle = term.to_lowercase();
    [identifier, description]
        .into_iter()
        .flatten()
        .any(|h| h.to_lowercase().contains(&needle))
}

/// In-memory index of a budget's subaccounts, keyed by parent.
struct SubaccountIndex {
    by_parent: HashMap<NodeRef, Vec<SubaccountModel>>,
}

impl SubaccountIndex {
    async fn load<C: ConnectionTrait>(db: &C, budget_id: i64) -> Result<Self> {
        let rows = Subaccount::find()
            .filter(SubaccountColumn::BudgetId.eq(budget_id))
            .order_by_asc(SubaccountColumn::Order)
            .all(db)
            .await?;
        let mut by_parent: HashMap<NodeRef, Vec<SubaccountModel>> = HashMap::new();
        for row in rows {
            by_parent.entry(row.parent()).or_default().push(row);
        }
        Ok(Self { by_parent })
    }

    fn children(&self, parent: NodeRef) -> &[SubaccountModel] {
        self.by_parent.get(&parent).map_or(&[], Vec::as_slice)
    }

    /// Builds the subtree under one subaccount; `None` when neither the row
    /// nor any descendant survives the search.
    fn build(&self, row: &SubaccountModel, search: Option<&str>) -> Option<TreeNode> {
        let own_match = matches(search, row.identifier.as_deref(), row.description.as_deref());
        let children: Vec<TreeNode> = self
            .children(NodeRef::subaccount(row.id))
            .iter()
            .filter_map(|child| self.build(child, search))
            .collect();
        if search.is_some() && !own_match && children.is_empty() {
            return None;
        }
        Some(TreeNode {
            id: row.id,
            kind: EntityKind::Subaccount,
            identifier: row.identifier.clone(),
            description: row.description.clone(),
            in_search_path: own_match,
            children,
        })
    }
}

fn account_node(
    index: &SubaccountIndex,
    account: &AccountModel,
    search: Option<&str>,
) -> Option<TreeNode> {
    let own_match = matches(search, Some(&account.identifier), account.description.as_deref());
    let children: Vec<TreeNode> = index
        .children(NodeRef::account(account.id))
        .iter()
        .filter_map(|child| index.build(child, search))
        .collect();
    if search.is_some() && !own_match && children.is_empty() {
        return None;
    }
    Some(TreeNode {
        id: account.id,
        kind: EntityKind::Account,
        identifier: Some(account.identifier.clone()),
        description: account.description.clone(),
        in_search_path: own_match,
        children,
    })
}

/// The items tree: every account of the budget with its subaccount subtree.
pub async fn items_tree<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
    search: Option<&str>,
) -> Result<Vec<TreeNode>> {
    crate::store::budget::require_budget(db, budget_id).await?;
    let index = SubaccountIndex::load(db, budget_id).await?;
    let accounts = Account::find()
        .filter(AccountColumn::BudgetId.eq(budget_id))
        .order_by_asc(AccountColumn::Order)
        .all(db)
        .await?;
    Ok(accounts
        .iter()
        .filter_map(|account| account_node(&index, account, search))
        .collect())
}

/// The subaccounts tree beneath one node.
pub async fn subaccounts_tree<C: ConnectionTrait>(
    db: &C,
    root: NodeRef,
    search: Option<&str>,
) -> Result<Vec<TreeNode>> {
    let budget_id = crate::store::subaccount::budget_of_node(db, root).await?;
    let index = SubaccountIndex::load(db, budget_id).await?;
    Ok(index
        .children(root)
        .iter()
        .filter_map(|child| index.build(child, search))
        .collect())
}

/// In-memory index of a budget's markups, keyed by parent.
async fn markups_by_parent<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
) -> Result<HashMap<ParentRef, Vec<MarkupModel>>> {
    let rows = Markup::find()
        .filter(MarkupColumn::BudgetId.eq(budget_id))
        .order_by_asc(MarkupColumn::Order)
        .all(db)
        .await?;
    let mut by_parent: HashMap<ParentRef, Vec<MarkupModel>> = HashMap::new();
    for row in rows {
        by_parent.entry(row.parent()).or_default().push(row);
    }
    Ok(by_parent)
}

fn push_markups(
    out: &mut Vec<OwnerTreeItem>,
    markups: &HashMap<ParentRef, Vec<MarkupModel>>,
    parent: ParentRef,
    search: Option<&str>,
) {
    for markup in markups.get(&parent).map_or(&[][..], Vec::as_slice) {
        let own_match = matches(
            search,
            markup.identifier.as_deref(),
            markup.description.as_deref(),
        );
        if search.is_some() && !own_match {
            continue;
        }
        out.push(OwnerTreeItem {
            id: markup.id,
            kind: OwnerKind::Markup,
            identifier: markup.identifier.clone(),
            description: markup.description.clone(),
            in_search_path: own_match,
        });
    }
}

/// Flattens one subaccount subtree into owner entries, returning whether
/// anything beneath it (itself included) matched.
fn flatten_owner(
    out: &mut Vec<OwnerTreeItem>,
    index: &SubaccountIndex,
    markups: &HashMap<ParentRef, Vec<MarkupModel>>,
    row: &SubaccountModel,
    search: Option<&str>,
) -> bool {
    let own_match = matches(search, row.identifier.as_deref(), row.description.as_deref());
    let position = out.len();
    out.push(OwnerTreeItem {
        id: row.id,
        kind: OwnerKind::Subaccount,
        identifier: row.identifier.clone(),
        description: row.description.clone(),
        in_search_path: own_match,
    });
    let mut any_match = own_match;
    for child in index.children(NodeRef::subaccount(row.id)) {
        any_match |= flatten_owner(out, index, markups, child, search);
    }
    push_markups(out, markups, ParentRef::subaccount(row.id), search);
    if search.is_some() && !any_match && out.len() == position + 1 {
        // Neither the row, its subtree, nor its markups survived the search
        out.truncate(position);
        return false;
    }
    any_match
}

/// The owner tree: every subaccount and markup an actual can be charged to,
/// flattened depth-first. A parent's markups follow its subtree.
pub async fn owner_tree<C: ConnectionTrait>(
    db: &C,
    budget_id: i64,
    search: Option<&str>,
) -> Result<Vec<OwnerTreeItem>> {
    crate::store::budget::require_budget(db, budget_id).await?;
    let index = SubaccountIndex::load(db, budget_id).await?;
    let markups = markups_by_parent(db, budget_id).await?;
    let accounts = Account::find()
        .filter(AccountColumn::BudgetId.eq(budget_id))
        .order_by_asc(AccountColumn::Order)
        .all(db)
        .await?;

    let mut out = Vec::new();
    for account in &accounts {
        for child in index.children(NodeRef::account(account.id)) {
            flatten_owner(&mut out, &index, &markups, child, search);
        }
        push_markups(&mut out, &markups, ParentRef::account(account.id), search);
    }
    push_markups(&mut out, &markups, ParentRef::budget(budget_id), search);
    Ok(out)
}
