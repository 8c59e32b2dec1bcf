//! Tree recomputation.
//!
//! When leaves change, [`recompute`] derives the union of their ancestor
//! chains, orders it deepest-first, recomputes every node exactly once, and
//! finishes with the budget rows. Aggregate writes use plain updates with no
//! signal emission, so a recompute can never cascade into another recompute.

use crate::calc::values;
use crate::entities::{
    account, budget, subaccount, Account, AccountColumn, Actual, ActualColumn, Budget, Fringe,
    FringeColumn, FringeModel, Markup, MarkupChild, MarkupChildColumn, MarkupColumn, MarkupModel,
    MarkupUnit, NodeKind, NodeRef, OwnerKind, ParentRef, Subaccount, SubaccountColumn,
    SubaccountFringe, SubaccountFringeColumn, SubaccountModel,
};
use crate::errors::Result;
use crate::signals::DirtySet;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set, Unchanged,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Recomputes the minimal set of nodes affected by `dirty`: each dirty node,
/// its ancestors (deepest first, each exactly once), then the budgets.
pub async fn recompute<C: ConnectionTrait>(db: &C, dirty: &DirtySet) -> Result<()> {
    let mut depths: BTreeMap<NodeRef, usize> = BTreeMap::new();
    let mut budgets: BTreeSet<i64> = dirty.budgets.clone();

    for node in &dirty.nodes {
        // A dirty node that no longer loads was deleted mid-operation; its
        // parent is marked dirty separately by the deleting code path.
        if let Some((budget_id, path)) = ancestor_chain(db, *node).await? {
            budgets.insert(budget_id);
            for (i, n) in path.iter().enumerate() {
                depths.insert(*n, i + 1);
            }
        }
    }

    let mut ordered: Vec<(NodeRef, usize)> = depths.into_iter().collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1));

    for (node, _) in &ordered {
        match node.kind {
            NodeKind::Subaccount => recompute_subaccount(db, node.id).await?,
            NodeKind::Account => recompute_account(db, node.id).await?,
        }
    }
    for budget_id in &budgets {
        recompute_budget(db, *budget_id).await?;
    }

    info!(
        nodes = ordered.len(),
        budgets = budgets.len(),
        "recomputed dirty ancestor set"
    );
    Ok(())
}

/// Recomputes an entire budget tree bottom-up. Used after duplication and
/// other whole-tree rebuilds.
pub async fn recompute_budget_tree<C: ConnectionTrait>(db: &C, budget_id: i64) -> Result<()> {
    let subaccounts = Subaccount::find()
        .filter(SubaccountColumn::BudgetId.eq(budget_id))
        .all(db)
        .await?;
    let accounts = Account::find()
        .filter(AccountColumn::BudgetId.eq(budget_id))
        .all(db)
        .await?;

    // Assign depths breadth-first from the accounts down.
    let mut children: BTreeMap<NodeRef, Vec<i64>> = BTreeMap::new();
    for sub in &subaccounts {
        children.entry(sub.parent()).or_default().push(sub.id);
    }
    let mut frontier: Vec<NodeRef> = accounts.iter().map(|a| NodeRef::account(a.id)).collect();
    let mut by_depth: Vec<Vec<NodeRef>> = Vec::new();
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for node in &frontier {
            for child_id in children.get(node).into_iter().flatten() {
                next.push(NodeRef::subaccount(*child_id));
            }
        }
        by_depth.push(frontier);
        frontier = next;
    }

    for level in by_depth.iter().rev() {
        for node in level {
            match node.kind {
                NodeKind::Subaccount => recompute_subaccount(db, node.id).await?,
                NodeKind::Account => recompute_account(db, node.id).await?,
            }
        }
    }
    recompute_budget(db, budget_id).await?;
    debug!(budget_id, "full tree recompute complete");
    Ok(())
}

/// Walks from `node` up to its account, returning the root budget id and the
/// path ordered account-first. `None` when the node no longer exists.
async fn ancestor_chain<C: ConnectionTrait>(
    db: &C,
    node: NodeRef,
) -> Result<Option<(i64, Vec<NodeRef>)>> {
    let mut reversed = Vec::new();
    let mut current = node;
    loop {
        match current.kind {
            NodeKind::Account => {
                let Some(acct) = Account::find_by_id(current.id).one(db).await? else {
                    return Ok(None);
                };
                reversed.push(current);
                reversed.reverse();
                return Ok(Some((acct.budget_id, reversed)));
            }
            NodeKind::Subaccount => {
                let Some(sub) = Subaccount::find_by_id(current.id).one(db).await? else {
                    return Ok(None);
                };
                reversed.push(current);
                current = sub.parent();
            }
        }
    }
}

/// `nominal + accumulated_*` of a child row, the full value it contributes to
/// its parent's nominal aggregate.
fn realized_subaccount(child: &SubaccountModel) -> f64 {
    child.nominal_value
        + child.accumulated_fringe_contribution
        + child.accumulated_markup_contribution
        + child.accumulated_value
}

async fn recompute_subaccount<C: ConnectionTrait>(db: &C, id: i64) -> Result<()> {
    let Some(model) = Subaccount::find_by_id(id).one(db).await? else {
        return Ok(());
    };

    let children = Subaccount::find()
        .filter(SubaccountColumn::ParentKind.eq(NodeKind::Subaccount))
        .filter(SubaccountColumn::ParentId.eq(id))
        .all(db)
        .await?;

    let percent_markups = percent_markups_containing(db, NodeRef::subaccount(id)).await?;
    let own_flat = flat_markups_under(db, ParentRef::subaccount(id)).await?;
    let own_actuals = owned_actual_total(db, OwnerKind::Subaccount, id).await?;
    let markup_actuals = markup_owned_actual_total(db, ParentRef::subaccount(id)).await?;

    let (nominal, fringe_c, markup_c, acc_fringe, acc_markup, acc_value, actual);
    if children.is_empty() {
        nominal = values::leaf_nominal(model.quantity, model.rate, model.multiplier);
        let fringes = fringes_for(db, id).await?;
        fringe_c = values::fringe_contribution(nominal, &fringes);
        // Leaves fold their own flat markups into their contribution
        markup_c = values::percent_contribution(nominal, &percent_markups)
            + values::flat_total(&own_flat);
        acc_fringe = 0.0;
        acc_markup = 0.0;
        acc_value = 0.0;
        actual = own_actuals + markup_actuals;
    } else {
        // Leaf inputs are unobservable once children exist, and fringes
        // apply to leaf nominals only, so this row contributes none itself.
        nominal = children.iter().map(realized_subaccount).sum();
        fringe_c = 0.0;
        markup_c = values::percent_contribution(nominal, &percent_markups);
        acc_fringe = children
            .iter()
            .map(|c| c.fringe_contribution + c.accumulated_fringe_contribution)
            .sum();
        acc_markup = children
            .iter()
            .map(|c| c.markup_contribution + c.accumulated_markup_contribution)
            .sum::<f64>()
            + values::flat_total(&own_flat);
        acc_value = children.iter().map(|c| c.accumulated_value).sum();
        actual = own_actuals
            + markup_actuals
            + children.iter().map(|c| c.actual).sum::<f64>();
    }

    subaccount::ActiveModel {
        id: Unchanged(id),
        nominal_value: Set(nominal),
        fringe_contribution: Set(fringe_c),
        markup_contribution: Set(markup_c),
        accumulated_fringe_contribution: Set(acc_fringe),
        accumulated_markup_contribution: Set(acc_markup),
        accumulated_value: Set(acc_value),
        actual: Set(actual),
        ..Default::default()
    }
    .update(db)
    .await?;
    Ok(())
}

async fn recompute_account<C: ConnectionTrait>(db: &C, id: i64) -> Result<()> {
    let Some(_model) = Account::find_by_id(id).one(db).await? else {
        return Ok(());
    };

    let children = Subaccount::find()
        .filter(SubaccountColumn::ParentKind.eq(NodeKind::Account))
        .filter(SubaccountColumn::ParentId.eq(id))
        .all(db)
        .await?;

    let percent_markups = percent_markups_containing(db, NodeRef::account(id)).await?;
    let own_flat = flat_markups_under(db, ParentRef::account(id)).await?;
    let markup_actuals = markup_owned_actual_total(db, ParentRef::account(id)).await?;

    let nominal: f64 = children.iter().map(realized_subaccount).sum();
    let markup_c = values::percent_contribution(nominal, &percent_markups);
    let acc_fringe: f64 = children
        .iter()
        .map(|c| c.fringe_contribution + c.accumulated_fringe_contribution)
        .sum();
    let acc_markup = children
        .iter()
        .map(|c| c.markup_contribution + c.accumulated_markup_contribution)
        .sum::<f64>()
        + values::flat_total(&own_flat);
    let acc_value: f64 = children.iter().map(|c| c.accumulated_value).sum();
    let actual = markup_actuals + children.iter().map(|c| c.actual).sum::<f64>();

    account::ActiveModel {
        id: Unchanged(id),
        nominal_value: Set(nominal),
        markup_contribution: Set(markup_c),
        accumulated_fringe_contribution: Set(acc_fringe),
        accumulated_markup_contribution: Set(acc_markup),
        accumulated_value: Set(acc_value),
        actual: Set(actual),
        ..Default::default()
    }
    .update(db)
    .await?;
    Ok(())
}

async fn recompute_budget<C: ConnectionTrait>(db: &C, id: i64) -> Result<()> {
    let Some(_model) = Budget::find_by_id(id).one(db).await? else {
        return Ok(());
    };

    let accounts = Account::find()
        .filter(AccountColumn::BudgetId.eq(id))
        .all(db)
        .await?;
    let own_flat = flat_markups_under(db, ParentRef::budget(id)).await?;

    let nominal: f64 = accounts
        .iter()
        .map(|a| {
            a.nominal_value
                + a.accumulated_fringe_contribution
                + a.accumulated_markup_contribution
                + a.accumulated_value
        })
        .sum();
    let acc_fringe: f64 = accounts
        .iter()
        .map(|a| a.accumulated_fringe_contribution)
        .sum();
    let acc_markup = accounts
        .iter()
        .map(|a| a.markup_contribution + a.accumulated_markup_contribution)
        .sum::<f64>()
        + values::flat_total(&own_flat);

    // The budget total must equal the sum over every actual attached to it,
    // owned or not.
    let actuals = Actual::find()
        .filter(ActualColumn::BudgetId.eq(id))
        .all(db)
        .await?;
    let actual: f64 = actuals.iter().filter_map(|a| a.value).sum();

    budget::ActiveModel {
        id: Unchanged(id),
        nominal_value: Set(nominal),
        accumulated_fringe_contribution: Set(acc_fringe),
        accumulated_markup_contribution: Set(acc_markup),
        actual: Set(actual),
        ..Default::default()
    }
    .update(db)
    .await?;
    Ok(())
}

/// Fringes attached to a subaccount through the join table.
async fn fringes_for<C: ConnectionTrait>(db: &C, subaccount_id: i64) -> Result<Vec<FringeModel>> {
    let fringe_ids: Vec<i64> = SubaccountFringe::find()
        .filter(SubaccountFringeColumn::SubaccountId.eq(subaccount_id))
        .all(db)
        .await?
        .into_iter()
        .map(|link| link.fringe_id)
        .collect();
    if fringe_ids.is_empty() {
        return Ok(Vec::new());
    }
    Fringe::find()
        .filter(FringeColumn::Id.is_in(fringe_ids))
        .all(db)
        .await
        .map_err(Into::into)
}

/// Percent markups that list `node` among their children.
async fn percent_markups_containing<C: ConnectionTrait>(
    db: &C,
    node: NodeRef,
) -> Result<Vec<MarkupModel>> {
    let markup_ids: Vec<i64> = MarkupChild::find()
        .filter(MarkupChildColumn::ChildKind.eq(node.kind))
        .filter(MarkupChildColumn::ChildId.eq(node.id))
        .all(db)
        .await?
        .into_iter()
        .map(|link| link.markup_id)
        .collect();
    if markup_ids.is_empty() {
        return Ok(Vec::new());
    }
    Markup::find()
        .filter(MarkupColumn::Id.is_in(markup_ids))
        .filter(MarkupColumn::Unit.eq(MarkupUnit::Percent))
        .all(db)
        .await
        .map_err(Into::into)
}

/// Flat markups hung directly off `parent`.
async fn flat_markups_under<C: ConnectionTrait>(
    db: &C,
    parent: ParentRef,
) -> Result<Vec<MarkupModel>> {
    Markup::find()
        .filter(MarkupColumn::ParentKind.eq(parent.kind))
        .filter(MarkupColumn::ParentId.eq(parent.id))
        .filter(MarkupColumn::Unit.eq(MarkupUnit::Flat))
        .all(db)
        .await
        .map_err(Into::into)
}

/// Sum of actual values owned directly by one row.
async fn owned_actual_total<C: ConnectionTrait>(
    db: &C,
    kind: OwnerKind,
    id: i64,
) -> Result<f64> {
    let actuals = Actual::find()
        .filter(ActualColumn::OwnerKind.eq(kind))
        .filter(ActualColumn::OwnerId.eq(id))
        .all(db)
        .await?;
    Ok(actuals.iter().filter_map(|a| a.value).sum())
}

/// Sum of actual values owned by markups hung off `parent`. Markup-owned
/// spend surfaces at the markup's parent so budget totals include it.
async fn markup_owned_actual_total<C: ConnectionTrait>(
    db: &C,
    parent: ParentRef,
) -> Result<f64> {
    let markup_ids: Vec<i64> = Markup::find()
        .filter(MarkupColumn::ParentKind.eq(parent.kind))
        .filter(MarkupColumn::ParentId.eq(parent.id))
        .all(db)
        .await?
        .into_iter()
        .map(|m| m.id)
        .collect();
    if markup_ids.is_empty() {
        return Ok(0.0);
    }
    let actuals = Actual::find()
        .filter(ActualColumn::OwnerKind.eq(OwnerKind::Markup))
        .filter(ActualColumn::OwnerId.is_in(markup_ids))
        .all(db)
        .await?;
    Ok(actuals.iter().filter_map(|a| a.value).sum())
}
