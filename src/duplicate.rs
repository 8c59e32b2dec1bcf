//! Budget duplication and cross-domain derivation.
//!
//! One engine covers three flows: duplicating a budget, saving a budget as a
//! template, and deriving a fresh budget from a template. The whole clone
//! runs under a full suspension scope inside one transaction; old ids are
//! remapped table by table, markup child links are rewired in a second pass
//! once every node has its new id, and the copy ends with a single full-tree
//! recomputation.

use crate::calc;
use crate::entities::{
    account, actual, budget, fringe, group, markup, markup_child, subaccount, subaccount_fringe,
    Account, AccountColumn, Actual, ActualColumn, BudgetKind, BudgetModel, Domain, EntityKind,
    EventType, Fringe, FringeColumn, Group, GroupColumn, Markup, MarkupChild, MarkupChildColumn,
    MarkupColumn, NodeKind, NodeRef, OwnerKind, ParentKind, Subaccount, SubaccountColumn,
    SubaccountFringe, SubaccountFringeColumn,
};
use crate::errors::{Error, Result};
use crate::signals::{Ctx, HistoryEntry, Suspension};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait, Unchanged,
};
use std::collections::HashMap;
use tracing::{debug, info};

/// Clones `source_id` into a new root of `target_kind` owned by the acting
/// user. Community flags never survive the copy; contacts and actuals only
/// exist in the budget domain and are dropped when the target is a template.
pub async fn duplicate_budget(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    source_id: i64,
    target_kind: Domain,
) -> Result<BudgetModel> {
    let txn = db.begin().await?;
    ctx.suspend(Suspension::all());
    let result = clone_tree(&txn, ctx, source_id, target_kind).await;
    ctx.resume();
    let model = result?;

    ctx.record(HistoryEntry {
        event_type: EventType::Create,
        entity_kind: EntityKind::Budget,
        entity_id: model.id,
        budget_id: model.id,
        field: None,
        old_value: None,
        new_value: None,
    });
    ctx.finish(&txn).await?;
    txn.commit().await?;
    ctx.flush_invalidations().await;
    info!(source_id, budget_id = model.id, kind = ?model.kind, "duplicated budget tree");
    Ok(model)
}

async fn clone_tree<C: ConnectionTrait>(
    db: &C,
    ctx: &mut Ctx,
    source_id: i64,
    target_kind: Domain,
) -> Result<BudgetModel> {
    let source = crate::store::budget::require_budget(db, source_id).await?;
    let to_budget_domain = target_kind == BudgetKind::Budget;
    let now = chrono::Utc::now();

    let root = budget::ActiveModel {
        kind: Set(target_kind),
        name: Set(source.name.clone()),
        image: Set(source.image.clone()),
        is_community: Set(false),
        is_hidden: Set(false),
        is_archived: Set(false),
        created_by: Set(ctx.user_id),
        updated_by: Set(ctx.user_id),
        created_at: Set(now),
        updated_at: Set(now),
        nominal_value: Set(0.0),
        accumulated_fringe_contribution: Set(0.0),
        accumulated_markup_contribution: Set(0.0),
        actual: Set(0.0),
        ..Default::default()
    }
    .insert(db)
    .await?;
    let new_budget_id = root.id;

    // Fringes first: subaccount joins need their new ids
    let mut fringe_map: HashMap<i64, i64> = HashMap::new();
    let fringes = Fringe::find()
        .filter(FringeColumn::BudgetId.eq(source_id))
        .order_by_asc(FringeColumn::Order)
        .all(db)
        .await?;
    for old in fringes {
        let new = fringe::ActiveModel {
            budget_id: Set(new_budget_id),
            name: Set(old.name.clone()),
            description: Set(old.description.clone()),
            cutoff: Set(old.cutoff),
            rate: Set(old.rate),
            unit: Set(old.unit),
            color: Set(old.color.clone()),
            order: Set(old.order.clone()),
            ..Default::default()
        }
        .insert(db)
        .await?;
        fringe_map.insert(old.id, new.id);
    }

    // Accounts, then subaccounts level by level; group assignment waits until
    // groups themselves are cloned
    let mut account_map: HashMap<i64, i64> = HashMap::new();
    let accounts = Account::find()
        .filter(AccountColumn::BudgetId.eq(source_id))
        .order_by_asc(AccountColumn::Order)
        .all(db)
        .await?;
    for old in &accounts {
        let new = account::ActiveModel {
            budget_id: Set(new_budget_id),
            identifier: Set(old.identifier.clone()),
            description: Set(old.description.clone()),
            group_id: Set(None),
            order: Set(old.order.clone()),
            nominal_value: Set(0.0),
            markup_contribution: Set(0.0),
            accumulated_fringe_contribution: Set(0.0),
            accumulated_markup_contribution: Set(0.0),
            accumulated_value: Set(0.0),
            actual: Set(0.0),
            ..Default::default()
        }
        .insert(db)
        .await?;
        account_map.insert(old.id, new.id);
    }

    let mut subaccount_map: HashMap<i64, i64> = HashMap::new();
    let mut old_group_of: HashMap<NodeRef, Option<i64>> = HashMap::new();
    for old in &accounts {
        old_group_of.insert(
            NodeRef::account(account_map[&old.id]),
            old.group_id,
        );
    }
    let mut frontier: Vec<(NodeRef, NodeRef)> = accounts
        .iter()
        .map(|a| (NodeRef::account(a.id), NodeRef::account(account_map[&a.id])))
        .collect();
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for (old_node, new_node) in frontier {
            let children = Subaccount::find()
                .filter(SubaccountColumn::ParentKind.eq(old_node.kind))
                .filter(SubaccountColumn::ParentId.eq(old_node.id))
                .order_by_asc(SubaccountColumn::Order)
                .all(db)
                .await?;
            for old in children {
                let new = subaccount::ActiveModel {
                    budget_id: Set(new_budget_id),
                    parent_kind: Set(new_node.kind),
                    parent_id: Set(new_node.id),
                    identifier: Set(old.identifier.clone()),
                    description: Set(old.description.clone()),
                    quantity: Set(old.quantity),
                    rate: Set(old.rate),
                    multiplier: Set(old.multiplier),
                    unit: Set(old.unit.clone()),
                    contact: Set(if to_budget_domain { old.contact } else { None }),
                    group_id: Set(None),
                    order: Set(old.order.clone()),
                    nominal_value: Set(0.0),
                    fringe_contribution: Set(0.0),
                    markup_contribution: Set(0.0),
                    accumulated_fringe_contribution: Set(0.0),
                    accumulated_markup_contribution: Set(0.0),
                    accumulated_value: Set(0.0),
                    actual: Set(0.0),
                    ..Default::default()
                }
                .insert(db)
                .await?;
                subaccount_map.insert(old.id, new.id);
                old_group_of.insert(NodeRef::subaccount(new.id), old.group_id);
                // Fringe joins carry over with remapped ids
                let joins = SubaccountFringe::find()
                    .filter(SubaccountFringeColumn::SubaccountId.eq(old.id))
                    .all(db)
                    .await?;
                for join in joins {
                    let Some(new_fringe) = fringe_map.get(&join.fringe_id) else {
                        return Err(Error::Integrity {
                            message: format!(
                                "fringe {} referenced outside budget {source_id}",
                                join.fringe_id
                            ),
                        });
                    };
                    subaccount_fringe::ActiveModel {
                        subaccount_id: Set(new.id),
                        fringe_id: Set(*new_fringe),
                        ..Default::default()
                    }
                    .insert(db)
                    .await?;
                }
                next.push((NodeRef::subaccount(old.id), NodeRef::subaccount(new.id)));
            }
        }
        frontier = next;
    }

    // Groups, then backfill group membership on the cloned rows
    let map_parent = |kind: ParentKind, id: i64| -> Option<(ParentKind, i64)> {
        match kind {
            ParentKind::Budget => Some((ParentKind::Budget, new_budget_id)),
            ParentKind::Account => account_map.get(&id).map(|n| (ParentKind::Account, *n)),
            ParentKind::Subaccount => subaccount_map.get(&id).map(|n| (ParentKind::Subaccount, *n)),
        }
    };
    let mut group_map: HashMap<i64, i64> = HashMap::new();
    let mut source_groups = Group::find()
        .filter(
            GroupColumn::ParentKind
                .eq(ParentKind::Budget)
                .and(GroupColumn::ParentId.eq(source_id)),
        )
        .all(db)
        .await?;
    let account_ids: Vec<i64> = account_map.keys().copied().collect();
    if !account_ids.is_empty() {
        source_groups.extend(
            Group::find()
                .filter(
                    GroupColumn::ParentKind
                        .eq(ParentKind::Account)
                        .and(GroupColumn::ParentId.is_in(account_ids)),
                )
                .all(db)
                .await?,
        );
    }
    let subaccount_ids: Vec<i64> = subaccount_map.keys().copied().collect();
    if !subaccount_ids.is_empty() {
        source_groups.extend(
            Group::find()
                .filter(
                    GroupColumn::ParentKind
                        .eq(ParentKind::Subaccount)
                        .and(GroupColumn::ParentId.is_in(subaccount_ids)),
                )
                .all(db)
                .await?,
        );
    }
    for old in source_groups {
        let Some((parent_kind, parent_id)) = map_parent(old.parent_kind, old.parent_id) else {
            continue;
        };
        let new = group::ActiveModel {
            parent_kind: Set(parent_kind),
            parent_id: Set(parent_id),
            name: Set(old.name.clone()),
            color: Set(old.color.clone()),
            order: Set(old.order.clone()),
            ..Default::default()
        }
        .insert(db)
        .await?;
        group_map.insert(old.id, new.id);
    }
    for (node, old_group) in &old_group_of {
        let Some(old_group) = old_group else { continue };
        let Some(new_group) = group_map.get(old_group) else {
            continue;
        };
        match node.kind {
            NodeKind::Account => {
                account::ActiveModel {
                    id: Unchanged(node.id),
                    group_id: Set(Some(*new_group)),
                    ..Default::default()
                }
                .update(db)
                .await?;
            }
            NodeKind::Subaccount => {
                subaccount::ActiveModel {
                    id: Unchanged(node.id),
                    group_id: Set(Some(*new_group)),
                    ..Default::default()
                }
                .update(db)
                .await?;
            }
        }
    }

    // Markups in two passes: rows first, child links once the map is complete
    let mut markup_map: HashMap<i64, i64> = HashMap::new();
    let markups = Markup::find()
        .filter(MarkupColumn::BudgetId.eq(source_id))
        .order_by_asc(MarkupColumn::Order)
        .all(db)
        .await?;
    for old in &markups {
        let Some((parent_kind, parent_id)) = map_parent(old.parent_kind, old.parent_id) else {
            continue;
        };
        let new = markup::ActiveModel {
            budget_id: Set(new_budget_id),
            parent_kind: Set(parent_kind),
            parent_id: Set(parent_id),
            identifier: Set(old.identifier.clone()),
            description: Set(old.description.clone()),
            rate: Set(old.rate),
            unit: Set(old.unit),
            order: Set(old.order.clone()),
            ..Default::default()
        }
        .insert(db)
        .await?;
        markup_map.insert(old.id, new.id);
    }
    for old in &markups {
        let Some(new_markup) = markup_map.get(&old.id) else {
            continue;
        };
        let links = MarkupChild::find()
            .filter(MarkupChildColumn::MarkupId.eq(old.id))
            .all(db)
            .await?;
        for link in links {
            let new_child = match link.child_kind {
                NodeKind::Account => account_map.get(&link.child_id),
                NodeKind::Subaccount => subaccount_map.get(&link.child_id),
            };
            let Some(new_child) = new_child else { continue };
            markup_child::ActiveModel {
                markup_id: Set(*new_markup),
                child_kind: Set(link.child_kind),
                child_id: Set(*new_child),
                ..Default::default()
            }
            .insert(db)
            .await?;
        }
    }

    // Actuals are budget-domain only
    if to_budget_domain && source.kind == BudgetKind::Budget {
        let actuals = Actual::find()
            .filter(ActualColumn::BudgetId.eq(source_id))
            .order_by_asc(ActualColumn::Order)
            .all(db)
            .await?;
        for old in actuals {
            let (owner_kind, owner_id) = match old.owner() {
                Some(owner) => {
                    let mapped = match owner.kind {
                        OwnerKind::Subaccount => subaccount_map.get(&owner.id).copied(),
                        OwnerKind::Markup => markup_map.get(&owner.id).copied(),
                    };
                    (mapped.map(|_| owner.kind), mapped)
                }
                None => (None, None),
            };
            actual::ActiveModel {
                budget_id: Set(new_budget_id),
                owner_kind: Set(owner_kind),
                owner_id: Set(owner_id),
                name: Set(old.name.clone()),
                notes: Set(old.notes.clone()),
                date: Set(old.date),
                value: Set(old.value),
                payment_id: Set(old.payment_id.clone()),
                purchase_order: Set(old.purchase_order.clone()),
                actual_type: Set(old.actual_type.clone()),
                contact: Set(old.contact),
                order: Set(old.order.clone()),
                ..Default::default()
            }
            .insert(db)
            .await?;
        }
    }

    calc::recompute_budget_tree(db, new_budget_id).await?;
    debug!(
        accounts = account_map.len(),
        subaccounts = subaccount_map.len(),
        markups = markup_map.len(),
        "cloned budget tree"
    );
    crate::store::budget::require_budget(db, new_budget_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{MarkupUnit, OwnerRef, ParentRef};
    use crate::signals::Ctx;
    use crate::store;
    use crate::test_utils::{
        create_test_account, create_test_budget, create_test_fringe, create_test_leaf,
        setup_test_db, test_ctx,
    };
    use sea_orm::DatabaseConnection;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    /// A budget with an account, a nested subtree, a fringe, a markup, a group
    /// and two actuals.
    async fn seed_source(db: &DatabaseConnection, ctx: &mut Ctx) -> BudgetModel {
        let budget = create_test_budget(db, ctx, "Pilot").await.unwrap();
        let account = create_test_account(db, ctx, budget.id, "1000").await.unwrap();
        let parent = NodeRef::account(account.id);
        let leaf = create_test_leaf(db, ctx, parent, 1.0, 100.0, 1.0).await.unwrap();
        let nested = create_test_leaf(db, ctx, parent, 2.0, 10.0, 1.0).await.unwrap();
        create_test_leaf(db, ctx, NodeRef::subaccount(nested.id), 1.0, 50.0, 1.0)
            .await
            .unwrap();

        let fringe = create_test_fringe(db, ctx, budget.id, 0.1, None).await.unwrap();
        store::subaccount::update_subaccount(
            db,
            ctx,
            leaf.id,
            store::subaccount::SubaccountPatch {
                fringes: Some(vec![fringe.id]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        store::markup::create_markup(
            db,
            ctx,
            ParentRef::account(account.id),
            store::markup::CreateMarkup {
                rate: Some(0.2),
                unit: MarkupUnit::Percent,
                children: vec![leaf.id],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        store::group::create_group(
            db,
            ctx,
            ParentRef::budget(budget.id),
            store::group::CreateGroup {
                name: "Above the line".to_string(),
                color: None,
                children: vec![account.id],
            },
        )
        .await
        .unwrap();
        store::actual::create_actual(
            db,
            ctx,
            budget.id,
            store::actual::CreateActual {
                value: Some(40.0),
                owner: Some(OwnerRef::subaccount(leaf.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        store::actual::create_actual(
            db,
            ctx,
            budget.id,
            store::actual::CreateActual {
                value: Some(30.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        store::budget::require_budget(db, budget.id).await.unwrap()
    }

    async fn count_rows(db: &DatabaseConnection, budget_id: i64) -> (usize, usize, usize, usize, usize) {
        let accounts = Account::find()
            .filter(AccountColumn::BudgetId.eq(budget_id))
            .all(db)
            .await
            .unwrap()
            .len();
        let subaccounts = Subaccount::find()
            .filter(SubaccountColumn::BudgetId.eq(budget_id))
            .all(db)
            .await
            .unwrap()
            .len();
        let fringes = Fringe::find()
            .filter(FringeColumn::BudgetId.eq(budget_id))
            .all(db)
            .await
            .unwrap()
            .len();
        let markups = Markup::find()
            .filter(MarkupColumn::BudgetId.eq(budget_id))
            .all(db)
            .await
            .unwrap()
            .len();
        let actuals = Actual::find()
            .filter(ActualColumn::BudgetId.eq(budget_id))
            .all(db)
            .await
            .unwrap()
            .len();
        (accounts, subaccounts, fringes, markups, actuals)
    }

    #[tokio::test]
    async fn the_copy_matches_the_source_row_for_row() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let source = seed_source(&db, &mut ctx).await;

        let mut other = Ctx::with_defaults(2);
        let copy = duplicate_budget(&db, &mut other, source.id, BudgetKind::Budget)
            .await
            .unwrap();

        assert_ne!(copy.id, source.id);
        assert_eq!(copy.created_by, 2);
        assert_eq!(copy.name, source.name);
        assert_eq!(count_rows(&db, source.id).await, count_rows(&db, copy.id).await);
        assert!(close(copy.nominal_value, source.nominal_value));
        assert!(close(
            copy.accumulated_fringe_contribution,
            source.accumulated_fringe_contribution
        ));
        assert!(close(
            copy.accumulated_markup_contribution,
            source.accumulated_markup_contribution
        ));
        assert!(close(copy.actual, source.actual));

        // Every cloned row points inside the copy
        for row in Subaccount::find()
            .filter(SubaccountColumn::BudgetId.eq(copy.id))
            .all(&db)
            .await
            .unwrap()
        {
            assert_eq!(row.budget_id, copy.id);
        }
    }

    #[tokio::test]
    async fn saving_as_template_drops_actuals_and_contacts() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let source = seed_source(&db, &mut ctx).await;

        let template = duplicate_budget(&db, &mut ctx, source.id, BudgetKind::Template)
            .await
            .unwrap();

        assert_eq!(template.kind, BudgetKind::Template);
        let (_, _, _, _, actuals) = count_rows(&db, template.id).await;
        assert_eq!(actuals, 0);
        assert!(close(template.actual, 0.0));
        // Calculated structure still carries over
        assert!(close(template.nominal_value, source.nominal_value));
    }

    #[tokio::test]
    async fn community_flags_never_survive_the_copy() {
        let db = setup_test_db().await.unwrap();
        let mut staff = test_ctx().as_staff();
        let template = store::budget::create_budget(
            &db,
            &mut staff,
            store::budget::CreateBudget {
                kind: BudgetKind::Template,
                name: "Community base".to_string(),
                image: None,
                is_community: true,
            },
        )
        .await
        .unwrap();

        let copy = duplicate_budget(&db, &mut staff, template.id, BudgetKind::Template)
            .await
            .unwrap();
        assert!(!copy.is_community);
        assert!(!copy.is_hidden);
    }

    #[tokio::test]
    async fn deriving_a_budget_from_a_template_lands_in_the_budget_domain() {
        let db = setup_test_db().await.unwrap();
        let mut ctx = test_ctx();
        let template = store::budget::create_budget(
            &db,
            &mut ctx,
            store::budget::CreateBudget {
                kind: BudgetKind::Template,
                name: "Base".to_string(),
                image: None,
                is_community: false,
            },
        )
        .await
        .unwrap();
        let account = create_test_account(&db, &mut ctx, template.id, "1000")
            .await
            .unwrap();
        create_test_leaf(&db, &mut ctx, NodeRef::account(account.id), 1.0, 10.0, 1.0)
            .await
            .unwrap();

        let budget = duplicate_budget(&db, &mut ctx, template.id, BudgetKind::Budget)
            .await
            .unwrap();
        assert_eq!(budget.kind, BudgetKind::Budget);
        assert!(close(budget.nominal_value, 10.0));
        // History records the derivation as a creation
        let events = crate::history::events_for_budget(&db, budget.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Create);
    }
}
