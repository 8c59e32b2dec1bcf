//! Shared test utilities.
//!
//! Helper functions for setting up in-memory test databases, mutation
//! contexts, and entities with sensible defaults.

use crate::entities::{
    AccountModel, BudgetKind, BudgetModel, FringeModel, FringeUnit, NodeRef, SubaccountModel,
};
use crate::errors::Result;
use crate::signals::Ctx;
use crate::store;
use sea_orm::DatabaseConnection;

/// Creates an in-memory `SQLite` database with all tables initialized.
/// This is the standard setup for all integration tests.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = sea_orm::Database::connect("sqlite::memory:").await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// A mutation context for test user 1 with the standard receivers and a
/// fresh cache.
pub fn test_ctx() -> Ctx {
    Ctx::with_defaults(1)
}

/// Creates a budget-domain root with the given name.
pub async fn create_test_budget(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    name: &str,
) -> Result<BudgetModel> {
    store::budget::create_budget(
        db,
        ctx,
        store::budget::CreateBudget {
            kind: BudgetKind::Budget,
            name: name.to_string(),
            image: None,
            is_community: false,
        },
    )
    .await
}

/// Creates a template-domain root with the given name.
pub async fn create_test_template(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    name: &str,
) -> Result<BudgetModel> {
    store::budget::create_budget(
        db,
        ctx,
        store::budget::CreateBudget {
            kind: BudgetKind::Template,
            name: name.to_string(),
            image: None,
            is_community: false,
        },
    )
    .await
}

/// Creates an account with the given identifier and no description or group.
pub async fn create_test_account(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    identifier: &str,
) -> Result<AccountModel> {
    store::account::create_account(
        db,
        ctx,
        budget_id,
        store::account::CreateAccount {
            identifier: identifier.to_string(),
            description: None,
            group: None,
        },
    )
    .await
}

/// Creates an empty subaccount under the given parent node.
pub async fn create_test_subaccount(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    parent: NodeRef,
) -> Result<SubaccountModel> {
    store::subaccount::create_subaccount(db, ctx, parent, Default::default()).await
}

/// Creates a leaf subaccount with the given estimate fields.
pub async fn create_test_leaf(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    parent: NodeRef,
    quantity: f64,
    rate: f64,
    multiplier: f64,
) -> Result<SubaccountModel> {
    store::subaccount::create_subaccount(
        db,
        ctx,
        parent,
        store::subaccount::CreateSubaccount {
            quantity: Some(quantity),
            rate: Some(rate),
            multiplier: Some(multiplier),
            ..Default::default()
        },
    )
    .await
}

/// Creates a percent fringe with the given rate and optional cutoff. The name
/// carries the rate so several fringes can coexist in one budget.
pub async fn create_test_fringe(
    db: &DatabaseConnection,
    ctx: &mut Ctx,
    budget_id: i64,
    rate: f64,
    cutoff: Option<f64>,
) -> Result<FringeModel> {
    store::fringe::create_fringe(
        db,
        ctx,
        budget_id,
        store::fringe::CreateFringe {
            name: format!("Fringe {rate}"),
            rate: Some(rate),
            cutoff,
            unit: FringeUnit::Percent,
            ..Default::default()
        },
    )
    .await
}
