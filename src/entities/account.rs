//! Account entity - a top-level budgetary category directly under a budget.
//!
//! `(budget_id, identifier)` is unique; the identifier is the user-facing
//! account number (e.g. "1000"). Aggregate columns are maintained by the
//! calculation engine.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Account database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    /// Unique identifier for the account
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Budget this account belongs to
    pub budget_id: i64,
    /// User-facing account number, unique within the budget
    pub identifier: String,
    /// Free-form description
    pub description: Option<String>,
    /// Group this row is clustered under, if any
    pub group_id: Option<i64>,
    /// Fractional order key within the budget's account table
    pub order: String,
    /// Cached aggregate: sum of child line-item values
    pub nominal_value: f64,
    /// Cached: contribution of percent markups that list this account as a child
    pub markup_contribution: f64,
    /// Cached aggregate: fringe contributions over all descendants
    pub accumulated_fringe_contribution: f64,
    /// Cached aggregate: markup contributions over descendants plus own flat markups
    pub accumulated_markup_contribution: f64,
    /// Cached aggregate: accumulated value over all descendants
    pub accumulated_value: f64,
    /// Cached aggregate: recorded spend over all descendants
    pub actual: f64,
}

/// Defines relationships between Account and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each account belongs to one budget
    #[sea_orm(
        belongs_to = "super::budget::Entity",
        from = "Column::BudgetId",
        to = "super::budget::Column::Id"
    )]
    Budget,
    /// An account may sit inside a group
    #[sea_orm(
        belongs_to = "super::group::Entity",
        from = "Column::GroupId",
        to = "super::group::Column::Id"
    )]
    Group,
}

impl Related<super::budget::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Budget.def()
    }
}

impl Related<super::group::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Group.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
