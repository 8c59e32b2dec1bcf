//! Budget entity - the root of every budgeting tree.
//!
//! A row is either a full budget or a reusable template, selected by `kind`.
//! The aggregate columns (`nominal_value`, `accumulated_*`, `actual`) are
//! maintained by the calculation engine and must never be written directly
//! by callers.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Root model kind: a working budget or a reusable template. Templates have no
/// collaborators or actuals and may be flagged as community content.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum BudgetKind {
    /// A user's working budget
    #[sea_orm(string_value = "budget")]
    Budget,
    /// A reusable template
    #[sea_orm(string_value = "template")]
    Template,
}

/// Budget database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "budgets")]
pub struct Model {
    /// Unique identifier for the budget
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Whether this row is a budget or a template
    pub kind: BudgetKind,
    /// Human-readable name (e.g. "Feature Film - Q3")
    pub name: String,
    /// Optional reference to a cover image (path or URL, storage is external)
    pub image: Option<String>,
    /// Community visibility flag; meaningful for templates only
    pub is_community: bool,
    /// Hidden flag; meaningful for community templates only
    pub is_hidden: bool,
    /// Archived budgets are excluded from default listings
    pub is_archived: bool,
    /// User who created the budget
    pub created_by: i64,
    /// User who last modified the budget
    pub updated_by: i64,
    /// When the budget was created
    pub created_at: DateTimeUtc,
    /// When the budget was last modified
    pub updated_at: DateTimeUtc,
    /// Cached aggregate: sum of account-level values
    pub nominal_value: f64,
    /// Cached aggregate: fringe contributions over all descendants
    pub accumulated_fringe_contribution: f64,
    /// Cached aggregate: markup contributions over all descendants
    pub accumulated_markup_contribution: f64,
    /// Cached aggregate: recorded spend over all descendants
    pub actual: f64,
}

/// Defines relationships between Budget and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One budget has many accounts
    #[sea_orm(has_many = "super::account::Entity")]
    Accounts,
    /// One budget has many fringes
    #[sea_orm(has_many = "super::fringe::Entity")]
    Fringes,
    /// One budget has many actuals
    #[sea_orm(has_many = "super::actual::Entity")]
    Actuals,
    /// One budget has many collaborator grants
    #[sea_orm(has_many = "super::collaborator::Entity")]
    Collaborators,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Accounts.def()
    }
}

impl Related<super::fringe::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Fringes.def()
    }
}

impl Related<super::actual::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Actuals.def()
    }
}

impl Related<super::collaborator::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Collaborators.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
