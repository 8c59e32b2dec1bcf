//! Markup entity - an additive flat- or percent-based cost hung off a budget,
//! account or subaccount.
//!
//! Percent markups carry explicit children (rows of the same parent) through
//! the `markup_children` join table and must have at least one; flat markups
//! have none and contribute their rate once to the parent's accumulated
//! bucket.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::refs::ParentKind;

/// How a markup's rate is interpreted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum MarkupUnit {
    /// Rate is a fraction of each child's nominal value
    #[default]
    #[sea_orm(string_value = "percent")]
    Percent,
    /// Rate is an absolute amount added once to the parent
    #[sea_orm(string_value = "flat")]
    Flat,
}

/// Markup database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "markups")]
pub struct Model {
    /// Unique identifier for the markup
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Budget the parent row belongs to (denormalized for same-budget checks)
    pub budget_id: i64,
    /// Kind of the row this markup hangs off
    pub parent_kind: ParentKind,
    /// Primary key of the row this markup hangs off
    pub parent_id: i64,
    /// User-facing label
    pub identifier: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// Rate; a null rate contributes 0
    pub rate: Option<f64>,
    /// Whether the rate is percent-of-children or a flat amount
    pub unit: MarkupUnit,
    /// Fractional order key within the parent's markup table
    pub order: String,
}

/// Defines relationships between Markup and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each markup belongs to one budget
    #[sea_orm(
        belongs_to = "super::budget::Entity",
        from = "Column::BudgetId",
        to = "super::budget::Column::Id"
    )]
    Budget,
    /// Join rows naming the children a percent markup applies to
    #[sea_orm(has_many = "super::markup_child::Entity")]
    Children,
}

impl Related<super::budget::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Budget.def()
    }
}

impl Related<super::markup_child::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Children.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Tagged reference to this markup's parent.
    #[must_use]
    pub const fn parent(&self) -> super::refs::ParentRef {
        super::refs::ParentRef {
            kind: self.parent_kind,
            id: self.parent_id,
        }
    }
}
