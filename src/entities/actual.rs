//! Actual entity - a recorded expenditure against a budget.
//!
//! Ownership is a tagged `(owner_kind, owner_id)` pair: an actual is charged
//! to a subaccount or to a markup. Unowned actuals still count toward the
//! budget total once assigned; until then they only appear in listings.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::refs::OwnerKind;

/// Actual database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "actuals")]
pub struct Model {
    /// Unique identifier for the actual
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Budget this actual belongs to
    pub budget_id: i64,
    /// Kind of the owning row, if assigned
    pub owner_kind: Option<OwnerKind>,
    /// Primary key of the owning row, if assigned
    pub owner_id: Option<i64>,
    /// Short name of the expenditure
    pub name: Option<String>,
    /// Free-form notes
    pub notes: Option<String>,
    /// Date the expenditure occurred
    pub date: Option<Date>,
    /// Amount spent; null sums as 0
    pub value: Option<f64>,
    /// External payment reference
    pub payment_id: Option<String>,
    /// Purchase order number
    pub purchase_order: Option<String>,
    /// Expenditure type tag (e.g. "invoice", "credit card")
    pub actual_type: Option<String>,
    /// Contact reference, if any
    pub contact: Option<i64>,
    /// Fractional order key within the budget's actual table
    pub order: String,
}

/// Defines relationships between Actual and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each actual belongs to one budget
    #[sea_orm(
        belongs_to = "super::budget::Entity",
        from = "Column::BudgetId",
        to = "super::budget::Column::Id"
    )]
    Budget,
}

impl Related<super::budget::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Budget.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Tagged reference to this actual's owner, if assigned.
    #[must_use]
    pub fn owner(&self) -> Option<super::refs::OwnerRef> {
        match (self.owner_kind, self.owner_id) {
            (Some(kind), Some(id)) => Some(super::refs::OwnerRef { kind, id }),
            _ => None,
        }
    }
}
