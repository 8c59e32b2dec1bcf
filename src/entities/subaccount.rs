//! SubAccount entity - a recursive line item beneath an account or another
//! subaccount.
//!
//! Leaves carry the raw pricing inputs (`quantity`, `rate`, `multiplier`,
//! `unit`); a subaccount that gains children has those inputs cleared on save
//! and its value derives from its children instead. The parent link is a
//! tagged `(parent_kind, parent_id)` pair since both accounts and subaccounts
//! can parent rows.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::refs::NodeKind;

/// SubAccount database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subaccounts")]
pub struct Model {
    /// Unique identifier for the subaccount
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Budget the whole tree belongs to (denormalized for same-budget checks)
    pub budget_id: i64,
    /// Kind of the direct parent row
    pub parent_kind: NodeKind,
    /// Primary key of the direct parent row
    pub parent_id: i64,
    /// User-facing line number, optional for subaccounts
    pub identifier: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// Quantity input; null counts as 1 in the value formula
    pub quantity: Option<f64>,
    /// Rate input; null counts as 0 in the value formula
    pub rate: Option<f64>,
    /// Multiplier input; null counts as 1 in the value formula
    pub multiplier: Option<f64>,
    /// Unit tag (e.g. "days", "weeks"); informational only
    pub unit: Option<String>,
    /// Contact reference; populated in the budget domain only
    pub contact: Option<i64>,
    /// Group this row is clustered under, if any
    pub group_id: Option<i64>,
    /// Fractional order key within the parent's subaccount table
    pub order: String,
    /// Cached: leaf formula result, or aggregate over children
    pub nominal_value: f64,
    /// Cached: fringe contribution applied to this row's nominal value
    pub fringe_contribution: f64,
    /// Cached: contribution of percent markups listing this row as a child,
    /// plus (for leaves) flat markups parented to this row
    pub markup_contribution: f64,
    /// Cached aggregate: fringe contributions over all descendants
    pub accumulated_fringe_contribution: f64,
    /// Cached aggregate: markup contributions over descendants plus own flat markups
    pub accumulated_markup_contribution: f64,
    /// Cached aggregate: accumulated value over all descendants
    pub accumulated_value: f64,
    /// Cached aggregate: recorded spend for this row and its descendants
    pub actual: f64,
}

/// Defines relationships between SubAccount and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each subaccount belongs to one budget
    #[sea_orm(
        belongs_to = "super::budget::Entity",
        from = "Column::BudgetId",
        to = "super::budget::Column::Id"
    )]
    Budget,
    /// A subaccount may sit inside a group
    #[sea_orm(
        belongs_to = "super::group::Entity",
        from = "Column::GroupId",
        to = "super::group::Column::Id"
    )]
    Group,
    /// Join rows linking this subaccount to its fringes
    #[sea_orm(has_many = "super::subaccount_fringe::Entity")]
    SubaccountFringes,
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

/// Many-to-many to fringes through the `subaccount_fringes` join table
impl Related<super::fringe::Entity> for Entity {
    fn to() -> RelationDef {
        super::subaccount_fringe::Relation::Fringe.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::subaccount_fringe::Relation::Subaccount.def().rev())
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Tagged reference to this row's parent.
    #[must_use]
    pub const fn parent(&self) -> super::refs::NodeRef {
        super::refs::NodeRef {
            kind: self.parent_kind,
            id: self.parent_id,
        }
    }
}
