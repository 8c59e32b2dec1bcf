//! Fringe entity - a flat- or percent-based cost adjustment owned by a budget
//! and applied to subaccounts through a many-to-many link.
//!
//! Flat fringes have their `cutoff` forced to null on save; the cutoff only
//! bounds percent fringes.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// How a fringe's rate is interpreted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum FringeUnit {
    /// Rate is a fraction of the row's nominal value, bounded by `cutoff`
    #[default]
    #[sea_orm(string_value = "percent")]
    Percent,
    /// Rate is an absolute amount added once
    #[sea_orm(string_value = "flat")]
    Flat,
}

/// Fringe database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "fringes")]
pub struct Model {
    /// Unique identifier for the fringe
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Budget this fringe belongs to
    pub budget_id: i64,
    /// Name, unique within the budget
    pub name: String,
    /// Free-form description
    pub description: Option<String>,
    /// Upper bound on the value a percent rate applies to; null for no bound
    pub cutoff: Option<f64>,
    /// Rate; a null rate contributes 0
    pub rate: Option<f64>,
    /// Whether the rate is percent-of-value or a flat amount
    pub unit: FringeUnit,
    /// Display color for the client
    pub color: Option<String>,
    /// Fractional order key within the budget's fringe table
    pub order: String,
}

/// Defines relationships between Fringe and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each fringe belongs to one budget
    #[sea_orm(
        belongs_to = "super::budget::Entity",
        from = "Column::BudgetId",
        to = "super::budget::Column::Id"
    )]
    Budget,
    /// Join rows linking this fringe to subaccounts
    #[sea_orm(has_many = "super::subaccount_fringe::Entity")]
    SubaccountFringes,
}

impl Related<super::budget::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Budget.def()
    }
}

/// Many-to-many to subaccounts through the `subaccount_fringes` join table
impl Related<super::subaccount::Entity> for Entity {
    fn to() -> RelationDef {
        super::subaccount_fringe::Relation::Subaccount.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::subaccount_fringe::Relation::Fringe.def().rev())
    }
}

impl ActiveModelBehavior for ActiveModel {}
