//! Join table linking subaccounts to the fringes applied to them.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// SubAccount-to-Fringe join row
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subaccount_fringes")]
pub struct Model {
    /// Unique identifier for the join row
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Subaccount side of the link
    pub subaccount_id: i64,
    /// Fringe side of the link
    pub fringe_id: i64,
}

/// Defines relationships for the join table
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each join row points at one subaccount
    #[sea_orm(
        belongs_to = "super::subaccount::Entity",
        from = "Column::SubaccountId",
        to = "super::subaccount::Column::Id"
    )]
    Subaccount,
    /// Each join row points at one fringe
    #[sea_orm(
        belongs_to = "super::fringe::Entity",
        from = "Column::FringeId",
        to = "super::fringe::Column::Id"
    )]
    Fringe,
}

impl Related<super::subaccount::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subaccount.def()
    }
}

impl Related<super::fringe::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Fringe.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
