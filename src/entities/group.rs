//! Group entity - a client-visible clustering of sibling rows.
//!
//! A group hangs off a budget, account or subaccount and collects the child
//! rows whose `group_id` points at it. When the last member leaves, the group
//! is pruned automatically by the signal bus.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::refs::ParentKind;

/// Group database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "groups")]
pub struct Model {
    /// Unique identifier for the group
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Kind of the row this group hangs off
    pub parent_kind: ParentKind,
    /// Primary key of the row this group hangs off
    pub parent_id: i64,
    /// Display name
    pub name: String,
    /// Display color for the client
    pub color: Option<String>,
    /// Fractional order key within the parent's group table
    pub order: String,
}

/// Defines relationships between Group and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Accounts clustered under this group
    #[sea_orm(has_many = "super::account::Entity")]
    Accounts,
    /// Subaccounts clustered under this group
    #[sea_orm(has_many = "super::subaccount::Entity")]
    Subaccounts,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Accounts.def()
    }
}

impl Related<super::subaccount::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subaccounts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
