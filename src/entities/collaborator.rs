//! Collaborator entity - a scoped access grant on a budget.
//!
//! Grants exist only in the budget domain; templates have no collaborator
//! concept. The budget owner cannot also be a collaborator on their own
//! budget, and a user cannot remove themselves.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Level of access a collaborator holds on a budget.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum AccessType {
    /// Full control, including collaborator management
    #[sea_orm(string_value = "owner")]
    Owner,
    /// Read-write access to budget content
    #[sea_orm(string_value = "editor")]
    Editor,
    /// Read-only access
    #[sea_orm(string_value = "view_only")]
    ViewOnly,
}

/// Collaborator database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "collaborators")]
pub struct Model {
    /// Unique identifier for the grant
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Budget the grant applies to
    pub budget_id: i64,
    /// User being granted access
    pub user_id: i64,
    /// Level of access granted
    pub access_type: AccessType,
    /// When the grant was created
    pub created_at: DateTimeUtc,
    /// When the grant was last modified
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between Collaborator and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each grant belongs to one budget
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
