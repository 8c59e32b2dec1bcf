//! Event entity - the append-only history/audit log.
//!
//! One row per create event, and one per changed tracked field on update.
//! Old/new values are serialized as JSON with datetimes coerced to ISO
//! strings. History is read-only from the API.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::refs::EntityKind;

/// Kind of history event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(24))")]
pub enum EventType {
    /// A row was created
    #[sea_orm(string_value = "create")]
    Create,
    /// A tracked field changed value
    #[sea_orm(string_value = "field_alteration")]
    FieldAlteration,
}

/// History event database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "events")]
pub struct Model {
    /// Unique identifier for the event
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Whether this records a creation or a field change
    pub event_type: EventType,
    /// Kind of the row the event refers to
    pub entity_kind: EntityKind,
    /// Primary key of the row the event refers to
    pub entity_id: i64,
    /// Budget the row belongs to, for scoped queries
    pub budget_id: i64,
    /// User who performed the mutation
    pub user_id: i64,
    /// Changed field name, for field alterations
    pub field: Option<String>,
    /// JSON-serialized previous value, for field alterations
    pub old_value: Option<Json>,
    /// JSON-serialized new value, for field alterations
    pub new_value: Option<Json>,
    /// When the event was recorded
    pub created_at: DateTimeUtc,
}

/// Defines relationships between Event and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each event is scoped to one budget
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
