//! Join table naming the account/subaccount children a percent markup applies
//! to. The child kind is tagged since both row kinds can be markup children.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::refs::NodeKind;

/// Markup-to-child join row
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "markup_children")]
pub struct Model {
    /// Unique identifier for the join row
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Markup side of the link
    pub markup_id: i64,
    /// Kind of the child row
    pub child_kind: NodeKind,
    /// Primary key of the child row
    pub child_id: i64,
}

/// Defines relationships for the join table
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each join row points at one markup
    #[sea_orm(
        belongs_to = "super::markup::Entity",
        from = "Column::MarkupId",
        to = "super::markup::Column::Id"
    )]
    Markup,
}

impl Related<super::markup::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Markup.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Tagged reference to the child row.
    #[must_use]
    pub const fn child(&self) -> super::refs::NodeRef {
        super::refs::NodeRef {
            kind: self.child_kind,
            id: self.child_id,
        }
    }
}
