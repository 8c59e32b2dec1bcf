//! Shared reference types for polymorphic links.
//!
//! Groups, markups and actuals can hang off more than one kind of row. Those
//! links are stored as a tagged pair: a kind column (one of the active enums
//! below) plus an id column. The `*Ref` structs bundle the pair for passing
//! through the call graph.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Every entity kind the signal bus, cache and history log can refer to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, DeriveActiveEnum,
    Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum EntityKind {
    /// Budget or template root
    #[sea_orm(string_value = "budget")]
    Budget,
    /// Top-level account row
    #[sea_orm(string_value = "account")]
    Account,
    /// Recursive line item
    #[sea_orm(string_value = "subaccount")]
    Subaccount,
    /// Fringe cost modifier
    #[sea_orm(string_value = "fringe")]
    Fringe,
    /// Flat or percent markup
    #[sea_orm(string_value = "markup")]
    Markup,
    /// Row cluster
    #[sea_orm(string_value = "group")]
    Group,
    /// Recorded expenditure
    #[sea_orm(string_value = "actual")]
    Actual,
    /// Budget collaborator grant
    #[sea_orm(string_value = "collaborator")]
    Collaborator,
}

impl EntityKind {
    /// Lowercase name used in error messages and cache keys.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Budget => "budget",
            Self::Account => "account",
            Self::Subaccount => "subaccount",
            Self::Fringe => "fringe",
            Self::Markup => "markup",
            Self::Group => "group",
            Self::Actual => "actual",
            Self::Collaborator => "collaborator",
        }
    }
}

/// Kind tag for rows that can parent a group or markup.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, DeriveActiveEnum,
    Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ParentKind {
    /// The budget root itself
    #[sea_orm(string_value = "budget")]
    Budget,
    /// An account row
    #[sea_orm(string_value = "account")]
    Account,
    /// A subaccount row
    #[sea_orm(string_value = "subaccount")]
    Subaccount,
}

/// Kind tag for tree nodes: the rows that carry calculated aggregates and can
/// parent subaccounts or be markup children.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, DeriveActiveEnum,
    Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum NodeKind {
    /// An account row
    #[sea_orm(string_value = "account")]
    Account,
    /// A subaccount row
    #[sea_orm(string_value = "subaccount")]
    Subaccount,
}

/// Kind tag for rows that can own an actual.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, DeriveActiveEnum,
    Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum OwnerKind {
    /// A subaccount row
    #[sea_orm(string_value = "subaccount")]
    Subaccount,
    /// A markup row
    #[sea_orm(string_value = "markup")]
    Markup,
}

/// Tagged reference to a group/markup parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParentRef {
    /// Kind of the referenced row
    pub kind: ParentKind,
    /// Primary key of the referenced row
    pub id: i64,
}

impl ParentRef {
    /// Reference to a budget root.
    #[must_use]
    pub const fn budget(id: i64) -> Self {
        Self {
            kind: ParentKind::Budget,
            id,
        }
    }

    /// Reference to an account row.
    #[must_use]
    pub const fn account(id: i64) -> Self {
        Self {
            kind: ParentKind::Account,
            id,
        }
    }

    /// Reference to a subaccount row.
    #[must_use]
    pub const fn subaccount(id: i64) -> Self {
        Self {
            kind: ParentKind::Subaccount,
            id,
        }
    }

    /// The tree node this parent corresponds to, unless it is the budget root.
    #[must_use]
    pub const fn as_node(self) -> Option<NodeRef> {
        match self.kind {
            ParentKind::Budget => None,
            ParentKind::Account => Some(NodeRef {
                kind: NodeKind::Account,
                id: self.id,
            }),
            ParentKind::Subaccount => Some(NodeRef {
                kind: NodeKind::Subaccount,
                id: self.id,
            }),
        }
    }
}

/// Tagged reference to a tree node (account or subaccount).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    /// Kind of the referenced row
    pub kind: NodeKind,
    /// Primary key of the referenced row
    pub id: i64,
}

impl NodeRef {
    /// Reference to an account row.
    #[must_use]
    pub const fn account(id: i64) -> Self {
        Self {
            kind: NodeKind::Account,
            id,
        }
    }

    /// Reference to a subaccount row.
    #[must_use]
    pub const fn subaccount(id: i64) -> Self {
        Self {
            kind: NodeKind::Subaccount,
            id,
        }
    }
}

impl From<NodeRef> for ParentRef {
    fn from(node: NodeRef) -> Self {
        match node.kind {
            NodeKind::Account => Self::account(node.id),
            NodeKind::Subaccount => Self::subaccount(node.id),
        }
    }
}

/// Tagged reference to an actual's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerRef {
    /// Kind of the owning row
    pub kind: OwnerKind,
    /// Primary key of the owning row
    pub id: i64,
}

impl OwnerRef {
    /// An actual owned by a subaccount.
    #[must_use]
    pub const fn subaccount(id: i64) -> Self {
        Self {
            kind: OwnerKind::Subaccount,
            id,
        }
    }

    /// An actual owned by a markup.
    #[must_use]
    pub const fn markup(id: i64) -> Self {
        Self {
            kind: OwnerKind::Markup,
            id,
        }
    }
}
