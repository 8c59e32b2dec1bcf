//! Entity module - Contains all SeaORM entity definitions for the database.
//! These entities represent the database tables and their relationships.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod account;
pub mod actual;
pub mod budget;
pub mod collaborator;
pub mod event;
pub mod fringe;
pub mod group;
pub mod markup;
pub mod markup_child;
pub mod refs;
pub mod subaccount;
pub mod subaccount_fringe;

// Re-export specific types to avoid conflicts
pub use account::{Column as AccountColumn, Entity as Account, Model as AccountModel};
pub use actual::{Column as ActualColumn, Entity as Actual, Model as ActualModel};
pub use budget::{
    BudgetKind, Column as BudgetColumn, Entity as Budget, Model as BudgetModel,
};
pub use collaborator::{
    AccessType, Column as CollaboratorColumn, Entity as Collaborator, Model as CollaboratorModel,
};
pub use event::{Column as EventColumn, Entity as Event, EventType, Model as EventModel};
pub use fringe::{Column as FringeColumn, Entity as Fringe, FringeUnit, Model as FringeModel};
pub use group::{Column as GroupColumn, Entity as Group, Model as GroupModel};
pub use markup::{Column as MarkupColumn, Entity as Markup, MarkupUnit, Model as MarkupModel};
pub use markup_child::{
    Column as MarkupChildColumn, Entity as MarkupChild, Model as MarkupChildModel,
};
pub use refs::{EntityKind, NodeKind, NodeRef, OwnerKind, OwnerRef, ParentKind, ParentRef};
pub use subaccount::{
    Column as SubaccountColumn, Entity as Subaccount, Model as SubaccountModel,
};
pub use subaccount_fringe::{
    Column as SubaccountFringeColumn, Entity as SubaccountFringe, Model as SubaccountFringeModel,
};

/// Alias for the root model kind when used to select child model behavior
/// (budget domain vs template domain).
pub type Domain = BudgetKind;
