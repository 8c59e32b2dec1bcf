//! Budget calculation engine.
//!
//! [`values`] holds the pure per-row math (leaf formula, fringe and markup
//! application); [`engine`] walks dirty nodes' ancestor chains and rewrites
//! the persisted aggregates in dependency order, deepest first, each node
//! exactly once, finishing with the budget row. Aggregate writes go through
//! silent updates so recomputation can never re-trigger itself.

pub mod engine;
pub mod values;

pub use engine::{recompute, recompute_budget_tree};
pub use values::{fringe_contribution, leaf_nominal, percent_contribution};
