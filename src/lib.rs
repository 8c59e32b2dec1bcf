//! Topsheet - backend core of a collaborative production-budgeting service
//!
//! This crate provides the calculation engine, fractional row ordering,
//! signal bus, bulk-operation framework, duplication engine, endpoint cache
//! and history log behind a spreadsheet-like budgeting client. HTTP routing,
//! authentication and serialization of responses live in the service layer
//! above it.

// Deny the most critical lints that could lead to bugs or security issues
#![deny(
    // Security and correctness
    unsafe_code,
    unsafe_op_in_unsafe_fn,

    // Code quality - things that are almost always bugs
    unreachable_code,
    unreachable_patterns,
    unused_must_use,

    // Documentation - broken links are bugs
    rustdoc::broken_intra_doc_links,
    rustdoc::private_intra_doc_links,
)]
// Warn on things that should be fixed but aren't necessarily bugs
#![warn(
    // Documentation - missing docs should be added gradually
    missing_docs,

    // Clippy categories for overall code quality
    clippy::all,
    clippy::pedantic,
    clippy::nursery,

    // Performance
    clippy::inefficient_to_string,
    clippy::large_types_passed_by_value,
    clippy::needless_pass_by_value,
    clippy::unnecessary_wraps,

    // Correctness
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::exit,
    clippy::expect_used,
    clippy::float_cmp,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_used,

    // Complexity and readability
    clippy::cognitive_complexity,
    clippy::large_enum_variant,
    clippy::match_same_arms,
    clippy::too_many_lines,

    // Style consistency
    clippy::enum_glob_use,
    clippy::inconsistent_struct_constructor,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::redundant_closure_for_method_calls,
    clippy::semicolon_if_nothing_returned,
    clippy::wildcard_imports,

    // Future compatibility
    future_incompatible,
    rust_2018_idioms,
)]
// Allow some pedantic lints that are too noisy or not applicable
#![allow(
    clippy::module_name_repetitions,  // Common pattern in Rust
    clippy::missing_errors_doc,        // Will add gradually
    clippy::missing_panics_doc,        // Will add gradually
)]

/// Transactional bulk create/update/delete with one recompute pass per call
pub mod bulk;
/// In-process endpoint response cache keyed by entity identity
pub mod cache;
/// Budget calculation engine - per-row values and ancestor propagation
pub mod calc;
/// Configuration management for database and application settings
pub mod config;
/// Deep-copy of budget trees with id remapping
pub mod duplicate;
/// SeaORM entity definitions for database tables
pub mod entities;
/// Unified error types and result handling
pub mod errors;
/// Append-only create/field-change history log
pub mod history;
/// Fractional order-key primitives for row tables
pub mod ordering;
/// Signal/event bus with scoped suspension and effect receivers
pub mod signals;
/// Entity store - per-entity CRUD with validation and signal emission
pub mod store;
/// Read-only tree projections for the client
pub mod tree;

#[cfg(test)]
pub mod test_utils;
