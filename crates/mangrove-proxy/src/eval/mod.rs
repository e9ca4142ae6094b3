//! Document evaluator: the in-memory implementation of MongoDB's filter,
//! projection, sort and update semantics.
//!
//! The backend may pre-filter with SQL pushdown, but this module is the
//! source of truth; anything the pushdown cannot express exactly is
//! re-checked here.
//!
//! - `path` - dotted paths, implicit array traversal, write navigation
//! - `filter` - query operators
//! - `projection` - inclusion/exclusion/$slice shaping
//! - `sort` - stable multi-key canonical sort
//! - `update` - update operators with validate-then-apply semantics

pub mod filter;
pub mod path;
pub mod projection;
pub mod sort;
pub mod update;
