#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Resumely shared types
//!
//! Types and database helpers used by the API server, the billing
//! reconciler and the background worker.

pub mod db;
pub mod plan;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use plan::{Plan, PlanParseError};
