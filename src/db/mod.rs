//! Database module: row models and SQL repositories.
//!
//! - `model`: row structs decoded by `sqlx` and their conversion into domain types.
//! - `repo`: SQL-only functions operating on the pool.
//!
//! Callers import from `smartexam_sync::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;
