//! Persistence: row models and the SQLite repository.
//!
//! - `model`: rows returned to callers.
//! - `repo`: the [`Repository`] owning the connection pool and every SQL
//!   statement.

pub mod model;
pub mod repo;

pub use model::{LineItemRow, PersistedPost};
pub use repo::{Pool, Repository};
