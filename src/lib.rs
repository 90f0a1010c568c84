//! fragwatch: ingest fragrance sale posts from Reddit, extract line items and
//! store them in SQLite, with NATS JetStream between fetching and processing.
pub mod backfill;
pub mod config;
pub mod db;
pub mod extract;
pub mod filter;
pub mod model;
pub mod queue;
pub mod reddit;
pub mod worker;
