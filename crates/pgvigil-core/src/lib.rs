//! pgvigil-core — query-observability core for PostgreSQL clusters.
//!
//! Provides:
//! - `connect` — target resolution into live connections (plain or via SSH tunnel)
//! - `normalize` — statement canonicalization and signatures
//! - `store` — deduplicated statement observations with triage state
//! - `monitor` — periodic `pg_stat_statements` sampling sessions
//! - `health` — on-demand cluster health-check runs with markdown reports
//! - `model` — clusters, instances, identifiers
//! - `repo` — persistence contracts for the surrounding console
//! - `mock` — scripted connection provider for tests and demos

pub mod connect;
pub mod error;
pub mod health;
pub mod mock;
pub mod model;
pub mod monitor;
pub mod normalize;
pub mod repo;
pub mod store;
