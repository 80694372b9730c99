//! Version-composed response cache for database-backed web applications.
//!
//! The engine lives in [`cache`]; [`infra`] holds the Postgres ledger, the
//! upstream proxy, and telemetry bootstrap; [`config`] resolves settings.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
