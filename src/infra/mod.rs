//! Infrastructure adapters and runtime bootstrap.

pub mod db;
pub mod error;
pub mod proxy;
pub mod telemetry;
