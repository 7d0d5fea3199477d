//! # Warehouse Source Client
//!
//! Read-side client for the analytic warehouse: table metadata, paginated
//! query results with type-preserving value decoding, multipart NDJSON load
//! jobs, and additive schema updates. Authentication is a service-account
//! JWT exchanged for a scoped access token (see [`auth`]).

pub mod auth;
mod client;

pub use auth::{ServiceAccountKey, TokenProvider};
pub use client::{LoadJobResult, LoadMode, WarehouseClient};
