//! # Textcast Gateway
//!
//! HTTP boundary for delivery agents and owners: due-work pulls, sent and
//! failed reports, scheduling and admin actions, statistics. Every request
//! except `/health` carries a bearer API key resolved to an owner.

pub mod db;
pub mod routes;
pub mod server;

pub use db::{ApiKeyDb, ApiKeyRecord, IssuedKey};
pub use server::{AppState, Caller, build_router, start};
