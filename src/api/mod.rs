//! HTTP API Module
//!
//! The ingress the node agents talk to: registration, heartbeats, and
//! per-node file distribution, plus health and fleet status.

mod routes;

pub use routes::{router, serve};
