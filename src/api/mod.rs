//! HTTP API Module
//!
//! Serves the peer API other agents call during role switches, plus
//! health and diagnostics for operators.

mod http;

pub use http::{AppState, HttpServer};
