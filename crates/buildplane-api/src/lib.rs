//! HTTP API server for Buildplane.
//!
//! Exposes workspace build submission, cancellation and presentation over
//! a JSON REST API.

pub mod error;
pub mod extract;
pub mod routes;
pub mod state;

pub use state::AppState;
