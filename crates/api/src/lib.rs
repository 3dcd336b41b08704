// API crate clippy configuration
#![allow(clippy::single_match)] // Clearer in some cases
#![allow(clippy::needless_borrows_for_generic_args)] // Sometimes needed for clarity
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ConsultDesk API Library
//!
//! HTTP surface for billing operations, provider webhooks, notification
//! triggers and SLA scheduling.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
