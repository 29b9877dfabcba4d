//! Front HTTP server
//!
//! Accepts Anthropic-shaped requests, exposes health/status/stats, and
//! writes responses back as JSON or SSE.

pub mod router;
pub mod server;
pub mod streaming;

pub use router::{AppState, create_router};
pub use server::Gateway;
