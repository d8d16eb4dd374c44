//! HTTP control plane (`/v1`): the admission boundary, job status and
//! cancellation, result retrieval, listing, the SSE event stream, and
//! operator endpoints.

pub mod error;
pub mod models;
pub mod server;
pub mod services;
pub mod state;
pub mod utils;
