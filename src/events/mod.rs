//! Server-side event tailing for the SSE endpoint and operator tooling.

pub mod stream;

pub use stream::{StreamItem, TailConfig, tail_events};
