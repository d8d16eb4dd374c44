pub mod api;
pub mod config;
pub mod download;
pub mod events;
pub mod humanize;
pub mod jobs;
pub mod observability;
pub mod providers;
pub mod server;
pub mod store;
pub mod worker;
