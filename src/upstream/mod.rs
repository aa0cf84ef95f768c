//! Upstream registry access
//!
//! - [`client`]: conditional GETs with bearer challenge handling
//! - [`retry`]: exponential backoff for transient failures

pub mod client;
pub mod retry;

pub use client::{BearerChallenge, FetchOptions, UpstreamBody, UpstreamClient, UpstreamResponse};
pub use retry::RetryManager;
