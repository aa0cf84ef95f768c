//! Ecosystem plugins and the proxy cache engine they share

pub mod cache;
pub mod registry;
