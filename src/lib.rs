//! artifact-depot - A self-hosted multi-ecosystem package registry
//!
//! Hosts, proxies and groups repositories for npm, Maven, NuGet, PyPI,
//! Composer, Helm, Cargo, container images and raw files. Proxy
//! repositories read through a content-aware cache; every container
//! repository gets its own registry listener.

pub mod auth;
pub mod config;
pub mod container;
pub mod database;
pub mod digest;
pub mod error;
pub mod models;
pub mod otel;
pub mod plugins;
pub mod router;
pub mod server;
pub mod storage;
pub mod upstream;
