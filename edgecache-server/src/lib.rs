//! The edge delivery server.
//!
//! This builds on top of the [`edgecache_service`] and exposes its delivery engine as an `HTTP`
//! layer which serves objects and images from the origin to *external clients*, cached in Redis.

pub mod cli;
pub mod config;
pub mod endpoints;
pub mod healthcheck;
pub mod observability;
pub mod state;
pub mod web;
