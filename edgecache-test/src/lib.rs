//! Test utilities for the edgecache server.
//!
//! This crate provides utilities to facilitate black-box testing of the server. See the modules
//! for all available utilities.

pub mod server;
pub mod tracing;
