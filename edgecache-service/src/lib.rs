//! The delivery layer of the edge cache.
//!
//! This crate decides how each request for an object is served: from the cache, buffered from
//! the origin and cached in the background, streamed from the origin, or as a byte range. It
//! also recompresses oversized images so that they fit the cache budget.
//!
//! It is designed as a library crate to be used by the `server`. The origin blob store and the
//! cache store are injected into the [`DeliveryEngine`] as trait objects, see
//! [`backend::BlobStore`] and [`cache::CacheStore`].
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod backend;
pub mod cache;
pub mod compress;
mod concurrency;
pub mod copy;
mod engine;
mod error;
pub mod populate;
pub mod range;
mod stream;

pub use engine::*;
pub use error::{DeliveryError, RejectReason};
pub use stream::PayloadStream;
