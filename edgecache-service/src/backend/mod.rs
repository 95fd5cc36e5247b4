//! Origin blob store implementations.

mod common;
mod in_memory;
mod s3_compatible;

pub use common::*;
pub use in_memory::InMemoryBackend;
pub use s3_compatible::{S3CompatibleBackend, S3CompatibleConfig};
