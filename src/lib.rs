// Library exports for the API server, the worker binary, and integration tests

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod queue;
pub mod storage;
pub mod transcoder;

#[cfg(feature = "test-utils")]
pub mod test_support;
