//! Testing utilities for harlog
//!
//! `MockServer` stands in for the metrics collector and the account API in
//! integration tests. It records every request it receives so tests can
//! assert on the batches a middleware instance actually shipped.

pub mod expectation;
pub mod matcher;
pub mod server;

pub use expectation::{Expectation, MockResponse, Times};
pub use matcher::RequestMatcher;
pub use server::{ExpectationBuilder, MockServer, RecordedRequest};
