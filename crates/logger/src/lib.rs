//! Shared tracing setup for the connectivity check binaries.

mod tracing;

pub use crate::tracing::{LogFormat, init, init_with_level};
