//! Testing utilities for the Cadence flow engine.
//!
//! Fixture component types, a pre-wired registry, coverage assertions and
//! polling helpers for asynchronous tests.

pub mod assertions;
pub mod engine;
pub mod fixtures;
pub mod util;

pub use cadence_monitoring::init_test_tracing;
pub use engine::TestEngine;
pub use util::{settle, wait_until};
