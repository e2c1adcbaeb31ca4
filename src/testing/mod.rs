//! Testing utilities
//!
//! An in-memory transport so sessions can be exercised without a broker.

pub mod mocks;

pub use mocks::*;
