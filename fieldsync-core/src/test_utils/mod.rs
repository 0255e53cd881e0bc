//! Test utilities for fieldsync
//!
//! An in-memory remote, a manual clock, device fixtures and async helpers
//! shared by the unit and scenario tests.

pub mod async_helpers;
pub mod fixtures;
pub mod memory_remote;

pub use async_helpers::*;
pub use fixtures::*;
pub use memory_remote::{MemoryRemote, FIRST_SERVER_ID};
