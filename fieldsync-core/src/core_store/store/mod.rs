/*
    Store subsystem - Persistence layer
*/

pub mod errors;
pub mod local_store;
pub mod migrations;

pub use errors::*;
pub use local_store::{LocalStore, LocalStoreConfig, RecordFilter, StoreStats};
