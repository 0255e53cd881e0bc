/*
    Model subsystem - Records, queued operations and reference rows
*/

pub mod operation;
pub mod record;
pub mod reference;
pub mod types;

pub use operation::*;
pub use record::*;
pub use reference::*;
pub use types::*;
