/*
    core_sync - Moving field records between the device and the remote API

    Handles:
    - Local writes routed through the merge state and the durable queue
    - Push of queued intents and pull of remote changes
    - Sync status publication and the process-wide lifecycle
*/

pub mod clock;
pub mod engine;
pub mod errors;
pub mod http;
pub mod remote;
pub mod status;
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use clock::{Clock, SystemClock};
pub use engine::{SyncEngine, SyncReport};
pub use errors::{SyncError, SyncResult};
pub use http::HttpRemote;
pub use remote::{
    CredentialProvider, EnvToken, RemoteApi, RemoteError, RemoteResult, StaticToken, WireRecord,
};
pub use status::{NetworkState, SyncStatus};
pub use supervisor::SyncSupervisor;
