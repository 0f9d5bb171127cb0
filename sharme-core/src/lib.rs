pub mod config;
pub mod conversation;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod id;
pub mod identity;
pub mod meta;
pub mod scheduler;
pub mod shard;
pub mod share;
pub mod store;
pub mod sync;

pub use error::{Result, SharmeError};
pub use gateway::{ArchiveGateway, SharedGateway, SharedUploader, UploadBackend};
pub use identity::{derive_keypair, generate_phrase, validate_phrase, Keypair};
pub use store::{Fact, LocalStore};
pub use sync::{PullOutcome, PushOutcome, SyncEngine};

/// Installs a `tracing` subscriber for test output. Library code never
/// installs a global subscriber itself; tests that want to see
/// `info!`/`warn!` output while debugging call this first. Safe to
/// call from more than one test in the same binary — later calls are
/// no-ops.
#[cfg(test)]
pub fn tracing_test_subscriber() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}
