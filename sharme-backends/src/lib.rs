//! Concrete archive and upload adapters for `sharme-core`'s
//! [`ArchiveGateway`]/[`UploadBackend`] seam.

mod archive;
mod cache;
mod upload;

pub use archive::{ArweaveGateway, GatewayError};
pub use cache::CachedGateway;
pub use upload::{ArweaveUploader, UploadError};
