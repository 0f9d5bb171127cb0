//! Error kinds shared across the sync engine.
//!
//! One `thiserror` enum per concern, wrapped into this top-level kind
//! at the boundary where a caller actually needs to branch on what
//! went wrong.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharmeError {
    #[error("invalid recovery phrase: {0}")]
    InvalidPhrase(String),

    #[error("invalid share token: {0}")]
    InvalidToken(String),

    #[error("decryption failed")]
    DecryptFailed,

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("blob too large: {size} bytes, max {max}")]
    BlobTooLarge { size: usize, max: usize },

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("gateway error: {0}")]
    GatewayError(String),

    #[error("pagination limit exceeded")]
    PaginationBlown,

    #[error("local store corrupted: {0}")]
    StoreCorruption(String),

    #[error("sharme home is not initialized")]
    NotInitialized,

    #[error("share already imported")]
    DuplicateImport,
}

pub type Result<T> = std::result::Result<T, SharmeError>;
