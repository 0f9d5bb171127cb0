//! Reserved keys for the process-wide meta KV table.

pub const CURRENT_VERSION: &str = "current_version";
pub const LAST_PUSHED_VERSION: &str = "last_pushed_version";
pub const CREATED: &str = "created";
pub const WALLET_ADDRESS: &str = "wallet_address";

/// `conversation_offset:<client>:<session>`
pub fn conversation_offset_key(client: &str, session: &str) -> String {
    format!("conversation_offset:{client}:{session}")
}
