//! Cache key constants and builders for smsgate
//!
//! # Key Patterns
//!
//! - `wallet_tokens:{user_id}` - Reservation counter: tokens still admissible
//! - `user:{user_id}` - JSON snapshot of `(is_privileged, balance)`
//!
//! # Example
//!
//! ```
//! use smsgate_cache::keys;
//! use uuid::Uuid;
//!
//! let key = keys::wallet_tokens_key(&Uuid::nil());
//! assert_eq!(key, "wallet_tokens:00000000-0000-0000-0000-000000000000");
//! ```

use std::fmt::Display;

/// Prefix for reservation counters
///
/// Format: `wallet_tokens:{user_id}`
pub const WALLET_TOKENS_PREFIX: &str = "wallet_tokens";

/// Prefix for user snapshots
///
/// Format: `user:{user_id}`
pub const USER_PREFIX: &str = "user";

/// Build the reservation counter key for a user
pub fn wallet_tokens_key(user_id: &impl Display) -> String {
    format!("{}:{}", WALLET_TOKENS_PREFIX, user_id)
}

/// Build the snapshot key for a user
pub fn user_key(user_id: &impl Display) -> String {
    format!("{}:{}", USER_PREFIX, user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_builders() {
        assert_eq!(wallet_tokens_key(&"u1"), "wallet_tokens:u1");
        assert_eq!(user_key(&"u1"), "user:u1");
    }
}
