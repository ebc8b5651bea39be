//! Credential handoff boundary.

/// Receives validated unlock credentials.
///
/// Implemented by the platform's lock-screen integration. Invoked exactly
/// once per completed unlock cycle, after the peer has been mutually
/// authenticated and its credentials payload decrypted.
pub trait Authorizer: Send + Sync {
    /// Hands over a decrypted unlock token.
    ///
    /// `user_handle` is the local user the sending peer is enrolled for,
    /// `token_handle` identifies which stored authentication token the
    /// `token` bytes unlock.
    fn on_credentials_received(&self, user_handle: i32, token: &[u8], token_handle: i64);
}
