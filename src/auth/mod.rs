//! Authentication Module
//! Mission: Tell the engine whether it may connect, and with which bearer token

pub mod token;

use async_trait::async_trait;

pub use token::TokenAuth;

/// Source of truth for the signed-in user
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// False while the auth state is still being restored
    fn is_resolved(&self) -> bool;

    fn is_authenticated(&self) -> bool;

    /// Bearer token for simulator API calls
    async fn access_token(&self) -> Option<String>;
}
