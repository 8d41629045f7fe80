use super::errors::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Token authorizing access to one audience.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessToken {
    /// The actual token string
    pub token: String,
    /// Token type as presented to the claims-based-security node
    /// (e.g. "servicebus.windows.net:sastoken" or "jwt")
    pub token_type: String,
    /// When the token stops being valid
    pub expires_on: DateTime<Utc>,
}

/// Source of tokens for link authorization.
///
/// # Examples
///
/// ```no_run
/// use link::auth::{AccessToken, AuthError, TokenProvider};
/// use async_trait::async_trait;
/// use chrono::{Duration, Utc};
///
/// struct StaticProvider;
///
/// #[async_trait]
/// impl TokenProvider for StaticProvider {
///     async fn get_token(&self, _audience: &str) -> Result<AccessToken, AuthError> {
///         Ok(AccessToken {
///             token: "example_token".to_string(),
///             token_type: "jwt".to_string(),
///             expires_on: Utc::now() + Duration::hours(1),
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain a token scoped to `audience`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the token cannot be produced. Errors
    /// flagged transient are retried by the renewer.
    async fn get_token(&self, audience: &str) -> Result<AccessToken, AuthError>;
}
