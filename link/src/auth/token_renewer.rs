use super::errors::AuthError;
use super::provider::{AccessToken, TokenProvider};
use crate::config::TokenRenewalConfig;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Result of one successful authorization of an audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationOutcome {
    pub audience: String,
    pub expires_on: DateTime<Utc>,
}

/// Stream a link consumes to learn whether it is still authorized.
///
/// Successful renewals are `Ok` items. An `Err` item or the end of the
/// stream means the link must stop.
pub type AuthorizationResults = BoxStream<'static, Result<AuthorizationOutcome, AuthError>>;

#[derive(Debug, Clone, PartialEq)]
enum RenewalState {
    Pending,
    Authorized(AuthorizationOutcome),
    Failed(AuthError),
    Stopped,
}

impl RenewalState {
    fn is_terminal(&self) -> bool {
        matches!(self, RenewalState::Failed(_) | RenewalState::Stopped)
    }
}

/// Service that keeps an audience authorized by renewing its token before
/// it expires.
pub struct TokenRenewer {
    provider: Arc<dyn TokenProvider>,
    audience: String,
    config: TokenRenewalConfig,
    retry_policy: RetryPolicy,
    state: watch::Sender<RenewalState>,
    cancel_token: CancellationToken,
}

impl TokenRenewer {
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        audience: impl Into<String>,
        config: TokenRenewalConfig,
        retry_policy: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(RenewalState::Pending);
        Self {
            provider,
            audience: audience.into(),
            config,
            retry_policy,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Start the background renewal loop
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                () = self.cancel_token.cancelled() => {}
                () = self.run() => {}
            }
            self.publish(RenewalState::Stopped);
        })
    }

    /// Stop renewing. Subscribers see their stream complete.
    pub fn shutdown(&self) {
        log::info!("Token renewer for '{}' shutting down", self.audience);
        self.cancel_token.cancel();
        self.publish(RenewalState::Stopped);
    }

    /// Stream of authorization results.
    ///
    /// The latest result is replayed to new subscribers. The stream yields
    /// a single `Err` and ends when renewal fails, and ends without error
    /// after [`shutdown`](Self::shutdown).
    pub fn authorization_results(&self) -> AuthorizationResults {
        let receiver = self.state.subscribe();
        stream::unfold(
            (receiver, true, false),
            |(mut receiver, first, finished)| async move {
                if finished {
                    return None;
                }

                if !first && receiver.changed().await.is_err() {
                    return None;
                }

                loop {
                    let state = receiver.borrow_and_update().clone();
                    match state {
                        RenewalState::Authorized(outcome) => {
                            return Some((Ok(outcome), (receiver, false, false)));
                        }
                        RenewalState::Failed(error) => {
                            return Some((Err(error), (receiver, false, true)));
                        }
                        RenewalState::Stopped => return None,
                        RenewalState::Pending => {}
                    }
                    if receiver.changed().await.is_err() {
                        return None;
                    }
                }
            },
        )
        .boxed()
    }

    async fn run(&self) {
        loop {
            match self.acquire_with_retry().await {
                Ok(token) => {
                    log::debug!(
                        "Authorized '{}' until {}",
                        self.audience,
                        token.expires_on
                    );
                    let delay = self.refresh_delay(&token);
                    self.publish(RenewalState::Authorized(AuthorizationOutcome {
                        audience: self.audience.clone(),
                        expires_on: token.expires_on,
                    }));
                    sleep(delay).await;
                }
                Err(e) => {
                    log::error!("Failed to renew token for '{}': {e}", self.audience);
                    self.publish(RenewalState::Failed(e));
                    return;
                }
            }
        }
    }

    /// Acquire a token, retrying transient failures per the retry policy
    async fn acquire_with_retry(&self) -> Result<AccessToken, AuthError> {
        let try_timeout = self.retry_policy.options().try_timeout();
        let mut retry_count = 0;

        loop {
            let attempt =
                match tokio::time::timeout(try_timeout, self.provider.get_token(&self.audience))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(AuthError::Timeout(try_timeout)),
                };

            let error = match attempt {
                Ok(token) => return Ok(token),
                Err(e) => e,
            };

            match self
                .retry_policy
                .calculate_retry_delay(error.is_transient(), retry_count)
            {
                Some(delay) => {
                    retry_count += 1;
                    log::warn!(
                        "Token acquisition attempt {retry_count} for '{}' failed: {error}, retrying in {delay:?}",
                        self.audience
                    );
                    sleep(delay).await;
                }
                None if retry_count == 0 => return Err(error),
                None => {
                    return Err(AuthError::RenewalFailed {
                        attempts: retry_count + 1,
                        reason: error.to_string(),
                    });
                }
            }
        }
    }

    fn refresh_delay(&self, token: &AccessToken) -> Duration {
        let until_expiry = (token.expires_on - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        until_expiry
            .saturating_sub(self.config.refresh_before())
            .max(self.config.min_refresh_interval())
    }

    fn publish(&self, next: RenewalState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RetryMode, RetryOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockTokenProvider {
        calls: Arc<AtomicU32>,
        fail_first: u32,
        transient: bool,
    }

    #[async_trait]
    impl TokenProvider for MockTokenProvider {
        async fn get_token(&self, _audience: &str) -> Result<AccessToken, AuthError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(AuthError::TokenAcquisition {
                    reason: "mock failure".to_string(),
                    transient: self.transient,
                });
            }
            Ok(AccessToken {
                token: "token".to_string(),
                token_type: "jwt".to_string(),
                expires_on: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    fn renewer(fail_first: u32, transient: bool) -> (Arc<TokenRenewer>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let provider = Arc::new(MockTokenProvider {
            calls: calls.clone(),
            fail_first,
            transient,
        });
        let retry_policy = RetryPolicy::new(RetryOptions {
            max_retries: 2,
            delay_ms: 10,
            max_delay_ms: 100,
            try_timeout_secs: 5,
            mode: RetryMode::Fixed,
        });
        let renewer = TokenRenewer::new(
            provider,
            "amqp://ns/orders",
            TokenRenewalConfig::default(),
            retry_policy,
        );
        (Arc::new(renewer), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let (renewer, calls) = renewer(2, true);
        let mut results = renewer.authorization_results();
        renewer.clone().start();

        let outcome = results.next().await.unwrap().unwrap();
        assert_eq!(outcome.audience, "amqp://ns/orders");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        renewer.shutdown();
        assert!(results.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_the_stream() {
        let (renewer, calls) = renewer(10, true);
        let mut results = renewer.authorization_results();
        renewer.clone().start();

        let error = results.next().await.unwrap().unwrap_err();
        assert_eq!(
            error,
            AuthError::RenewalFailed {
                attempts: 3,
                reason: "Token acquisition failed: mock failure".to_string(),
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(results.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_failure_is_not_retried() {
        let (renewer, calls) = renewer(1, false);
        let mut results = renewer.authorization_results();
        renewer.clone().start();

        assert!(matches!(
            results.next().await,
            Some(Err(AuthError::TokenAcquisition { transient: false, .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_delay_respects_floor() {
        let (renewer, _) = renewer(0, true);
        let token = AccessToken {
            token: String::new(),
            token_type: String::new(),
            expires_on: Utc::now() + chrono::Duration::seconds(60),
        };
        assert_eq!(renewer.refresh_delay(&token), Duration::from_secs(30));
    }
}
