use async_trait::async_trait;
use chrono::Utc;
use claims::{assert_matches, assert_ok};
use futures::StreamExt;
use link::auth::{
    AccessToken, AuthError, SAS_TOKEN_TYPE, SharedAccessKeyProvider, TokenProvider, TokenRenewer,
};
use link::config::TokenRenewalConfig;
use link::retry::{RetryMode, RetryOptions, RetryPolicy};
use link::testing::{InlineDispatcher, MockConnection, MockLink};
use link::transport::{LinkIdentity, TransportLink};
use link::{LinkError, ReactorReceiver, ReceiveLinkHandler, ReceiverOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const CONNECTION_STRING: &str = "Endpoint=sb://my-ns.servicebus.windows.net/;SharedAccessKeyName=listen;SharedAccessKey=bXlzZWNyZXQ=";

// Helper module for authorization testing
mod auth_helpers {
    use super::*;

    /// Provider that succeeds `successes` times and then fails permanently
    pub struct ExpiringProvider {
        pub calls: Arc<AtomicU32>,
        pub successes: u32,
        pub validity: chrono::Duration,
    }

    #[async_trait]
    impl TokenProvider for ExpiringProvider {
        async fn get_token(&self, _audience: &str) -> Result<AccessToken, AuthError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.successes {
                return Err(AuthError::TokenAcquisition {
                    reason: "key revoked".to_string(),
                    transient: false,
                });
            }
            Ok(AccessToken {
                token: format!("token-{call}"),
                token_type: "jwt".to_string(),
                expires_on: Utc::now() + self.validity,
            })
        }
    }

    pub fn retry_policy() -> RetryPolicy {
        RetryPolicy::new(RetryOptions {
            max_retries: 2,
            delay_ms: 100,
            max_delay_ms: 1_000,
            try_timeout_secs: 10,
            mode: RetryMode::Exponential,
        })
    }

    pub fn renewal_config() -> TokenRenewalConfig {
        TokenRenewalConfig {
            refresh_before_secs: 60,
            min_refresh_interval_secs: 1,
        }
    }
}

use auth_helpers::*;

mod token_renewal {
    use super::*;

    #[tokio::test]
    async fn test_shared_access_key_renewal_publishes_outcome() {
        let provider = SharedAccessKeyProvider::from_connection_string(CONNECTION_STRING).unwrap();
        let audience = provider.properties().audience("orders");
        assert_eq!(audience, "amqp://my-ns.servicebus.windows.net/orders");

        let token = assert_ok!(provider.get_token(&audience).await);
        assert_eq!(token.token_type, SAS_TOKEN_TYPE);
        assert!(token.token.contains("&skn=listen"));

        let renewer = Arc::new(TokenRenewer::new(
            Arc::new(provider),
            audience.clone(),
            renewal_config(),
            retry_policy(),
        ));
        let mut results = renewer.authorization_results();
        let task = renewer.clone().start();

        let outcome = results.next().await.unwrap().unwrap();
        assert_eq!(outcome.audience, audience);
        assert!(outcome.expires_on > Utc::now());

        renewer.shutdown();
        assert!(results.next().await.is_none());
        assert_ok!(task.await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_before_expiry_until_provider_fails() {
        let calls = Arc::new(AtomicU32::new(0));
        let renewer = Arc::new(TokenRenewer::new(
            Arc::new(ExpiringProvider {
                calls: calls.clone(),
                successes: 2,
                validity: chrono::Duration::seconds(120),
            }),
            "amqp://ns/orders",
            renewal_config(),
            retry_policy(),
        ));
        let results = renewer.authorization_results();
        renewer.clone().start();

        let observed: Vec<_> = results.collect().await;

        assert_eq!(observed.len(), 3);
        assert!(observed[0].is_ok() && observed[1].is_ok());
        assert_matches!(
            &observed[2],
            Err(AuthError::TokenAcquisition { transient: false, .. })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_latest_outcome() {
        let renewer = Arc::new(TokenRenewer::new(
            Arc::new(ExpiringProvider {
                calls: Arc::new(AtomicU32::new(0)),
                successes: 10,
                validity: chrono::Duration::hours(1),
            }),
            "amqp://ns/orders",
            renewal_config(),
            retry_policy(),
        ));
        let mut early = renewer.authorization_results();
        renewer.clone().start();
        assert_ok!(early.next().await.unwrap());

        let mut late = renewer.authorization_results();
        assert_ok!(late.next().await.unwrap());
        renewer.shutdown();
    }
}

mod receiver_authorization {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_renewal_failure_closes_receiver() {
        let renewer = Arc::new(TokenRenewer::new(
            Arc::new(ExpiringProvider {
                calls: Arc::new(AtomicU32::new(0)),
                successes: 1,
                validity: chrono::Duration::seconds(120),
            }),
            "amqp://ns/orders",
            renewal_config(),
            retry_policy(),
        ));

        let link = Arc::new(MockLink::new("orders_1"));
        let connection = MockConnection::new("conn-1", "ns");
        let handler = Arc::new(ReceiveLinkHandler::new(LinkIdentity::new(
            "conn-1",
            "ns",
            link.name(),
            "orders",
        )));
        let receiver = ReactorReceiver::new(
            &connection,
            link.clone(),
            handler.clone(),
            renewer.authorization_results(),
            Arc::new(InlineDispatcher::new()),
            ReceiverOptions {
                close_timeout: Duration::from_secs(5),
            },
        );
        handler.on_link_remote_open();
        let messages = receiver.receive();
        renewer.clone().start();

        let messages: Vec<_> = messages.collect().await;

        assert_eq!(messages.len(), 1);
        assert_matches!(&messages[0], Err(LinkError::Authorization { .. }));
        link.wait_for_close().await;
        assert_eq!(link.close_calls(), 1);
        receiver.close_async().await;
        assert!(handler.is_terminal());
    }

    #[tokio::test]
    async fn test_renewer_shutdown_completes_receiver_stream() {
        let provider = SharedAccessKeyProvider::from_connection_string(CONNECTION_STRING).unwrap();
        let renewer = Arc::new(TokenRenewer::new(
            Arc::new(provider),
            "amqp://my-ns.servicebus.windows.net/orders",
            renewal_config(),
            retry_policy(),
        ));

        let link = Arc::new(MockLink::new("orders_1"));
        let connection = MockConnection::new("conn-1", "my-ns.servicebus.windows.net");
        let handler = Arc::new(ReceiveLinkHandler::new(LinkIdentity::generate(
            "conn-1",
            "my-ns.servicebus.windows.net",
            "orders",
        )));
        let receiver = ReactorReceiver::new(
            &connection,
            link.clone(),
            handler.clone(),
            renewer.authorization_results(),
            Arc::new(InlineDispatcher::new()),
            ReceiverOptions::default(),
        );
        let messages = receiver.receive();
        renewer.clone().start();

        renewer.shutdown();

        let messages: Vec<_> = tokio::time::timeout(Duration::from_secs(5), messages.collect())
            .await
            .unwrap();
        assert!(messages.is_empty());
        tokio::time::timeout(Duration::from_secs(5), link.wait_for_close())
            .await
            .unwrap();
        assert!(receiver.is_disposed());
    }
}
