use super::errors::AuthError;
use super::provider::{AccessToken, TokenProvider};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Token type presented for shared access signatures.
pub const SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// Parsed components of a namespace connection string.
#[derive(Clone)]
pub struct ConnectionStringProperties {
    /// Fully qualified namespace, e.g. `my-ns.servicebus.windows.net`
    pub host: String,
    pub key_name: String,
    key: Zeroizing<String>,
    pub entity_path: Option<String>,
}

impl std::fmt::Debug for ConnectionStringProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStringProperties")
            .field("host", &self.host)
            .field("key_name", &self.key_name)
            .field("entity_path", &self.entity_path)
            .finish_non_exhaustive()
    }
}

impl ConnectionStringProperties {
    /// Parse `Endpoint=sb://<host>/;SharedAccessKeyName=..;SharedAccessKey=..[;EntityPath=..]`
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        if value.trim().is_empty() {
            return Err(AuthError::InvalidConnectionString(
                "Connection string cannot be empty".to_string(),
            ));
        }

        let mut host = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for part in value.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            if let Some(endpoint) = part.strip_prefix("Endpoint=") {
                let without_scheme = endpoint
                    .find("://")
                    .map(|start| &endpoint[start + 3..])
                    .unwrap_or(endpoint);
                let trimmed = without_scheme.trim_end_matches('/');
                if !trimmed.is_empty() {
                    host = Some(trimmed.to_string());
                }
            } else if let Some(kn) = part.strip_prefix("SharedAccessKeyName=") {
                key_name = Some(kn.to_string());
            } else if let Some(k) = part.strip_prefix("SharedAccessKey=") {
                key = Some(Zeroizing::new(k.to_string()));
            } else if let Some(path) = part.strip_prefix("EntityPath=") {
                entity_path = Some(path.to_string());
            }
        }

        let host = host.ok_or_else(|| {
            AuthError::InvalidConnectionString("Missing Endpoint in connection string".to_string())
        })?;
        let key_name = key_name.ok_or_else(|| {
            AuthError::InvalidConnectionString(
                "Missing SharedAccessKeyName in connection string".to_string(),
            )
        })?;
        let key = key.ok_or_else(|| {
            AuthError::InvalidConnectionString(
                "Missing SharedAccessKey in connection string".to_string(),
            )
        })?;

        Ok(Self {
            host,
            key_name,
            key,
            entity_path,
        })
    }

    /// Token audience for an entity on this namespace
    pub fn audience(&self, entity_path: &str) -> String {
        format!("amqp://{}/{}", self.host, entity_path)
    }
}

/// Signs shared access signature tokens for link authorization.
///
/// Tokens are HMAC-SHA256 signatures over the URL-encoded audience and an
/// expiry timestamp. The key is used as given (UTF-8 bytes), the way the
/// broker validates it.
#[derive(Clone, Debug)]
pub struct SharedAccessKeyProvider {
    properties: ConnectionStringProperties,
    token_validity: Duration,
}

impl SharedAccessKeyProvider {
    pub fn from_connection_string(value: &str) -> Result<Self, AuthError> {
        Ok(Self {
            properties: ConnectionStringProperties::parse(value)?,
            token_validity: Duration::hours(1),
        })
    }

    pub fn with_token_validity(mut self, validity: Duration) -> Self {
        self.token_validity = validity;
        self
    }

    pub fn properties(&self) -> &ConnectionStringProperties {
        &self.properties
    }

    /// Generate a SAS token for `audience` valid until `expiry`.
    pub fn generate_sas_token(
        &self,
        audience: &str,
        expiry: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let expiry_timestamp = expiry.timestamp();
        let encoded_audience = urlencoding::encode(audience);
        let string_to_sign = format!("{encoded_audience}\n{expiry_timestamp}");

        let mut mac = HmacSha256::new_from_slice(self.properties.key.as_bytes())
            .map_err(|e| AuthError::InvalidKey(format!("Failed to create HMAC: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_audience,
            urlencoding::encode(&signature),
            expiry_timestamp,
            self.properties.key_name
        ))
    }
}

#[async_trait]
impl TokenProvider for SharedAccessKeyProvider {
    async fn get_token(&self, audience: &str) -> Result<AccessToken, AuthError> {
        let expires_on = Utc::now() + self.token_validity;
        let token = self.generate_sas_token(audience, expires_on)?;

        Ok(AccessToken {
            token,
            token_type: SAS_TOKEN_TYPE.to_string(),
            expires_on,
        })
    }
}
