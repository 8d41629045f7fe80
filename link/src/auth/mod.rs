pub mod errors;
pub mod provider;
pub mod shared_access_key;
pub mod token_renewer;

pub use errors::AuthError;
pub use provider::{AccessToken, TokenProvider};
pub use shared_access_key::{ConnectionStringProperties, SAS_TOKEN_TYPE, SharedAccessKeyProvider};
pub use token_renewer::{AuthorizationOutcome, AuthorizationResults, TokenRenewer};
