// =============================================================================
// Credential adapter — opaque API key retrieval
// =============================================================================
//
// Decryption and storage are a deployment concern; this core only needs a
// seam to ask for a (key, secret) pair for a given (user, account). The
// bundled implementation reads from the process environment, which is
// adequate for a single-operator deployment and for tests.
// =============================================================================

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::types::AccountPriority;

/// Exchange API credentials for one (user, account) pair. `passphrase` is
/// carried for exchanges that require one; Bybit v5 does not.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: Option<String>,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_api_keys(
        &self,
        user_id: i64,
        account_priority: AccountPriority,
    ) -> Result<ApiCredentials, ExchangeError>;
}

/// Reads `BYBIT_API_KEY_{user_id}_{account_priority}` / `..._SECRET` from the
/// environment, falling back to the unscoped `BYBIT_API_KEY` / `BYBIT_API_SECRET`
/// pair for single-account deployments.
pub struct EnvCredentialProvider;

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn get_api_keys(
        &self,
        user_id: i64,
        account_priority: AccountPriority,
    ) -> Result<ApiCredentials, ExchangeError> {
        let scoped_key = format!("BYBIT_API_KEY_{user_id}_{account_priority}");
        let scoped_secret = format!("BYBIT_API_SECRET_{user_id}_{account_priority}");

        let api_key = std::env::var(&scoped_key)
            .or_else(|_| std::env::var("BYBIT_API_KEY"))
            .map_err(|_| ExchangeError::AuthFailure {
                code: 0,
                message: format!("no credentials configured for user {user_id} account {account_priority}"),
            })?;
        let api_secret = std::env::var(&scoped_secret)
            .or_else(|_| std::env::var("BYBIT_API_SECRET"))
            .map_err(|_| ExchangeError::AuthFailure {
                code: 0,
                message: format!("no credentials configured for user {user_id} account {account_priority}"),
            })?;

        Ok(ApiCredentials {
            api_key,
            api_secret,
            passphrase: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_credentials_yield_auth_failure() {
        std::env::remove_var("BYBIT_API_KEY");
        std::env::remove_var("BYBIT_API_SECRET");
        let provider = EnvCredentialProvider;
        let result = provider.get_api_keys(999, 1).await;
        assert!(result.is_err());
    }
}
