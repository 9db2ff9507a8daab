use std::sync::Arc;

use cloud_agent_api::{AgentGateway, ApiError, UserInfo};
use thiserror::Error;

use crate::AuthFailureHandler;
use crate::credential::{CredentialError, CredentialInputError, CredentialStore, normalize_api_key};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Input(#[from] CredentialInputError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] CredentialError),
}

/// Ties the credential store to the gateway's ambient credential.
#[derive(Clone)]
pub struct Session {
    gateway: Arc<dyn AgentGateway>,
    store: Arc<dyn CredentialStore>,
}

impl Session {
    #[must_use]
    pub fn new(gateway: Arc<dyn AgentGateway>, store: Arc<dyn CredentialStore>) -> Self {
        Self { gateway, store }
    }

    #[must_use]
    pub fn gateway(&self) -> Arc<dyn AgentGateway> {
        Arc::clone(&self.gateway)
    }

    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.gateway.has_credential()
    }

    /// Validates `raw_key` against the service before storing it. A rejected
    /// key leaves the previous session untouched.
    pub async fn sign_in(&self, raw_key: &str) -> Result<UserInfo, SessionError> {
        let credential = normalize_api_key(raw_key)?;
        let user = self.gateway.validate_credential(&credential).await?;
        self.store.persist(&credential)?;
        self.gateway.set_credential(Some(credential));
        tracing::info!(api_key_name = %user.api_key_name, "signed in");
        Ok(user)
    }

    pub fn sign_out(&self) -> Result<(), CredentialError> {
        self.gateway.set_credential(None);
        self.store.clear()?;
        tracing::info!("signed out");
        Ok(())
    }

    /// Installs a stored credential, if any, without contacting the service.
    pub fn restore(&self) -> Result<bool, CredentialError> {
        match self.store.load()? {
            Some(credential) => {
                self.gateway.set_credential(Some(credential));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn whoami(&self) -> Result<UserInfo, SessionError> {
        let credential = self.store.load()?.ok_or_else(ApiError::missing_credential)?;
        Ok(self.gateway.validate_credential(&credential).await?)
    }

    /// Handler for synchronizers and caches: a rejected credential ends the
    /// session.
    #[must_use]
    pub fn auth_failure_callback(&self) -> AuthFailureHandler {
        let session = self.clone();
        Arc::new(move || {
            if !session.is_signed_in() {
                return;
            }
            tracing::warn!("credential rejected by the service; signing out");
            if let Err(error) = session.sign_out() {
                tracing::warn!(error = %error, "failed to clear stored credential");
            }
        })
    }
}
