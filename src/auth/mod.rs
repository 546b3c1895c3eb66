//! Token authority
//!
//! Holds the service credential used to call the advisory model and keeps it
//! fresh. Renewal runs under a single async lock so concurrent callers that
//! find the token expiring trigger exactly one renewal.

pub mod cognito;
pub mod token;

use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::CognitoConfig;
use crate::error::AdvisorError;
pub use cognito::{AuthenticationResult, CognitoIdentityProvider, IdentityProvider};
pub use token::{decode_token_expiry, secret_hash, Credential};

/// Ways of obtaining a fresh credential, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    Password,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub has_tokens: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
    pub has_refresh_token: bool,
    pub has_client_secret: bool,
}

pub struct TokenAuthority {
    provider: Arc<dyn IdentityProvider>,
    config: CognitoConfig,
    credential: Mutex<Credential>,
}

impl TokenAuthority {
    pub fn new(provider: Arc<dyn IdentityProvider>, config: CognitoConfig) -> Self {
        Self {
            provider,
            config,
            credential: Mutex::new(Credential::default()),
        }
    }

    /// Seeds the authority with a token obtained elsewhere.
    pub fn with_existing_token(self, token: impl Into<String>) -> Self {
        let token = token.into();
        let credential = Credential {
            expires_at: decode_token_expiry(&token),
            id_token: Some(token),
            access_token: None,
            refresh_token: None,
        };
        Self {
            credential: Mutex::new(credential),
            ..self
        }
    }

    fn password_configured(&self) -> bool {
        self.config.client_secret.is_some()
            && !self.config.username.is_empty()
            && !self.config.password.is_empty()
    }

    /// Strategy order for the current credential.
    pub fn strategies(&self, credential: &Credential) -> Vec<AuthStrategy> {
        let mut plan = Vec::with_capacity(2);
        if self.password_configured() {
            plan.push(AuthStrategy::Password);
        }
        if credential.refresh_token.is_some() {
            plan.push(AuthStrategy::Refresh);
        }
        plan
    }

    fn secret_hash(&self) -> crate::Result<Option<String>> {
        match &self.config.client_secret {
            Some(secret) => secret_hash(&self.config.username, &self.config.client_id, secret).map(Some),
            None => Ok(None),
        }
    }

    fn apply(&self, credential: &mut Credential, result: AuthenticationResult) {
        let mut fresh = Credential::issued(
            result.id_token,
            result.access_token,
            result.refresh_token,
            credential.refresh_token.take(),
        );
        if fresh.expires_at.is_none() {
            fresh.expires_at = result
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs));
        }
        *credential = fresh;
    }

    async fn run_password(&self, credential: &mut Credential) -> crate::Result<()> {
        let hash = self.secret_hash()?;
        let result = self
            .provider
            .authenticate_password(&self.config.username, &self.config.password, hash.as_deref())
            .await?;
        self.apply(credential, result);
        info!("Authenticated with username and password");
        Ok(())
    }

    async fn run_refresh(&self, credential: &mut Credential) -> crate::Result<()> {
        let refresh_token = credential
            .refresh_token
            .clone()
            .ok_or_else(|| AdvisorError::Authentication("no refresh token held".to_string()))?;
        let hash = self.secret_hash()?;

        match self.provider.refresh(&refresh_token, hash.as_deref()).await {
            Ok(result) => {
                self.apply(credential, result);
                info!("Refreshed service credential");
                Ok(())
            }
            Err(e) if self.password_configured() => {
                warn!("Token refresh failed, falling back to password auth: {}", e);
                self.run_password(credential).await
            }
            Err(e) => Err(e),
        }
    }

    /// Returns true iff a non-expiring credential is held when this returns.
    pub async fn ensure_valid(&self) -> bool {
        let mut credential = self.credential.lock().await;
        if credential.is_valid_at(Utc::now()) {
            debug!("Service credential still valid");
            return true;
        }

        for strategy in self.strategies(&credential) {
            let outcome = match strategy {
                AuthStrategy::Password => self.run_password(&mut credential).await,
                AuthStrategy::Refresh => self.run_refresh(&mut credential).await,
            };
            match outcome {
                Ok(()) if credential.is_valid_at(Utc::now()) => return true,
                Ok(()) => warn!(?strategy, "Issued credential is already expiring"),
                Err(e) => warn!(?strategy, "Authentication strategy failed: {}", e),
            }
        }

        error!("All authentication strategies failed");
        false
    }

    /// Headers for an advisory model call: the held bearer plus the
    /// caller's service token.
    pub async fn auth_headers(&self, service_token: &str) -> crate::Result<HeaderMap> {
        if !self.ensure_valid().await {
            return Err(AdvisorError::Authentication(
                "unable to obtain a valid service token".to_string(),
            ));
        }

        let credential = self.credential.lock().await;
        let bearer = credential
            .bearer()
            .ok_or_else(|| AdvisorError::Authentication("no bearer token held".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", bearer))?);
        headers.insert("x-api-key", header_value(&format!("Bearer {}", service_token))?);
        Ok(headers)
    }

    pub async fn token_info(&self) -> TokenInfo {
        let credential = self.credential.lock().await;
        let now = Utc::now();
        TokenInfo {
            has_tokens: credential.bearer().is_some(),
            expires_at: credential.expires_at,
            is_expired: credential.expires_at.map(|e| e <= now).unwrap_or(true),
            has_refresh_token: credential.refresh_token.is_some(),
            has_client_secret: self.config.client_secret.is_some(),
        }
    }
}

fn header_value(value: &str) -> crate::Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| AdvisorError::Authentication(format!("token is not a valid header value: {}", e)))
}
