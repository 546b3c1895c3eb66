//! Cognito `InitiateAuth` client

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{error, info};

use crate::config::CognitoConfig;
use crate::error::AdvisorError;

const INITIATE_AUTH_TARGET: &str = "AWSCognitoIdentityProviderService.InitiateAuth";
const AMZ_JSON: &str = "application/x-amz-json-1.1";
const AUTH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticationResult {
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuthResponse {
    authentication_result: Option<AuthenticationResult>,
}

/// Issues tokens. The token authority only depends on this trait.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate_password(
        &self,
        username: &str,
        password: &str,
        secret_hash: Option<&str>,
    ) -> crate::Result<AuthenticationResult>;

    async fn refresh(&self, refresh_token: &str, secret_hash: Option<&str>) -> crate::Result<AuthenticationResult>;
}

pub struct CognitoIdentityProvider {
    client: Client,
    endpoint: String,
    client_id: String,
}

impl CognitoIdentityProvider {
    pub fn new(config: &CognitoConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(AUTH_TIMEOUT_SECS))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(2)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint_url(),
            client_id: config.client_id.clone(),
        })
    }

    fn request_body(&self, flow: &str, mut params: Map<String, Value>, secret_hash: Option<&str>) -> Value {
        if let Some(hash) = secret_hash {
            params.insert("SECRET_HASH".to_string(), json!(hash));
        }
        json!({
            "AuthFlow": flow,
            "ClientId": self.client_id,
            "AuthParameters": params,
        })
    }

    async fn initiate_auth(&self, flow: &str, body: Value) -> crate::Result<AuthenticationResult> {
        info!(flow, "Calling identity provider");

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Amz-Target", INITIATE_AUTH_TARGET)
            .header("Content-Type", AMZ_JSON)
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| {
                error!("Identity provider request failed: {}", e);
                AdvisorError::Authentication(format!("identity provider unreachable: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(flow, %status, "Identity provider rejected request: {}", text);
            return Err(AdvisorError::Authentication(format!(
                "{} failed with status {}",
                flow, status
            )));
        }

        let parsed: InitiateAuthResponse = serde_json::from_str(&response.text().await?)?;
        parsed.authentication_result.ok_or_else(|| {
            AdvisorError::Authentication(format!("{} returned no authentication result", flow))
        })
    }
}

#[async_trait]
impl IdentityProvider for CognitoIdentityProvider {
    async fn authenticate_password(
        &self,
        username: &str,
        password: &str,
        secret_hash: Option<&str>,
    ) -> crate::Result<AuthenticationResult> {
        let mut params = Map::new();
        params.insert("USERNAME".to_string(), json!(username));
        params.insert("PASSWORD".to_string(), json!(password));
        let body = self.request_body("USER_PASSWORD_AUTH", params, secret_hash);
        self.initiate_auth("USER_PASSWORD_AUTH", body).await
    }

    async fn refresh(&self, refresh_token: &str, secret_hash: Option<&str>) -> crate::Result<AuthenticationResult> {
        let mut params = Map::new();
        params.insert("REFRESH_TOKEN".to_string(), json!(refresh_token));
        let body = self.request_body("REFRESH_TOKEN_AUTH", params, secret_hash);
        self.initiate_auth("REFRESH_TOKEN_AUTH", body).await
    }
}
