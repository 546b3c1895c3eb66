//! Advisory model client
//!
//! OpenAI-compatible chat completions behind a LiteLLM gateway. Uses a
//! long-lived reqwest::Client for connection pooling and asks the token
//! authority for fresh headers on every call.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::auth::{CognitoIdentityProvider, TokenAuthority};
use crate::config::{AdvisorConfig, CognitoConfig, LlmConfig};
use crate::error::AdvisorError;
use crate::secrets::SecretStore;

/// Secret with `username`, `password`, `clientId`, `clientSecret` and
/// `bearerToken` fields.
pub const LLM_SECRET: &str = "llm-service";

const MAX_ATTEMPTS: u32 = 3;
const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Filled in by the client when left empty.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip)]
    pub timeout: Duration,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>, temperature: f32, max_tokens: u32, timeout: Duration) -> Self {
        Self {
            model: String::new(),
            messages,
            temperature,
            max_tokens,
            stream: false,
            timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChatMessage>,
}

/// The advisory model as seen by the recommendation engine and sessions.
#[async_trait]
pub trait AdvisoryModel: Send + Sync {
    /// Content of the first choice.
    async fn complete(&self, request: &ChatRequest) -> crate::Result<String>;
}

pub struct LiteLlmClient {
    client: Client,
    api_url: String,
    model: String,
    service_token: String,
    auth: Arc<TokenAuthority>,
}

impl LiteLlmClient {
    pub fn new(config: &LlmConfig, auth: Arc<TokenAuthority>) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            service_token: config.bearer_token.clone(),
            auth,
        })
    }

    fn prepare(&self, request: &ChatRequest, stream: bool) -> ChatRequest {
        let mut request = request.clone();
        if request.model.is_empty() {
            request.model = self.model.clone();
        }
        request.stream = stream;
        request
    }

    /// POST with status-gated retries and exponential backoff.
    async fn post_with_retry(&self, body: &ChatRequest) -> crate::Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let headers = self.auth.auth_headers(&self.service_token).await?;
            let response = self
                .client
                .post(&self.api_url)
                .headers(headers)
                .timeout(body.timeout)
                .json(body)
                .send()
                .await
                .map_err(|e| {
                    error!("Advisory model request failed: {}", e);
                    AdvisorError::ExternalService(format!("advisory model unreachable: {}", e))
                })?;

            let status = response.status();
            if status == StatusCode::OK {
                return Ok(response);
            }
            if RETRY_STATUSES.contains(&status.as_u16()) && attempt < MAX_ATTEMPTS {
                let backoff = Duration::from_secs(1u64 << (attempt - 1));
                warn!(attempt, %status, "Advisory model busy, retrying in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            error!(%status, "Advisory model error response: {}", text);
            return Err(AdvisorError::ExternalService(format!(
                "advisory model returned {}: {}",
                status, text
            )));
        }
    }

    /// Streams a completion, invoking `on_delta` for every content fragment.
    /// Returns the concatenated text.
    pub async fn stream_completion<F>(&self, request: &ChatRequest, mut on_delta: F) -> crate::Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let body = self.prepare(request, true);
        let response = self.post_with_retry(&body).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut full = String::new();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                match parse_sse_line(line.trim()) {
                    SseEvent::Delta(text) => {
                        on_delta(&text);
                        full.push_str(&text);
                    }
                    SseEvent::Done => break 'outer,
                    SseEvent::Skip => {}
                }
            }
        }

        Ok(full)
    }

    /// Models advertised by the gateway (`GET <base>/model/info`).
    pub async fn list_models(&self) -> crate::Result<Value> {
        let base = self.api_url.trim_end_matches("/chat/completions");
        let headers = self.auth.auth_headers(&self.service_token).await?;
        let response = self
            .client
            .get(format!("{}/model/info", base))
            .headers(headers)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AdvisorError::ExternalService(format!(
                "model listing returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl AdvisoryModel for LiteLlmClient {
    async fn complete(&self, request: &ChatRequest) -> crate::Result<String> {
        let body = self.prepare(request, false);
        info!(model = %body.model, messages = body.messages.len(), "Calling advisory model");

        let response = self.post_with_retry(&body).await?;
        let parsed: CompletionResponse = response.json().await.map_err(|e| {
            error!("Failed to parse advisory model response: {}", e);
            AdvisorError::ExternalService(format!("advisory model parse error: {}", e))
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .ok_or_else(|| AdvisorError::ExternalService("empty response from advisory model".to_string()))?;

        debug!(chars = content.len(), "Advisory model response received");
        Ok(content)
    }
}

#[derive(Debug, PartialEq)]
pub enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

/// Interprets one server-sent event line of a streamed completion.
pub fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data: ") else {
        return SseEvent::Skip;
    };
    if data.trim() == "[DONE]" {
        return SseEvent::Done;
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return SseEvent::Skip;
    };
    match value["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => SseEvent::Delta(text.to_string()),
        _ => SseEvent::Skip,
    }
}

/// Stands in when no model credentials are configured; every call fails.
pub struct UnconfiguredModel;

#[async_trait]
impl AdvisoryModel for UnconfiguredModel {
    async fn complete(&self, _request: &ChatRequest) -> crate::Result<String> {
        Err(AdvisorError::ExternalService("advisory model is not configured".into()))
    }
}

/// Identity-provider credentials and service token, secret fields first and
/// the environment-derived config for anything the secret leaves out.
pub async fn resolve_credentials(config: &AdvisorConfig, secrets: &dyn SecretStore) -> (CognitoConfig, LlmConfig) {
    let mut cognito = config.cognito.clone();
    let mut llm = config.llm.clone();

    let secret = match secrets.get_secret(LLM_SECRET).await {
        Ok(secret) => secret,
        Err(AdvisorError::NotFound(_)) => {
            debug!("No {} secret, using environment credentials", LLM_SECRET);
            return (cognito, llm);
        }
        Err(e) => {
            warn!("Could not read {} secret, using environment credentials: {}", LLM_SECRET, e);
            return (cognito, llm);
        }
    };
    let field = |name: &str| {
        secret
            .get(name)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if let Some(v) = field("username") {
        cognito.username = v;
    }
    if let Some(v) = field("password") {
        cognito.password = v;
    }
    if let Some(v) = field("clientId") {
        cognito.client_id = v;
    }
    if let Some(v) = field("clientSecret") {
        cognito.client_secret = Some(v);
    }
    if let Some(v) = field("bearerToken") {
        llm.bearer_token = v;
    }
    (cognito, llm)
}

/// The authenticated model client, or `None` when neither identity-provider
/// credentials nor a service token are configured.
pub async fn build_advisory_model(
    config: &AdvisorConfig,
    secrets: &dyn SecretStore,
) -> crate::Result<Option<Arc<dyn AdvisoryModel>>> {
    let (cognito, llm) = resolve_credentials(config, secrets).await;
    if cognito.client_id.is_empty() && llm.bearer_token.is_empty() {
        info!("Advisory model not configured");
        return Ok(None);
    }

    let provider = Arc::new(CognitoIdentityProvider::new(&cognito)?);
    let authority = Arc::new(TokenAuthority::new(provider, cognito));
    let client = LiteLlmClient::new(&llm, authority)?;
    info!(model = %llm.model, "Advisory model client ready");
    Ok(Some(Arc::new(client)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ObjectStoreConfig, TableNames};

    struct StaticSecrets(Option<Value>);

    #[async_trait]
    impl SecretStore for StaticSecrets {
        async fn get_secret(&self, name: &str) -> crate::Result<Value> {
            self.0
                .clone()
                .ok_or_else(|| AdvisorError::NotFound(format!("secret {}", name)))
        }
    }

    fn env_config() -> AdvisorConfig {
        AdvisorConfig {
            port: 8080,
            database_url: None,
            tables: TableNames {
                profiles: "profiles".into(),
                sessions: "sessions".into(),
                connections: "connections".into(),
            },
            llm: LlmConfig {
                api_url: "http://127.0.0.1:4000/chat/completions".into(),
                model: "advisor".into(),
                bearer_token: "env-token".into(),
                timeout: Duration::from_secs(5),
            },
            cognito: CognitoConfig {
                username: "env-user".into(),
                password: "env-pass".into(),
                region: "us-east-1".into(),
                ..Default::default()
            },
            exchange_rate_api_key: None,
            object_store: ObjectStoreConfig {
                bucket: "docs".into(),
                base_url: "http://127.0.0.1:9000".into(),
                signing_key: String::new(),
                upload_expiration: Duration::from_secs(300),
            },
            extraction_service_url: None,
            secrets_dir: None,
        }
    }

    #[tokio::test]
    async fn test_secret_credentials_override_environment() {
        let secrets = StaticSecrets(Some(serde_json::json!({
            "username": "svc-user",
            "clientId": "client-1",
            "clientSecret": "s3cret",
            "password": ""
        })));
        let (cognito, llm) = resolve_credentials(&env_config(), &secrets).await;

        assert_eq!(cognito.username, "svc-user");
        assert_eq!(cognito.password, "env-pass");
        assert_eq!(cognito.client_id, "client-1");
        assert_eq!(cognito.client_secret.as_deref(), Some("s3cret"));
        assert_eq!(llm.bearer_token, "env-token");
    }

    #[tokio::test]
    async fn test_missing_secret_keeps_environment() {
        let (cognito, llm) = resolve_credentials(&env_config(), &StaticSecrets(None)).await;
        assert_eq!(cognito.username, "env-user");
        assert!(cognito.client_secret.is_none());
        assert_eq!(llm.bearer_token, "env-token");

        let mut config = env_config();
        config.llm.bearer_token = String::new();
        let model = build_advisory_model(&config, &StaticSecrets(None)).await.unwrap();
        assert!(model.is_none());
    }

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            SseEvent::Delta("Hi".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseEvent::Done);
        assert_eq!(parse_sse_line("data: {broken"), SseEvent::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SseEvent::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseEvent::Skip
        );
    }

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest::new(
            vec![ChatMessage::system("sys"), ChatMessage::user("hello")],
            0.3,
            3000,
            Duration::from_secs(120),
        );
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][1]["role"], "user");
        assert_eq!(value["max_tokens"], 3000);
        assert_eq!(value["stream"], false);
        assert!(value.get("timeout").is_none());
    }

    #[test]
    fn test_completion_response_parse() {
        let raw = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"ok"}}]}"#;
        let parsed: CompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.as_ref().unwrap().content, "ok");
    }
}
