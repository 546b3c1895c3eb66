//! Runtime configuration
//!
//! Everything is read from the environment once at startup. `.env` files are
//! loaded by the binaries through `dotenv` before `AdvisorConfig::from_env`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LLM_API_URL: &str = "https://api-llm.ctl-gait.clientlabsaft.com/chat/completions";
pub const DEFAULT_LLM_MODEL: &str = "Anthropic Claude-V3.5 Sonnet Vertex AI (Internal)";

/// Identity provider settings used by the token authority
#[derive(Debug, Clone, Default)]
pub struct CognitoConfig {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub region: String,
    /// Overrides the regional `cognito-idp` URL (tests, proxies)
    pub endpoint: Option<String>,
}

impl CognitoConfig {
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://cognito-idp.{}.amazonaws.com/", self.region))
    }
}

/// Advisory model endpoint settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub model: String,
    /// Service key sent as `x-api-key: Bearer <token>`
    pub bearer_token: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub base_url: String,
    pub signing_key: String,
    pub upload_expiration: Duration,
}

#[derive(Debug, Clone)]
pub struct TableNames {
    pub profiles: String,
    pub sessions: String,
    pub connections: String,
}

#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub tables: TableNames,
    pub llm: LlmConfig,
    pub cognito: CognitoConfig,
    pub exchange_rate_api_key: Option<String>,
    pub object_store: ObjectStoreConfig,
    pub extraction_service_url: Option<String>,
    pub secrets_dir: Option<PathBuf>,
}

impl AdvisorConfig {
    pub fn from_env() -> crate::Result<Self> {
        let port: u16 = env::var("PORT")
            .or_else(|_| env::var("API_PORT"))
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| crate::AdvisorError::Config(format!("invalid PORT: {}", e)))?;

        let upload_expiration = env::var("UPLOAD_EXPIRATION")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(300);

        Ok(Self {
            port,
            database_url: env::var("DATABASE_URL")
                .or_else(|_| env::var("POSTGRES_URL"))
                .ok(),
            tables: TableNames {
                profiles: env_or("USER_PROFILES_TABLE", "asu-user-profiles"),
                sessions: env_or("SESSIONS_TABLE", "chatbot-sessions"),
                connections: env_or("CONNECTIONS_TABLE", "chatbot-connections"),
            },
            llm: LlmConfig {
                api_url: env_or("LLM_API_URL", DEFAULT_LLM_API_URL),
                model: env_or("LLM_MODEL", DEFAULT_LLM_MODEL),
                bearer_token: env_or("BEARER_TOKEN", ""),
                timeout: Duration::from_secs(crate::calculator::constants::LLM_TIMEOUT_SECS),
            },
            cognito: CognitoConfig {
                username: env_or("COGNITO_USERNAME", ""),
                password: env_or("COGNITO_PASSWORD", ""),
                client_id: env_or("COGNITO_CLIENT_ID", ""),
                client_secret: non_empty_env("COGNITO_CLIENT_SECRET"),
                region: env_or("COGNITO_REGION", "us-east-1"),
                endpoint: non_empty_env("COGNITO_ENDPOINT"),
            },
            exchange_rate_api_key: non_empty_env("EXCHANGE_RATE_API_KEY"),
            object_store: ObjectStoreConfig {
                bucket: env_or("BUCKET_NAME", "asu-loan-documents"),
                base_url: env_or("OBJECT_STORE_BASE_URL", "http://127.0.0.1:9000"),
                signing_key: env_or("OBJECT_STORE_SIGNING_KEY", ""),
                upload_expiration: Duration::from_secs(upload_expiration),
            },
            extraction_service_url: non_empty_env("EXTRACTION_SERVICE_URL"),
            secrets_dir: non_empty_env("SECRETS_DIR").map(PathBuf::from),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
