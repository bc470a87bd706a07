use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use parley_gateway::{CompletionProvider, GatewayConfig, HttpCompletionProvider};

const AI_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_AI_MODEL: &str = "gpt-4o-mini";

/// Settings read from `PARLEY_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub gateway: GatewayConfig,
    pub ai: Option<AiConfig>,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = GatewayConfig::default();

        let host = var("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_var("PARLEY_PORT", 8080)?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {host}:{port}"))?;

        let jwt_secret = match var("PARLEY_JWT_SECRET") {
            Some(secret) => secret,
            None => {
                warn!("PARLEY_JWT_SECRET is not set, using the development secret");
                defaults.jwt_secret.clone()
            }
        };

        let gateway = GatewayConfig {
            jwt_secret,
            token_ttl: Duration::from_secs(parse_var("PARLEY_TOKEN_TTL_HOURS", 720u64)? * 3600),
            upload_dir: var("PARLEY_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            upload_temp_dir: var("PARLEY_UPLOAD_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_temp_dir),
            max_upload_bytes: parse_var("PARLEY_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            upload_timeout: Duration::from_secs(parse_var(
                "PARLEY_UPLOAD_TIMEOUT_SECS",
                defaults.upload_timeout.as_secs(),
            )?),
            typing_ttl: Duration::from_secs(parse_var(
                "PARLEY_TYPING_TTL_SECS",
                defaults.typing_ttl.as_secs(),
            )?),
            outbound_queue: parse_var("PARLEY_OUTBOUND_QUEUE", defaults.outbound_queue)?,
            message_cache: parse_var("PARLEY_MESSAGE_CACHE", defaults.message_cache)?,
            malformed_tolerance: parse_var(
                "PARLEY_MALFORMED_TOLERANCE",
                defaults.malformed_tolerance,
            )?,
        };

        let ai = var("PARLEY_AI_ENDPOINT").map(|endpoint| AiConfig {
            endpoint,
            api_key: var("PARLEY_AI_API_KEY"),
            model: var("PARLEY_AI_MODEL").unwrap_or_else(|| DEFAULT_AI_MODEL.into()),
        });

        Ok(Self {
            addr,
            db_path: PathBuf::from(var("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into())),
            gateway,
            ai,
        })
    }

    /// The completion provider behind `@ai`, if one is configured.
    pub fn completion_provider(&self) -> Result<Option<Arc<dyn CompletionProvider>>> {
        let Some(ai) = &self.ai else {
            info!("No AI endpoint configured, @ai is disabled");
            return Ok(None);
        };
        let provider = HttpCompletionProvider::new(
            ai.endpoint.clone(),
            ai.api_key.clone(),
            ai.model.clone(),
            AI_TIMEOUT,
        )?;
        info!("AI replies via {} ({})", ai.endpoint, ai.model);
        Ok(Some(Arc::new(provider)))
    }
}
