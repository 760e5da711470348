use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub token_ttl_days: i64,
    /// Allowed browser origin; any origin when unset
    pub cors_origin: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = var("CHATLINE_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("CHATLINE_JWT_SECRET is unset or still a placeholder");
        }

        let port = match var("CHATLINE_PORT") {
            Some(raw) => raw.parse().with_context(|| format!("invalid CHATLINE_PORT '{}'", raw))?,
            None => 5000,
        };
        let token_ttl_days = match var("CHATLINE_TOKEN_TTL_DAYS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid CHATLINE_TOKEN_TTL_DAYS '{}'", raw))?,
            None => 30,
        };
        if token_ttl_days <= 0 {
            bail!("CHATLINE_TOKEN_TTL_DAYS must be positive");
        }

        Ok(Self {
            host: var("CHATLINE_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: var("CHATLINE_DB_PATH")
                .unwrap_or_else(|| "chatline.db".into())
                .into(),
            jwt_secret,
            token_ttl_days,
            cors_origin: var("CHATLINE_CORS_ORIGIN").filter(|v| !v.trim().is_empty()),
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
