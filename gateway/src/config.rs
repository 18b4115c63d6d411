//! Configuration for the gateway service

use anyhow::Result;
use clap::{Parser, ValueEnum};

use crate::auth::{parse_algorithm, JwtConfig};

/// Where records live
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Process-local tables, lost on restart
    Memory,
    /// NATS JetStream key-value bucket
    Jetstream,
}

/// Configuration for the Haven gateway
#[derive(Debug, Clone, Parser)]
#[command(name = "haven-gateway")]
#[command(about = "Serves geofence and parental control checks over HTTP")]
pub struct GatewayConfig {
    /// Address to listen on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3001")]
    pub bind_addr: String,

    /// Shared secret for verifying bearer tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// HMAC algorithm tokens are signed with
    #[arg(long, env = "JWT_ALGORITHM", default_value = "HS256")]
    pub jwt_algorithm: String,

    /// Required `iss` claim, if set
    #[arg(long, env = "JWT_ISSUER")]
    pub jwt_issuer: Option<String>,

    /// Required `aud` claim, if set
    #[arg(long, env = "JWT_AUDIENCE")]
    pub jwt_audience: Option<String>,

    /// IANA timezone for time-of-day rules and the daily screen-time reset
    #[arg(long, env = "HAVEN_TIMEZONE", default_value = "UTC")]
    pub timezone: String,

    /// Store backend
    #[arg(long, env = "HAVEN_STORE", value_enum, default_value_t = StoreBackend::Memory)]
    pub store: StoreBackend,

    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// Path to NATS credentials file
    #[arg(long, env = "NATS_CREDS_PATH")]
    pub nats_creds_path: Option<String>,

    /// JetStream KV bucket name
    #[arg(long, env = "HAVEN_KV_BUCKET", default_value = "haven")]
    pub kv_bucket: String,

    /// Output logs in JSON format
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl GatewayConfig {
    pub fn jwt_config(&self) -> Result<JwtConfig> {
        if self.jwt_secret.trim().is_empty() {
            anyhow::bail!("JWT_SECRET must not be empty");
        }
        let algorithm = parse_algorithm(&self.jwt_algorithm).map_err(anyhow::Error::msg)?;
        let mut config = JwtConfig::new(self.jwt_secret.clone(), algorithm);
        if let Some(issuer) = &self.jwt_issuer {
            config = config.with_issuer(issuer.clone());
        }
        if let Some(audience) = &self.jwt_audience {
            config = config.with_audience(audience.clone());
        }
        Ok(config)
    }
}
