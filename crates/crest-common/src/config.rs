//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call crest_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("server.public_url", "http://localhost:8080")?
        .set_default("server.behind_proxy", false)?
        .set_default("database.url", "sqlite://crest.db?mode=rwc")?
        .set_default("database.max_connections", 8)?
        .set_default("auth.rp_name", "Crest")?
        .set_default("auth.app_origins", Vec::<String>::new())?
        .set_default("auth.cookie_session_hours", 24)?
        .set_default("auth.hmac_session_days", 90)?
        .set_default("auth.refresh_token_days", 60)?
        .set_default("auth.otp_expiry_mins", 10)?
        .set_default("auth.otp_resend_wait_mins", 5)?
        .set_default("auth.magic_link_ttl_secs", 300)?
        .set_default("auth.handoff_token_ttl_secs", 300)?
        .set_default("auth.invite_token_ttl_hours", 72)?
        .set_default("policy.invite_only", false)?
        .set_default("policy.allowed_address_suffixes", Vec::<String>::new())?
        .set_default("mail.smtp_host", "")?
        .set_default("mail.smtp_port", 587)?
        .set_default("mail.smtp_user", "")?
        .set_default("mail.smtp_pass", "")?
        .set_default("mail.from_address", "no-reply@localhost")?
        .set_default("geo.endpoint", "http://ip-api.com/json")?
        .set_default("geo.timeout_secs", 3)?
        .set_default("media.stun_urls", "stun:stun.l.google.com:19302")?
        .set_default("media.turn_host", "")?
        .set_default("media.turn_secret", "")?
        .set_default("media.turn_credential_ttl_secs", 86_400)?
        .set_default("media.token_ttl_secs", 86_400)?
        .set_default("messaging.allow_legacy_device_inbox", false)?
        .set_default("serializer.default_deadline_secs", 10)?
        .set_default("serializer.prekey_soft_deadline_secs", 5)?
        .set_default("limits.max_profile_image_bytes", 1_048_576)? // 1 MiB
        .set_default("limits.max_prekeys_per_upload", 1000)?
        .set_default("limits.max_payload_bytes", 262_144)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (CREST_SERVER__HOST, CREST_AUTH__SIGNING_KEY, etc.)
        .add_source(
            config::Environment::with_prefix("CREST")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Initialize the global config directly from a value. Test support only.
pub fn init_from(app_config: AppConfig) -> &'static AppConfig {
    CONFIG.get_or_init(|| app_config)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub policy: PolicyConfig,
    pub mail: MailConfig,
    pub geo: GeoConfig,
    pub media: MediaConfig,
    pub messaging: MessagingConfig,
    pub serializer: SerializerConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally visible base URL (scheme + host), e.g. "https://crest.example.com".
    /// Used for magic links and to derive the credential RP origin.
    pub public_url: String,
    /// Honor X-Forwarded-Proto / X-Forwarded-Host when deriving origins.
    pub behind_proxy: bool,
}

impl ServerConfig {
    /// Relying-party identifier: the registrable domain of `public_url`.
    pub fn rp_id(&self) -> String {
        self.public_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split([':', '/'])
            .next()
            .unwrap_or("localhost")
            .to_string()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Server signing key (HMAC-SHA256) for magic links, bearer tokens, and
    /// media room tokens. 256+ bits of entropy.
    pub signing_key: String,
    /// Human-readable relying-party name shown by authenticators.
    pub rp_name: String,
    /// App-identity origins accepted verbatim during assertion, e.g.
    /// "android:apk-key-hash:…". Prefix-matched, never treated as HTTPS.
    pub app_origins: Vec<String>,
    pub cookie_session_hours: i64,
    pub hmac_session_days: i64,
    pub refresh_token_days: i64,
    pub otp_expiry_mins: i64,
    pub otp_resend_wait_mins: i64,
    pub magic_link_ttl_secs: i64,
    pub handoff_token_ttl_secs: i64,
    pub invite_token_ttl_hours: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    /// When true, enrollment requires a valid invitation token.
    pub invite_only: bool,
    /// Allowed address suffixes (empty = any address).
    pub allowed_address_suffixes: Vec<String>,
    /// Roles auto-assigned at verification, keyed by exact address.
    #[serde(default)]
    pub auto_roles: Vec<AutoRoleRule>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AutoRoleRule {
    pub address: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    /// SMTP relay host — empty string disables outbound mail entirely.
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub from_address: String,
}

impl MailConfig {
    pub fn enabled(&self) -> bool {
        !self.smtp_host.is_empty()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeoConfig {
    /// IP-geolocation endpoint; empty string disables lookups.
    pub endpoint: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    /// STUN URLs, comma-separated.
    pub stun_urls: String,
    /// TURN relay hostname — empty string omits TURN from ICE config.
    pub turn_host: String,
    /// Shared secret for TURN REST credentials.
    pub turn_secret: String,
    pub turn_credential_ttl_secs: i64,
    /// Media room token lifetime; capped at 24 h.
    pub token_ttl_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessagingConfig {
    /// Legacy inbox reads bound by device only are refused unless this is set.
    pub allow_legacy_device_inbox: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SerializerConfig {
    pub default_deadline_secs: u64,
    pub prekey_soft_deadline_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    pub max_profile_image_bytes: u64,
    pub max_prekeys_per_upload: u32,
    pub max_payload_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rp_id_strips_scheme_and_port() {
        let sc = ServerConfig {
            host: "0.0.0.0".into(),
            port: 8080,
            public_url: "https://chat.example.org:8443/app".into(),
            behind_proxy: true,
        };
        assert_eq!(sc.rp_id(), "chat.example.org");
    }
}
