use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_CODE_LENGTH: usize = 8;
const DEFAULT_MAX_ATTEMPTS: i32 = 5;
const DEFAULT_MAX_NOTE_LENGTH: usize = 65_000;
const DEFAULT_MAX_REFERENCE_LENGTH: usize = 500;
const STRIPE_API_BASE: &str = "https://api.stripe.com";
const PAYPAL_SANDBOX_API_BASE: &str = "https://api-m.sandbox.paypal.com";
const PAYPAL_LIVE_API_BASE: &str = "https://api-m.paypal.com";

/// Handover/delivery code settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct VerificationConfig {
    /// Length of generated codes
    #[serde(default = "default_code_length")]
    #[validate(range(min = 6, max = 32))]
    pub code_length: usize,

    /// Wrong entries allowed per leg before the order is disputed
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: i32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            code_length: default_code_length(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Card processor credentials
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct StripeConfig {
    #[validate(length(min = 1, message = "Stripe secret key is required"))]
    pub secret_key: String,

    #[serde(default = "default_stripe_api_base")]
    pub api_base: String,

    /// Signing secret for `Stripe-Signature` webhook headers
    #[serde(default)]
    pub webhook_secret: Option<String>,

    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            api_base: default_stripe_api_base(),
            webhook_secret: None,
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
        }
    }
}

/// Wallet processor credentials
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PayPalConfig {
    #[validate(length(min = 1, message = "PayPal client id is required"))]
    pub client_id: String,

    #[validate(length(min = 1, message = "PayPal client secret is required"))]
    pub client_secret: String,

    /// "sandbox" or "live"
    #[serde(default = "default_paypal_mode")]
    #[validate(custom = "validate_paypal_mode")]
    pub mode: String,

    /// Overrides the API host derived from `mode`
    #[serde(default)]
    pub api_base: Option<String>,

    pub return_url: String,
    pub cancel_url: String,
}

impl PayPalConfig {
    pub fn base_url(&self) -> &str {
        match &self.api_base {
            Some(base) => base,
            None if self.mode.eq_ignore_ascii_case("live") => PAYPAL_LIVE_API_BASE,
            None => PAYPAL_SANDBOX_API_BASE,
        }
    }
}

/// Payment processing settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentsConfig {
    /// Smallest instant charge in minor currency units
    #[serde(default = "default_minimum_charge_minor")]
    #[validate(range(min = 1))]
    pub minimum_charge_minor: i64,

    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,

    #[serde(default)]
    #[validate]
    pub stripe: Option<StripeConfig>,

    #[serde(default)]
    #[validate]
    pub paypal: Option<PayPalConfig>,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            minimum_charge_minor: default_minimum_charge_minor(),
            request_timeout_secs: default_request_timeout_secs(),
            stripe: None,
            paypal: None,
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1, message = "database_url is required"))]
    pub database_url: String,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Capacity of the domain event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Cap on the free-text audit note kept on an order
    #[serde(default = "default_max_note_length")]
    pub max_note_length: usize,

    /// Cap on stored URLs and payment references
    #[serde(default = "default_max_reference_length")]
    pub max_reference_length: usize,

    #[serde(default)]
    #[validate]
    pub verification: VerificationConfig,

    #[serde(default)]
    #[validate]
    pub payments: PaymentsConfig,
}

impl AppConfig {
    /// Creates a new configuration
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            max_note_length: default_max_note_length(),
            max_reference_length: default_max_reference_length(),
            verification: VerificationConfig::default(),
            payments: PaymentsConfig::default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_max_note_length() -> usize {
    DEFAULT_MAX_NOTE_LENGTH
}
fn default_max_reference_length() -> usize {
    DEFAULT_MAX_REFERENCE_LENGTH
}
fn default_code_length() -> usize {
    DEFAULT_CODE_LENGTH
}
fn default_max_attempts() -> i32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_minimum_charge_minor() -> i64 {
    50
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_stripe_api_base() -> String {
    STRIPE_API_BASE.to_string()
}
fn default_webhook_tolerance_secs() -> i64 {
    300
}
fn default_paypal_mode() -> String {
    "sandbox".to_string()
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_paypal_mode(mode: &str) -> Result<(), ValidationError> {
    match mode.to_ascii_lowercase().as_str() {
        "sandbox" | "live" => Ok(()),
        _ => {
            let mut err = ValidationError::new("mode");
            err.message = Some("Must be one of: sandbox, live".into());
            Err(err)
        }
    }
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("maa_express={},sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Same as [`load_config`] with an explicit config directory.
pub fn load_config_from(config_dir: &Path) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://maa_express.db?mode=rwc")?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(
            File::with_name(&config_dir.join("default").to_string_lossy()).required(false),
        )
        .add_source(File::with_name(&config_dir.join(&run_env).to_string_lossy()).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, name: &str, content: &str) {
        let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
        writeln!(file, "{}", content).unwrap();
    }

    #[test]
    fn defaults_cover_verification_and_payments() {
        let cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        assert_eq!(cfg.verification.code_length, 8);
        assert_eq!(cfg.verification.max_attempts, 5);
        assert_eq!(cfg.payments.minimum_charge_minor, 50);
        assert_eq!(cfg.max_note_length, 65_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn file_layer_is_read_and_validated() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "default.toml",
            r#"
            database_url = "postgres://localhost/maa"
            environment = "development"
            log_level = "debug"

            [verification]
            code_length = 6

            [payments.stripe]
            secret_key = "sk_test_123"
            "#,
        );

        let cfg = load_config_from(dir.path()).unwrap();
        assert_eq!(cfg.database_url, "postgres://localhost/maa");
        assert_eq!(cfg.verification.code_length, 6);
        assert_eq!(cfg.verification.max_attempts, 5);
        let stripe = cfg.payments.stripe.unwrap();
        assert_eq!(stripe.api_base, "https://api.stripe.com");
        assert!(cfg.payments.paypal.is_none());
    }

    #[test]
    fn out_of_range_code_length_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "default.toml",
            r#"
            database_url = "sqlite::memory:"
            environment = "development"

            [verification]
            code_length = 3
            "#,
        );

        let result = load_config_from(dir.path());
        assert!(matches!(result, Err(AppConfigError::Validation(_))));
    }

    #[test]
    fn event_channel_needs_capacity() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        assert!(cfg.validate().is_ok());
        cfg.event_channel_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn paypal_mode_selects_api_host() {
        let mut paypal = PayPalConfig {
            client_id: "id".into(),
            client_secret: "secret".into(),
            mode: "live".into(),
            api_base: None,
            return_url: "https://example.com/return".into(),
            cancel_url: "https://example.com/cancel".into(),
        };
        assert_eq!(paypal.base_url(), "https://api-m.paypal.com");

        paypal.mode = "sandbox".into();
        assert_eq!(paypal.base_url(), "https://api-m.sandbox.paypal.com");

        paypal.mode = "staging".into();
        assert!(paypal.validate().is_err());
    }
}
