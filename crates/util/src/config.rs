use std::{
    env, fmt,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://shopfront.db?mode=rwc";
pub const DEFAULT_DOH_ENDPOINT: &str = "https://cloudflare-dns.com/dns-query";
const DEV_JWT_SECRET: &str = "dev-jwt-secret-change-me";
const DEV_CART_SECRET: &str = "dev-cart-secret-change-me";
const DEFAULT_ACCESS_TTL_SECS: u64 = 900;
const DEFAULT_REFRESH_TTL_SECS: u64 = 30 * 24 * 60 * 60;
const DEFAULT_CART_TTL_DAYS: u64 = 30;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns `true` for production deployments.
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub jwt_secret: Vec<u8>,
    pub cart_cookie_secret: Vec<u8>,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub cart_ttl: Duration,
    pub doh_endpoint: String,
    pub edge_ips: Vec<Ipv4Addr>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let jwt_secret = secret_var("JWT_SECRET", DEV_JWT_SECRET, environment)?;
        let cart_cookie_secret = secret_var("CART_COOKIE_SECRET", DEV_CART_SECRET, environment)?;

        let access_token_ttl = Duration::from_secs(u64_var(
            "ACCESS_TOKEN_TTL_SECS",
            DEFAULT_ACCESS_TTL_SECS,
        )?);
        let refresh_token_ttl = Duration::from_secs(u64_var(
            "REFRESH_TOKEN_TTL_SECS",
            DEFAULT_REFRESH_TTL_SECS,
        )?);
        let cart_ttl =
            Duration::from_secs(u64_var("CART_TTL_DAYS", DEFAULT_CART_TTL_DAYS)? * 24 * 60 * 60);

        let doh_endpoint =
            env::var("DOH_ENDPOINT").unwrap_or_else(|_| DEFAULT_DOH_ENDPOINT.to_string());
        let edge_ips = parse_edge_ips(&env::var("EDGE_IPS").unwrap_or_default())?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            jwt_secret,
            cart_cookie_secret,
            access_token_ttl,
            refresh_token_ttl,
            cart_ttl,
            doh_endpoint,
            edge_ips,
        })
    }
}

fn secret_var(
    name: &'static str,
    dev_default: &str,
    environment: Environment,
) -> Result<Vec<u8>, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value.into_bytes()),
        _ if environment.is_production() => Err(ConfigError::MissingSecret(name)),
        _ => Ok(dev_default.as_bytes().to_vec()),
    }
}

fn u64_var(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|parsed| *parsed > 0)
            .ok_or(ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(default),
    }
}

fn parse_edge_ips(raw: &str) -> Result<Vec<Ipv4Addr>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<Ipv4Addr>()
                .map_err(|_| ConfigError::InvalidEdgeIp(item.to_string()))
        })
        .collect()
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingSecret(&'static str),
    InvalidNumber { name: &'static str, value: String },
    InvalidEdgeIp(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingSecret(name) => write!(f, "{name} must be set in production"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a positive integer (got {value})")
            }
            Self::InvalidEdgeIp(value) => write!(f, "EDGE_IPS contains invalid IPv4 address {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_BIND_ADDR;

    const VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "JWT_SECRET",
        "CART_COOKIE_SECRET",
        "ACCESS_TOKEN_TTL_SECS",
        "REFRESH_TOKEN_TTL_SECS",
        "CART_TTL_DAYS",
        "DOH_ENDPOINT",
        "EDGE_IPS",
    ];

    fn clear_env() {
        for name in VARS {
            env::remove_var(name);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.access_token_ttl, Duration::from_secs(900));
        assert_eq!(config.cart_ttl, Duration::from_secs(30 * 86_400));
        assert!(config.edge_ips.is_empty());
        assert!(!config.jwt_secret.is_empty());
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }

    #[test]
    fn production_requires_secrets() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("APP_ENV", "production");

        let err = AppConfig::from_env().expect_err("missing secret should error");
        assert!(matches!(err, ConfigError::MissingSecret("JWT_SECRET")));

        env::set_var("JWT_SECRET", "jwt");
        env::set_var("CART_COOKIE_SECRET", "cart");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.jwt_secret, b"jwt".to_vec());

        clear_env();
    }

    #[test]
    fn parses_edge_ips_and_ttls() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        clear_env();
        env::set_var("EDGE_IPS", "203.0.113.10, 203.0.113.11");
        env::set_var("ACCESS_TOKEN_TTL_SECS", "60");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(
            config.edge_ips,
            vec![
                Ipv4Addr::new(203, 0, 113, 10),
                Ipv4Addr::new(203, 0, 113, 11)
            ]
        );
        assert_eq!(config.access_token_ttl, Duration::from_secs(60));

        env::set_var("EDGE_IPS", "not-an-ip");
        let err = AppConfig::from_env().expect_err("bad ip should error");
        assert!(matches!(err, ConfigError::InvalidEdgeIp(value) if value == "not-an-ip"));

        env::set_var("EDGE_IPS", "");
        env::set_var("CART_TTL_DAYS", "zero");
        let err = AppConfig::from_env().expect_err("bad number should error");
        assert!(matches!(err, ConfigError::InvalidNumber { name: "CART_TTL_DAYS", .. }));

        clear_env();
    }
}
