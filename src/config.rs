//! Server configuration module
//! Handles tunable parameters for the coordination core

use crate::constants::*;
use crate::error::{PulseError, Result};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long a dropped collectible stays claimable
    pub claim_window: Duration,
    /// Interval of the expiry sweep
    pub sweep_interval: Duration,
    /// Interval of the random drop trigger
    pub drop_interval: Duration,
    /// Rooms need at least this many current participants to receive a drop
    pub drop_min_participants: u32,
    /// Probability that an eligible room receives a drop on a tick
    pub drop_chance: f64,
    /// Failed attempts allowed per window before a key is blocked
    pub rate_limit_max_attempts: u32,
    pub rate_limit_window: Duration,
    pub rate_limit_block: Duration,
    pub rate_limit_cleanup_interval: Duration,
    /// Deadline for a single transport send
    pub send_timeout: Duration,
    /// Deadline for a single store call
    pub store_timeout: Duration,
    pub nearby_radius_km: f64,
    pub max_message_bytes: usize,
    /// Accept sessions without a credential, keyed by the path id
    pub allow_anonymous: bool,
    /// Trust X-Forwarded-For / X-Real-IP when deriving the client address
    pub trust_proxy_headers: bool,
    /// Development token table: token -> user id
    pub static_tokens: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            claim_window: Duration::from_secs(DEFAULT_CLAIM_WINDOW_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            drop_interval: Duration::from_secs(DEFAULT_DROP_INTERVAL_SECS),
            drop_min_participants: DEFAULT_DROP_MIN_PARTICIPANTS,
            drop_chance: DEFAULT_DROP_CHANCE,
            rate_limit_max_attempts: DEFAULT_RATE_LIMIT_MAX_ATTEMPTS,
            rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            rate_limit_block: Duration::from_secs(DEFAULT_RATE_LIMIT_BLOCK_SECS),
            rate_limit_cleanup_interval: Duration::from_secs(DEFAULT_RATE_LIMIT_CLEANUP_SECS),
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            nearby_radius_km: DEFAULT_NEARBY_RADIUS_KM,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            allow_anonymous: true,
            trust_proxy_headers: false,
            static_tokens: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Short, deterministic settings for tests
    pub fn for_testing() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            send_timeout: Duration::from_millis(500),
            store_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let host = env::var("PULSE_HOST").unwrap_or(defaults.host);
        let port = parse_var("PULSE_PORT", defaults.port)?;

        let claim_window = secs_var("PULSE_CLAIM_WINDOW_SECS", defaults.claim_window)?;
        let sweep_interval = secs_var("PULSE_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?;
        let drop_interval = secs_var("PULSE_DROP_INTERVAL_SECS", defaults.drop_interval)?;
        let drop_min_participants =
            parse_var("PULSE_DROP_MIN_PARTICIPANTS", defaults.drop_min_participants)?;
        let drop_chance = parse_var("PULSE_DROP_CHANCE", defaults.drop_chance)?;

        let rate_limit_max_attempts =
            parse_var("PULSE_RATE_LIMIT_MAX_ATTEMPTS", defaults.rate_limit_max_attempts)?;
        let rate_limit_window = secs_var("PULSE_RATE_LIMIT_WINDOW_SECS", defaults.rate_limit_window)?;
        let rate_limit_block = secs_var("PULSE_RATE_LIMIT_BLOCK_SECS", defaults.rate_limit_block)?;
        let rate_limit_cleanup_interval = secs_var(
            "PULSE_RATE_LIMIT_CLEANUP_SECS",
            defaults.rate_limit_cleanup_interval,
        )?;

        let send_timeout = millis_var("PULSE_SEND_TIMEOUT_MS", defaults.send_timeout)?;
        let store_timeout = millis_var("PULSE_STORE_TIMEOUT_MS", defaults.store_timeout)?;
        let nearby_radius_km = parse_var("PULSE_NEARBY_RADIUS_KM", defaults.nearby_radius_km)?;
        let max_message_bytes = parse_var("PULSE_MAX_MESSAGE_BYTES", defaults.max_message_bytes)?;

        let allow_anonymous = flag_var("PULSE_ALLOW_ANONYMOUS", defaults.allow_anonymous);
        let trust_proxy_headers = flag_var("PULSE_TRUST_PROXY_HEADERS", defaults.trust_proxy_headers);

        let static_tokens = match env::var("PULSE_STATIC_TOKENS") {
            Ok(raw) => parse_token_table(&raw)?,
            Err(_) => HashMap::new(),
        };

        let config = Self {
            host,
            port,
            claim_window,
            sweep_interval,
            drop_interval,
            drop_min_participants,
            drop_chance,
            rate_limit_max_attempts,
            rate_limit_window,
            rate_limit_block,
            rate_limit_cleanup_interval,
            send_timeout,
            store_timeout,
            nearby_radius_km,
            max_message_bytes,
            allow_anonymous,
            trust_proxy_headers,
            static_tokens,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a background task spin or a rule meaningless
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("claim window", self.claim_window),
            ("sweep interval", self.sweep_interval),
            ("drop interval", self.drop_interval),
            ("rate limit window", self.rate_limit_window),
            ("rate limit cleanup interval", self.rate_limit_cleanup_interval),
            ("send timeout", self.send_timeout),
            ("store timeout", self.store_timeout),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(PulseError::ConfigError(format!("{} must be greater than zero", name)));
            }
        }

        if self.rate_limit_max_attempts == 0 {
            return Err(PulseError::ConfigError(
                "rate limit max attempts must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.drop_chance) {
            return Err(PulseError::ConfigError(format!(
                "drop chance must be within [0, 1], got {}",
                self.drop_chance
            )));
        }

        if !(self.nearby_radius_km.is_finite() && self.nearby_radius_km > 0.0) {
            return Err(PulseError::ConfigError(
                "nearby radius must be a positive number of kilometres".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| PulseError::ConfigError(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    parse_var(name, default.as_secs()).map(Duration::from_secs)
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    parse_var(name, default.as_millis() as u64).map(Duration::from_millis)
}

fn flag_var(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(default)
}

/// Parse `token:user_id` pairs separated by commas
fn parse_token_table(raw: &str) -> Result<HashMap<String, String>> {
    let mut table = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once(':') {
            Some((token, user_id)) if !token.is_empty() && !user_id.is_empty() => {
                table.insert(token.to_string(), user_id.to_string());
            }
            _ => {
                return Err(PulseError::ConfigError(format!(
                    "PULSE_STATIC_TOKENS entry is not token:user_id: {}",
                    entry
                )))
            }
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ServerConfig::default().validate().is_ok());
        assert!(ServerConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_drop_chance_out_of_range() {
        let mut config = ServerConfig::for_testing();
        config.drop_chance = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("drop chance"));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let mut config = ServerConfig::for_testing();
        config.sweep_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(PulseError::ConfigError(_))));
    }

    #[test]
    fn test_token_table_parsing() {
        let table = parse_token_table("abc:u1, def:u2").unwrap();
        assert_eq!(table.get("abc").map(String::as_str), Some("u1"));
        assert_eq!(table.get("def").map(String::as_str), Some("u2"));

        assert!(parse_token_table("missing-separator").is_err());
        assert!(parse_token_table("").unwrap().is_empty());
    }
}
