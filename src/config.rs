//! Partner and match configuration
//!
//! Everything here round-trips through serde so the embedding CLI can persist
//! it however it likes. Durations are stored as whole seconds.

use std::time::Duration;

use rcgen::KeyPair;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::negotiate::Protocol;
use crate::pki::{parse_private_key, PkiError};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of range or inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Configuration text could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Partner private key unusable
    #[error("invalid partner private key: {0}")]
    PrivateKey(#[from] PkiError),

    /// No partner with the requested name
    #[error("partner {0} is not configured")]
    UnknownPartner(String),
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

fn require_positive(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid(format!("{name} must be positive")));
    }
    Ok(())
}

/// Data channel connection timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Bound on the whole connect or accept operation
    #[serde(with = "duration_secs")]
    pub overall_timeout: Duration,
    /// Bound on a single TCP dial
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,
    /// Bound on a single TLS handshake
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    /// Pause between failed attempts
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(120),
            dial_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl ConnectConfig {
    /// Reject zero timeouts
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("overall_timeout", self.overall_timeout)?;
        require_positive("dial_timeout", self.dial_timeout)?;
        require_positive("handshake_timeout", self.handshake_timeout)?;
        require_positive("retry_delay", self.retry_delay)
    }
}

/// Match attempt timing and protocol preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// How long to wait for the service to hand out a peer endpoint
    #[serde(with = "duration_secs")]
    pub init_timeout: Duration,
    /// How long the whole match may take, result polling included
    #[serde(with = "duration_secs")]
    pub run_timeout: Duration,
    /// Pause between RPC polls
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Protocols in preference order
    pub preferred_protocols: Vec<Protocol>,
    /// Data channel timeouts
    pub connect: ConnectConfig,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10 * 60),
            run_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(5),
            preferred_protocols: vec![Protocol::Dhpsi],
            connect: ConnectConfig::default(),
        }
    }
}

impl MatchConfig {
    /// Reject zero intervals, zero timeouts and empty preferences
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("init_timeout", self.init_timeout)?;
        require_positive("run_timeout", self.run_timeout)?;
        require_positive("poll_interval", self.poll_interval)?;
        if self.preferred_protocols.is_empty() {
            return Err(ConfigError::Invalid(
                "preferred_protocols must not be empty".to_string(),
            ));
        }
        if self.preferred_protocols.len() > usize::from(u8::MAX) {
            return Err(ConfigError::Invalid(
                "at most 255 preferred protocols".to_string(),
            ));
        }
        self.connect.validate()
    }
}

/// One partner this client can match with
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartnerConfig {
    /// Local name for the partner
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Partner federation API URL
    pub url: String,
    /// Our partner id at that service
    pub id: String,
    /// base64 PKCS#8 DER or PEM P-256 key
    pub private_key: String,
}

impl std::fmt::Debug for PartnerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartnerConfig")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("url", &self.url)
            .field("id", &self.id)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl PartnerConfig {
    /// Decode the private key
    pub fn parsed_private_key(&self) -> Result<KeyPair, ConfigError> {
        Ok(parse_private_key(&self.private_key)?)
    }

    /// Require name, url, id and a usable key
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("name", &self.name), ("url", &self.url), ("id", &self.id)] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("partner {field} is required")));
            }
        }
        self.parsed_private_key().map(|_| ())
    }
}

/// All configured partners
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Partners by local name
    pub partners: Vec<PartnerConfig>,
}

impl Config {
    /// Parse from JSON text
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Partner with `name`
    pub fn partner(&self, name: &str) -> Result<&PartnerConfig, ConfigError> {
        self.partners
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ConfigError::UnknownPartner(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine};

    #[test]
    fn defaults_match_operational_timeouts() {
        let config = MatchConfig::default();
        assert_eq!(config.init_timeout, Duration::from_secs(600));
        assert_eq!(config.run_timeout, Duration::from_secs(1800));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.preferred_protocols, vec![Protocol::Dhpsi]);
        assert_eq!(config.connect.overall_timeout, Duration::from_secs(120));
        assert_eq!(config.connect.dial_timeout, Duration::from_secs(2));
        assert_eq!(config.connect.retry_delay, Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: MatchConfig = serde_json::from_str(
            r#"{"poll_interval": 1, "preferred_protocols": ["kkrtpsi", "dhpsi"], "connect": {"dial_timeout": 5}}"#,
        )
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.init_timeout, Duration::from_secs(600));
        assert_eq!(
            config.preferred_protocols,
            vec![Protocol::Kkrtpsi, Protocol::Dhpsi]
        );
        assert_eq!(config.connect.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.connect.overall_timeout, Duration::from_secs(120));
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let json = serde_json::to_value(ConnectConfig::default()).unwrap();
        assert_eq!(json["overall_timeout"], 120);
        assert_eq!(json["handshake_timeout"], 30);
    }

    #[test]
    fn validation_rejects_zero_and_empty() {
        let config = MatchConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("poll_interval")));

        let config = MatchConfig {
            preferred_protocols: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MatchConfig {
            connect: ConnectConfig {
                retry_delay: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partner_key_parses_and_is_redacted() {
        let key = KeyPair::generate().unwrap();
        let partner = PartnerConfig {
            name: "acme".to_string(),
            description: "Acme Corp".to_string(),
            url: "https://match.acme.example".to_string(),
            id: "p-123".to_string(),
            private_key: STANDARD.encode(key.serialize_der()),
        };

        partner.validate().unwrap();
        assert_eq!(
            partner.parsed_private_key().unwrap().public_key_raw(),
            key.public_key_raw()
        );
        assert!(!format!("{partner:?}").contains(&partner.private_key));

        let config = Config {
            partners: vec![partner.clone()],
        };
        let parsed = Config::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed.partner("acme").unwrap(), &partner);
        assert!(matches!(
            parsed.partner("globex"),
            Err(ConfigError::UnknownPartner(_))
        ));
    }

    #[test]
    fn partner_without_key_is_invalid() {
        let partner = PartnerConfig {
            name: "acme".to_string(),
            url: "https://x".to_string(),
            id: "p".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            partner.validate(),
            Err(ConfigError::PrivateKey(_))
        ));
    }
}
