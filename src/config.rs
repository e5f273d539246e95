//! Configuration record interpretation and testing-mode vhost rewrite
//! (spec §6). Loading the JSON value itself from disk/environment is the
//! embedding service's job (out of scope, spec §1); this module only
//! resolves an already-loaded value into connection parameters, the way
//! `report-fast-renderer::config` resolves env vars into a `Config`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config missing required field: {0}")]
    MissingField(String),
}

/// Per-service credentials, as found under `MQ.users.<service_name>`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Credentials {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Mirror of the JSON shape in spec §6:
/// `{ "MQ": { "server", "port", "users": { "<service>": {"user","password"} } } }`
/// (or the unwrapped inner object directly).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MqConfigRecord {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub users: HashMap<String, Credentials>,
}

impl MqConfigRecord {
    /// Unwraps an outer `{"MQ": {...}}` envelope if present.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let inner = value.get("MQ").unwrap_or(value);
        serde_json::from_value(inner.clone())
            .map_err(|e| ConfigError::MissingField(e.to_string()))
    }
}

/// Broker connection parameters for one service, after defaulting.
#[derive(Debug, Clone)]
pub struct ResolvedMq {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl ResolvedMq {
    pub fn resolve(config: &MqConfigRecord, service_name: &str) -> Self {
        let creds = config.users.get(service_name);
        Self {
            host: config.server.clone().unwrap_or_else(|| "localhost".to_string()),
            port: config.port.unwrap_or(5672),
            user: creds
                .and_then(|c| c.user.clone())
                .unwrap_or_else(|| "guest".to_string()),
            password: creds
                .and_then(|c| c.password.clone())
                .unwrap_or_else(|| "guest".to_string()),
        }
    }

    pub fn amqp_url(&self, vhost: &str) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            percent_encode_vhost(vhost)
        )
    }
}

fn percent_encode_vhost(vhost: &str) -> String {
    // vhost begins with '/'; the AMQP URI scheme wants it percent-encoded
    // as the path component, stripped of its own leading slash.
    vhost.trim_start_matches('/').replace('/', "%2F")
}

/// Resolves the testing-mode flag from `<SERVICE>_TESTING`/`MQ_TESTING`,
/// service-specific first (spec §6 precedence).
pub fn testing_mode(service_name: &str) -> bool {
    let service_env = format!("{}_TESTING", service_name.to_uppercase());
    for key in [service_env.as_str(), "MQ_TESTING"] {
        if let Ok(v) = std::env::var(key) {
            return v == "1";
        }
    }
    false
}

/// Resolves the testing-mode prefix from `<SERVICE>_TESTING_PREFIX`/
/// `MQ_TESTING_PREFIX`, defaulting to `"test"`.
pub fn testing_prefix(service_name: &str) -> String {
    let service_env = format!("{}_TESTING_PREFIX", service_name.to_uppercase());
    for key in [service_env.as_str(), "MQ_TESTING_PREFIX"] {
        if let Ok(v) = std::env::var(key) {
            if !v.is_empty() {
                return v;
            }
        }
    }
    "test".to_string()
}

/// Rewrites `vhost` under testing mode: "prepend prefix exactly once"
/// (spec §9 Open Question, resolved in SPEC_FULL.md). A vhost whose first
/// path segment already equals the prefix is left untouched, so repeated
/// application is idempotent.
pub fn rewrite_vhost_for_testing(vhost: &str, prefix: &str) -> String {
    let vhost = if vhost.is_empty() { "/" } else { vhost };
    let rest = vhost.trim_start_matches('/');
    let first_segment = rest.split('_').next().unwrap_or("");
    if first_segment == prefix {
        return vhost.to_string();
    }
    if rest.is_empty() {
        format!("/{}", prefix)
    } else {
        format!("/{}_{}", prefix, rest)
    }
}

/// Applies the testing-mode rewrite if the relevant env vars say to.
pub fn apply_testing_mode(vhost: &str, service_name: &str) -> String {
    if testing_mode(service_name) {
        rewrite_vhost_for_testing(vhost, &testing_prefix(service_name))
    } else {
        vhost.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwraps_outer_mq_key() {
        let value = json!({"MQ": {"server": "broker.local", "port": 1234}});
        let config = MqConfigRecord::from_value(&value).unwrap();
        assert_eq!(config.server.as_deref(), Some("broker.local"));
        assert_eq!(config.port, Some(1234));
    }

    #[test]
    fn accepts_unwrapped_record_directly() {
        let value = json!({"server": "broker.local", "port": 1234});
        let config = MqConfigRecord::from_value(&value).unwrap();
        assert_eq!(config.server.as_deref(), Some("broker.local"));
    }

    #[test]
    fn defaults_missing_fields() {
        let config = MqConfigRecord::from_value(&json!({})).unwrap();
        let resolved = ResolvedMq::resolve(&config, "my-service");
        assert_eq!(resolved.host, "localhost");
        assert_eq!(resolved.port, 5672);
        assert_eq!(resolved.user, "guest");
        assert_eq!(resolved.password, "guest");
    }

    #[test]
    fn resolves_per_service_credentials() {
        let value = json!({
            "server": "broker.local",
            "port": 5672,
            "users": {"my-service": {"user": "svc", "password": "secret"}}
        });
        let config = MqConfigRecord::from_value(&value).unwrap();
        let resolved = ResolvedMq::resolve(&config, "my-service");
        assert_eq!(resolved.user, "svc");
        assert_eq!(resolved.password, "secret");
    }

    #[test]
    fn vhost_rewrite_is_idempotent() {
        let once = rewrite_vhost_for_testing("/orders", "test");
        let twice = rewrite_vhost_for_testing(&once, "test");
        assert_eq!(once, twice);
        assert_eq!(once, "/test_orders");
    }

    #[test]
    fn vhost_rewrite_handles_root_vhost() {
        let once = rewrite_vhost_for_testing("/", "test");
        assert_eq!(once, "/test");
        let twice = rewrite_vhost_for_testing(&once, "test");
        assert_eq!(once, twice);
    }

    #[test]
    fn vhost_rewrite_no_op_when_already_prefixed() {
        let already = "/test_orders";
        assert_eq!(rewrite_vhost_for_testing(already, "test"), already);
    }
}
