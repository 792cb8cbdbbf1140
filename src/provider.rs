//! Upstream provider configuration.

use crate::error::GatewayError;
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for one upstream API provider.
///
/// Created at registration and treated as immutable afterwards; the gateway
/// owns the matching breaker and health record.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Header the API key is sent in.
    pub api_key_header: String,
    /// Prefix prepended to the API key value.
    pub api_key_prefix: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Attempts per request, including the first.
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub retry_delay: Duration,
    /// Default TTL for cached responses from this provider.
    pub cache_ttl: Duration,
    /// Relative weight for weighted balancing.
    pub weight: u32,
    /// Failover preference, lower wins.
    pub priority: i32,
    /// Static headers attached to every request.
    pub headers: HashMap<String, String>,
    pub enabled: bool,
    /// Optional URL probed by health checks.
    pub health_url: Option<String>,
}

impl ProviderSpec {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            api_key_header: "Authorization".into(),
            api_key_prefix: "Bearer ".into(),
            timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            cache_ttl: Duration::from_secs(300),
            weight: 100,
            priority: 0,
            headers: HashMap::new(),
            enabled: true,
            health_url: None,
        }
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn api_key_header(mut self, header: impl Into<String>) -> Self {
        self.api_key_header = header.into();
        self
    }

    pub fn api_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_key_prefix = prefix.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.name.is_empty() {
            return Err(GatewayError::InvalidConfig("provider name is empty".into()));
        }
        if self.base_url.is_empty() {
            return Err(GatewayError::InvalidConfig(format!(
                "provider '{}' has an empty base_url",
                self.name
            )));
        }
        if self.retry_attempts == 0 {
            return Err(GatewayError::InvalidConfig(format!(
                "provider '{}' must allow at least one attempt",
                self.name
            )));
        }
        Ok(())
    }

    /// Value sent in the API-key header, if a key is configured.
    pub(crate) fn api_key_value(&self) -> Option<String> {
        self.api_key.as_ref().map(|key| format!("{}{}", self.api_key_prefix, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let spec = ProviderSpec::new("helius", "https://api.helius.xyz");
        assert_eq!(spec.api_key_header, "Authorization");
        assert_eq!(spec.api_key_prefix, "Bearer ");
        assert_eq!(spec.timeout, Duration::from_secs(30));
        assert_eq!(spec.retry_attempts, 3);
        assert_eq!(spec.retry_delay, Duration::from_secs(1));
        assert_eq!(spec.cache_ttl, Duration::from_secs(300));
        assert_eq!(spec.weight, 100);
        assert_eq!(spec.priority, 0);
        assert!(spec.enabled);
        assert!(spec.headers.is_empty());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn api_key_value_combines_prefix_and_key() {
        let bearer = ProviderSpec::new("a", "https://a").api_key("secret");
        assert_eq!(bearer.api_key_value().unwrap(), "Bearer secret");

        let custom = ProviderSpec::new("b", "https://b")
            .api_key("k123")
            .api_key_header("X-API-KEY")
            .api_key_prefix("");
        assert_eq!(custom.api_key_value().unwrap(), "k123");

        let none = ProviderSpec::new("c", "https://c");
        assert!(none.api_key_value().is_none());
    }

    #[test]
    fn validation_rejects_degenerate_configs() {
        assert!(ProviderSpec::new("", "https://x").validate().is_err());
        assert!(ProviderSpec::new("x", "").validate().is_err());
        assert!(ProviderSpec::new("x", "https://x").retry_attempts(0).validate().is_err());
    }
}
