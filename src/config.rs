use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::discovery::{CoordinationStore, NodeInfo, NodeRegistry, Registrant};
use crate::error::{DiscoveryError, InfraResult, Result};

/// 服务发现配置
///
/// ```toml
/// endpoints = ["http://127.0.0.1:2379"]
/// namespace = "/ed-client"
/// service_name = "/b/"
/// ttl = 10
///
/// [logging]
/// level = "info"
/// format = "pretty"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    pub endpoints: Vec<String>,
    pub namespace: String,
    pub service_name: String,
    /// 注册租约 TTL（秒）
    #[serde(default = "default_ttl")]
    pub ttl: i64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// 租约丢失后重新注册、监听中断后重新监听的间隔
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty 或 json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_ttl() -> i64 {
    10
}

fn default_lock_timeout_ms() -> u64 {
    3000
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl DiscoveryConfig {
    pub fn new(
        endpoints: Vec<String>,
        namespace: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            endpoints,
            namespace: namespace.into(),
            service_name: service_name.into(),
            ttl: default_ttl(),
            lock_timeout_ms: default_lock_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            logging: None,
        }
    }

    pub fn load_from_file(path: &str) -> InfraResult<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        let config = Self::from_toml(&content).with_context(|| format!("invalid config {}", path))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: DiscoveryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(DiscoveryError::Config("endpoints 不能为空".to_string()));
        }
        if self.namespace.is_empty() {
            return Err(DiscoveryError::Config("namespace 不能为空".to_string()));
        }
        if self.service_name.is_empty() {
            return Err(DiscoveryError::Config("service_name 不能为空".to_string()));
        }
        if self.ttl <= 0 {
            return Err(DiscoveryError::Config(format!("ttl 必须大于 0: {}", self.ttl)));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// 按配置创建注册表
    pub fn registry(&self, store: Arc<dyn CoordinationStore>) -> NodeRegistry {
        NodeRegistry::new(store, &self.namespace, &self.service_name)
            .with_lock_timeout(self.lock_timeout())
            .with_retry_interval(self.retry_interval())
    }

    /// 按配置创建注册者
    pub fn registrant(&self, store: Arc<dyn CoordinationStore>, node: NodeInfo) -> Registrant {
        Registrant::new(store, &self.namespace, &self.service_name, node, self.ttl)
            .with_lock_timeout(self.lock_timeout())
            .with_retry_interval(self.retry_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_from_toml_applies_defaults() {
        let config = DiscoveryConfig::from_toml(
            r#"
            endpoints = ["http://127.0.0.1:2379"]
            namespace = "/ed-client"
            service_name = "/b/"
            "#,
        )
        .unwrap();

        assert_eq!(config.ttl, 10);
        assert_eq!(config.lock_timeout(), Duration::from_secs(3));
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
        assert!(config.logging.is_none());
    }

    #[test]
    fn test_from_toml_reads_logging_section() {
        let config = DiscoveryConfig::from_toml(
            r#"
            endpoints = ["http://127.0.0.1:2379"]
            namespace = "/ns"
            service_name = "/svc/"
            ttl = 30

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.ttl, 30);
        let logging = config.logging.unwrap();
        assert_eq!(logging.level, "info");
        assert_eq!(logging.format, "json");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DiscoveryConfig::new(vec!["http://127.0.0.1:2379".into()], "/ns", "/svc/");
        assert_ok!(config.validate());

        config.ttl = 0;
        assert!(matches!(config.validate(), Err(DiscoveryError::Config(_))));

        config.ttl = 5;
        config.endpoints.clear();
        assert_err!(config.validate());
    }

    #[test]
    fn test_from_toml_rejects_malformed() {
        let err = DiscoveryConfig::from_toml("endpoints = 3").unwrap_err();
        assert!(matches!(err, DiscoveryError::Config(_)));
    }

    #[test]
    fn test_load_from_missing_file() {
        assert_err!(DiscoveryConfig::load_from_file("/nonexistent/ed-client.toml"));
    }
}
