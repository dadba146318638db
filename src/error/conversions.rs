//! 错误类型转换实现

use super::DiscoveryError;

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            DiscoveryError::Encode(format!("JSON 序列化错误: {}", err))
        } else {
            DiscoveryError::Decode(format!("JSON 反序列化错误: {}", err))
        }
    }
}

impl From<toml::de::Error> for DiscoveryError {
    fn from(err: toml::de::Error) -> Self {
        DiscoveryError::Config(format!("TOML 解析错误: {}", err))
    }
}

/// 未单独分类的 etcd 错误统一视为连接失败
#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for DiscoveryError {
    fn from(err: etcd_client::Error) -> Self {
        DiscoveryError::store(super::ErrorCode::ConnectionFailed, "etcd", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_serde_json_error_is_decode() {
        let err: DiscoveryError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, DiscoveryError::Decode(_)));
        assert_eq!(err.code(), ErrorCode::DeserializationError);
    }

    #[test]
    fn test_toml_error_is_config() {
        let err: DiscoveryError = toml::from_str::<toml::Value>("= nope").unwrap_err().into();
        assert!(matches!(err, DiscoveryError::Config(_)));
    }
}
