//! 节点信息定义与编解码
//!
//! 存储中的值是一个 JSON 对象：`{"Server": "127.0.0.1:8081", "Tag": {"zone": "a"}}`。
//! 字段名与同一存储的其它读取方保持一致，解码时也接受 `address` / `tags`。

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use crate::error::{DiscoveryError, Result};

/// 节点信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NodeInfo {
    /// 服务地址（host:port）
    #[serde(rename = "Server", alias = "address")]
    pub address: String,

    /// 自定义标签
    #[serde(
        rename = "Tag",
        alias = "tags",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub tags: HashMap<String, String>,
}

impl NodeInfo {
    /// 创建新的节点信息
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tags: HashMap::new(),
        }
    }

    /// 添加标签
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// 编码为存储值
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DiscoveryError::Encode(e.to_string()))
    }

    /// 从存储值解码
    pub fn decode(value: &[u8]) -> Result<Self> {
        serde_json::from_slice(value).map_err(|e| DiscoveryError::Decode(e.to_string()))
    }

    /// 检查是否匹配标签过滤器
    pub fn matches_tags(&self, filters: &HashMap<String, String>) -> bool {
        filters
            .iter()
            .all(|(key, value)| self.tags.get(key).map(|v| v == value).unwrap_or(false))
    }
}

// 其它客户端会把空标签写成 null
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let node = NodeInfo::new("127.0.0.1:8081")
            .with_tag("zone", "cn-east")
            .with_tag("version", "v2");

        let bytes = node.encode().unwrap();
        assert_eq!(NodeInfo::decode(&bytes).unwrap(), node);
    }

    #[test]
    fn test_wire_field_names() {
        let node = NodeInfo::new("127.0.0.1:8081").with_tag("env", "test");
        let value: serde_json::Value = serde_json::from_slice(&node.encode().unwrap()).unwrap();

        assert_eq!(value["Server"], "127.0.0.1:8081");
        assert_eq!(value["Tag"]["env"], "test");
    }

    #[test]
    fn test_decode_accepts_null_and_missing_tags() {
        let node = NodeInfo::decode(br#"{"Server":"10.0.0.1:80","Tag":null}"#).unwrap();
        assert!(node.tags.is_empty());

        let node = NodeInfo::decode(br#"{"Server":"10.0.0.1:80"}"#).unwrap();
        assert_eq!(node.address, "10.0.0.1:80");
        assert!(node.tags.is_empty());
    }

    #[test]
    fn test_decode_accepts_lowercase_aliases() {
        let node = NodeInfo::decode(br#"{"address":"10.0.0.2:80","tags":{"a":"b"}}"#).unwrap();
        assert_eq!(node, NodeInfo::new("10.0.0.2:80").with_tag("a", "b"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = NodeInfo::decode(b"not-json").unwrap_err();
        assert!(matches!(err, DiscoveryError::Decode(_)));
    }

    #[test]
    fn test_matches_tags() {
        let node = NodeInfo::new("a:1").with_tag("zone", "a");
        let mut filters = HashMap::new();
        assert!(node.matches_tags(&filters));
        filters.insert("zone".to_string(), "a".to_string());
        assert!(node.matches_tags(&filters));
        filters.insert("zone".to_string(), "b".to_string());
        assert!(!node.matches_tags(&filters));
    }
}
