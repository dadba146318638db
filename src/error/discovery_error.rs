//! 服务发现统一错误类型

use super::code::ErrorCode;
use thiserror::Error;

/// 服务发现统一错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// 在超时时间内未能获取分布式锁
    #[error("获取分布式锁超时: {key} ({timeout_ms}ms)")]
    LockTimeout { key: String, timeout_ms: u64 },

    /// 协调存储操作失败
    #[error("协调存储操作 {op} 失败 [{code}]: {reason}", code = .code.as_str())]
    Store {
        code: ErrorCode,
        op: &'static str,
        reason: String,
    },

    /// 节点信息编码失败
    #[error("节点信息编码错误: {0}")]
    Encode(String),

    /// 节点信息解码失败
    #[error("节点信息解码错误: {0}")]
    Decode(String),

    /// 注册表已经启动
    #[error("注册表已启动: {0}")]
    AlreadyStarted(String),

    /// 节点已经注册
    #[error("节点已注册: {0}")]
    AlreadyRegistered(String),

    /// 节点尚未注册
    #[error("节点未注册: {0}")]
    NotRegistered(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

impl DiscoveryError {
    /// 创建存储操作错误
    pub fn store(code: ErrorCode, op: &'static str, reason: impl std::fmt::Display) -> Self {
        DiscoveryError::Store {
            code,
            op,
            reason: reason.to_string(),
        }
    }

    /// 创建锁超时错误
    pub fn lock_timeout(key: impl Into<String>, timeout: std::time::Duration) -> Self {
        DiscoveryError::LockTimeout {
            key: key.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            DiscoveryError::LockTimeout { .. } => ErrorCode::LockTimeout,
            DiscoveryError::Store { code, .. } => *code,
            DiscoveryError::Encode(_) => ErrorCode::SerializationError,
            DiscoveryError::Decode(_) => ErrorCode::DeserializationError,
            DiscoveryError::AlreadyStarted(_) => ErrorCode::AlreadyStarted,
            DiscoveryError::AlreadyRegistered(_) => ErrorCode::AlreadyRegistered,
            DiscoveryError::NotRegistered(_) => ErrorCode::NotRegistered,
            DiscoveryError::Config(_) => ErrorCode::ConfigurationError,
        }
    }

    /// 判断是否可重试
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// 服务发现结果类型
pub type Result<T> = std::result::Result<T, DiscoveryError>;
