//! 错误代码定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 连接相关错误
/// - 2000-2999: 分布式锁相关错误
/// - 3000-3999: 租约相关错误
/// - 4000-4999: 存储读写与监听相关错误
/// - 6000-6999: 状态与配置相关错误
/// - 8000-8999: 序列化相关错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接相关错误 (1000-1999)
    // ============================================================
    ConnectionFailed = 1000,
    ConnectionTimeout = 1001,

    // ============================================================
    // 分布式锁相关错误 (2000-2999)
    // ============================================================
    LockTimeout = 2000,
    LockFailed = 2001,
    LockReleaseFailed = 2002,

    // ============================================================
    // 租约相关错误 (3000-3999)
    // ============================================================
    LeaseGrantFailed = 3000,
    LeaseRevokeFailed = 3001,
    LeaseKeepAliveFailed = 3002,
    LeaseNotFound = 3003,

    // ============================================================
    // 存储相关错误 (4000-4999)
    // ============================================================
    StoreReadFailed = 4000,
    StoreWriteFailed = 4001,
    WatchFailed = 4002,
    /// 监听的起始版本已被压缩
    WatchCompacted = 4003,

    // ============================================================
    // 状态与配置相关错误 (6000-6999)
    // ============================================================
    AlreadyStarted = 6000,
    AlreadyRegistered = 6001,
    NotRegistered = 6002,
    ConfigurationError = 6003,

    // ============================================================
    // 序列化相关错误 (8000-8999)
    // ============================================================
    SerializationError = 8000,
    DeserializationError = 8001,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::LockTimeout => "LOCK_TIMEOUT",
            ErrorCode::LockFailed => "LOCK_FAILED",
            ErrorCode::LockReleaseFailed => "LOCK_RELEASE_FAILED",
            ErrorCode::LeaseGrantFailed => "LEASE_GRANT_FAILED",
            ErrorCode::LeaseRevokeFailed => "LEASE_REVOKE_FAILED",
            ErrorCode::LeaseKeepAliveFailed => "LEASE_KEEP_ALIVE_FAILED",
            ErrorCode::LeaseNotFound => "LEASE_NOT_FOUND",
            ErrorCode::StoreReadFailed => "STORE_READ_FAILED",
            ErrorCode::StoreWriteFailed => "STORE_WRITE_FAILED",
            ErrorCode::WatchFailed => "WATCH_FAILED",
            ErrorCode::WatchCompacted => "WATCH_COMPACTED",
            ErrorCode::AlreadyStarted => "ALREADY_STARTED",
            ErrorCode::AlreadyRegistered => "ALREADY_REGISTERED",
            ErrorCode::NotRegistered => "NOT_REGISTERED",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::ConnectionTimeout
                | ErrorCode::LockTimeout
                | ErrorCode::LeaseGrantFailed
                | ErrorCode::StoreReadFailed
                | ErrorCode::StoreWriteFailed
                | ErrorCode::WatchFailed
        )
    }
}
