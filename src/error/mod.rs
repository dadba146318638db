//! 服务发现错误处理模块
//!
//! 提供统一的错误类型、错误代码分类和错误转换

pub mod code;
pub mod conversions;
pub mod discovery_error;

// 重新导出公共类型
pub use code::ErrorCode;
pub use discovery_error::{DiscoveryError, Result};

/// 基础设施层默认使用的结果类型
pub type InfraResult<T> = anyhow::Result<T>;
