//! 协调存储后端抽象和实现

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::Result;

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// 租约 ID
pub type LeaseId = i64;

/// 存储中的一条键值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// 最后一次修改时的存储版本
    pub mod_revision: i64,
}

/// 前缀读取的结果
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// 按 key 排序的键值列表
    pub kvs: Vec<KeyValue>,
    /// 读取时刻的存储版本，监听应从 `revision + 1` 开始
    pub revision: i64,
}

/// 监听事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// 监听事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Delete 事件的 value 为空
    pub value: Vec<u8>,
    pub revision: i64,
}

/// 租约续期响应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub lease: LeaseId,
    /// 续期后剩余的 TTL（秒）
    pub ttl: i64,
}

/// 持有中的分布式锁
///
/// 由 [`CoordinationStore::acquire_lock`] 返回，交还给 [`CoordinationStore::release_lock`] 释放
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    /// 锁名
    pub name: String,
    /// 后端返回的锁所有权 key
    pub key: Vec<u8>,
    /// 锁绑定的会话租约
    pub lease: Option<LeaseId>,
}

/// 监听事件流，每一项是存储一次推送的一批事件
pub type WatchStream = BoxStream<'static, Result<Vec<WatchEvent>>>;

/// 租约续期响应流，租约丢失时结束
pub type KeepAliveStream = BoxStream<'static, KeepAliveResponse>;

/// 协调存储 trait
///
/// 注册表和注册者只通过这个 trait 访问存储（etcd 或进程内实现）。
/// 由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// 前缀读取
    async fn get(&self, prefix: &str) -> Result<Snapshot>;

    /// 写入，可选绑定租约
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()>;

    /// 前缀删除，返回删除的 key 数量
    async fn delete(&self, prefix: &str) -> Result<u64>;

    /// 前缀监听
    ///
    /// `from_revision` 为 `Some(rev)` 时从该版本（含）开始回放事件，否则从当前时刻开始
    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<WatchStream>;

    /// 申请租约
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// 租约续期
    ///
    /// 返回的流在租约过期、被撤销或连接断开时结束
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// 撤销租约
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// 获取分布式锁，超过 `timeout` 返回 [`crate::DiscoveryError::LockTimeout`]
    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockGuard>;

    /// 释放分布式锁
    async fn release_lock(&self, guard: LockGuard) -> Result<()>;
}
