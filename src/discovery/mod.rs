//! 服务注册发现模块
//!
//! - [`Registrant`]：在租约下发布本节点并自动续期、失效后自动重新注册
//! - [`NodeRegistry`]：快照 + 监听维护命名空间下的节点缓存
//! - [`LoadBalancer`]：在节点快照上做轮询选择
//!
//! key 布局：节点写在 `namespace + service_name + lease_id`，
//! 注册表按 `namespace + service_name` 前缀读取，两者共用
//! `/lock + namespace + service_name` 这把分布式锁。

pub mod backend;
pub mod instance;
pub mod load_balancer;
pub mod registrant;
pub mod registry;

use std::time::Duration;

pub use backend::{
    CoordinationStore, EventKind, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId,
    LockGuard, MemoryStore, Snapshot, WatchEvent, WatchStream,
};
#[cfg(feature = "etcd")]
pub use backend::EtcdStore;
pub use instance::NodeInfo;
pub use load_balancer::LoadBalancer;
pub use registrant::{Registrant, RegistrantState};
pub use registry::{NodeRegistry, RegistryChange};

/// 获取命名空间锁的默认超时时间
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// 租约丢失后重新注册的默认间隔
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// 命名空间锁的 key
pub fn lock_key(namespace: &str, service_name: &str) -> String {
    format!("/lock{}{}", namespace, service_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_layout() {
        assert_eq!(lock_key("/ed-client", "/b/"), "/lock/ed-client/b/");
    }
}
