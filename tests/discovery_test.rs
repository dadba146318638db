//! 注册、注册表与负载均衡的端到端测试（进程内存储）

use async_trait::async_trait;
use futures::StreamExt;
use ed_client::discovery::{
    CoordinationStore, KeepAliveStream, LeaseId, LockGuard, Snapshot, WatchStream,
};
use ed_client::{
    ErrorCode, LoadBalancer, MemoryStore, NodeInfo, NodeRegistry, Registrant, RegistrantState,
    RegistryChange,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "/test-discovery";
const SERVICE: &str = "/test/";

async fn next_change(rx: &mut async_broadcast::Receiver<RegistryChange>) -> RegistryChange {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no registry change within 5s")
        .expect("change channel closed")
}

async fn started_registry(store: &MemoryStore) -> NodeRegistry {
    let registry = NodeRegistry::new(Arc::new(store.clone()), NAMESPACE, SERVICE);
    registry.start(CancellationToken::new()).await.unwrap();
    registry
}

/// 测试：租约到期后节点从注册表消失
#[tokio::test]
async fn test_entry_removed_after_lease_expiry() {
    let store = MemoryStore::new();
    let registry = started_registry(&store).await;
    let mut changes = registry.subscribe();

    let node = NodeInfo::new("127.0.0.1:8081");
    let lease = store.grant_lease(1).await.unwrap();
    let key = format!("{}{}{}", NAMESPACE, SERVICE, lease);
    store.put(&key, node.encode().unwrap(), Some(lease)).await.unwrap();

    assert_eq!(
        next_change(&mut changes).await,
        RegistryChange::Added {
            key: key.clone(),
            node: node.clone(),
        }
    );
    assert_eq!(registry.get(&key).await, Some(node));

    // 没有续期，1 秒后租约过期
    assert_eq!(
        next_change(&mut changes).await,
        RegistryChange::Removed { key: key.clone() }
    );
    assert!(registry.is_empty().await);
}

/// 测试：注册后注册表中恰好有一个条目，注销后消失
#[tokio::test]
async fn test_register_and_quit_converge() {
    let store = MemoryStore::new();
    let registry = started_registry(&store).await;
    let mut changes = registry.subscribe();

    let node = NodeInfo::new("127.0.0.1:8081");
    let registrant = Registrant::new(Arc::new(store.clone()), NAMESPACE, SERVICE, node.clone(), 5);
    registrant.register(CancellationToken::new()).await.unwrap();

    let change = next_change(&mut changes).await;
    assert_eq!(Some(change.key().to_string()), registrant.key());
    let nodes = registry.current_nodes().await;
    assert_eq!(nodes.len(), 1);
    assert!(nodes.values().all(|value| *value == node));

    registrant.quit().await.unwrap();
    assert!(matches!(
        next_change(&mut changes).await,
        RegistryChange::Removed { .. }
    ));
    assert!(registry.is_empty().await);
}

/// 测试：三个并发调用各自拿到不同的节点
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn test_load_balancer_concurrent_callers() {
    let lb = Arc::new(LoadBalancer::new(vec![
        NodeInfo::new("127.0.0.1:8081"),
        NodeInfo::new("127.0.0.1:8082"),
        NodeInfo::new("127.0.0.1:8083"),
    ]));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let lb = lb.clone();
        handles.push(tokio::spawn(async move { lb.next().unwrap().address }));
    }

    let mut picked = HashSet::new();
    for handle in handles {
        picked.insert(handle.await.unwrap());
    }

    let expected: HashSet<String> = ["127.0.0.1:8081", "127.0.0.1:8082", "127.0.0.1:8083"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(picked, expected);
}

/// 测试：非法的值被跳过，合法条目照常跟踪
#[tokio::test]
async fn test_malformed_value_is_skipped() {
    let store = MemoryStore::new();
    let bad_key = format!("{}{}bad", NAMESPACE, SERVICE);
    store.put(&bad_key, b"\x00garbage".to_vec(), None).await.unwrap();

    let registry = started_registry(&store).await;
    assert!(registry.is_empty().await);
    let mut changes = registry.subscribe();

    store.put(&bad_key, b"{\"Server\":".to_vec(), None).await.unwrap();
    let good_key = format!("{}{}good", NAMESPACE, SERVICE);
    let node = NodeInfo::new("127.0.0.1:8082").with_tag("zone", "b");
    store.put(&good_key, node.encode().unwrap(), None).await.unwrap();

    assert_eq!(next_change(&mut changes).await.key(), good_key);
    let nodes = registry.current_nodes().await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes.get(&good_key), Some(&node));
    assert!(registry.is_running());
}

/// 测试：续期流被强制关闭后自动以新租约重新注册
#[tokio::test]
async fn test_lease_loss_reregisters() {
    let store = MemoryStore::new();
    let registry = started_registry(&store).await;
    let mut changes = registry.subscribe();

    let registrant = Registrant::new(
        Arc::new(store.clone()),
        NAMESPACE,
        SERVICE,
        NodeInfo::new("127.0.0.1:8081"),
        5,
    );
    registrant.register(CancellationToken::new()).await.unwrap();
    let old_key = registrant.key().unwrap();
    let old_lease = registrant.lease_id().unwrap();
    assert_eq!(next_change(&mut changes).await.key(), old_key);

    assert!(store.sever_keep_alive(old_lease));

    assert_eq!(
        next_change(&mut changes).await,
        RegistryChange::Removed {
            key: old_key.clone()
        }
    );
    let added = next_change(&mut changes).await;
    assert!(matches!(added, RegistryChange::Added { .. }));
    assert_ne!(added.key(), old_key);

    assert_eq!(registrant.state(), RegistrantState::Alive);
    assert_eq!(registrant.key().as_deref(), Some(added.key()));
    let keys: Vec<String> = registry.current_nodes().await.into_keys().collect();
    assert_eq!(keys, vec![added.key().to_string()]);

    registrant.quit().await.unwrap();
}

/// 在快照读取返回后、监听建立前写入一条数据的存储
struct RacingStore {
    inner: MemoryStore,
    injected: AtomicBool,
    key: String,
    value: Vec<u8>,
}

#[async_trait]
impl CoordinationStore for RacingStore {
    async fn get(&self, prefix: &str) -> ed_client::Result<Snapshot> {
        let snapshot = self.inner.get(prefix).await?;
        if !self.injected.swap(true, Ordering::SeqCst) {
            self.inner.put(&self.key, self.value.clone(), None).await?;
        }
        Ok(snapshot)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> ed_client::Result<()> {
        self.inner.put(key, value, lease).await
    }

    async fn delete(&self, prefix: &str) -> ed_client::Result<u64> {
        self.inner.delete(prefix).await
    }

    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> ed_client::Result<WatchStream> {
        self.inner.watch(prefix, from_revision).await
    }

    async fn grant_lease(&self, ttl_secs: i64) -> ed_client::Result<LeaseId> {
        self.inner.grant_lease(ttl_secs).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> ed_client::Result<KeepAliveStream> {
        self.inner.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> ed_client::Result<()> {
        self.inner.revoke_lease(lease).await
    }

    async fn acquire_lock(&self, name: &str, timeout: Duration) -> ed_client::Result<LockGuard> {
        self.inner.acquire_lock(name, timeout).await
    }

    async fn release_lock(&self, guard: LockGuard) -> ed_client::Result<()> {
        self.inner.release_lock(guard).await
    }
}

/// 测试：快照和监听之间写入的条目不会丢失
#[tokio::test]
async fn test_put_between_snapshot_and_watch_is_not_lost() {
    let inner = MemoryStore::new();
    let existing = NodeInfo::new("127.0.0.1:8081");
    let existing_key = format!("{}{}1", NAMESPACE, SERVICE);
    inner.put(&existing_key, existing.encode().unwrap(), None).await.unwrap();

    let racing = NodeInfo::new("127.0.0.1:8082");
    let racing_key = format!("{}{}2", NAMESPACE, SERVICE);
    let store = Arc::new(RacingStore {
        inner: inner.clone(),
        injected: AtomicBool::new(false),
        key: racing_key.clone(),
        value: racing.encode().unwrap(),
    });

    let registry = NodeRegistry::new(store, NAMESPACE, SERVICE);
    let mut changes = registry.subscribe();
    registry.start(CancellationToken::new()).await.unwrap();

    // 快照中的条目
    assert_eq!(next_change(&mut changes).await.key(), existing_key);
    // 监听回放的条目
    assert_eq!(next_change(&mut changes).await.key(), racing_key);

    let nodes = registry.current_nodes().await;
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes.get(&racing_key), Some(&racing));
}

/// 测试：负载均衡器从注册表刷新节点
#[tokio::test]
async fn test_load_balancer_refresh_from_registry() {
    let store = MemoryStore::new();
    let registry = started_registry(&store).await;
    let mut changes = registry.subscribe();
    let lb = LoadBalancer::from_registry(&registry).await;
    assert!(lb.next().is_none());

    for port in [8081u16, 8082] {
        let key = format!("{}{}{}", NAMESPACE, SERVICE, port);
        let node = NodeInfo::new(format!("127.0.0.1:{}", port));
        store.put(&key, node.encode().unwrap(), None).await.unwrap();
        next_change(&mut changes).await;
    }

    lb.refresh_from(&registry).await;
    let picked: HashSet<String> = (0..2).map(|_| lb.next().unwrap().address).collect();
    assert_eq!(picked.len(), 2);
}

/// 测试：注销后可以再次注册，旧任务不影响新的注册
#[tokio::test]
async fn test_register_quit_register_quit() {
    let store = MemoryStore::new();
    let registry = started_registry(&store).await;
    let mut changes = registry.subscribe();
    let registrant = Registrant::new(
        Arc::new(store.clone()),
        NAMESPACE,
        SERVICE,
        NodeInfo::new("127.0.0.1:8081"),
        5,
    );

    for _ in 0..2 {
        registrant.register(CancellationToken::new()).await.unwrap();
        let key = registrant.key().unwrap();
        assert_eq!(next_change(&mut changes).await.key(), key);

        registrant.quit().await.unwrap();
        assert_eq!(
            next_change(&mut changes).await,
            RegistryChange::Removed { key }
        );
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(registrant.state(), RegistrantState::Stopped);
    assert!(store.lease_ids().is_empty());
    assert!(registry.is_empty().await);
}

/// 前若干次监听返回的流只产生一个错误就结束的存储
struct FlakyWatchStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

#[async_trait]
impl CoordinationStore for FlakyWatchStore {
    async fn get(&self, prefix: &str) -> ed_client::Result<Snapshot> {
        self.inner.get(prefix).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> ed_client::Result<()> {
        self.inner.put(key, value, lease).await
    }

    async fn delete(&self, prefix: &str) -> ed_client::Result<u64> {
        self.inner.delete(prefix).await
    }

    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> ed_client::Result<WatchStream> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            let err = ed_client::DiscoveryError::store(ErrorCode::WatchFailed, "watch", "connection reset");
            return Ok(futures::stream::iter(vec![Err(err)]).boxed());
        }
        self.inner.watch(prefix, from_revision).await
    }

    async fn grant_lease(&self, ttl_secs: i64) -> ed_client::Result<LeaseId> {
        self.inner.grant_lease(ttl_secs).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> ed_client::Result<KeepAliveStream> {
        self.inner.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> ed_client::Result<()> {
        self.inner.revoke_lease(lease).await
    }

    async fn acquire_lock(&self, name: &str, timeout: Duration) -> ed_client::Result<LockGuard> {
        self.inner.acquire_lock(name, timeout).await
    }

    async fn release_lock(&self, guard: LockGuard) -> ed_client::Result<()> {
        self.inner.release_lock(guard).await
    }
}

/// 测试：监听流中断后注册表继续跟踪变化
#[tokio::test]
async fn test_registry_survives_watch_interruption() {
    let inner = MemoryStore::new();
    let store = Arc::new(FlakyWatchStore {
        inner: inner.clone(),
        failures: AtomicUsize::new(2),
    });

    let registry = NodeRegistry::new(store, NAMESPACE, SERVICE)
        .with_retry_interval(Duration::from_millis(100));
    let mut changes = registry.subscribe();
    let token = CancellationToken::new();
    registry.start(token.clone()).await.unwrap();

    let node = NodeInfo::new("127.0.0.1:8081");
    let key = format!("{}{}1", NAMESPACE, SERVICE);
    inner.put(&key, node.encode().unwrap(), None).await.unwrap();

    assert_eq!(
        next_change(&mut changes).await,
        RegistryChange::Added {
            key: key.clone(),
            node: node.clone(),
        }
    );
    assert!(!token.is_cancelled());
    assert!(registry.is_running());
    assert_eq!(registry.get(&key).await, Some(node));

    token.cancel();
    timeout(Duration::from_secs(2), async {
        while registry.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}
