//! 节点注册表
//!
//! 维护某个命名空间下 key -> [`NodeInfo`] 的本地缓存：
//! 1. 持有命名空间锁做一次前缀快照读取；
//! 2. 释放锁后从快照版本 + 1 开始监听，保证快照和监听之间不丢事件；
//! 3. 后台任务按顺序应用 Put / Delete 事件，直到取消令牌被触发。
//!
//! 监听流出错或被存储端关闭时，后台任务在重试间隔后从最后应用的版本 + 1 重新监听；
//! 起始版本已被压缩时重新做一次快照并与缓存对齐。取消令牌是任务唯一的退出方式。

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{CoordinationStore, EventKind, KeyValue, WatchEvent, WatchStream};
use super::instance::NodeInfo;
use super::{DEFAULT_LOCK_TIMEOUT, DEFAULT_RETRY_INTERVAL, lock_key};
use crate::error::{DiscoveryError, ErrorCode, Result};

/// 变更通知通道容量，订阅者落后时丢弃最旧的通知
const CHANGE_CAPACITY: usize = 256;

/// 注册表变更通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    /// 新增或更新
    Added { key: String, node: NodeInfo },
    /// 删除
    Removed { key: String },
}

impl RegistryChange {
    pub fn key(&self) -> &str {
        match self {
            RegistryChange::Added { key, .. } | RegistryChange::Removed { key } => key,
        }
    }
}

struct Shared {
    nodes: RwLock<HashMap<String, NodeInfo>>,
    changes: Sender<RegistryChange>,
    // 保持通道打开，没有订阅者时通知直接丢弃
    idle: InactiveReceiver<RegistryChange>,
}

impl Shared {
    fn notify(&self, change: RegistryChange) {
        let _ = self.changes.try_broadcast(change);
    }

    async fn upsert(&self, key: String, value: &[u8]) {
        let node = match NodeInfo::decode(value) {
            Ok(node) => node,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping undecodable node value");
                return;
            }
        };

        self.nodes.write().await.insert(key.clone(), node.clone());
        debug!(key = %key, address = %node.address, "Node added");
        self.notify(RegistryChange::Added { key, node });
    }

    async fn remove(&self, key: String) {
        let removed = self.nodes.write().await.remove(&key);
        if removed.is_some() {
            debug!(key = %key, "Node removed");
            self.notify(RegistryChange::Removed { key });
        }
    }

    async fn apply(&self, events: Vec<WatchEvent>) {
        for event in events {
            match event.kind {
                EventKind::Put => self.upsert(event.key, &event.value).await,
                EventKind::Delete => self.remove(event.key).await,
            }
        }
    }

    /// 用快照替换整个缓存，只通知实际发生变化的 key
    async fn reconcile(&self, snapshot: HashMap<String, NodeInfo>) {
        let changes = {
            let mut nodes = self.nodes.write().await;
            let mut changes: Vec<RegistryChange> = nodes
                .keys()
                .filter(|key| !snapshot.contains_key(*key))
                .map(|key| RegistryChange::Removed { key: key.clone() })
                .collect();
            changes.extend(
                snapshot
                    .iter()
                    .filter(|(key, node)| nodes.get(*key) != Some(*node))
                    .map(|(key, node)| RegistryChange::Added {
                        key: key.clone(),
                        node: node.clone(),
                    }),
            );
            *nodes = snapshot;
            changes
        };

        for change in changes {
            self.notify(change);
        }
    }
}

/// 解码快照，跳过无法解码的值
fn decode_snapshot(kvs: Vec<KeyValue>) -> HashMap<String, NodeInfo> {
    kvs.into_iter()
        .filter_map(|kv| match NodeInfo::decode(&kv.value) {
            Ok(node) => Some((kv.key, node)),
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Skipping undecodable node value");
                None
            }
        })
        .collect()
}

/// 注册表访问存储所需的参数
#[derive(Clone)]
struct Source {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    lock_key: String,
    lock_timeout: Duration,
}

impl Source {
    /// 持锁读取快照，返回解码后的节点和快照版本
    async fn snapshot(&self) -> Result<(HashMap<String, NodeInfo>, i64)> {
        let guard = self
            .store
            .acquire_lock(&self.lock_key, self.lock_timeout)
            .await?;

        let snapshot = match self.store.get(&self.prefix).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if let Err(unlock_err) = self.store.release_lock(guard).await {
                    warn!(lock = %self.lock_key, error = %unlock_err, "Failed to release lock");
                }
                return Err(e);
            }
        };

        self.store.release_lock(guard).await?;
        let count = snapshot.kvs.len();
        debug!(prefix = %self.prefix, revision = snapshot.revision, count, "Registry snapshot loaded");
        Ok((decode_snapshot(snapshot.kvs), snapshot.revision))
    }

    /// 快照之后从快照版本 + 1 开始监听
    async fn snapshot_and_watch(&self) -> Result<(HashMap<String, NodeInfo>, i64, WatchStream)> {
        let (nodes, revision) = self.snapshot().await?;
        let stream = self.store.watch(&self.prefix, Some(revision + 1)).await?;
        Ok((nodes, revision, stream))
    }
}

/// 节点注册表
pub struct NodeRegistry {
    source: Source,
    retry_interval: Duration,
    shared: Arc<Shared>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeRegistry {
    /// 创建注册表，监听 `namespace + service_name` 前缀
    pub fn new(store: Arc<dyn CoordinationStore>, namespace: &str, service_name: &str) -> Self {
        let (mut changes, idle) = async_broadcast::broadcast(CHANGE_CAPACITY);
        changes.set_overflow(true);
        changes.set_await_active(false);

        Self {
            source: Source {
                store,
                prefix: format!("{}{}", namespace, service_name),
                lock_key: lock_key(namespace, service_name),
                lock_timeout: DEFAULT_LOCK_TIMEOUT,
            },
            retry_interval: DEFAULT_RETRY_INTERVAL,
            shared: Arc::new(Shared {
                nodes: RwLock::new(HashMap::new()),
                changes,
                idle: idle.deactivate(),
            }),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// 设置获取命名空间锁的超时时间
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.source.lock_timeout = timeout;
        self
    }

    /// 设置监听中断后重新监听的间隔
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// 监听的 key 前缀
    pub fn prefix(&self) -> &str {
        &self.source.prefix
    }

    /// 启动注册表
    ///
    /// 快照读取成功并建立监听后返回；后台任务只在 `token` 取消时退出。
    /// 任何一步失败都会返回错误，缓存保持为空，也不会发出变更通知
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::AlreadyStarted(self.source.prefix.clone()));
        }

        let (nodes, revision, stream) = match self.source.snapshot_and_watch().await {
            Ok(primed) => primed,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.shared.reconcile(nodes).await;

        let watch = WatchLoop {
            source: self.source.clone(),
            shared: self.shared.clone(),
            retry_interval: self.retry_interval,
            token,
        };
        let handle = tokio::spawn(watch.run(stream, revision));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(prefix = %self.source.prefix, revision, "Node registry started");
        Ok(())
    }

    /// 当前缓存的全部节点
    pub async fn current_nodes(&self) -> HashMap<String, NodeInfo> {
        self.shared.nodes.read().await.clone()
    }

    /// 按 key 获取节点
    pub async fn get(&self, key: &str) -> Option<NodeInfo> {
        self.shared.nodes.read().await.get(key).cloned()
    }

    /// 按 key 排序的节点列表
    pub async fn node_list(&self) -> Vec<NodeInfo> {
        let nodes = self.shared.nodes.read().await;
        let mut entries: Vec<(&String, &NodeInfo)> = nodes.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, node)| node.clone()).collect()
    }

    /// 按标签过滤节点
    pub async fn filter_by_tags(&self, filters: &HashMap<String, String>) -> Vec<NodeInfo> {
        self.shared
            .nodes
            .read()
            .await
            .values()
            .filter(|node| node.matches_tags(filters))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.shared.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.shared.nodes.read().await.is_empty()
    }

    /// 订阅变更通知
    ///
    /// 每次缓存新增或删除一个节点都会发送一条通知，通知在缓存更新后发出
    pub fn subscribe(&self) -> Receiver<RegistryChange> {
        self.shared.idle.activate_cloned()
    }

    /// 后台监听任务是否仍在运行
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for NodeRegistry {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = task {
            handle.abort();
        }
    }
}

/// 后台监听任务
struct WatchLoop {
    source: Source,
    shared: Arc<Shared>,
    retry_interval: Duration,
    token: CancellationToken,
}

impl WatchLoop {
    /// `revision` 是缓存已经反映到的存储版本
    async fn run(self, mut stream: WatchStream, mut revision: i64) {
        let prefix = self.source.prefix.clone();
        loop {
            let compacted = loop {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        info!(prefix = %prefix, "Node registry stopped");
                        return;
                    }
                    batch = stream.next() => match batch {
                        Some(Ok(events)) => {
                            if let Some(last) = events.iter().map(|event| event.revision).max() {
                                revision = revision.max(last);
                            }
                            self.shared.apply(events).await;
                        }
                        Some(Err(e)) => {
                            warn!(prefix = %prefix, revision, error = %e, "Watch stream error");
                            break e.code() == ErrorCode::WatchCompacted;
                        }
                        None => {
                            warn!(prefix = %prefix, revision, "Watch stream closed by store");
                            break false;
                        }
                    }
                }
            };

            match self.reopen(compacted, revision).await {
                Some((next, resumed_at)) => {
                    stream = next;
                    revision = resumed_at;
                }
                None => {
                    info!(prefix = %prefix, "Node registry stopped");
                    return;
                }
            }
        }
    }

    /// 按重试间隔重新建立监听；需要时先重新做快照。令牌取消时返回 None
    async fn reopen(&self, mut resync: bool, revision: i64) -> Option<(WatchStream, i64)> {
        let prefix = &self.source.prefix;
        let mut attempt: u32 = 0;
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }

            attempt += 1;
            let opened = if resync {
                match self.source.snapshot_and_watch().await {
                    Ok((nodes, snapshot_revision, stream)) => {
                        self.shared.reconcile(nodes).await;
                        Ok((stream, snapshot_revision))
                    }
                    Err(e) => Err(e),
                }
            } else {
                self.source
                    .store
                    .watch(prefix, Some(revision + 1))
                    .await
                    .map(|stream| (stream, revision))
            };

            match opened {
                Ok((stream, resumed_at)) => {
                    info!(prefix = %prefix, revision = resumed_at, resync, attempt, "Watch resumed");
                    return Some((stream, resumed_at));
                }
                Err(e) => {
                    warn!(prefix = %prefix, attempt, error = %e, "Failed to resume watch");
                    if e.code() == ErrorCode::WatchCompacted {
                        resync = true;
                    }
                }
            }
        }
    }
}
