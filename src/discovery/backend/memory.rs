//! 进程内协调存储
//!
//! 在单个进程内实现 [`CoordinationStore`] 的全部语义：全局递增版本号、
//! 可按版本回放的监听、会过期的租约以及按名字互斥的锁。
//! 用于测试和不需要跨进程协调的嵌入场景。
//!
//! 事件历史最多保留 [`DEFAULT_HISTORY_LIMIT`] 条（可调整），超出部分按版本压缩；
//! 从已压缩版本开始的监听会收到 [`ErrorCode::WatchCompacted`] 错误后结束。

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    CoordinationStore, EventKind, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId,
    LockGuard, Snapshot, WatchEvent, WatchStream,
};
use crate::error::{DiscoveryError, ErrorCode, Result};

/// 默认保留的事件历史条数
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// 进程内协调存储
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    revision: i64,
    kvs: BTreeMap<String, Entry>,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    /// 小于该版本的事件已被丢弃
    compact_revision: i64,
    watchers: Vec<Watcher>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    held: HashMap<Vec<u8>, OwnedMutexGuard<()>>,
    lock_seq: u64,
}

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
    mod_revision: i64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<Vec<WatchEvent>>>,
}

struct Lease {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
    /// 取消后当前所有续期流立即结束
    severed: CancellationToken,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn renew(&self, lease: LeaseId) -> Option<KeepAliveResponse> {
        let mut state = self.state();
        let entry = state.leases.get_mut(&lease)?;
        entry.deadline = Instant::now() + Duration::from_secs(entry.ttl as u64);
        Some(KeepAliveResponse {
            lease,
            ttl: entry.ttl,
        })
    }
}

impl State {
    fn next_revision(&mut self) -> i64 {
        self.revision += 1;
        self.revision
    }

    fn publish(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|watcher| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|event| event.key.starts_with(&watcher.prefix))
                .cloned()
                .collect();
            batch.is_empty() || watcher.tx.send(Ok(batch)).is_ok()
        });
        self.history.extend(events);
        self.trim_history();
    }

    fn trim_history(&mut self) {
        if self.history.len() <= self.history_limit {
            return;
        }
        let excess = self.history.len() - self.history_limit;
        if let Some(through) = self.history.get(excess - 1).map(|event| event.revision) {
            self.compact(through + 1);
        }
    }

    /// 丢弃版本小于 `revision` 的事件
    fn compact(&mut self, revision: i64) {
        let revision = revision.min(self.revision);
        if revision <= self.compact_revision {
            return;
        }
        while self
            .history
            .front()
            .is_some_and(|event| event.revision < revision)
        {
            self.history.pop_front();
        }
        self.compact_revision = revision;
    }

    fn remove_key(&mut self, key: &str, revision: i64) -> Option<WatchEvent> {
        let entry = self.kvs.remove(key)?;
        if let Some(lease) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        Some(WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: Vec::new(),
            revision,
        })
    }

    /// 删除租约及其绑定的全部 key，返回租约是否存在
    fn expire(&mut self, lease: LeaseId) -> bool {
        let Some(entry) = self.leases.remove(&lease) else {
            return false;
        };
        entry.severed.cancel();
        if entry.keys.is_empty() {
            return true;
        }
        let revision = self.next_revision();
        let events = entry
            .keys
            .iter()
            .filter_map(|key| self.remove_key(key, revision))
            .collect();
        self.publish(events);
        true
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// 创建空存储
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// 创建空存储，最多保留 `limit` 条事件历史
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    history_limit: limit.max(1),
                    ..State::default()
                }),
            }),
        }
    }

    /// 当前存储版本
    pub fn revision(&self) -> i64 {
        self.inner.state().revision
    }

    /// 最早仍可回放的版本
    pub fn compact_revision(&self) -> i64 {
        self.inner.state().compact_revision
    }

    /// 压缩事件历史：丢弃版本小于 `revision` 的事件（不超过当前版本）
    pub fn compact(&self, revision: i64) {
        self.inner.state().compact(revision);
    }

    /// 当前保留的事件条数
    pub fn history_len(&self) -> usize {
        self.inner.state().history.len()
    }

    /// 中断所有打开的监听（模拟连接断开）：每个监听流收到一个错误后结束
    ///
    /// 返回被中断的监听数量
    pub fn interrupt_watches(&self) -> usize {
        let watchers = std::mem::take(&mut self.inner.state().watchers);
        for watcher in &watchers {
            let _ = watcher.tx.send(Err(DiscoveryError::store(
                ErrorCode::WatchFailed,
                "watch",
                "watch interrupted",
            )));
        }
        watchers.len()
    }

    /// 租约是否仍然存活
    pub fn has_lease(&self, lease: LeaseId) -> bool {
        self.inner.state().leases.contains_key(&lease)
    }

    /// 所有存活的租约
    pub fn lease_ids(&self) -> Vec<LeaseId> {
        let mut ids: Vec<LeaseId> = self.inner.state().leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// 强制关闭某个租约当前所有的续期流（模拟连接断开），租约本身不受影响，
    /// 之后将按 TTL 正常过期
    ///
    /// 返回租约是否存在
    pub fn sever_keep_alive(&self, lease: LeaseId) -> bool {
        let mut state = self.inner.state();
        match state.leases.get_mut(&lease) {
            Some(entry) => {
                std::mem::replace(&mut entry.severed, CancellationToken::new()).cancel();
                true
            }
            None => false,
        }
    }

    fn spawn_reaper(&self, lease: LeaseId) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(inner) = weak.upgrade() else { return };
                    let state = inner.state();
                    match state.leases.get(&lease) {
                        Some(entry) => entry.deadline,
                        None => return,
                    }
                };

                tokio::time::sleep_until(deadline).await;

                let Some(inner) = weak.upgrade() else { return };
                let mut state = inner.state();
                let expired = match state.leases.get(&lease) {
                    Some(entry) => entry.deadline <= Instant::now(),
                    None => return,
                };
                if expired {
                    state.expire(lease);
                    debug!(lease_id = lease, "Lease expired");
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, prefix: &str) -> Result<Snapshot> {
        let state = self.inner.state();
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
                mod_revision: entry.mod_revision,
            })
            .collect();
        Ok(Snapshot {
            kvs,
            revision: state.revision,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        let mut state = self.inner.state();
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(DiscoveryError::store(
                    ErrorCode::LeaseNotFound,
                    "put",
                    format!("lease {} not found", id),
                ));
            }
        }

        let revision = state.next_revision();
        let previous = state.kvs.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
                mod_revision: revision,
            },
        );
        if let Some(old) = previous.and_then(|entry| entry.lease) {
            if Some(old) != lease {
                if let Some(entry) = state.leases.get_mut(&old) {
                    entry.keys.remove(key);
                }
            }
        }
        if let Some(entry) = lease.and_then(|id| state.leases.get_mut(&id)) {
            entry.keys.insert(key.to_string());
        }

        state.publish(vec![WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value,
            revision,
        }]);
        Ok(())
    }

    async fn delete(&self, prefix: &str) -> Result<u64> {
        let mut state = self.inner.state();
        let keys: Vec<String> = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let revision = state.next_revision();
        let events: Vec<WatchEvent> = keys
            .iter()
            .filter_map(|key| state.remove_key(key, revision))
            .collect();
        let deleted = events.len() as u64;
        state.publish(events);
        Ok(deleted)
    }

    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state();

        if let Some(from) = from_revision {
            if from < state.compact_revision {
                let _ = tx.send(Err(DiscoveryError::store(
                    ErrorCode::WatchCompacted,
                    "watch",
                    format!(
                        "revision {} compacted, oldest available {}",
                        from, state.compact_revision
                    ),
                )));
                return Ok(UnboundedReceiverStream::new(rx).boxed());
            }

            let mut batch: Vec<WatchEvent> = Vec::new();
            for event in state
                .history
                .iter()
                .filter(|event| event.revision >= from && event.key.starts_with(prefix))
            {
                if batch.last().is_some_and(|last| last.revision != event.revision) {
                    let _ = tx.send(Ok(std::mem::take(&mut batch)));
                }
                batch.push(event.clone());
            }
            if !batch.is_empty() {
                let _ = tx.send(Ok(batch));
            }
        }

        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(DiscoveryError::store(
                ErrorCode::LeaseGrantFailed,
                "lease_grant",
                format!("invalid ttl {}", ttl_secs),
            ));
        }

        let lease = {
            let mut state = self.inner.state();
            state.next_lease += 1;
            let lease = state.next_lease;
            state.leases.insert(
                lease,
                Lease {
                    ttl: ttl_secs,
                    deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                    keys: BTreeSet::new(),
                    severed: CancellationToken::new(),
                },
            );
            lease
        };
        self.spawn_reaper(lease);
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let (ttl, severed) = {
            let state = self.inner.state();
            let entry = state.leases.get(&lease).ok_or_else(|| {
                DiscoveryError::store(
                    ErrorCode::LeaseNotFound,
                    "lease_keep_alive",
                    format!("lease {} not found", lease),
                )
            })?;
            (entry.ttl, entry.severed.child_token())
        };

        let interval = Duration::from_millis((ttl as u64 * 1000 / 3).max(100));
        let weak = Arc::downgrade(&self.inner);
        let stream = futures::stream::unfold(true, move |first| {
            let weak = weak.clone();
            let severed = severed.clone();
            async move {
                if !first {
                    tokio::select! {
                        _ = severed.cancelled() => return None,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                if severed.is_cancelled() {
                    return None;
                }
                let response = weak.upgrade()?.renew(lease)?;
                Some((response, false))
            }
        });
        Ok(stream.boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        if self.inner.state().expire(lease) {
            Ok(())
        } else {
            Err(DiscoveryError::store(
                ErrorCode::LeaseNotFound,
                "lease_revoke",
                format!("lease {} not found", lease),
            ))
        }
    }

    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let mutex = {
            let mut state = self.inner.state();
            state
                .locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let owned = tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .map_err(|_| DiscoveryError::lock_timeout(name, timeout))?;

        let mut state = self.inner.state();
        state.lock_seq += 1;
        let key = format!("{}/{:x}", name, state.lock_seq).into_bytes();
        state.held.insert(key.clone(), owned);
        Ok(LockGuard {
            name: name.to_string(),
            key,
            lease: None,
        })
    }

    async fn release_lock(&self, guard: LockGuard) -> Result<()> {
        match self.inner.state().held.remove(&guard.key) {
            Some(_) => Ok(()),
            None => Err(DiscoveryError::store(
                ErrorCode::LockReleaseFailed,
                "unlock",
                format!("lock {} is not held", guard.name),
            )),
        }
    }
}
