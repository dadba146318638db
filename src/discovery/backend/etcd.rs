//! etcd 协调存储后端

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType, GetOptions, LockOptions, PutOptions,
    WatchOptions,
};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    CoordinationStore, EventKind, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId,
    LockGuard, Snapshot, WatchEvent, WatchStream,
};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, ErrorCode, Result};

/// 锁会话租约的 TTL（秒），持锁进程崩溃后锁最迟在这个时间后释放
const LOCK_SESSION_TTL: i64 = 10;

/// etcd 协调存储
///
/// `etcd_client::Client` 内部是可共享的 gRPC 连接，每次调用 clone 一份即可
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// 连接 etcd
    pub async fn connect(config: &DiscoveryConfig) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .with_timeout(Duration::from_millis(config.request_timeout_ms));

        let client = Client::connect(&config.endpoints, Some(options)).await?;

        Ok(Self { client })
    }

    /// 使用已有的客户端
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, prefix: &str) -> Result<Snapshot> {
        let resp = self
            .client()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| DiscoveryError::store(ErrorCode::StoreReadFailed, "get", e))?;

        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                mod_revision: kv.mod_revision(),
            })
            .collect();

        Ok(Snapshot { kvs, revision })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client()
            .put(key, value, options)
            .await
            .map_err(|e| DiscoveryError::store(ErrorCode::StoreWriteFailed, "put", e))?;
        Ok(())
    }

    async fn delete(&self, prefix: &str) -> Result<u64> {
        let resp = self
            .client()
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(|e| DiscoveryError::store(ErrorCode::StoreWriteFailed, "delete", e))?;
        Ok(resp.deleted().max(0) as u64)
    }

    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<WatchStream> {
        let mut options = WatchOptions::new().with_prefix();
        if let Some(revision) = from_revision {
            options = options.with_start_revision(revision);
        }

        let (watcher, stream) = self
            .client()
            .watch(prefix, Some(options))
            .await
            .map_err(|e| DiscoveryError::store(ErrorCode::WatchFailed, "watch", e))?;

        // watcher 必须和流一起存活，否则服务端会取消监听
        let stream = futures::stream::unfold(
            Some((watcher, stream)),
            |state| async move {
                let (watcher, mut stream) = state?;
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            warn!(
                                watch_id = resp.watch_id(),
                                compact_revision = resp.compact_revision(),
                                "Watch canceled by server"
                            );
                            if resp.compact_revision() > 0 {
                                let err = DiscoveryError::store(
                                    ErrorCode::WatchCompacted,
                                    "watch",
                                    format!("oldest available revision {}", resp.compact_revision()),
                                );
                                return Some((Err(err), None));
                            }
                            return None;
                        }
                        let events = resp
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let kv = event.kv()?;
                                let kind = match event.event_type() {
                                    EventType::Put => EventKind::Put,
                                    EventType::Delete => EventKind::Delete,
                                };
                                Some(WatchEvent {
                                    kind,
                                    key: String::from_utf8_lossy(kv.key()).into_owned(),
                                    value: kv.value().to_vec(),
                                    revision: kv.mod_revision(),
                                })
                            })
                            .collect();
                        Some((Ok(events), Some((watcher, stream))))
                    }
                    Ok(None) => None,
                    Err(e) => Some((
                        Err(DiscoveryError::store(ErrorCode::WatchFailed, "watch", e)),
                        None,
                    )),
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let resp = self
            .client()
            .lease_grant(ttl_secs, None)
            .await
            .map_err(|e| DiscoveryError::store(ErrorCode::LeaseGrantFailed, "lease_grant", e))?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let (keeper, stream) = self.client().lease_keep_alive(lease).await.map_err(|e| {
            DiscoveryError::store(ErrorCode::LeaseKeepAliveFailed, "lease_keep_alive", e)
        })?;

        // 首次续期拿到 TTL 后按 TTL/3 的间隔持续发送续期请求
        let stream = futures::stream::unfold(
            (keeper, stream, None::<Duration>),
            move |(mut keeper, mut stream, interval)| async move {
                if let Some(interval) = interval {
                    tokio::time::sleep(interval).await;
                }
                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease_id = lease, error = %e, "Lease keep-alive request failed");
                    return None;
                }
                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        debug!(lease_id = lease, ttl = resp.ttl(), "Lease keep-alive successful");
                        let next = Duration::from_millis((resp.ttl() as u64 * 1000 / 3).max(100));
                        let response = KeepAliveResponse {
                            lease: resp.id(),
                            ttl: resp.ttl(),
                        };
                        Some((response, (keeper, stream, Some(next))))
                    }
                    Ok(Some(_)) => {
                        warn!(lease_id = lease, "Lease expired on server");
                        None
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(lease_id = lease, error = %e, "Lease keep-alive stream error");
                        None
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.client()
            .lease_revoke(lease)
            .await
            .map_err(|e| DiscoveryError::store(ErrorCode::LeaseRevokeFailed, "lease_revoke", e))?;
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let mut client = self.client();
        let session = client
            .lease_grant(LOCK_SESSION_TTL, None)
            .await
            .map_err(|e| DiscoveryError::store(ErrorCode::LockFailed, "lock_session", e))?
            .id();

        let locked = tokio::time::timeout(
            timeout,
            client.lock(name, Some(LockOptions::new().with_lease(session))),
        )
        .await;

        let resp = match locked {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                let _ = client.lease_revoke(session).await;
                return Err(DiscoveryError::store(ErrorCode::LockFailed, "lock", e));
            }
            Err(_) => {
                // 撤销会话租约，服务端排队中的锁请求随之失效
                let _ = client.lease_revoke(session).await;
                return Err(DiscoveryError::lock_timeout(name, timeout));
            }
        };

        Ok(LockGuard {
            name: name.to_string(),
            key: resp.key().to_vec(),
            lease: Some(session),
        })
    }

    async fn release_lock(&self, guard: LockGuard) -> Result<()> {
        let mut client = self.client();
        let unlocked = client
            .unlock(guard.key.clone())
            .await
            .map_err(|e| DiscoveryError::store(ErrorCode::LockReleaseFailed, "unlock", e));

        if let Some(session) = guard.lease {
            if let Err(e) = client.lease_revoke(session).await {
                debug!(lock = %guard.name, error = %e, "Failed to revoke lock session lease");
            }
        }
        unlocked.map(|_| ())
    }
}
