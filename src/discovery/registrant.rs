//! 节点注册者
//!
//! 在租约下发布本进程的 [`NodeInfo`]，并由单个后台任务负责续期与故障恢复：
//!
//! ```text
//!   Alive --keepalive 流结束--> LeaseLost --等待重试间隔--> Reregistering
//!     ^                                                        |
//!     +----------------------- 注册成功 -----------------------+
//!
//!   任意状态收到停止信号 --> Stopped
//! ```
//!
//! 重新注册失败时在同一个任务里按固定间隔重试，不会派生新的任务。
//! 每次注册有自己的代数（generation），已被注销的旧任务不会改动新注册的状态。

use futures::StreamExt;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backend::{CoordinationStore, KeepAliveStream, LeaseId};
use super::instance::NodeInfo;
use super::{DEFAULT_LOCK_TIMEOUT, DEFAULT_RETRY_INTERVAL, lock_key};
use crate::error::{DiscoveryError, Result};

/// 注册者状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrantState {
    /// 尚未注册
    Idle,
    /// 首次注册进行中
    Registering,
    /// 租约正常续期
    Alive,
    /// 续期流已结束，等待重新注册
    LeaseLost,
    /// 重新注册进行中
    Reregistering,
    /// 已停止
    Stopped,
}

impl fmt::Display for RegistrantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrantState::Idle => "idle",
            RegistrantState::Registering => "registering",
            RegistrantState::Alive => "alive",
            RegistrantState::LeaseLost => "lease_lost",
            RegistrantState::Reregistering => "reregistering",
            RegistrantState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct Session {
    /// 每次注册加一，续期任务只修改自己那一代的状态
    generation: u64,
    state: RegistrantState,
    /// 当前持有的租约；Quit 取走后由 Quit 负责撤销
    lease: Option<LeaseId>,
    stop: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

#[derive(Clone, Copy)]
struct Timing {
    lock_timeout: Duration,
    retry_interval: Duration,
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    lock_key: String,
    node: NodeInfo,
    ttl: i64,
    timing: Mutex<Timing>,
    session: Mutex<Session>,
}

/// 节点注册者
pub struct Registrant {
    inner: Arc<Inner>,
}

impl Registrant {
    /// 创建注册者，节点将发布在 `namespace + service_name + lease_id`
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: &str,
        service_name: &str,
        node: NodeInfo,
        ttl: i64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                prefix: format!("{}{}", namespace, service_name),
                lock_key: lock_key(namespace, service_name),
                node,
                ttl,
                timing: Mutex::new(Timing {
                    lock_timeout: DEFAULT_LOCK_TIMEOUT,
                    retry_interval: DEFAULT_RETRY_INTERVAL,
                }),
                session: Mutex::new(Session {
                    generation: 0,
                    state: RegistrantState::Idle,
                    lease: None,
                    stop: None,
                    task: None,
                }),
            }),
        }
    }

    /// 设置获取命名空间锁的超时时间，从下一次获取锁开始生效
    pub fn with_lock_timeout(self, timeout: Duration) -> Self {
        self.inner.timing().lock_timeout = timeout;
        self
    }

    /// 设置租约丢失后重新注册的间隔，从下一次重试开始生效
    pub fn with_retry_interval(self, interval: Duration) -> Self {
        self.inner.timing().retry_interval = interval;
        self
    }

    /// 注册节点
    ///
    /// 发布成功后启动续期任务。`token` 被取消时续期任务撤销租约并退出
    pub async fn register(&self, token: CancellationToken) -> Result<()> {
        let (generation, previous) = {
            let mut session = self.inner.session();
            if !matches!(
                session.state,
                RegistrantState::Idle | RegistrantState::Stopped
            ) {
                return Err(DiscoveryError::AlreadyRegistered(self.inner.prefix.clone()));
            }
            let previous = session.state;
            session.generation += 1;
            session.state = RegistrantState::Registering;
            (session.generation, previous)
        };

        let (lease, keepalive) = match self.inner.publish().await {
            Ok(published) => published,
            Err(e) => {
                self.inner.session().state = previous;
                return Err(e);
            }
        };

        let stop = token.child_token();
        let mut session = self.inner.session();
        session.state = RegistrantState::Alive;
        session.lease = Some(lease);
        session.stop = Some(stop.clone());
        session.task = Some(tokio::spawn(supervise(
            self.inner.clone(),
            generation,
            lease,
            keepalive,
            stop,
        )));
        info!(key = %self.inner.key_for(lease), lease_id = lease, "Node registered");
        Ok(())
    }

    /// 注销节点：撤销租约并停止续期任务
    ///
    /// 撤销失败时返回错误，但停止信号始终会发出
    pub async fn quit(&self) -> Result<()> {
        let (lease, stop) = {
            let mut session = self.inner.session();
            let Some(stop) = session.stop.take() else {
                return Err(DiscoveryError::NotRegistered(self.inner.prefix.clone()));
            };
            session.state = RegistrantState::Stopped;
            (session.lease.take(), stop)
        };

        // 先停任务，避免撤销导致的续期流结束被当成租约丢失
        stop.cancel();

        match lease {
            Some(lease) => {
                self.inner.store.revoke_lease(lease).await?;
                info!(key = %self.inner.key_for(lease), lease_id = lease, "Node unregistered");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// 当前状态
    pub fn state(&self) -> RegistrantState {
        self.inner.session().state
    }

    /// 当前租约 ID
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.inner.session().lease
    }

    /// 当前发布的 key
    pub fn key(&self) -> Option<String> {
        self.lease_id().map(|lease| self.inner.key_for(lease))
    }

    /// 发布的节点信息
    pub fn node(&self) -> &NodeInfo {
        &self.inner.node
    }
}

impl Drop for Registrant {
    fn drop(&mut self) {
        let mut session = self.inner.session();
        if let Some(stop) = session.stop.take() {
            stop.cancel();
        }
        session.task.take();
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_for(&self, lease: LeaseId) -> String {
        format!("{}{}", self.prefix, lease)
    }

    fn set_state(&self, generation: u64, state: RegistrantState) {
        let mut session = self.session();
        if session.generation == generation {
            session.state = state;
        }
    }

    /// 持锁申请租约并写入节点信息，随后建立续期流
    async fn publish(&self) -> Result<(LeaseId, KeepAliveStream)> {
        let lock_timeout = self.timing().lock_timeout;
        let guard = self
            .store
            .acquire_lock(&self.lock_key, lock_timeout)
            .await?;
        let published = self.grant_and_put().await;
        if let Err(e) = self.store.release_lock(guard).await {
            warn!(lock = %self.lock_key, error = %e, "Failed to release lock");
        }
        let lease = published?;

        match self.store.keep_alive(lease).await {
            Ok(keepalive) => Ok((lease, keepalive)),
            Err(e) => {
                self.revoke_quietly(lease).await;
                Err(e)
            }
        }
    }

    async fn grant_and_put(&self) -> Result<LeaseId> {
        let value = self.node.encode()?;
        let lease = self.store.grant_lease(self.ttl).await?;
        if let Err(e) = self.store.put(&self.key_for(lease), value, Some(lease)).await {
            self.revoke_quietly(lease).await;
            return Err(e);
        }
        Ok(lease)
    }

    async fn revoke_quietly(&self, lease: LeaseId) {
        if let Err(e) = self.store.revoke_lease(lease).await {
            debug!(lease_id = lease, error = %e, "Revoke of lost lease failed");
        }
    }

    /// 续期任务收到停止信号时调用：如果租约还没被 Quit 取走，由任务负责撤销。
    /// 会话已经属于更新的注册时不做任何修改
    async fn stop_from_task(&self, generation: u64, lease: LeaseId) {
        let owned = {
            let mut session = self.session();
            if session.generation != generation {
                debug!(prefix = %self.prefix, generation, "Superseded registrant task stopped");
                return;
            }
            session.state = RegistrantState::Stopped;
            session.stop = None;
            if session.lease == Some(lease) {
                session.lease.take()
            } else {
                None
            }
        };
        if let Some(lease) = owned {
            self.revoke_quietly(lease).await;
        }
        info!(prefix = %self.prefix, lease_id = lease, "Registrant stopped");
    }

    /// 新租约生效；如果期间已被 Quit 取走状态则返回 false
    fn adopt_lease(&self, generation: u64, lease: LeaseId, stop: &CancellationToken) -> bool {
        let mut session = self.session();
        if stop.is_cancelled() || session.generation != generation {
            return false;
        }
        session.state = RegistrantState::Alive;
        session.lease = Some(lease);
        true
    }
}

async fn supervise(
    inner: Arc<Inner>,
    generation: u64,
    mut lease: LeaseId,
    mut keepalive: KeepAliveStream,
    stop: CancellationToken,
) {
    loop {
        // Alive
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    inner.stop_from_task(generation, lease).await;
                    return;
                }
                response = keepalive.next() => match response {
                    Some(response) => {
                        debug!(lease_id = response.lease, ttl = response.ttl, "Lease renewed");
                    }
                    None => break,
                }
            }
        }
        if stop.is_cancelled() {
            inner.stop_from_task(generation, lease).await;
            return;
        }

        // LeaseLost
        warn!(key = %inner.key_for(lease), lease_id = lease, "Lease keep-alive closed, re-registering");
        inner.set_state(generation, RegistrantState::LeaseLost);
        inner.revoke_quietly(lease).await;

        // Reregistering
        let mut attempt: u32 = 0;
        loop {
            let retry_interval = inner.timing().retry_interval;
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    inner.stop_from_task(generation, lease).await;
                    return;
                }
                _ = tokio::time::sleep(retry_interval) => {}
            }

            attempt += 1;
            inner.set_state(generation, RegistrantState::Reregistering);
            match inner.publish().await {
                Ok((new_lease, stream)) => {
                    if !inner.adopt_lease(generation, new_lease, &stop) {
                        inner.revoke_quietly(new_lease).await;
                        inner.stop_from_task(generation, lease).await;
                        return;
                    }
                    info!(
                        key = %inner.key_for(new_lease),
                        old_lease_id = lease,
                        lease_id = new_lease,
                        attempt,
                        "Node re-registered"
                    );
                    lease = new_lease;
                    keepalive = stream;
                    break;
                }
                Err(e) => {
                    error!(prefix = %inner.prefix, attempt, error = %e, "Re-registration failed");
                    inner.set_state(generation, RegistrantState::LeaseLost);
                }
            }
        }
    }
}
