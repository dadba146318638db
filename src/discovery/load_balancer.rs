//! 轮询负载均衡
//!
//! 节点列表以不可变快照（`Arc<[NodeInfo]>`）保存，替换时整体交换，
//! 选择时下标总是对同一份快照的长度取模，不会越界。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::instance::NodeInfo;
use super::registry::NodeRegistry;

/// 轮询负载均衡器
pub struct LoadBalancer {
    nodes: RwLock<Arc<[NodeInfo]>>,
    counter: AtomicUsize,
}

impl LoadBalancer {
    /// 从节点列表创建
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self {
            nodes: RwLock::new(nodes.into()),
            counter: AtomicUsize::new(0),
        }
    }

    /// 从 key -> 节点映射创建，按 key 排序
    pub fn from_map(nodes: &HashMap<String, NodeInfo>) -> Self {
        Self::new(sorted_by_key(nodes))
    }

    /// 从注册表当前缓存创建
    pub async fn from_registry(registry: &NodeRegistry) -> Self {
        Self::new(registry.node_list().await)
    }

    /// 轮询选择下一个节点，没有节点时返回 None
    pub fn next(&self) -> Option<NodeInfo> {
        let nodes = self.snapshot();
        if nodes.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len();
        nodes.get(index).cloned()
    }

    /// 替换节点列表
    pub fn replace_nodes(&self, nodes: Vec<NodeInfo>) {
        let nodes: Arc<[NodeInfo]> = nodes.into();
        *self.nodes.write().unwrap_or_else(PoisonError::into_inner) = nodes;
    }

    /// 用 key -> 节点映射替换节点列表
    pub fn replace_nodes_from_map(&self, nodes: &HashMap<String, NodeInfo>) {
        self.replace_nodes(sorted_by_key(nodes));
    }

    /// 用注册表当前缓存替换节点列表
    pub async fn refresh_from(&self, registry: &NodeRegistry) {
        self.replace_nodes(registry.node_list().await);
    }

    /// 当前节点快照
    pub fn snapshot(&self) -> Arc<[NodeInfo]> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn sorted_by_key(nodes: &HashMap<String, NodeInfo>) -> Vec<NodeInfo> {
    let mut entries: Vec<(&String, &NodeInfo)> = nodes.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().map(|(_, node)| node.clone()).collect()
}
