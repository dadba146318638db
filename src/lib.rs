//! ed-client: etcd service discovery client
//!
//! Registers the current process under a renewed lease, keeps a watched local
//! view of every live node under a namespace, and round-robins over it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ed_client::{DiscoveryConfig, EtcdStore, LoadBalancer, NodeInfo};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> ed_client::Result<()> {
//! let config = DiscoveryConfig::new(vec!["http://127.0.0.1:2379".into()], "/ed-client", "/b/");
//! let store = Arc::new(EtcdStore::connect(&config).await?);
//! let token = CancellationToken::new();
//!
//! let registrant = config.registrant(store.clone(), NodeInfo::new("127.0.0.1:8081"));
//! registrant.register(token.clone()).await?;
//!
//! let registry = config.registry(store);
//! registry.start(token.clone()).await?;
//!
//! let lb = LoadBalancer::from_registry(&registry).await;
//! let target = lb.next();
//! # let _ = target;
//! registrant.quit().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod telemetry;

// Re-exports
pub use config::{DiscoveryConfig, LoggingConfig};
pub use discovery::{
    CoordinationStore, LoadBalancer, MemoryStore, NodeInfo, NodeRegistry, Registrant,
    RegistrantState, RegistryChange,
};
#[cfg(feature = "etcd")]
pub use discovery::EtcdStore;
pub use error::{DiscoveryError, ErrorCode, Result};
pub use telemetry::init_logging;
