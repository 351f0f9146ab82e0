//! # session-cache
//!
//! Resilient cache-aside session validation in front of a system-of-record.
//!
//! ## Features
//!
//! - **Cache-aside validation:** [`SessionCache::validate`] answers from the
//!   cache when it can and from the system-of-record when it must
//! - **Strictly best-effort cache:** cache-layer failures are counted and
//!   logged, never surfaced to callers
//! - **Bounded connection pool** with acquire timeouts, liveness probes and
//!   idle reaping
//! - **Circuit breaker** over a rolling error window with a single
//!   half-open probe
//! - **Startup warming** in paced batches under a hard timeout
//! - **Hotkey detection** with bounded memory
//! - **Health snapshot** for monitoring endpoints
//!
//! ## Quick Start
//!
//! ```ignore
//! use session_cache::prelude::*;
//! use std::sync::Arc;
//!
//! let config = SessionCacheConfig::from_env();
//! let manager = InMemoryManager::new(InMemoryStore::new());
//! let sessions = SessionCache::connect(manager, Arc::new(my_repository), &config).await?;
//!
//! // warm in the background, serve traffic right away
//! let warmer = CacheWarmer::new(sessions.clone(), config.warmer.clone());
//! let job = warmer.warm(None, false).await;
//!
//! let health = HealthReporter::new(sessions.client().clone())
//!     .with_warming(Arc::clone(warmer.progress()));
//!
//! if let Some(session) = sessions.validate(token).await? {
//!     // authenticated as session.user_id
//! }
//! ```
//!
//! With the `redis` feature, swap `InMemoryManager` for
//! [`backend::RedisManager`].

#[macro_use]
extern crate log;

pub mod backend;
pub mod breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod hotkey;
pub mod key;
pub mod observability;
pub mod pool;
pub mod repository;
pub mod service;
pub mod session;
pub mod warmer;

mod window;

// Re-exports for convenience
pub use backend::CacheConnection;
pub use breaker::{CircuitBreaker, CircuitState};
pub use client::CacheClient;
pub use config::SessionCacheConfig;
pub use error::{Error, Result};
pub use health::{HealthReporter, HealthSnapshot};
pub use hotkey::HotkeyDetector;
pub use pool::{ManageConnection, Pool};
pub use repository::SessionRepository;
pub use service::SessionCache;
pub use session::{hash_token, SessionRecord};
pub use warmer::{CacheWarmer, WarmingResult, WarmingStatus};

/// Everything needed to wire a session cache.
pub mod prelude {
    #[cfg(feature = "inmemory")]
    pub use crate::backend::{InMemoryManager, InMemoryStore};
    #[cfg(feature = "redis")]
    pub use crate::backend::{RedisConfig, RedisManager, TlsMode};
    pub use crate::config::{
        BreakerConfig, HotkeyConfig, PoolConfig, SessionCacheConfig, WarmerConfig,
    };
    pub use crate::observability::CacheMetrics;
    pub use crate::repository::InMemorySessionRepository;
    pub use crate::{
        CacheClient, CacheConnection, CacheWarmer, CircuitBreaker, Error, HealthReporter,
        HotkeyDetector, ManageConnection, Pool, Result, SessionCache, SessionRecord,
        SessionRepository,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
