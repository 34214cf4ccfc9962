//! # stateplane
//!
//! Member identity and volume ownership for stateful services running on
//! container schedulers:
//! - Idempotent service creation (devices, volumes, configs, static IPs, members)
//! - Versioned, immutable config files
//! - Per-node idle member selection with locality preference
//! - Volume and static IP handoff between nodes
//! - Compare-and-swap metadata as the only cross-node lock
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Orchestrator (manage)             │
//! │  CreateService / DeleteService           │
//! │   - devices, volumes, configs, IPs       │
//! └───────────┬──────────────────────────────┘
//!             │ create-if-absent / CAS
//!   ┌─────────▼──────────┐
//!   │   Metadata store   │  (RocksDB or in-memory)
//!   └─────────▲──────────┘
//!             │ CAS on ServiceMember
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌──▼───────────┐
//! │ Agent      │   │ Agent      │   │ Agent        │
//! │ node A     │   │ node B     │   │ node C       │
//! │ mount/umnt │   │ mount/umnt │   │ mount/umnt   │
//! └────────────┘   └────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use stateplane::manage::{CreateServiceRequest, ServiceManager};
//! use stateplane::metadata::RocksStore;
//! use stateplane::platform::{MemDns, MemNetwork, MemVolumes};
//!
//! # async fn run(req: CreateServiceRequest) -> stateplane::Result<()> {
//! let config = stateplane::Config::load()?;
//! let store = Arc::new(RocksStore::open("./stateplane-meta")?);
//! let manager = ServiceManager::new(
//!     store,
//!     Arc::new(MemVolumes::new()),
//!     Arc::new(MemNetwork::new()),
//!     Arc::new(MemDns::new()),
//!     config.manage,
//! );
//! let _uuid = manager.create_service(&req).await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::result_large_err)]

pub mod agent;
pub mod common;
pub mod manage;
pub mod metadata;
pub mod platform;

// Re-export commonly used types
pub use agent::VolumeAgent;
pub use common::{Config, Error, Result};
pub use manage::ServiceManager;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
