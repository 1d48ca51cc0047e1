//! slicesync Core Library
//!
//! Per-slice application state that behaves like a plain in-memory value
//! while being cached locally and mirrored to a remote per-user document
//! store. It survives restarts, multiple devices and offline periods without
//! the local and remote copies feeding each other an update loop.
//!
//! # Architecture
//!
//! - **Local cache**: synchronous, session-namespaced key-value store
//!   (SQLite or in-memory); the warm-start source for every unit
//! - **Remote store**: one JSON document per session and slice, written by
//!   merge and observed by subscription
//! - **Sync unit**: one per slice; owns the value, persists every change and
//!   sends debounced write-merges once the remote has answered
//! - **Session scope**: rebinds every unit on login, logout and account
//!   deletion
//!
//! # Quick Start
//!
//! ```text
//! let scope = SessionScope::from_config(&Config::load()?)?;
//! let dashboard = scope.unit(SliceKey::new("dashboard-config")?, DashboardConfig::default())?;
//!
//! scope.login(SessionId::new("u1")?)?;
//! dashboard.update(|config| config.low_threshold = 65);
//! ```
//!
//! # Modules
//!
//! - `sync`: sync unit and its state machine
//! - `session`: session scope and account deletion
//! - `cache`: local cache store
//! - `remote`: remote store trait, adapters and the document server
//! - `keys`: slice keys and session ids
//! - `slices`: the application's known slices
//! - `identity`: persisted logged-in session
//! - `config`: application configuration

pub mod cache;
pub mod config;
pub mod identity;
pub mod keys;
pub mod remote;
pub mod session;
pub mod slices;
pub mod sync;

pub use cache::{CacheError, LocalCache};
pub use config::Config;
pub use identity::Identity;
pub use keys::{KeyError, SessionId, SliceKey};
pub use remote::{MemoryRemote, RemoteError, RemoteEvent, RemoteStore, WsRemote};
pub use session::{DeletionReport, SessionBound, SessionScope};
pub use slices::DashboardConfig;
pub use sync::{Phase, SliceValue, SyncError, SyncUnit, UnitOptions};
