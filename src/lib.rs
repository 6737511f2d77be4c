//! Storage synchronization between a legacy add-on and its embedded WebExtension.
//!
//! During the migration both environments keep their own copy of the settings. A
//! [`SyncController`] on each side keeps the two copies equal:
//!
//! 1. On startup the sides exchange their `lastStorageChange` stamps.
//! 2. The side with the older stamp is overwritten with the full storage of the other.
//! 3. From then on every local change is relayed to the peer. If that fails, the next
//!    change sends the full storage instead.
//!
//! ```no_run
//! use storage_migration::{
//!     SyncConfig, SyncController, connection::memory::pair, storage::MemoryStorage,
//! };
//!
//! # async fn run() -> Result<(), storage_migration::defer::DeferredError> {
//! let (legacy_end, webext_end) = pair();
//! let legacy = SyncController::spawn_connected(
//!     SyncConfig::legacy_side(),
//!     MemoryStorage::default(),
//!     legacy_end,
//! );
//! let webext = SyncController::spawn_connected(
//!     SyncConfig::webext_side(),
//!     MemoryStorage::default(),
//!     webext_end,
//! );
//! legacy.storage_ready_for_access().wait().await?;
//! webext.initial_sync_done().wait().await?;
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(storage_migration_docsrs, feature(doc_cfg))]

pub mod config;
pub mod connection;
pub mod controller;
pub mod defer;
pub mod error;
pub mod protocol;
pub mod settings_migration;
pub mod storage;

#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(storage_migration_docsrs, doc(cfg(any(test, feature = "test-utils"))))]
pub mod test_utils;

pub use self::{
    config::{Role, SyncConfig},
    controller::{InitialSyncState, SyncController},
    settings_migration::SettingsMigration,
};
