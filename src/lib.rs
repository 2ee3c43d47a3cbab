//! # changelog
//!
//! A durable, crash-recoverable append-only log with:
//! - Checksummed, 8-byte aligned records with gap-free ids
//! - A sparse index for positioned reads
//! - Torn-tail recovery on open
//! - Batched, asynchronous flushing on a background thread
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ChangelogStore                            │
//! │              ({id:09}.log segments in a dir)                 │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                   AsyncChangelog                             │
//! │        (append → FlushFuture, read, flush, finalize)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     Dispatcher                               │
//! │     (per-changelog queues, one "changelog-flush" thread)     │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  Data file  │          │ Index file  │
//!   │  (records)  │          │  (sparse)   │
//!   └─────────────┘          └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod changelog;
pub mod dispatcher;
pub mod async_changelog;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ChangelogError, Result};
pub use config::Config;
pub use changelog::{Changelog, ChangelogState, EpochId, RecoveryReport};
pub use dispatcher::{Dispatcher, FlushFuture};
pub use async_changelog::AsyncChangelog;
pub use store::ChangelogStore;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of the changelog crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
