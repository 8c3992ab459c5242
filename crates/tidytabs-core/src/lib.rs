//! tidytabs-core: Core library for TidyTabs
//!
//! This crate provides the core functionality for `tidytabs`, a tab
//! reconciliation engine that deduplicates, auto-deletes, groups, and
//! repositions browser tabs against a slow and partially failing tab API.
//!
//! # Architecture
//!
//! ```text
//! Tab Host → Fetch/Filter → Merge → Dedupe → Auto-delete
//!                        ↓
//!          Partition → Group States → Group Plan
//!                        ↓
//!            Executor (retry/batch) → Tab Host
//!                        ↓
//!              Event Bus → Indicator
//! ```
//!
//! # Modules
//!
//! - `tabs`: tab, window, and group primitives
//! - `rules`: per-domain rule compilation
//! - `error`: crate-wide error type
//! - `settings`: persisted settings and stores
//! - `host`: tab host trait and duplicate indicator
//! - `retry`: retry policies and paced batching
//! - `plan`: group states and layout plans
//! - `planner`: pure partitioning and reposition math
//! - `executor`: host-facing pipeline phases
//! - `controller`: single-flight orchestration
//! - `events`: event bus and debouncing
//! - `session`: in-memory host for tests and dry runs
//! - `logging`: tracing setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod controller;
pub mod error;
pub mod events;
pub mod executor;
pub mod host;
pub mod logging;
pub mod plan;
pub mod planner;
pub mod retry;
pub mod rules;
pub mod session;
pub mod settings;
pub mod tabs;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
