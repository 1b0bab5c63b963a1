//! # mediavfs core
//!
//! Background indexing core for the mediavfs metadata filesystem. It walks a
//! set of filesystem roots, extracts and persists per-file metadata, keeps the
//! persisted tree in sync with live filesystem changes, and paces itself
//! according to measured system load.
//!
//! ## Overview
//!
//! - **Scheduler**: samples CPU/IO load and turns it into a pacing delay per
//!   throttling [`Policy`](scheduler::Policy).
//! - **Crawler**: owns a deduplicated scan queue per root, installs watches,
//!   reconciles live change events and rolls directory attributes up the tree.
//! - **Parser**: decides whether an item needs re-extraction, runs the
//!   extractor, keeps thumbnails fresh and upserts into the store.
//!
//! The storage engine, metadata codecs and thumbnail encoding are external
//! collaborators reached through the traits in [`store`], [`parser`] and
//! [`watch`].
//!
//! ## Feature Flags
//!
//! - `watch`: native change notifications through `notify`
//! - `system-load`: `/proc/stat` and sysinfo backed load sampling
//! - `ffmpeg`: FFmpeg-based metadata extraction
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mediavfs_core::{
//!     config::CrawlerConfig,
//!     crawler::Crawler,
//!     parser::{ExtensionExtractor, NullThumbnailer, Parser},
//!     scheduler::{Policy, Scheduler},
//!     store::{MemoryStore, StoreWriter},
//! };
//!
//! async fn index(root: &str) -> mediavfs_core::Result<()> {
//!     let writer = StoreWriter::new(Arc::new(MemoryStore::new()));
//!     let parser = Parser::new(
//!         writer,
//!         Arc::new(ExtensionExtractor::new()),
//!         Arc::new(NullThumbnailer),
//!     );
//!     let crawler = Crawler::new(
//!         parser,
//!         Scheduler::unavailable(),
//!         None,
//!         CrawlerConfig::default(),
//!         Policy::Balanced,
//!     );
//!     crawler.append(root).await?;
//!     crawler.wait_idle().await;
//!     crawler.stop();
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Tuning knobs shared by the crawler, parser and scheduler.
pub mod config;

/// Directory crawling, live event reconciliation and rollup aggregation.
pub mod crawler;

/// Error types and error handling utilities.
pub mod error;

/// Indexed items and their attribute bags.
pub mod item;

/// Directory listings merged with their overlay directories.
pub mod listing;

/// Per-item extraction, thumbnail freshness and store upsert.
pub mod parser;

/// Registered crawl roots.
pub mod roots;

/// Load sampling and pacing delay recommendations.
pub mod scheduler;

/// Store collaborator traits, cooperative reader lock and the in-memory store.
pub mod store;

/// OS change-notification collaborator and the watch table.
pub mod watch;

pub use error::{IndexError, Result};
