//! Engineering-productivity analytics over software development events:
//! pull requests, commits, releases and issue tickets, read from a
//! metadata store and distilled into per-PR facts, release mappings and
//! aggregated metrics.
//!
//! The read path is `releases` → `release_map` → `facts` → `metrics`,
//! orchestrated by `query`, with `cache` intercepting every boundary and
//! `dag` maintaining the per-repository commit graphs underneath.

use std::sync::Arc;

pub mod cache;
pub mod dag;
pub mod db;
pub mod error;
pub mod facts;
pub mod logger;
pub mod metrics;
pub mod query;
pub mod release_map;
pub mod releases;
pub mod settings;

#[cfg(test)]
pub(crate) mod tests;

use cache::Caches;
use db::{MetadataStore, PrecomputedStore};

/// Shared storage and cache handles threaded through every pipeline stage.
pub struct Context {
    pub metadata: Arc<dyn MetadataStore>,
    pub precomputed: Arc<dyn PrecomputedStore>,
    pub caches: Arc<Caches>,
}
