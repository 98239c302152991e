//! # Strata
//!
//! Temporally-partitioned vector memory store for multi-tenant agent
//! workspaces.
//!
//! This library provides:
//! - An asynchronous write pipeline: queue batches of fact operations are
//!   embedded (with credit reservation and retry/backoff) and persisted into
//!   per-agent, per-grain vector partitions
//! - A connection-cached read path with similarity, metadata, and temporal
//!   queries
//! - Per-workspace document indexing and semantic search with single-flight
//!   de-duplication and graceful partial results under a global timeout
//!
//! ## Data Flow
//!
//! ```text
//! write batches ──▶ WriteConsumer ──▶ EmbeddingGenerator + CreditGuard
//!                        │                      │
//!                        ▼                      ▼
//!                  partition store ◀── per-(agent, grain) tables
//!                        ▲
//! search ──▶ DocumentIndexer (single-flight) ──▶ cosine ranking
//! ```
//!
//! ## Modules
//! - `memory`: partitions, write consumer, embedding, credits, queries
//! - `docsearch`: document indexing, snippet splitting, semantic search
//! - `config`: environment configuration for the worker

pub mod config;
pub mod docsearch;
pub mod memory;

pub use config::Config;
pub use docsearch::{DocumentIndexer, SearchHit};
pub use memory::{MemorySystem, TemporalGrain};
