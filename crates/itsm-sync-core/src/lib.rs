//! # itsm-sync core
//!
//! Runtime-agnostic engine for incremental synchronization of ITSM records
//! into a vector index: data models, collaborator traits, the watermark/lock
//! state machine, per-category pipelines, and the sync coordinator.
//!
//! This crate contains no tokio, sqlx, or network dependencies. Persistence
//! and I/O are reached through the traits in [`store`] and [`source`], with
//! in-memory implementations in [`store::memory`] for tests.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Categories, records, chunks, sync state, run results |
//! | [`error`] | Typed engine errors |
//! | [`clock`] | Injectable time source |
//! | [`store`] | Watermark store and artifact index traits |
//! | [`source`] | Extractor and chunker traits |
//! | [`chunk`] | Paragraph-boundary record chunker |
//! | [`embedding`] | Embedder trait and vector helpers |
//! | [`lock`] | Per-category lock manager with stale-lock recovery |
//! | [`pipeline`] | One category's fetch → re-derive → replace → advance run |
//! | [`coordinator`] | Drives all pipelines, full resync, reconciliation |

pub mod chunk;
pub mod clock;
pub mod coordinator;
pub mod embedding;
pub mod error;
pub mod lock;
pub mod models;
pub mod pipeline;
pub mod source;
pub mod store;
