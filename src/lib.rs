//! # itsm-sync
//!
//! Keeps a local vector index of ITSM records (incidents, work orders,
//! knowledge articles, change requests) in step with the source system.
//! Each category syncs incrementally from its own watermark under a lock
//! stored in its `sync_state` row, so a crashed or overlapping run never
//! loses or duplicates records.
//!
//! The engine lives in the `itsm-sync-core` crate. This crate provides the
//! concrete pieces around it:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────┐   ┌────────────┐
//! │ RestExtractor│──▶│ CategoryPipeline ×4  │──▶│  SQLite    │
//! │  (ITSM REST) │   │ chunk + embed + swap │   │ state+index│
//! └──────────────┘   └──────────┬───────────┘   └────────────┘
//!                               │
//!                  ┌────────────┼─────────────┐
//!                  ▼            ▼             ▼
//!             ┌────────┐  ┌───────────┐  ┌──────────┐
//!             │  CLI   │  │ scheduler │  │  admin   │
//!             │        │  │           │  │  HTTP    │
//!             └────────┘  └───────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | Watermark store and artifact index on SQLite |
//! | [`http`] | Shared retry policy for outbound HTTP |
//! | [`connector_itsm`] | REST extractor for the ITSM gateway |
//! | [`embedding`] | OpenAI and Ollama embedders |
//! | [`ingest`] | Coordinator wiring and CLI commands |
//! | [`scheduler`] | Periodic sync and reconciliation |
//! | [`server`] | Admin HTTP API |

pub mod config;
pub mod connector_itsm;
pub mod db;
pub mod embedding;
pub mod http;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod scheduler;
pub mod server;
pub mod sqlite_store;
