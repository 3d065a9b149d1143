//! # agrafes-corpus-engine
//!
//! **A local multilingual corpus engine: ingestion, full-text search,
//! cross-document alignment, and a localhost HTTP sidecar.**
//!
//! The engine stores documents as an ordered sequence of units (lines or
//! structural elements) in an embedded SQLite database, indexes their
//! normalized text in FTS5, and can align equivalent units across a pivot
//! document and a target document — typically a source text and its
//! translation, or a full text and an excerpt.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────────┐   ┌──────────┐
//! │  ingest  │──▶│  units    │──▶│  FTS5      │──▶│  query   │
//! │ segmenter│   │  (SQLite) │   │ fts_units  │   │ aligner  │
//! └──────────┘   └───────────┘   └────────────┘   └──────────┘
//!                                                        │
//!                     ┌──────────────────────────────────┤
//!                     ▼                                  ▼
//!               ┌──────────┐                       ┌──────────┐
//!               │   CLI    │                       │  sidecar │
//!               │(agrafes) │                       │  (axum)  │
//!               └──────────┘                       └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. [`ingest`] reads raw document bytes into paragraphs, normalizes them
//!    via [`unicode_policy`], and inserts one `units` row per paragraph.
//! 2. [`segmenter`] can replace a document's line units with sentence-level
//!    units using an abbreviation-aware splitter.
//! 3. [`indexer`] (re)builds the `fts_units` FTS5 index from `units`.
//! 4. [`query`] runs FTS5 `MATCH` queries, rendering segment or KWIC views
//!    and optionally attaching aligned units from a related document.
//! 5. [`aligner`] links units across a pivot/target document pair by shared
//!    external id, position, text similarity, or a hybrid of the two, and
//!    exposes audit/quality reports and manual link edits.
//! 6. [`curation`] applies regex rewrite rules over stored text, and
//!    [`metadata`] / [`diagnostics`] report on corpus health.
//! 7. Everything above is reachable from the **CLI** (`agrafes`) and from
//!    the **sidecar** ([`server`]), a localhost HTTP service that the CLI
//!    can also launch and talk to directly.
//!
//! ## Quick Start
//!
//! ```bash
//! agrafes init-project
//! agrafes import --title "Moby Dick" --language en --source-path moby.txt
//! agrafes index
//! agrafes query --fts-query whale
//! agrafes serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: `Document`, `Unit`, `AlignmentLink`, `DocRelation`, `Run` |
//! | [`db`] | Single-connection SQLite pool plus the process-wide writer lock |
//! | [`migrate`] | Forward-only versioned schema migrations |
//! | [`unicode_policy`] | Text normalization policy (NFC, control stripping, separator marks) |
//! | [`ingest`] | Document readers and unit insertion |
//! | [`segmenter`] | Abbreviation-aware sentence segmentation |
//! | [`indexer`] | FTS5 index (re)building |
//! | [`query`] | Full-text query engine with segment/KWIC rendering and pagination |
//! | [`aligner`] | Cross-document alignment, audit, quality, and link editing |
//! | [`documents`] | Document listing and metadata editing |
//! | [`curation`] | Regex-based text curation rules |
//! | [`metadata`] | Document metadata completeness validation |
//! | [`diagnostics`] | Whole-database health reporting |
//! | [`export`] | TEI, alignment CSV, and run-report export |
//! | [`jobs`] | In-process async job manager for long-running operations |
//! | [`runs`] | The run ledger and per-run log files |
//! | [`portfile`] | Sidecar discovery via a JSON portfile |
//! | [`error`] | HTTP error taxonomy for the sidecar contract |
//! | [`server`] | The localhost HTTP sidecar (Axum) |
//!
//! ## Configuration
//!
//! The engine is configured via a TOML file (default: `config/agrafes.toml`).
//! See [`config`] for all available options and [`config::load_config`] for
//! validation rules.

pub mod aligner;
pub mod config;
pub mod curation;
pub mod db;
pub mod diagnostics;
pub mod documents;
pub mod error;
pub mod export;
pub mod indexer;
pub mod ingest;
pub mod jobs;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod portfile;
pub mod query;
pub mod runs;
pub mod segmenter;
pub mod server;
pub mod unicode_policy;
