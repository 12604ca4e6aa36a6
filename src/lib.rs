//! # Smart File Search
//!
//! An allow-listed document indexer and guarded search service.
//!
//! Documents under configured root directories are extracted into
//! addressable chunks, kept in a SQLite FTS5 index that mirrors the
//! filesystem incrementally, and served through a small set of operations.
//! Every operation passes through a guardrail layer (allow-list, redaction,
//! snippet caps, per-caller rate limits, audit) and AI enrichment is
//! optional, budgeted and never on the critical path.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌──────────────┐
//! │  roots   │──▶│  indexer  │──▶│ extract  │──▶│ SQLite store │
//! │ (walk)   │   │ (workers) │   │ (chunks) │   │ FTS5 + vecs  │
//! └──────────┘   └───────────┘   └──────────┘   └──────┬───────┘
//!                                                      │
//!                 ┌────────────┐   ┌────────────┐      │
//!  CLI / HTTP ──▶ │ guardrails │──▶│  planner   │──▶ search ──▶ redaction
//!                 └────────────┘   └─────┬──────┘
//!                                        ▼
//!                                  AI adapter (opt-in, budgeted)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sfs init                          # create database
//! sfs index /srv/docs               # index an allow-listed root
//! sfs search "budget" --ext pdf --year 2023
//! sfs open /srv/docs/plan.pdf --pointer "page 2"
//! sfs serve                         # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Boundary error taxonomy |
//! | [`extract`] | Per-format text extraction |
//! | [`chunk`] | Section chunking |
//! | [`scan`] | Root directory walk |
//! | [`store`] | Files, chunks, FTS mirror, embeddings |
//! | [`indexer`] | Incremental indexing runs |
//! | [`jobs`] | Per-root job state |
//! | [`planner`] | Query to FTS5 expression |
//! | [`search`] | Ranking and pagination |
//! | [`guard`] | Allow-list, redaction, rate limits, audit |
//! | [`ai`] | Optional LLM enrichment and token budget |
//! | [`embedding`] | Embedding providers and vector helpers |
//! | [`service`] | The guarded operations |
//! | [`tools`] | Operations as named tools for HTTP |
//! | [`server`] | HTTP server |
//! | [`stats`] | Index counts and consistency check |

pub mod ai;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod guard;
pub mod indexer;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod planner;
pub mod scan;
pub mod search;
pub mod server;
pub mod service;
pub mod stats;
pub mod store;
pub mod tools;
