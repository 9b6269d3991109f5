//! Fact-based memory engine — atomic facts, consolidated observations, and
//! hybrid graph recall.
//!
//! Mnemon stores memory as three layers:
//!
//! - **Facts** — atomic, verbatim statements ("User works at Acme"), each
//!   embedded and indexed for keyword search
//! - **Entities** — canonical named things resolved across mentions, so
//!   "Acme", "acme corp", and "Acme Corporation" converge on one identity
//! - **Observations** — generalizations a language model distills from
//!   accumulated facts in a background consolidation loop
//!
//! Facts are connected by weighted links (temporal, semantic, entity) into a
//! graph. Recall fuses vector KNN and BM25 keyword search, expands through
//! the link graph, and adjusts scores by recency and usage, so related
//! memories surface together even when only one of them matches the query.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search
//! - **Embeddings**: Local ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions)
//! - **Model**: any OpenAI-compatible chat endpoint, used for entity
//!   extraction and consolidation decisions
//!
//! # Modules
//!
//! - [`config`] — Configuration loading from TOML files and environment variables
//! - [`db`] — SQLite database initialization and schema
//! - [`embedding`] — Text-to-vector embedding pipeline via ONNX Runtime
//! - [`model`] — Language-model trait and the chat-completions client
//! - [`memory`] — The engine: facts, entities, linking, retrieval,
//!   consolidation, and the [`memory::FactMemory`] facade

pub mod config;
pub mod db;
pub mod embedding;
pub mod memory;
pub mod model;
