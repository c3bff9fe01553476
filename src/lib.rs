//! # LetsLearn
//!
//! A local study assistant. Uploaded documents are chunked and embedded into
//! an in-memory vector index; a locally hosted model then answers questions
//! and generates topics, summaries, notes, flashcards and quizzes from the
//! retrieved context. Generated material is cached per project and topic,
//! quiz questions accumulate into per-topic pools, and submitted quiz
//! results roll up into per-topic mastery statistics.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌─────────────┐   ┌─────────────────┐
//! │  parser  │──▶│  chunk  │──▶│ VectorIndex │──▶│ContextAssembler │
//! └──────────┘   └─────────┘   └─────────────┘   └────────┬────────┘
//!                                                         │
//!     ┌──────────────┐   ┌────────────────┐   ┌──────────▼─────────┐
//!     │ ContentStore │◀──│ QuizPoolManager│◀──│ GenerationGate     │
//!     │ (JSON, vN)   │   │ MasteryTracker │   │ (one model, fail   │
//!     └──────────────┘   └────────────────┘   │  fast when busy)   │
//!                                             └────────────────────┘
//!                 StudyService ── CLI (letslearn) / HTTP (axum)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! letslearn project create biology
//! letslearn project add biology ./cells.pdf
//! letslearn ask biology "What does the mitochondria do?"
//! letslearn quiz biology --topic cells --count 5
//! letslearn serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed failures at the service boundary |
//! | [`models`] | Persisted data types |
//! | [`parser`] | Document text extraction |
//! | [`chunk`] | Overlapping fixed-window chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | In-memory vector index |
//! | [`context`] | Bounded context windows |
//! | [`generation`] | Completion backends and the exclusive generation gate |
//! | [`prompts`] | Task prompts and token budgets |
//! | [`migrate`] | Versioned store migrations |
//! | [`cache`] | Persisted projects store |
//! | [`quiz`] | Topic-scoped quiz pools |
//! | [`mastery`] | Per-topic mastery statistics |
//! | [`study`] | The study service |
//! | [`server`] | HTTP API |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod mastery;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod prompts;
pub mod quiz;
pub mod server;
pub mod study;
