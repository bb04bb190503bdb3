//! # docqa
//!
//! Session-scoped question answering over remote documents.
//!
//! Callers hand the service a list of document locators and an API key.
//! Documents are downloaded, their text extracted, split into nodes,
//! embedded, and persisted as one index per session. Later questions
//! against that session are answered from the most similar nodes with a
//! single completion call. A stateless path answers a question over the
//! full text of freshly fetched documents without indexing anything.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Fetch   │──▶│ Extract  │──▶│ Chunk+Embed │──▶│    SQLite    │
//! │ (HTTP)   │   │ PDF/DOCX │   │  (OpenAI)   │   │ per session  │
//! └──────────┘   └──────────┘   └─────────────┘   └──────┬───────┘
//!                                                        │
//!                                  ┌─────────────────────┤
//!                                  ▼                     ▼
//!                             ┌──────────┐         ┌──────────┐
//!                             │   HTTP   │         │   CLI    │
//!                             │ (axum)   │         │ (docqa)  │
//!                             └──────────┘         └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and machine codes |
//! | [`models`] | Validated request values and node types |
//! | [`fetch`] | Document download into scoped temp files |
//! | [`extract`] | PDF / DOCX / text extraction |
//! | [`chunk`] | Node splitting |
//! | [`prompt`] | Prompt templates and token budgets |
//! | [`llm`] | Completion and embedding client |
//! | [`db`] | SQLite connection and schema |
//! | [`store`] | Session index persistence |
//! | [`session`] | Per-session locking |
//! | [`index`] | Index build and query |
//! | [`raw_query`] | Index-free question answering |
//! | [`pipeline`] | Request-level operations |
//! | [`server`] | HTTP server |

pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod index;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod raw_query;
pub mod server;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;
