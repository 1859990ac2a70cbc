//! Public facade crate for webstash.
//!
//! Re-exports the backend-agnostic types from `webstash-core` and the engine
//! implementations from `webstash-engine`.

pub use webstash_core as core;
pub use webstash_engine as engine;
