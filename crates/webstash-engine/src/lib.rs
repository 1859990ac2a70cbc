//! Engine implementations for the webstash recording/replaying proxy: the
//! ZIP-backed archive store, the per-request stores, the HTML patcher, the
//! reqwest upstream client, the request orchestrator and the axum adapter.

pub mod archive;
pub mod client;
pub mod cookie_store;
pub mod engine;
pub mod header_store;
pub mod host_list;
pub mod html_patcher;
pub mod lossy;
pub mod server;

pub use engine::{Engine, ProxyRequest, ProxyResponse};
