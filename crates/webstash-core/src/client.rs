//! The upstream fetch contract.
//!
//! The orchestrator never talks to the network directly; it hands a fully
//! prepared request to an [`UpstreamClient`] and gets back a decompressed
//! response. Tests drive the engine with an in-memory implementation.

use crate::header::Header;
use crate::Result;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub method: String,
    pub header: Header,
    pub body: Vec<u8>,
    /// Hard deadline for the whole fetch, connect included.
    pub timeout: Duration,
}

/// A response with any transfer encoding already undone: `body` holds the
/// decoded bytes and `header` no longer carries `Content-Encoding`.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub header: Header,
    pub body: Vec<u8>,
}

#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse>;
}
