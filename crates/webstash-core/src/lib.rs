//! Backend-agnostic building blocks for webstash: the error type, the frozen
//! session settings, URL and header utilities, the cache policy engine and the
//! upstream client contract.
//!
//! Everything in this crate is pure or trait-shaped; the tokio/reqwest/zip
//! plumbing lives in `webstash-engine`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod cache_info;
pub mod client;
pub mod event;
pub mod header;
pub mod policy;
pub mod urls;

pub use policy::{ArchivePolicy, DownloadPolicy, ServePolicy};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Session configuration, parsed once by the CLI and frozen before the engine
/// is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Initial request URL; may come from the input archive's `url` entry.
    pub url: Option<String>,
    pub input_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub download_policy: DownloadPolicy,
    pub serve_policy: ServePolicy,
    pub archive_policy: ArchivePolicy,
    /// Upstream timeout when revalidating an archived response.
    pub refresh_timeout: Duration,
    /// Upstream timeout for fresh downloads.
    pub request_timeout: Duration,
    pub block_hosts_files: Vec<PathBuf>,
    pub inject_js_file: Option<PathBuf>,
    /// Optional HTTP/SOCKS proxy for upstream fetches (`host[:port]` or URL).
    pub proxy_server: Option<String>,
    pub verbose: bool,
    pub allow_lossy_compression: bool,
    pub open_browser: bool,
    pub patch_base_tag: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            url: None,
            input_file: None,
            output_file: None,
            download_policy: DownloadPolicy::default(),
            serve_policy: ServePolicy::default(),
            archive_policy: ArchivePolicy::default(),
            refresh_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            block_hosts_files: Vec::new(),
            inject_js_file: None,
            proxy_server: None,
            verbose: false,
            allow_lossy_compression: false,
            open_browser: false,
            patch_base_tag: false,
        }
    }
}
