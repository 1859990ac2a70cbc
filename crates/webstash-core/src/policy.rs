//! The three orthogonal session policies and the pure decision function that
//! maps a request's archive state onto `{serve, write, download}`.

use serde::{Deserialize, Serialize};

/// When to go upstream at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPolicy {
    /// Download what is missing or expired.
    #[default]
    Standard,
    /// Re-download everything.
    Always,
    /// Work offline.
    Never,
}

/// Which archived version satisfies a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServePolicy {
    /// Prefer a fresh download over stale archive content.
    #[default]
    Latest,
    /// Serve the most recently archived version, refreshing stale entries in
    /// the background.
    LastArchived,
    /// Serve the first version ever archived.
    FirstArchived,
}

/// What the close-time pass copies from the input archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivePolicy {
    #[default]
    Latest,
    First,
    LatestAndFirst,
    /// Keep only what this session actually requested.
    Requested,
}

/// The per-request decision: serve from the archive, mirror the served entry
/// into the output, download upstream. Any combination can hold; a chosen
/// `serve` that finds no body falls through to `download` in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub serve: bool,
    pub write: bool,
    pub download: bool,
}

impl Action {
    const fn new(serve: bool, write: bool, download: bool) -> Self {
        Self {
            serve,
            write,
            download,
        }
    }
}

/// The decision matrix. Total over its whole domain.
pub fn action(
    archived: bool,
    expired: bool,
    download: DownloadPolicy,
    serve: ServePolicy,
) -> Action {
    match download {
        DownloadPolicy::Standard => {
            if !archived {
                return Action::new(false, false, true);
            }
            match serve {
                ServePolicy::Latest if expired => Action::new(false, false, true),
                ServePolicy::Latest => Action::new(true, true, false),
                ServePolicy::LastArchived if expired => Action::new(true, false, true),
                ServePolicy::LastArchived => Action::new(true, true, false),
                ServePolicy::FirstArchived => Action::new(true, false, false),
            }
        }
        DownloadPolicy::Always => match serve {
            ServePolicy::Latest => Action::new(false, false, true),
            ServePolicy::LastArchived => Action::new(true, false, true),
            ServePolicy::FirstArchived if archived => Action::new(true, false, false),
            ServePolicy::FirstArchived => Action::new(false, false, true),
        },
        DownloadPolicy::Never => {
            if !archived {
                return Action::new(false, false, false);
            }
            match serve {
                ServePolicy::FirstArchived => Action::new(true, false, false),
                _ => Action::new(true, true, false),
            }
        }
    }
}
