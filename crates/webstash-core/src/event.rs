//! The session event vocabulary.
//!
//! Every externally observable step of a request's lifecycle is logged as one
//! line, `<EVENT> <detail>`. Serialization of whole lines is delegated to the
//! global `tracing` subscriber, the only process-wide state in the system.

use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Fatal,
    Error,
    Info,
    Accept,
    Redirect,
    Download,
    DownloadOmitted,
    DownloadFinished,
    DownloadFailed,
    DownloadBlocked,
    Served,
    WritingFailed,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Event::Fatal => "FATAL",
            Event::Error => "ERROR",
            Event::Info => "INFO",
            Event::Accept => "ACCEPT",
            Event::Redirect => "REDIRECT",
            Event::Download => "DOWNLOAD",
            Event::DownloadOmitted => "DOWNLOAD_OMITTED",
            Event::DownloadFinished => "DOWNLOAD_FINISHED",
            Event::DownloadFailed => "DOWNLOAD_FAILED",
            Event::DownloadBlocked => "DOWNLOAD_BLOCKED",
            Event::Served => "SERVED",
            Event::WritingFailed => "WRITING_FAILED",
        }
    }

    fn is_error(self) -> bool {
        matches!(
            self,
            Event::Fatal | Event::Error | Event::DownloadFailed | Event::WritingFailed
        )
    }
}

/// Emits one `<EVENT> <detail>` line.
pub fn emit(event: Event, detail: impl Display) {
    if event.is_error() {
        tracing::error!(target: "webstash", "{} {}", event.as_str(), detail);
    } else {
        tracing::info!(target: "webstash", "{} {}", event.as_str(), detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_the_log_vocabulary() {
        let names = [
            Event::Fatal,
            Event::Error,
            Event::Info,
            Event::Accept,
            Event::Redirect,
            Event::Download,
            Event::DownloadOmitted,
            Event::DownloadFinished,
            Event::DownloadFailed,
            Event::DownloadBlocked,
            Event::Served,
            Event::WritingFailed,
        ]
        .map(Event::as_str);
        assert_eq!(
            names.join(" "),
            "FATAL ERROR INFO ACCEPT REDIRECT DOWNLOAD DOWNLOAD_OMITTED \
             DOWNLOAD_FINISHED DOWNLOAD_FAILED DOWNLOAD_BLOCKED SERVED WRITING_FAILED"
        );
    }
}
