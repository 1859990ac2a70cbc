//! The request orchestrator: the per-request state machine tying the archive
//! store, the policy engine, the cookie/header/HSTS stores and the HTML
//! patcher together.
//!
//! Handlers never raise; every failure becomes a log event plus, where a
//! client is waiting, a synthetic response.

use crate::archive::{ArchiveReader, ArchiveWriter, Version, OVERLAY_PREFIX};
use crate::cookie_store::CookieStore;
use crate::header_store::HeaderStore;
use crate::host_list::HostList;
use crate::html_patcher::HtmlPatcher;
use crate::lossy::LossyCompressor;
use encoding_rs::{Encoding, UTF_8};
use rand::Rng;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{Notify, Semaphore};
use webstash_core::cache_info::{self, CacheInfo};
use webstash_core::client::{UpstreamClient, UpstreamRequest};
use webstash_core::event::{self, Event};
use webstash_core::header::{
    format_http_time, now_epoch, split_content_type, Header,
};
use webstash_core::policy::{self, ServePolicy};
use webstash_core::urls::{
    get_identifying_url, get_scheme, get_hostname_port, get_scheme_hostname_port,
    get_scheme_hostname_port_path, is_same_url, to_absolute_url, to_local_filename,
    to_relative_or_patch_url, to_relative_url, unpatch_url, url_to_regex,
};
use webstash_core::{Error, Result, Settings};

/// Well-known paths intercepted under the proxy's own base.
pub const INJECT_JAVASCRIPT_PATH: &str = "/__webrecorder.js";
pub const SET_COOKIE_PATH: &str = "/__webrecorder_setcookie";
pub const EXIT_PATH: &str = "/__webrecorder_exit";

/// Worker pool size after the single-threaded startup phase.
const WORKER_THREADS: usize = 5;

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub header: Header,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub header: Header,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    fn empty(status: u16) -> Self {
        Self {
            status,
            header: Header::new(),
            body: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct ServerBases {
    base: String,
    base_path: String,
}

#[derive(Default)]
struct Startup {
    complete: bool,
    ready_callback: Option<Box<dyn FnOnce() + Send>>,
}

#[derive(Default)]
struct WriteState {
    header_writer: HeaderStore,
    strict_transport_security: BTreeMap<String, Regex>,
}

pub struct Engine {
    settings: Settings,
    client: Arc<dyn UpstreamClient>,
    start_url: String,
    inject_javascript_code: String,
    uid: Mutex<String>,
    archive_reader: Option<Arc<ArchiveReader>>,
    archive_writer: Option<ArchiveWriter>,
    header_reader: HeaderStore,
    cookie_store: CookieStore,
    blocked_hosts: Option<HostList>,
    local_server_base: Mutex<String>,
    bases: RwLock<ServerBases>,
    startup: Mutex<Startup>,
    startup_gate: Arc<Semaphore>,
    write_state: Mutex<WriteState>,
    shutdown: Notify,
    shutting_down: AtomicBool,
}

impl Engine {
    pub fn new(settings: Settings, client: Arc<dyn UpstreamClient>) -> Result<Self> {
        let mut archive_reader = None;
        if let Some(input) = &settings.input_file {
            match ArchiveReader::open(input) {
                Ok(reader) => {
                    reader.set_overlay_path(OVERLAY_PREFIX);
                    archive_reader = Some(Arc::new(reader));
                }
                Err(error) => {
                    if settings.url.is_none() {
                        return Err(error);
                    }
                    event::emit(Event::Error, error);
                }
            }
        }

        let mut start_url = settings.url.clone();
        let mut uid = String::new();
        let mut header_reader = HeaderStore::new();
        let mut cookie_store = CookieStore::new();
        if let Some(reader) = &archive_reader {
            if start_url.is_none() {
                if let Some(data) = reader.read("url", Version::Base) {
                    let url = String::from_utf8_lossy(&data).into_owned();
                    if !url.is_empty() {
                        start_url = Some(url);
                    }
                }
            }
            if let Some(data) = reader.read("uid", Version::Base) {
                uid = String::from_utf8_lossy(&data).into_owned();
            }
            if let Some(data) = reader.read("headers", Version::Base) {
                header_reader = HeaderStore::deserialize(&String::from_utf8_lossy(&data));
            }
            if let Some(data) = reader.read("cookies", Version::Base) {
                cookie_store = CookieStore::deserialize(&String::from_utf8_lossy(&data));
            }
        }
        let start_url = start_url.ok_or_else(|| {
            Error::Config(if settings.input_file.is_none() {
                "no URL specified".into()
            } else {
                "reading the input archive failed".into()
            })
        })?;

        let mut archive_writer = None;
        if let Some(output) = &settings.output_file {
            let writer = open_temporary_writer()?;
            writer.move_on_close(output.clone(), true);
            writer.write("url", start_url.as_bytes(), 0, false);
            if settings.allow_lossy_compression {
                writer.set_lossy_compressor(LossyCompressor::new());
            }
            archive_writer = Some(writer);
        }

        let mut blocked = HostList::new();
        for file in &settings.block_hosts_files {
            blocked.add_hosts_from_file(file)?;
        }
        let blocked_hosts = blocked.has_hosts().then_some(blocked);

        let mut inject_javascript_code = String::new();
        if let Some(path) = &settings.inject_js_file {
            inject_javascript_code = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("reading {} failed: {e}", path.display()))
            })?;
        }

        let bases = ServerBases {
            base: get_scheme_hostname_port(&start_url).to_string(),
            base_path: get_scheme_hostname_port_path(&start_url).to_string(),
        };

        Ok(Self {
            settings,
            client,
            start_url,
            inject_javascript_code,
            uid: Mutex::new(uid),
            archive_reader,
            archive_writer,
            header_reader,
            cookie_store,
            blocked_hosts,
            local_server_base: Mutex::new(String::new()),
            bases: RwLock::new(bases),
            startup: Mutex::new(Startup::default()),
            startup_gate: Arc::new(Semaphore::new(1)),
            write_state: Mutex::new(WriteState::default()),
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn start_url(&self) -> &str {
        &self.start_url
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Announces the bound local endpoint; only call on the main task before
    /// serving starts.
    pub fn set_local_server_url(&self, url: &str) {
        *lock(&self.local_server_base) = get_scheme_hostname_port(url).to_string();
        event::emit(Event::Accept, url);
    }

    /// Fires once, on the first non-redirect response.
    pub fn set_ready_callback(&self, callback: impl FnOnce() + Send + 'static) {
        lock(&self.startup).ready_callback = Some(Box::new(callback));
    }

    pub fn initiate_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub async fn shutdown_requested(&self) {
        let notified = self.shutdown.notified();
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }

    /// Handles one request end to end. Until the first non-redirect response
    /// a single gate permit keeps the engine effectively single-threaded, so
    /// initial redirects may move the server base without racing.
    pub async fn handle_request(self: Arc<Self>, request: ProxyRequest) -> ProxyResponse {
        let _permit = Arc::clone(&self.startup_gate).acquire_owned().await.ok();

        if request.method.eq_ignore_ascii_case("OPTIONS") {
            return self.cors_preflight_response(&request);
        }

        let mut url = to_absolute_url(unpatch_url(&request.path), &self.server_base());
        if !request.query.is_empty() {
            url.push('?');
            url.push_str(&request.query);
        }
        if get_scheme(&url) == Some("http") {
            url = self.apply_strict_transport_security(url);
        }

        if request.path.ends_with(INJECT_JAVASCRIPT_PATH) {
            let mut header = Header::new();
            header.append("Content-Type", "text/javascript;charset=utf-8");
            return ProxyResponse {
                status: 200,
                header,
                body: self.inject_javascript_code.clone().into_bytes(),
            };
        }
        if request.path.ends_with(SET_COOKIE_PATH) {
            self.cookie_store
                .set(&url, &String::from_utf8_lossy(&request.body));
            let mut header = Header::new();
            header.append("Access-Control-Allow-Origin", "*");
            return ProxyResponse {
                status: 204,
                header,
                body: Vec::new(),
            };
        }
        if request.path.ends_with(EXIT_PATH) {
            self.initiate_shutdown();
            return ProxyResponse::empty(204);
        }

        if let Some(blocked) = &self.blocked_hosts {
            if blocked.contains(&url) {
                event::emit(Event::DownloadBlocked, &url);
                return ProxyResponse::empty(404);
            }
        }

        if let Some(response) = self.serve_previously_served(&request, &url).await {
            return response;
        }

        let identifying_url = get_identifying_url(&url, &request.body);
        let entry = self.header_reader.read(&identifying_url).cloned();
        let archived = self.archive_reader.is_some() && entry.is_some();
        let cache_info = entry.as_ref().and_then(|entry| {
            cache_info::evaluate(entry.status, &entry.header, &request.header, now_epoch())
        });
        let expired = cache_info.as_ref().map_or(true, |info| info.expired);
        let action = policy::action(
            archived,
            expired,
            self.settings.download_policy,
            self.settings.serve_policy,
        );

        if action.serve {
            if let Some(response) = self.serve_from_archive(&request, &url, action.write).await {
                if action.download {
                    // serve the stale copy now, refresh the archive behind it
                    let engine = Arc::clone(&self);
                    let request = request.clone();
                    let url = url.clone();
                    tokio::spawn(async move {
                        engine.refresh_in_background(request, url, cache_info).await;
                    });
                }
                return response;
            }
        }
        if !action.download {
            return self.serve_error(&url, 0);
        }
        self.forward_request(&request, &url, cache_info).await
    }

    fn server_base(&self) -> String {
        self.bases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .base
            .clone()
    }

    fn cors_preflight_response(&self, request: &ProxyRequest) -> ProxyResponse {
        let mut header = Header::new();
        header.append("Access-Control-Max-Age", "-1");
        for (name, value) in request.header.iter() {
            if name.eq_ignore_ascii_case("Origin") {
                header.append("Access-Control-Allow-Origin", value);
            } else if name.eq_ignore_ascii_case("Access-Control-Request-Method") {
                header.append("Access-Control-Allow-Method", value);
            } else if name.eq_ignore_ascii_case("Access-Control-Request-Headers") {
                header.append("Access-Control-Allow-Headers", value);
            }
        }
        ProxyResponse {
            status: 204,
            header,
            body: Vec::new(),
        }
    }

    /// Serves an entry this session already wrote, read back through the
    /// writer thread so queued writes stay ordered ahead of it.
    async fn serve_previously_served(
        &self,
        request: &ProxyRequest,
        url: &str,
    ) -> Option<ProxyResponse> {
        let writer = self.archive_writer.as_ref()?;
        let identifying_url = get_identifying_url(url, &request.body);
        let filename = to_local_filename(&identifying_url);
        let entry = {
            let state = lock(&self.write_state);
            if !writer.contains(&filename) {
                return None;
            }
            state.header_writer.read(&identifying_url).cloned()
        }?;

        let (sender, receiver) = tokio::sync::oneshot::channel();
        writer.async_read(&filename, move |result| {
            let _ = sender.send(result);
        });
        let (data, modification_time) = receiver.await.ok()??;
        Some(self.serve_file(request, url, entry.status, &entry.header, data, modification_time))
    }

    /// Serves the archived entry for `url`, optionally mirroring it into the
    /// output archive. `None` when the input archive has no such entry.
    async fn serve_from_archive(
        &self,
        request: &ProxyRequest,
        url: &str,
        write_to_archive: bool,
    ) -> Option<ProxyResponse> {
        let reader = self.archive_reader.as_ref()?;
        let identifying_url = get_identifying_url(url, &request.body);
        let entry = self.header_reader.read(&identifying_url)?.clone();
        let filename = to_local_filename(&identifying_url);
        let version = match self.settings.serve_policy {
            ServePolicy::FirstArchived => Version::Top,
            _ => Version::Base,
        };

        let reader = Arc::clone(reader);
        let read_filename = filename.clone();
        let (info, data) = tokio::task::spawn_blocking(move || {
            (
                reader.get_file_info(&read_filename, version),
                reader.read(&read_filename, version),
            )
        })
        .await
        .ok()?;

        let response_time = info
            .map(|info| info.modification_time)
            .filter(|time| *time != 0)
            .unwrap_or_else(now_epoch);
        // entries recorded without a body (redirects) have no blob
        let data = data.unwrap_or_default();

        if write_to_archive {
            self.async_write_file(
                &identifying_url,
                entry.status,
                &entry.header,
                data.clone(),
                response_time,
                false,
            );
        }
        Some(self.serve_file(request, url, entry.status, &entry.header, data, response_time))
    }

    async fn forward_request(
        &self,
        request: &ProxyRequest,
        url: &str,
        cache_info: Option<CacheInfo>,
    ) -> ProxyResponse {
        event::emit(Event::Download, url);
        let upstream = self.build_upstream_request(request, url, cache_info.as_ref());
        match self.client.fetch(upstream).await {
            Err(error) => {
                event::emit(Event::DownloadFailed, format!("{url} {error}"));
                if let Some(response) = self.serve_from_archive(request, url, true).await {
                    event::emit(Event::DownloadOmitted, url);
                    return response;
                }
                ProxyResponse::empty(404)
            }
            Ok(response) => {
                if !is_served_directly(response.status) {
                    if let Some(archived) = self.serve_from_archive(request, url, true).await {
                        event::emit(Event::DownloadOmitted, url);
                        return archived;
                    }
                }
                event::emit(
                    Event::DownloadFinished,
                    format!("{} {} {url}", response.status, response.body.len()),
                );
                let response_time = now_epoch();
                let reply = self.serve_file(
                    request,
                    url,
                    response.status,
                    &response.header,
                    response.body.clone(),
                    response_time,
                );
                self.async_write_file(
                    &get_identifying_url(url, &request.body),
                    response.status,
                    &response.header,
                    response.body,
                    response_time,
                    true,
                );
                reply
            }
        }
    }

    /// A stale-while-revalidate fetch after the response already went out.
    async fn refresh_in_background(
        self: Arc<Self>,
        request: ProxyRequest,
        url: String,
        cache_info: Option<CacheInfo>,
    ) {
        event::emit(Event::Download, &url);
        let upstream = self.build_upstream_request(&request, &url, cache_info.as_ref());
        match self.client.fetch(upstream).await {
            Err(error) => event::emit(Event::DownloadFailed, format!("{url} {error}")),
            Ok(response) => {
                if !is_served_directly(response.status) {
                    return;
                }
                event::emit(
                    Event::DownloadFinished,
                    format!("{} {} {url}", response.status, response.body.len()),
                );
                for cookie in response.header.get_all("Set-Cookie") {
                    self.cookie_store.set(&url, cookie);
                }
                if let Some(value) = response.header.get("Strict-Transport-Security") {
                    self.set_strict_transport_security(&url, value.contains("includeSubDomains"));
                }
                self.async_write_file(
                    &get_identifying_url(&url, &request.body),
                    response.status,
                    &response.header,
                    response.body,
                    now_epoch(),
                    true,
                );
            }
        }
    }

    fn serve_error(&self, url: &str, status: u16) -> ProxyResponse {
        event::emit(Event::DownloadFailed, url);
        ProxyResponse::empty(if status == 0 { 404 } else { status })
    }

    /// Builds the outgoing response: harvests cookies and HSTS, patches HTML
    /// and CSS bodies, rewrites `Location`, and rebuilds the header with the
    /// hop-by-hop and security headers dropped.
    fn serve_file(
        &self,
        request: &ProxyRequest,
        url: &str,
        status: u16,
        header: &Header,
        mut body: Vec<u8>,
        response_time: i64,
    ) -> ProxyResponse {
        self.update_startup_phase(url, status, header);

        let content_type = header.get("Content-Type").unwrap_or_default().to_string();
        let (mime_type, charset) = split_content_type(&content_type);

        // cookies are kept by the proxy and exposed through the bootstrap
        for cookie in header.get_all("Set-Cookie") {
            self.cookie_store.set(url, cookie);
        }

        let server_base = self.server_base();
        let patchable = mime_type.eq_ignore_ascii_case("text/html")
            || mime_type.eq_ignore_ascii_case("text/css");
        if patchable && !body.is_empty() {
            let label = if charset.is_empty() { "utf-8" } else { charset };
            let encoding = Encoding::for_label(label.as_bytes()).unwrap_or(UTF_8);
            let (text, _, _) = encoding.decode(&body);
            let patcher = HtmlPatcher::new(
                server_base.clone(),
                url.to_string(),
                mime_type,
                text.into_owned(),
                if self.inject_javascript_code.is_empty() {
                    String::new()
                } else {
                    INJECT_JAVASCRIPT_PATH.to_string()
                },
                self.cookie_store.get_cookies_list(url),
                response_time,
                self.settings.patch_base_tag,
            );
            let patched = patcher.get_patched();
            let (encoded, _, _) = encoding.encode(&patched);
            body = encoded.into_owned();
        }

        let had_content_length = header.contains("Content-Length");
        let mut out = Header::new();
        for (name, value) in header.iter() {
            if name.eq_ignore_ascii_case("Location") {
                let location = to_absolute_url(value, url);
                out.append(name, to_relative_or_patch_url(&location, &server_base));
            } else if name.eq_ignore_ascii_case("Strict-Transport-Security") {
                self.set_strict_transport_security(url, value.contains("includeSubDomains"));
            } else if !iequals_any(
                name,
                &[
                    "Content-Length",
                    "Set-Cookie",
                    "Connection",
                    "Link",
                    "Transfer-Encoding",
                    "Access-Control-Allow-Origin",
                    "Timing-Allow-Origin",
                    "Content-Security-Policy",
                    "Content-Security-Policy-Report-Only",
                    "Cache-Control",
                ],
            ) {
                out.append(name, value);
            }
        }
        if had_content_length {
            out.append("Content-Length", body.len().to_string());
        }
        if let Some(origin) = request.header.get("Origin") {
            out.append("Access-Control-Allow-Origin", origin);
            out.append("Access-Control-Allow-Credentials", "true");
        }
        // the browser cache must never shadow the archive
        out.append("Cache-Control", "no-store");
        out.append("Connection", "keep-alive");

        event::emit(Event::Served, url);
        ProxyResponse {
            status,
            header: out,
            body,
        }
    }

    /// During the single-threaded startup phase, redirects of the start URL
    /// move the server base; the first real response widens the worker gate
    /// and fires the ready callback.
    fn update_startup_phase(&self, url: &str, status: u16, header: &Header) {
        let mut startup = lock(&self.startup);
        if startup.complete {
            return;
        }
        if (300..400).contains(&status) {
            let base_path = self
                .bases
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .base_path
                .clone();
            if is_same_url(&base_path, url) {
                if let Some(location) = header.get("Location") {
                    let location = to_absolute_url(location, url);
                    let mut bases = self.bases.write().unwrap_or_else(|e| e.into_inner());
                    bases.base = get_scheme_hostname_port(&location).to_string();
                    bases.base_path = get_scheme_hostname_port_path(&location).to_string();
                    event::emit(Event::Redirect, &location);
                }
            }
        } else {
            startup.complete = true;
            self.startup_gate.add_permits(WORKER_THREADS - 1);
            if let Some(callback) = startup.ready_callback.take() {
                callback();
            }
        }
    }

    fn build_upstream_request(
        &self,
        request: &ProxyRequest,
        url: &str,
        cache_info: Option<&CacheInfo>,
    ) -> UpstreamRequest {
        let local_base = lock(&self.local_server_base).clone();
        let mut header = Header::new();
        for (name, value) in request.header.iter() {
            if name.eq_ignore_ascii_case("Origin") {
                let relative = unpatch_url(to_relative_url(value, &local_base));
                header.append(name, to_absolute_url(relative, url));
            } else if !iequals_any(name, &["Host", "Accept-Encoding", "Referer", "Connection"]) {
                header.append(name, value);
            }
        }
        header.append("Referer", get_scheme_hostname_port(url));

        let cookies = self.cookie_store.get_cookies_list(url);
        if !cookies.is_empty() {
            header.append("Cookie", cookies);
        }
        if let Some(info) = cache_info {
            if info.last_modified_time != 0 {
                header.append("If-Modified-Since", format_http_time(info.last_modified_time));
            }
            if !info.etag.is_empty() {
                header.append("If-None-Match", info.etag.clone());
            }
        }

        let timeout = if cache_info.is_some() {
            self.settings.refresh_timeout
        } else {
            self.settings.request_timeout
        };
        UpstreamRequest {
            url: url.to_string(),
            method: request.method.clone(),
            header,
            body: request.body.clone(),
            timeout,
        }
    }

    /// Records the header entry and queues the body write; entries already
    /// written this session are left alone. Bodiless entries (redirects) only
    /// get their header recorded.
    fn async_write_file(
        &self,
        identifying_url: &str,
        status: u16,
        header: &Header,
        data: Vec<u8>,
        response_time: i64,
        allow_lossy: bool,
    ) {
        let Some(writer) = &self.archive_writer else {
            return;
        };
        let filename = to_local_filename(identifying_url);
        let mut state = lock(&self.write_state);
        if writer.contains(&filename) {
            return;
        }
        state
            .header_writer
            .write(identifying_url, status, header.clone());
        if !data.is_empty() {
            writer.async_write(&filename, data, response_time, allow_lossy, |succeeded| {
                if !succeeded {
                    event::emit(Event::WritingFailed, "archive write");
                }
            });
        }
    }

    fn set_strict_transport_security(&self, url: &str, include_subdomains: bool) {
        let host = get_hostname_port(url).to_string();
        if host.is_empty() {
            return;
        }
        let mut state = lock(&self.write_state);
        if state.strict_transport_security.contains_key(&host) {
            return;
        }
        let pattern = url_to_regex(&format!("http://{host}"), include_subdomains);
        if let Ok(regex) = Regex::new(&pattern) {
            state.strict_transport_security.insert(host, regex);
        }
    }

    fn apply_strict_transport_security(&self, mut url: String) -> String {
        let state = lock(&self.write_state);
        for regex in state.strict_transport_security.values() {
            if regex.is_match(&url) {
                url.insert(4, 's');
                break;
            }
        }
        url
    }

    /// The close-time pass: copies entries of the input archive this session
    /// never requested, at the version the archive policy selects.
    fn append_unrequested_files(&self) {
        use webstash_core::policy::ArchivePolicy;

        if self.settings.archive_policy == ArchivePolicy::Requested {
            return;
        }
        let (Some(reader), Some(writer)) = (&self.archive_reader, &self.archive_writer) else {
            return;
        };
        let version = match self.settings.archive_policy {
            ArchivePolicy::First => Version::Top,
            _ => Version::Base,
        };

        for (identifying_url, entry) in self.header_reader.entries() {
            let filename = to_local_filename(identifying_url);
            if writer.contains(&filename) {
                continue;
            }
            if let Some(blocked) = &self.blocked_hosts {
                if blocked.contains(identifying_url) {
                    continue;
                }
            }
            let Some(data) = reader.read(&filename, version) else {
                continue;
            };
            if data.is_empty() {
                continue;
            }
            let modification_time = reader
                .get_file_info(&filename, version)
                .map(|info| info.modification_time)
                .unwrap_or(0);
            lock(&self.write_state).header_writer.write(
                identifying_url,
                entry.status,
                entry.header.clone(),
            );
            if !writer.write(&filename, &data, modification_time, false) {
                event::emit(Event::WritingFailed, &filename);
                continue;
            }

            if self.settings.archive_policy == ArchivePolicy::LatestAndFirst {
                if let Some(first) = reader.read(&filename, Version::Overlay) {
                    if !first.is_empty() && first != data {
                        let modification_time = reader
                            .get_file_info(&filename, Version::Overlay)
                            .map(|info| info.modification_time)
                            .unwrap_or(0);
                        writer.write(
                            &format!("{OVERLAY_PREFIX}{filename}"),
                            &first,
                            modification_time,
                            false,
                        );
                    }
                }
            }
        }
    }

    /// Runs once after the server stopped: the append pass, the reserved
    /// keys, then the writer close and rename.
    pub fn finalize(&self) {
        self.append_unrequested_files();
        let Some(writer) = &self.archive_writer else {
            return;
        };

        let uid = {
            let mut uid = lock(&self.uid);
            if uid.is_empty() {
                *uid = generate_uid();
            }
            uid.clone()
        };
        writer.write("uid", uid.as_bytes(), 0, false);
        let headers = lock(&self.write_state).header_writer.serialize();
        writer.write("headers", headers.as_bytes(), 0, false);
        writer.write("cookies", self.cookie_store.serialize().as_bytes(), 0, false);

        if !writer.close() {
            event::emit(Event::WritingFailed, "closing the archive");
        }
    }
}

fn is_served_directly(status: u16) -> bool {
    // 304 and error statuses first try the archive; everything the client
    // can use (including redirects) is relayed as-is
    status != 304 && (200..400).contains(&status)
}

fn iequals_any(name: &str, names: &[&str]) -> bool {
    names.iter().any(|n| name.eq_ignore_ascii_case(n))
}

fn open_temporary_writer() -> Result<ArchiveWriter> {
    let mut last_error = None;
    for _ in 0..6 {
        match ArchiveWriter::open(generate_temporary_filename()) {
            Ok(writer) => return Ok(writer),
            Err(error) => last_error = Some(error),
        }
    }
    Err(last_error
        .unwrap_or_else(|| Error::Archive("opening a temporary file failed".into())))
}

fn generate_temporary_filename() -> PathBuf {
    let mut rng = rand::thread_rng();
    let digits: String = (0..10)
        .map(|_| char::from(b'0' + rng.gen_range(0..10)))
        .collect();
    std::env::temp_dir().join(format!("webstash_{digits}.tmp"))
}

/// 16 hex digits; the first byte stays below 0x80 so the id reads as a
/// positive 64-bit value everywhere.
fn generate_uid() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    bytes[0] &= 0x7f;
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
