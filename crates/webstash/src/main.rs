use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use webstash_core::event::{self, Event};
use webstash_core::urls::{filename_from_url, get_legal_filename, get_scheme_hostname_port, url_from_input};
use webstash_core::{ArchivePolicy, DownloadPolicy, ServePolicy, Settings};
use webstash_engine::client::HttpClient;
use webstash_engine::{server, Engine};

#[derive(Parser, Debug)]
#[command(name = "webstash")]
#[command(about = "Record and replay browsing sessions through a local proxy", long_about = None)]
struct Cli {
    /// Initial request URL.
    #[arg(short = 'u', long = "url")]
    url: Option<String>,

    /// Input and output archive.
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,

    /// Input archive.
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,

    /// Output archive.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Download policy. Allowed: standard, always, never
    #[arg(short = 'd', long = "download", default_value = "standard")]
    download: String,

    /// Serve policy. Allowed: latest, last-archived, first-archived
    #[arg(short = 's', long = "serve", default_value = "latest")]
    serve: String,

    /// Archive policy. Allowed: latest, first, latest-and-first, requested
    #[arg(short = 'a', long = "archive", default_value = "latest")]
    archive: String,

    /// Upstream timeout in seconds when revalidating an archived response.
    #[arg(long = "refresh-timeout", default_value_t = 1)]
    refresh_timeout: u64,

    /// Upstream timeout in seconds for fresh downloads.
    #[arg(long = "request-timeout", default_value_t = 5)]
    request_timeout: u64,

    /// Block hosts listed in a hosts-format file (repeatable).
    #[arg(long = "block-hosts-file")]
    block_hosts_file: Vec<PathBuf>,

    /// Inject this JavaScript file into every HTML page.
    #[arg(long = "inject-js-file")]
    inject_js_file: Option<PathBuf>,

    /// HTTP/SOCKS proxy for upstream fetches (host[:port] or URL).
    #[arg(long = "proxy", env = "HTTP_PROXY")]
    proxy: Option<String>,

    /// Allow lossy recompression of big images.
    #[arg(long = "allow-lossy-compression")]
    allow_lossy_compression: bool,

    /// Patch the base tag so URLs stay relative to the original host.
    #[arg(long = "patch-base-tag")]
    patch_base_tag: bool,

    /// Open a browser on the local server URL.
    #[arg(long = "open-browser")]
    open_browser: bool,

    /// Verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// URL to record, or an archive file to replay.
    #[arg(value_name = "URL_OR_FILE")]
    target: Option<String>,
}

fn parse_download_policy(value: &str) -> anyhow::Result<DownloadPolicy> {
    Ok(match value {
        "standard" => DownloadPolicy::Standard,
        "always" => DownloadPolicy::Always,
        "never" => DownloadPolicy::Never,
        other => bail!("invalid download policy: {other}"),
    })
}

fn parse_serve_policy(value: &str) -> anyhow::Result<ServePolicy> {
    Ok(match value {
        "latest" => ServePolicy::Latest,
        "last-archived" => ServePolicy::LastArchived,
        "first-archived" => ServePolicy::FirstArchived,
        other => bail!("invalid serve policy: {other}"),
    })
}

fn parse_archive_policy(value: &str) -> anyhow::Result<ArchivePolicy> {
    Ok(match value {
        "latest" => ArchivePolicy::Latest,
        "first" => ArchivePolicy::First,
        "latest-and-first" => ArchivePolicy::LatestAndFirst,
        "requested" => ArchivePolicy::Requested,
        other => bail!("invalid archive policy: {other}"),
    })
}

/// Replaces filename characters that are illegal on common filesystems,
/// leaving any directory part untouched.
fn legalize_filename(path: PathBuf) -> PathBuf {
    match path.file_name().and_then(|name| name.to_str()) {
        Some(name) => {
            let legal = get_legal_filename(name);
            path.with_file_name(legal)
        }
        None => path,
    }
}

fn settings_from_cli(cli: Cli) -> anyhow::Result<Settings> {
    let mut settings = Settings {
        url: cli.url.as_deref().map(url_from_input),
        download_policy: parse_download_policy(&cli.download)?,
        serve_policy: parse_serve_policy(&cli.serve)?,
        archive_policy: parse_archive_policy(&cli.archive)?,
        refresh_timeout: Duration::from_secs(cli.refresh_timeout),
        request_timeout: Duration::from_secs(cli.request_timeout),
        block_hosts_files: cli.block_hosts_file,
        inject_js_file: cli.inject_js_file,
        proxy_server: cli.proxy,
        verbose: cli.verbose,
        allow_lossy_compression: cli.allow_lossy_compression,
        open_browser: cli.open_browser,
        patch_base_tag: cli.patch_base_tag,
        ..Settings::default()
    };

    if let Some(file) = cli.file {
        settings.input_file = Some(file.clone());
        settings.output_file = Some(file);
    }
    if let Some(input) = cli.input {
        settings.input_file = Some(input);
    }
    if let Some(output) = cli.output {
        settings.output_file = Some(output);
    }

    // the bare trailing argument is a URL or an archive file
    if let Some(target) = cli.target {
        let path = PathBuf::from(&target);
        if settings.url.is_none() && !path.exists() {
            settings.url = Some(url_from_input(&target));
        } else {
            settings.input_file = Some(path.clone());
            settings.output_file = Some(path);
        }
    }
    if let (Some(url), None, None) = (&settings.url, &settings.input_file, &settings.output_file) {
        let default = PathBuf::from(filename_from_url(url));
        settings.input_file = Some(default.clone());
        settings.output_file = Some(default);
    }

    settings.input_file = settings.input_file.take().map(legalize_filename);
    settings.output_file = settings.output_file.take().map(legalize_filename);

    if settings.input_file.is_none() && settings.output_file.is_none() {
        bail!("no URL and no archive file specified (see --help)");
    }
    // replay-only sessions need an existing input archive
    if let (None, Some(input)) = (&settings.url, &settings.input_file) {
        if !Path::new(input).exists() {
            bail!("input archive {} not found", input.display());
        }
    }
    Ok(settings)
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = settings_from_cli(cli)?;
    let client = Arc::new(HttpClient::new(settings.proxy_server.as_deref())?);
    let engine = Arc::new(Engine::new(settings, client)?);

    let listener = server::bind().await?;
    let port = listener.local_addr().context("reading local address")?.port();

    let start_url = engine.start_url().to_string();
    let path = &start_url[get_scheme_hostname_port(&start_url).len()..];
    let local_url = format!("http://127.0.0.1:{port}{path}");
    engine.set_local_server_url(&local_url);

    if engine.settings().open_browser {
        let browser_url = local_url.clone();
        engine.set_ready_callback(move || {
            event::emit(Event::Info, format!("session ready at {browser_url}"));
        });
        if let Err(error) = open::that_detached(&local_url) {
            event::emit(Event::Error, format!("opening browser failed: {error}"));
        }
    }

    server::run(Arc::clone(&engine), listener).await?;

    let finalize_engine = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || finalize_engine.finalize())
        .await
        .context("finalizing the archive")?;
    if let Some(output) = &engine.settings().output_file {
        event::emit(Event::Info, format!("session archived to {}", output.display()));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(error) = run(cli).await {
        event::emit(Event::Fatal, format!("{error:#}"));
        std::process::exit(1);
    }
}
