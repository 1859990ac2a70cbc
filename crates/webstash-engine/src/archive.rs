//! The ZIP-backed archive store.
//!
//! [`ArchiveReader`] serves random-access reads over an existing archive: the
//! central directory is pre-read once, and a pool of open handles is shared
//! between request workers. [`ArchiveWriter`] builds the output archive on a
//! single dedicated thread that drains a FIFO of closures; it can flip the
//! container between write and read mode to serve back entries written
//! earlier in the session, and renames the temporary file onto its final
//! target at close.
//!
//! Failures never panic; they surface as `false`/`None` and a completion
//! callback argument.

use crate::lossy::LossyCompressor;
use chrono::{Datelike, TimeZone, Timelike, Utc};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use webstash_core::header::now_epoch;
use webstash_core::urls::get_file_extension;
use webstash_core::{Error, Result};

/// Overlay prefix under which the first-archived version of a key is stored.
pub const OVERLAY_PREFIX: &str = "first/";

/// Which side of the overlay a read consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Overlay first, then the archive root.
    Top,
    /// Only the overlay.
    Overlay,
    /// Only the archive root.
    Base,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveFileInfo {
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub modification_time: i64,
}

fn is_likely_compressible(filename: &str) -> bool {
    let extension = get_file_extension(filename).to_ascii_lowercase();
    !matches!(
        extension.as_str(),
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "otf" | "woff" | "woff2"
    )
}

fn datetime_to_epoch(datetime: &zip::DateTime) -> i64 {
    Utc.with_ymd_and_hms(
        datetime.year() as i32,
        datetime.month() as u32,
        datetime.day() as u32,
        datetime.hour() as u32,
        datetime.minute() as u32,
        datetime.second() as u32,
    )
    .single()
    .map(|t| t.timestamp())
    .unwrap_or(0)
}

fn epoch_to_datetime(time: i64) -> zip::DateTime {
    let Some(time) = chrono::DateTime::<Utc>::from_timestamp(time, 0) else {
        return zip::DateTime::default();
    };
    zip::DateTime::from_date_and_time(
        time.year() as u16,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    )
    .unwrap_or_default()
}

//-------------------------------------------------------------------------

/// Read-only access to an existing archive.
pub struct ArchiveReader {
    path: PathBuf,
    directory: BTreeMap<String, ArchiveFileInfo>,
    overlay_path: Mutex<Option<String>>,
    handles: Mutex<Vec<zip::ZipArchive<BufReader<File>>>>,
}

impl ArchiveReader {
    /// Opens `path` and pre-reads the central directory.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Archive(format!("opening {} failed: {e}", path.display())))?;
        let mut archive = zip::ZipArchive::new(BufReader::new(file))
            .map_err(|e| Error::Archive(format!("reading {} failed: {e}", path.display())))?;

        let mut directory = BTreeMap::new();
        for index in 0..archive.len() {
            let Ok(entry) = archive.by_index_raw(index) else {
                continue;
            };
            directory.insert(
                entry.name().to_string(),
                ArchiveFileInfo {
                    compressed_size: entry.compressed_size(),
                    uncompressed_size: entry.size(),
                    modification_time: datetime_to_epoch(&entry.last_modified()),
                },
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            directory,
            overlay_path: Mutex::new(None),
            handles: Mutex::new(vec![archive]),
        })
    }

    /// Prefix consulted before the archive root by `Version::Top` reads.
    pub fn set_overlay_path(&self, prefix: impl Into<String>) {
        *lock(&self.overlay_path) = Some(prefix.into());
    }

    fn resolve(&self, filename: &str, version: Version) -> Option<String> {
        let overlay = lock(&self.overlay_path).clone();
        if version != Version::Base {
            if let Some(prefix) = &overlay {
                let overlaid = format!("{prefix}{filename}");
                if self.directory.contains_key(&overlaid) {
                    return Some(overlaid);
                }
            }
            if version == Version::Overlay {
                return None;
            }
        }
        self.directory
            .contains_key(filename)
            .then(|| filename.to_string())
    }

    pub fn contains(&self, filename: &str, version: Version) -> bool {
        self.resolve(filename, version).is_some()
    }

    pub fn get_file_info(&self, filename: &str, version: Version) -> Option<ArchiveFileInfo> {
        let resolved = self.resolve(filename, version)?;
        self.directory.get(&resolved).copied()
    }

    /// Reads a whole entry. `None` on a missing key or any container error.
    pub fn read(&self, filename: &str, version: Version) -> Option<Vec<u8>> {
        let resolved = self.resolve(filename, version)?;
        let mut archive = self.acquire_handle()?;
        let result = (|| {
            let mut entry = archive.by_name(&resolved).ok()?;
            let mut buffer = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buffer).ok()?;
            Some(buffer)
        })();
        lock(&self.handles).push(archive);
        result
    }

    /// Iterates the central directory in name order.
    pub fn for_each_file(&self, mut callback: impl FnMut(&str, &ArchiveFileInfo)) {
        for (name, info) in &self.directory {
            callback(name, info);
        }
    }

    fn acquire_handle(&self) -> Option<zip::ZipArchive<BufReader<File>>> {
        if let Some(handle) = lock(&self.handles).pop() {
            return Some(handle);
        }
        let file = File::open(&self.path).ok()?;
        zip::ZipArchive::new(BufReader::new(file)).ok()
    }
}

//-------------------------------------------------------------------------

enum Handle {
    Write(zip::ZipWriter<File>),
    Read(zip::ZipArchive<File>),
    Closed,
}

struct WriterState {
    handle: Handle,
    lossy_compressor: Option<LossyCompressor>,
}

type Task = Box<dyn FnOnce(&mut WriterState) + Send>;

/// Builds a new archive through a single dedicated writer thread.
pub struct ArchiveWriter {
    path: PathBuf,
    state: Arc<Mutex<WriterState>>,
    /// Keys written so far with their modification times; duplicate keys and
    /// keys with a leading slash are refused.
    filenames: Mutex<BTreeMap<String, i64>>,
    tasks: Mutex<Option<mpsc::Sender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    move_on_close: Mutex<Option<(PathBuf, bool)>>,
}

impl ArchiveWriter {
    /// Creates `path` and starts the writer thread.
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Archive(format!("creating {} failed: {e}", path.display())))?;

        let state = Arc::new(Mutex::new(WriterState {
            handle: Handle::Write(zip::ZipWriter::new(file)),
            lossy_compressor: None,
        }));

        let (sender, receiver) = mpsc::channel::<Task>();
        let thread_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("webstash-archive-writer".into())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    let mut state = lock(&thread_state);
                    task(&mut state);
                }
            })
            .map_err(|e| Error::Archive(format!("starting writer thread failed: {e}")))?;

        Ok(Self {
            path,
            state,
            filenames: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
            move_on_close: Mutex::new(None),
        })
    }

    /// Where to rename the temporary file at close; with `overwrite` false an
    /// existing target gets a `" [N]"` suffix instead.
    pub fn move_on_close(&self, target: PathBuf, overwrite: bool) {
        *lock(&self.move_on_close) = Some((target, overwrite));
    }

    pub fn set_lossy_compressor(&self, compressor: LossyCompressor) {
        lock(&self.state).lossy_compressor = Some(compressor);
    }

    pub fn contains(&self, filename: &str) -> bool {
        lock(&self.filenames).contains_key(filename)
    }

    /// Synchronous write. Refuses duplicate keys and keys with a leading
    /// slash.
    pub fn write(&self, filename: &str, data: &[u8], modification_time: i64, allow_lossy: bool) -> bool {
        if !self.insert_filename(filename, modification_time) {
            return false;
        }
        let mut state = lock(&self.state);
        do_write(&mut state, filename, data, modification_time, allow_lossy)
    }

    /// Queues a write onto the writer thread; `on_complete` receives the
    /// outcome.
    pub fn async_write(
        &self,
        filename: &str,
        data: Vec<u8>,
        modification_time: i64,
        allow_lossy: bool,
        on_complete: impl FnOnce(bool) + Send + 'static,
    ) {
        if !self.insert_filename(filename, modification_time) {
            on_complete(false);
            return;
        }
        let filename = filename.to_string();
        self.enqueue(Box::new(move |state| {
            let succeeded = do_write(state, &filename, &data, modification_time, allow_lossy);
            on_complete(succeeded);
        }));
    }

    /// Queues a read-back of an entry written earlier this session. The
    /// container flips to read mode for the duration of the task.
    pub fn async_read(
        &self,
        filename: &str,
        on_complete: impl FnOnce(Option<(Vec<u8>, i64)>) + Send + 'static,
    ) {
        let modification_time = lock(&self.filenames).get(filename).copied();
        let filename = filename.to_string();
        self.enqueue(Box::new(move |state| {
            let result = (|| {
                let modification_time = modification_time?;
                if !reopen(state, true) {
                    return None;
                }
                let Handle::Read(archive) = &mut state.handle else {
                    return None;
                };
                let mut entry = archive.by_name(&filename).ok()?;
                let mut buffer = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut buffer).ok()?;
                Some((buffer, modification_time))
            })();
            on_complete(result);
        }));
    }

    /// Drains the queue, joins the thread, finalizes the container and
    /// resolves the close-time rename.
    pub fn close(&self) -> bool {
        drop(lock(&self.tasks).take());
        if let Some(thread) = lock(&self.thread).take() {
            let _ = thread.join();
        }

        let finalized = {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut state.handle, Handle::Closed) {
                Handle::Write(mut writer) => writer.finish().is_ok(),
                Handle::Read(_) => true,
                Handle::Closed => return true,
            }
        };
        if !finalized {
            return false;
        }

        let Some((target, overwrite)) = lock(&self.move_on_close).clone() else {
            return true;
        };
        let Some(target) = resolve_collision(&target, overwrite) else {
            return false;
        };
        move_file(&self.path, &target)
    }

    fn insert_filename(&self, filename: &str, modification_time: i64) -> bool {
        if filename.starts_with('/') {
            return false;
        }
        let mut filenames = lock(&self.filenames);
        if filenames.contains_key(filename) {
            return false;
        }
        filenames.insert(filename.to_string(), modification_time);
        true
    }

    fn enqueue(&self, task: Task) {
        if let Some(sender) = lock(&self.tasks).as_ref() {
            let _ = sender.send(task);
        }
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        drop(lock(&self.tasks).take());
        if let Some(thread) = lock(&self.thread).take() {
            let _ = thread.join();
        }
    }
}

fn do_write(
    state: &mut WriterState,
    filename: &str,
    data: &[u8],
    modification_time: i64,
    allow_lossy: bool,
) -> bool {
    if !reopen(state, false) {
        return false;
    }

    let mut stored = !is_likely_compressible(filename);
    let mut compressed = None;
    if allow_lossy {
        if let Some(compressor) = &state.lossy_compressor {
            if let Some(smaller) = compressor.try_compress(data) {
                compressed = Some(smaller);
                stored = true;
            }
        }
    }
    let data = compressed.as_deref().unwrap_or(data);

    let modification_time = if modification_time == 0 {
        now_epoch()
    } else {
        modification_time
    };
    let method = if stored {
        zip::CompressionMethod::Stored
    } else {
        zip::CompressionMethod::Deflated
    };
    let options = zip::write::FileOptions::default()
        .compression_method(method)
        .last_modified_time(epoch_to_datetime(modification_time));

    let Handle::Write(writer) = &mut state.handle else {
        return false;
    };
    if writer.start_file(filename, options).is_err() {
        return false;
    }
    writer.write_all(data).is_ok()
}

/// Flips the container between write and read mode; `true` when the desired
/// mode is active afterwards.
fn reopen(state: &mut WriterState, for_reading: bool) -> bool {
    match (&state.handle, for_reading) {
        (Handle::Write(_), false) | (Handle::Read(_), true) => return true,
        (Handle::Closed, _) => return false,
        _ => {}
    }
    let handle = std::mem::replace(&mut state.handle, Handle::Closed);
    state.handle = match handle {
        Handle::Write(mut writer) => match writer.finish().map(zip::ZipArchive::new) {
            Ok(Ok(archive)) => Handle::Read(archive),
            _ => Handle::Closed,
        },
        Handle::Read(archive) => match zip::ZipWriter::new_append(archive.into_inner()) {
            Ok(writer) => Handle::Write(writer),
            Err(_) => Handle::Closed,
        },
        Handle::Closed => Handle::Closed,
    };
    matches!(
        (&state.handle, for_reading),
        (Handle::Write(_), false) | (Handle::Read(_), true)
    )
}

fn resolve_collision(target: &Path, overwrite: bool) -> Option<PathBuf> {
    if !target.exists() {
        return Some(target.to_path_buf());
    }
    if overwrite {
        return std::fs::remove_file(target)
            .ok()
            .map(|_| target.to_path_buf());
    }
    for n in 2..100 {
        let mut renamed = target.as_os_str().to_os_string();
        renamed.push(format!(" [{n}]"));
        let renamed = PathBuf::from(renamed);
        if !renamed.exists() {
            return Some(renamed);
        }
    }
    None
}

fn move_file(source: &Path, target: &Path) -> bool {
    if std::fs::rename(source, target).is_ok() {
        return true;
    }
    // cross-filesystem fallback
    if std::fs::copy(source, target).is_err() {
        return false;
    }
    let _ = std::fs::remove_file(source);
    true
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn temp_archive(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_archive(&dir, "out.zip");

        let writer = ArchiveWriter::open(path.clone()).unwrap();
        assert!(writer.write("http/a.com/index", b"<html>hi</html>", 1_600_000_000, false));
        assert!(writer.write("http/a.com/logo.png", b"not-really-a-png", 0, false));
        assert!(writer.close());

        let reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(
            reader.read("http/a.com/index", Version::Base).as_deref(),
            Some(b"<html>hi</html>".as_slice())
        );
        let info = reader.get_file_info("http/a.com/index", Version::Base).unwrap();
        assert_eq!(info.uncompressed_size, 15);
        assert_eq!(info.modification_time, 1_600_000_000);
        assert_eq!(reader.read("missing", Version::Base), None);
    }

    #[test]
    fn duplicate_and_absolute_keys_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArchiveWriter::open(temp_archive(&dir, "out.zip")).unwrap();
        assert!(writer.write("key", b"first", 0, false));
        assert!(!writer.write("key", b"second", 0, false));
        assert!(!writer.write("/rooted", b"data", 0, false));
        assert!(writer.contains("key"));
        assert!(!writer.contains("/rooted"));
        assert!(writer.close());
    }

    #[test]
    fn async_write_completes_in_queue_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_archive(&dir, "out.zip");
        let writer = ArchiveWriter::open(path.clone()).unwrap();

        let (sender, receiver) = channel();
        for n in 0..10 {
            let sender = sender.clone();
            writer.async_write(
                &format!("file-{n}"),
                vec![n as u8; 32],
                0,
                false,
                move |succeeded| {
                    sender.send((n, succeeded)).unwrap();
                },
            );
        }
        let order: Vec<_> = receiver.iter().take(10).collect();
        assert_eq!(order, (0..10).map(|n| (n, true)).collect::<Vec<_>>());
        assert!(writer.close());

        let reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.read("file-7", Version::Base), Some(vec![7u8; 32]));
    }

    #[test]
    fn mode_flips_between_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_archive(&dir, "out.zip");
        let writer = ArchiveWriter::open(path.clone()).unwrap();

        assert!(writer.write("one", b"first body", 123_456_789, false));

        let (sender, receiver) = channel();
        writer.async_read("one", move |result| {
            sender.send(result).unwrap();
        });
        let (data, mtime) = receiver.recv().unwrap().unwrap();
        assert_eq!(data, b"first body");
        assert_eq!(mtime, 123_456_789);

        // writing still works after the container was flipped to read mode
        assert!(writer.write("two", b"second body", 0, false));
        assert!(writer.close());

        let reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.read("one", Version::Base).as_deref(), Some(b"first body".as_slice()));
        assert_eq!(reader.read("two", Version::Base).as_deref(), Some(b"second body".as_slice()));
    }

    #[test]
    fn async_read_of_unknown_key_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArchiveWriter::open(temp_archive(&dir, "out.zip")).unwrap();
        let (sender, receiver) = channel();
        writer.async_read("nope", move |result| {
            sender.send(result).unwrap();
        });
        assert_eq!(receiver.recv().unwrap(), None);
        assert!(writer.close());
    }

    #[test]
    fn overlay_reads_prefer_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_archive(&dir, "out.zip");
        let writer = ArchiveWriter::open(path.clone()).unwrap();
        writer.write("page", b"latest", 0, false);
        writer.write("first/page", b"oldest", 0, false);
        writer.write("only-base", b"base", 0, false);
        assert!(writer.close());

        let reader = ArchiveReader::open(&path).unwrap();
        reader.set_overlay_path(OVERLAY_PREFIX);
        assert_eq!(reader.read("page", Version::Top).as_deref(), Some(b"oldest".as_slice()));
        assert_eq!(reader.read("page", Version::Overlay).as_deref(), Some(b"oldest".as_slice()));
        assert_eq!(reader.read("page", Version::Base).as_deref(), Some(b"latest".as_slice()));
        assert_eq!(reader.read("only-base", Version::Top).as_deref(), Some(b"base".as_slice()));
        assert_eq!(reader.read("only-base", Version::Overlay), None);
    }

    #[test]
    fn close_renames_onto_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let temp = temp_archive(&dir, "session.tmp");
        let target = temp_archive(&dir, "session.zip");

        let writer = ArchiveWriter::open(temp.clone()).unwrap();
        writer.move_on_close(target.clone(), true);
        writer.write("key", b"data", 0, false);
        assert!(writer.close());

        assert!(!temp.exists());
        assert!(target.exists());
        let reader = ArchiveReader::open(&target).unwrap();
        assert_eq!(reader.read("key", Version::Base).as_deref(), Some(b"data".as_slice()));
    }

    #[test]
    fn close_overwrites_or_renames_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let target = temp_archive(&dir, "session.zip");
        std::fs::write(&target, b"occupied").unwrap();

        // overwrite=false side-steps to "session.zip [2]"
        let writer = ArchiveWriter::open(temp_archive(&dir, "a.tmp")).unwrap();
        writer.move_on_close(target.clone(), false);
        writer.write("key", b"data", 0, false);
        assert!(writer.close());
        assert_eq!(std::fs::read(&target).unwrap(), b"occupied");
        let renamed = dir.path().join("session.zip [2]");
        assert!(renamed.exists());

        // overwrite=true replaces the occupant
        let writer = ArchiveWriter::open(temp_archive(&dir, "b.tmp")).unwrap();
        writer.move_on_close(target.clone(), true);
        writer.write("key", b"data", 0, false);
        assert!(writer.close());
        let reader = ArchiveReader::open(&target).unwrap();
        assert!(reader.contains("key", Version::Base));
    }

    #[test]
    fn stored_entries_for_precompressed_extensions() {
        assert!(!is_likely_compressible("http/a.com/photo.JPG"));
        assert!(!is_likely_compressible("http/a.com/font.woff2"));
        assert!(is_likely_compressible("http/a.com/index"));
        assert!(is_likely_compressible("http/a.com/script.js"));
    }

    #[test]
    fn zip_timestamps_roundtrip() {
        let epoch = 1_600_000_000;
        assert_eq!(datetime_to_epoch(&epoch_to_datetime(epoch)), epoch);
        // out-of-range times fall back to the container's default
        let fallback = epoch_to_datetime(-1);
        let default = zip::DateTime::default();
        assert_eq!(
            (fallback.datepart(), fallback.timepart()),
            (default.datepart(), default.timepart())
        );
    }

    #[test]
    fn concurrent_reads_share_the_handle_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_archive(&dir, "out.zip");
        let writer = ArchiveWriter::open(path.clone()).unwrap();
        for n in 0..20 {
            writer.write(&format!("file-{n}"), format!("body-{n}").as_bytes(), 0, false);
        }
        assert!(writer.close());

        let reader = Arc::new(ArchiveReader::open(&path).unwrap());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let reader = Arc::clone(&reader);
                std::thread::spawn(move || {
                    for n in 0..20 {
                        let data = reader.read(&format!("file-{n}"), Version::Base).unwrap();
                        assert_eq!(data, format!("body-{n}").into_bytes(), "thread {t}");
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }
}
