//! Streaming tarball extraction.
//!
//! An [`Archive`] walks the entries of a (by default gzip-compressed) tar
//! stream exactly once, in stream order, and hands every regular file that
//! passes its filter to an [`Unpacker`]. Nothing is buffered beyond the
//! entry currently being dispatched, except by [`MultiUnpacker`] which has to
//! replay each entry for every sink.

use crate::error::{PkgError, Result};
use flate2::read::MultiGzDecoder;
use std::cell::Cell;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Upper bound on the buffer reserved up front from a declared entry size.
const PREALLOC_LIMIT: u64 = 64 * 1024;

type NameFilter = Box<dyn Fn(&str) -> bool + Send>;
type NameTransform = Box<dyn Fn(&str) -> String + Send>;

/// Receives each accepted archive entry.
pub trait Unpacker {
    /// Consumes one entry. `size` is the size declared in the tar header.
    fn unpack(&mut self, name: &str, size: u64, reader: &mut dyn Read) -> Result<()>;
}

impl<U: Unpacker + ?Sized> Unpacker for Box<U> {
    fn unpack(&mut self, name: &str, size: u64, reader: &mut dyn Read) -> Result<()> {
        (**self).unpack(name, size, reader)
    }
}

/// Adapts a closure into an [`Unpacker`].
pub struct FnUnpacker<F>(F);

impl<F> Unpacker for FnUnpacker<F>
where
    F: FnMut(&str, u64, &mut dyn Read) -> Result<()>,
{
    fn unpack(&mut self, name: &str, size: u64, reader: &mut dyn Read) -> Result<()> {
        (self.0)(name, size, reader)
    }
}

/// Builds an [`Unpacker`] from a closure.
///
/// # Examples
///
/// ```
/// use fhirpkg_core::archive::{Unpacker, unpacker_fn};
///
/// let mut seen = Vec::new();
/// let mut sink = unpacker_fn(|name, _size, _reader| {
///     seen.push(name.to_string());
///     Ok(())
/// });
/// sink.unpack("package.json", 0, &mut std::io::empty()).unwrap();
/// drop(sink);
/// assert_eq!(seen, ["package.json"]);
/// ```
pub fn unpacker_fn<F>(f: F) -> FnUnpacker<F>
where
    F: FnMut(&str, u64, &mut dyn Read) -> Result<()>,
{
    FnUnpacker(f)
}

/// Fans every entry out to several sinks, in order.
///
/// The entry is read into memory once so each sink observes the full
/// contents. The first failing sink aborts the dispatch.
#[derive(Default)]
pub struct MultiUnpacker {
    sinks: Vec<Box<dyn Unpacker + Send>>,
}

impl MultiUnpacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Unpacker + Send + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn Unpacker + Send>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Unpacker for MultiUnpacker {
    fn unpack(&mut self, name: &str, size: u64, reader: &mut dyn Read) -> Result<()> {
        if let [sink] = self.sinks.as_mut_slice() {
            return sink.unpack(name, size, reader);
        }

        let mut buf = Vec::with_capacity(size.min(PREALLOC_LIMIT) as usize);
        reader.read_to_end(&mut buf)?;
        if (buf.len() as u64) < size {
            return Err(PkgError::Archive(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "entry {} ended after {} of {} declared bytes",
                    name,
                    buf.len(),
                    size
                ),
            )));
        }
        for sink in &mut self.sinks {
            sink.unpack(name, size, &mut buf.as_slice())?;
        }
        Ok(())
    }
}

/// Writes entries below a root directory.
///
/// Entry names are joined onto the root as-is. Names containing `..` or an
/// absolute path are not rejected, so callers unpacking untrusted archives
/// should flatten names first (as the cache does).
pub struct DiskUnpacker {
    root: PathBuf,
    observer: Option<Box<dyn FnMut(usize) + Send>>,
}

impl DiskUnpacker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            observer: None,
        }
    }

    /// Calls `observer` with the length of every chunk read from an entry.
    pub fn with_observer(mut self, observer: impl FnMut(usize) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Unpacker for DiskUnpacker {
    fn unpack(&mut self, name: &str, _size: u64, reader: &mut dyn Read) -> Result<()> {
        let target = self.root.join(name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = File::create(&target)?;
        match self.observer.as_mut() {
            Some(observer) => {
                let mut observed = ObservedReader {
                    inner: reader,
                    observer: observer.as_mut(),
                };
                io::copy(&mut observed, &mut file)?;
            }
            None => {
                io::copy(reader, &mut file)?;
            }
        }
        Ok(())
    }
}

struct ObservedReader<'a, R: ?Sized, F: ?Sized> {
    inner: &'a mut R,
    observer: &'a mut F,
}

impl<R, F> Read for ObservedReader<'_, R, F>
where
    R: Read + ?Sized,
    F: FnMut(usize) + ?Sized,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            (self.observer)(n);
        }
        Ok(n)
    }
}

/// Remembers whether a read from the archive itself failed, so errors
/// surfacing through a sink can be reported as archive corruption.
struct EntryReader<'a, R> {
    inner: R,
    failed: &'a Cell<bool>,
}

impl<R: Read> Read for EntryReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|_| self.failed.set(true))
    }
}

/// A tar stream plus the rules deciding which entries are dispatched.
///
/// # Examples
///
/// ```no_run
/// use fhirpkg_core::archive::{Archive, DiskUnpacker};
///
/// let file = std::fs::File::open("package.tgz").unwrap();
/// Archive::new(file)
///     .with_filter(|name| name.ends_with(".json"))
///     .with_transform(|name| name.rsplit('/').next().unwrap_or(name).to_string())
///     .unpack(&mut DiskUnpacker::new("out"))
///     .unwrap();
/// ```
pub struct Archive<R> {
    reader: R,
    gzip: bool,
    filter: NameFilter,
    transform: NameTransform,
}

impl<R: Read> Archive<R> {
    /// Wraps a gzip-compressed tar stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            gzip: true,
            filter: Box::new(accept_all),
            transform: Box::new(identity),
        }
    }

    /// Treats the input as an already decompressed tar stream.
    pub fn decompressed(mut self) -> Self {
        self.gzip = false;
        self
    }

    pub fn with_filter(mut self, filter: impl Fn(&str) -> bool + Send + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    pub fn with_transform(mut self, transform: impl Fn(&str) -> String + Send + 'static) -> Self {
        self.transform = Box::new(transform);
        self
    }

    /// Dispatches every accepted regular file to `sink`.
    ///
    /// # Errors
    ///
    /// Returns `PkgError::Archive` for a malformed tar or gzip stream, or the
    /// first error produced by `sink`.
    pub fn unpack(self, sink: &mut dyn Unpacker) -> Result<()> {
        let Self {
            reader,
            gzip,
            filter,
            transform,
        } = self;

        if gzip {
            dispatch(
                tar::Archive::new(MultiGzDecoder::new(reader)),
                &*filter,
                &*transform,
                sink,
            )
        } else {
            dispatch(tar::Archive::new(reader), &*filter, &*transform, sink)
        }
    }
}

fn accept_all(_name: &str) -> bool {
    true
}

fn identity(name: &str) -> String {
    name.to_string()
}

fn dispatch<T: Read>(
    mut archive: tar::Archive<T>,
    filter: &(dyn Fn(&str) -> bool + Send),
    transform: &(dyn Fn(&str) -> String + Send),
    sink: &mut dyn Unpacker,
) -> Result<()> {
    for entry in archive.entries().map_err(PkgError::Archive)? {
        let entry = entry.map_err(PkgError::Archive)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if !filter(&raw_name) {
            tracing::trace!("skipping archive entry {}", raw_name);
            continue;
        }

        let name = transform(&raw_name);
        let size = entry.size();
        let failed = Cell::new(false);
        let mut reader = EntryReader {
            inner: entry,
            failed: &failed,
        };

        match sink.unpack(&name, size, &mut reader) {
            Ok(()) => {}
            Err(PkgError::Io(e)) if failed.get() => return Err(PkgError::Archive(e)),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn tgz_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes(files)).unwrap();
        encoder.finish().unwrap()
    }

    fn collect(archive: Archive<&[u8]>) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        archive.unpack(&mut unpacker_fn(|name, _size, reader| {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            entries.push((name.to_string(), data));
            Ok(())
        }))?;
        Ok(entries)
    }

    #[test]
    fn test_unpack_all_entries_in_order() {
        let data = tgz_bytes(&[("package/a.json", b"{}"), ("package/b.txt", b"hello")]);
        let entries = collect(Archive::new(data.as_slice())).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "package/a.json");
        assert_eq!(entries[1], ("package/b.txt".to_string(), b"hello".to_vec()));
    }

    #[test]
    fn test_filter_and_transform() {
        let data = tgz_bytes(&[
            ("package/package.json", b"{\"name\":\"x\"}"),
            ("package/.index.json", b"{}"),
            ("package/other/Foo.json", b"{}"),
            ("package/readme.md", b"# x"),
        ]);
        let archive = Archive::new(data.as_slice())
            .with_filter(|name| name.ends_with(".json") && !name.ends_with(".index.json"))
            .with_transform(|name| name.rsplit('/').next().unwrap_or(name).to_string());

        let names: Vec<String> = collect(archive).unwrap().into_iter().map(|e| e.0).collect();
        assert_eq!(names, ["package.json", "Foo.json"]);
    }

    #[test]
    fn test_decompressed_input() {
        let data = tar_bytes(&[("a.json", b"[]")]);
        let entries = collect(Archive::new(data.as_slice()).decompressed()).unwrap();
        assert_eq!(entries, [("a.json".to_string(), b"[]".to_vec())]);
    }

    #[test]
    fn test_skips_directories() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_cksum();
        builder
            .append_data(&mut dir, "package/", std::io::empty())
            .unwrap();
        let mut file = tar::Header::new_gnu();
        file.set_size(2);
        file.set_mode(0o644);
        file.set_cksum();
        builder
            .append_data(&mut file, "package/x.json", &b"{}"[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        let entries = collect(Archive::new(data.as_slice()).decompressed()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "package/x.json");
    }

    #[test]
    fn test_corrupt_gzip_is_archive_error() {
        let data = b"definitely not a gzip stream".to_vec();
        let result = collect(Archive::new(data.as_slice()));
        assert!(matches!(result, Err(PkgError::Archive(_))));
    }

    #[test]
    fn test_truncated_stream_is_archive_error() {
        let payload = vec![b'x'; 64 * 1024];
        let data = tar_bytes(&[("package/big.json", &payload)]);
        let truncated = &data[..10_000];

        let dir = tempfile::tempdir().unwrap();
        let result = Archive::new(truncated)
            .decompressed()
            .unpack(&mut DiskUnpacker::new(dir.path()));
        assert!(matches!(result, Err(PkgError::Archive(_))));
    }

    #[test]
    fn test_sink_error_aborts() {
        let data = tgz_bytes(&[("a.json", b"{}"), ("b.json", b"{}")]);
        let mut calls = 0;
        let result = Archive::new(data.as_slice()).unpack(&mut unpacker_fn(|_, _, _| {
            calls += 1;
            Err(PkgError::invalid_arguments("stop"))
        }));

        assert!(matches!(result, Err(PkgError::InvalidArguments(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_disk_unpacker_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let data = tgz_bytes(&[("nested/dir/a.json", b"{\"a\":1}")]);

        Archive::new(data.as_slice())
            .unpack(&mut DiskUnpacker::new(dir.path()))
            .unwrap();

        let written = fs::read(dir.path().join("nested/dir/a.json")).unwrap();
        assert_eq!(written, b"{\"a\":1}");
    }

    #[test]
    fn test_disk_unpacker_truncates_existing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), b"much longer previous content").unwrap();
        let data = tgz_bytes(&[("a.json", b"{}")]);

        Archive::new(data.as_slice())
            .unpack(&mut DiskUnpacker::new(dir.path()))
            .unwrap();

        assert_eq!(fs::read(dir.path().join("a.json")).unwrap(), b"{}");
    }

    #[test]
    fn test_disk_unpacker_observer_counts_bytes() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let data = tgz_bytes(&[("a.json", &[b'1'; 300]), ("b.json", &[b'2'; 200])]);
        let total = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&total);

        Archive::new(data.as_slice())
            .unpack(
                &mut DiskUnpacker::new(dir.path()).with_observer(move |n| {
                    counter.fetch_add(n, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert_eq!(total.load(Ordering::SeqCst), 500);
    }

    #[test]
    fn test_multi_unpacker_replays_entry() {
        let dir = tempfile::tempdir().unwrap();
        let data = tgz_bytes(&[("a.json", b"{\"k\":true}")]);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_by_sink = std::sync::Arc::clone(&seen);

        let mut sink = MultiUnpacker::new()
            .with(unpacker_fn(move |name, size, reader| {
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;
                seen_by_sink
                    .lock()
                    .unwrap()
                    .push((name.to_string(), size, data.len()));
                Ok(())
            }))
            .with(DiskUnpacker::new(dir.path()));
        assert_eq!(sink.len(), 2);

        Archive::new(data.as_slice()).unpack(&mut sink).unwrap();

        assert_eq!(*seen.lock().unwrap(), [("a.json".to_string(), 10, 10)]);
        assert_eq!(
            fs::read(dir.path().join("a.json")).unwrap(),
            b"{\"k\":true}"
        );
    }

    #[test]
    fn test_multi_unpacker_rejects_oversized_declared_size() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(1 << 50);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "package/huge.json", &b"{}"[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        let mut sink = MultiUnpacker::new()
            .with(unpacker_fn(|_, _, _| Ok(())))
            .with(unpacker_fn(|_, _, _| Ok(())));
        let result = Archive::new(data.as_slice()).decompressed().unpack(&mut sink);

        assert!(matches!(result, Err(PkgError::Archive(_))), "got {result:?}");
    }

    #[test]
    fn test_concatenated_gzip_members() {
        use std::io::Write;

        let tar = tar_bytes(&[("a.json", b"{}"), ("b.json", b"[]")]);
        let (head, tail) = tar.split_at(512);
        let mut data = Vec::new();
        for part in [head, tail] {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(part).unwrap();
            data.extend(encoder.finish().unwrap());
        }

        let names: Vec<String> = collect(Archive::new(data.as_slice()))
            .unwrap()
            .into_iter()
            .map(|e| e.0)
            .collect();
        assert_eq!(names, ["a.json", "b.json"]);
    }
}
