use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Atomic file persistence used by the [`Serializator`](super::Serializator).
///
/// Content is first written to a temporary file with [`write_temp`](Self::write_temp), and then
/// moved into place with [`commit`](Self::commit). Readers never observe a partially written
/// file at the committed path.
pub trait AtomicFileStore: Send + Sync + 'static {
    /// A handle to fully written, but not yet committed content.
    ///
    /// Dropping the handle without committing it discards the content.
    type Temp: Send + 'static;

    /// Writes `bytes` to a new temporary file.
    fn write_temp(&self, bytes: &[u8]) -> io::Result<Self::Temp>;

    /// Atomically replaces the file at `path` with the content of `temp`.
    fn commit(&self, temp: Self::Temp, path: &Path) -> io::Result<()>;

    /// Reads the whole file at `path`.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// An [`AtomicFileStore`] on the local file system.
///
/// Temporary files are created in a dedicated directory, which has to be on the same file system
/// as the committed files so that the final rename is atomic.
#[derive(Debug, Clone)]
pub struct FsStore {
    tmp_dir: PathBuf,
}

impl FsStore {
    /// Creates a store that keeps its temporary files in `tmp_dir`.
    pub fn new(tmp_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let tmp_dir = tmp_dir.into();
        std::fs::create_dir_all(&tmp_dir)?;
        Ok(Self { tmp_dir })
    }

    /// The directory holding temporary files.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Removes all leftover temporary files.
    ///
    /// Temporary files are deleted when dropped, but a crashing process may leave some behind.
    /// This should only be called when no writes are in progress.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        std::fs::create_dir_all(&self.tmp_dir)
    }

    /// Create a new temporary file in the temp directory.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        let path = &self.tmp_dir;
        // The temp directory could be removed by `clear_tmp` in another process, so retry the
        // fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(path) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to create temp directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to create temp file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }
}

impl AtomicFileStore for FsStore {
    type Temp = NamedTempFile;

    fn write_temp(&self, bytes: &[u8]) -> io::Result<NamedTempFile> {
        let mut temp_file = self.tempfile()?;
        temp_file.write_all(bytes)?;
        temp_file.as_file().sync_data()?;
        Ok(temp_file)
    }

    fn commit(&self, temp: NamedTempFile, path: &Path) -> io::Result<()> {
        persist_tempfile(temp, path)?;
        tracing::trace!("Committed `{}`", path.display());
        Ok(())
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let bytes = std::fs::read(path)?;
        tracing::trace!("File `{}` length: {}", path.display(), bytes.len());
        Ok(bytes)
    }
}

/// Moves `temp_file` to `cache_path`, replacing any existing file.
fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<std::fs::File> {
    let parent = cache_path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Other,
            "no parent directory to persist item",
        )
    })?;

    // The target directory could be removed from under us, so retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to persist cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_entries(store: &FsStore) -> usize {
        std::fs::read_dir(store.tmp_dir()).unwrap().count()
    }

    #[test]
    fn test_write_commit_read() {
        serializator_test::setup();
        let dir = serializator_test::tempdir();
        let store = FsStore::new(dir.path().join("tmp")).unwrap();
        let path = dir.path().join("item.properties");

        let temp = store.write_temp(b"a=1\n").unwrap();
        assert_eq!(tmp_entries(&store), 1);
        assert!(!path.exists());

        store.commit(temp, &path).unwrap();
        assert_eq!(tmp_entries(&store), 0);
        assert_eq!(store.read(&path).unwrap(), b"a=1\n");

        let temp = store.write_temp(b"a=2\n").unwrap();
        store.commit(temp, &path).unwrap();
        assert_eq!(store.read(&path).unwrap(), b"a=2\n");
    }

    #[test]
    fn test_dropped_temp_is_discarded() {
        let dir = serializator_test::tempdir();
        let store = FsStore::new(dir.path().join("tmp")).unwrap();

        let temp = store.write_temp(b"never committed").unwrap();
        assert_eq!(tmp_entries(&store), 1);
        drop(temp);
        assert_eq!(tmp_entries(&store), 0);
    }

    #[test]
    fn test_read_missing() {
        let dir = serializator_test::tempdir();
        let store = FsStore::new(dir.path().join("tmp")).unwrap();

        let err = store.read(&dir.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_clear_tmp() {
        let dir = serializator_test::tempdir();
        let store = FsStore::new(dir.path().join("tmp")).unwrap();

        std::fs::write(store.tmp_dir().join("tmpleftover"), b"crashed").unwrap();
        let temp = store.write_temp(b"x").unwrap();
        assert_eq!(tmp_entries(&store), 2);

        store.clear_tmp().unwrap();
        assert_eq!(tmp_entries(&store), 0);
        assert!(store.tmp_dir().is_dir());
        drop(temp);
    }
}
