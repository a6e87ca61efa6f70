//! Local library access
//!
//! All filesystem reads and writes under the library root go through
//! `LocalLibrary`. Relative paths are POSIX style and validated so nothing
//! escapes the root.
//!
//! Writes are atomic: content goes to a temporary file in the target's
//! directory, is synced, then renamed over the target. Temporary files
//! carry the `.folio-tmp` suffix and are ignored by scans and the watcher.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{SyncError, SyncResult};
use crate::hasher;
use crate::models::FileRecord;

/// Suffix of in-progress atomic writes
pub const TEMP_SUFFIX: &str = ".folio-tmp";

/// Local metadata for one path, without its hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub relative_path: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
}

/// Result of walking the library
#[derive(Debug, Default)]
pub struct Scan {
    pub entries: Vec<LocalEntry>,
    /// Paths that could not be read, or are neither file nor directory
    pub unreadable: Vec<(String, SyncError)>,
}

impl Scan {
    /// Whether `path` is, or lies beneath, an unreadable path
    pub fn covers(&self, path: &str) -> bool {
        self.unreadable.iter().any(|(bad, _)| {
            path == bad
                || path
                    .strip_prefix(bad.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    fn skip(&mut self, relative: String, error: SyncError) {
        warn!("Skipping {}: {}", relative, error);
        self.unreadable.push((relative, error));
    }
}

/// The local side of a library
#[derive(Debug, Clone)]
pub struct LocalLibrary {
    root: PathBuf,
}

impl LocalLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative library path to an absolute path under the root
    pub fn resolve(&self, relative: &str) -> SyncResult<PathBuf> {
        let relative = relative.trim_start_matches("./");
        if relative.is_empty() {
            return Err(SyncError::InvalidPath(relative.to_string()));
        }

        let mut resolved = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(SyncError::InvalidPath(relative.to_string())),
            }
        }
        Ok(resolved)
    }

    /// Convert an absolute path under the root to a relative library path
    pub fn relative(&self, path: &Path) -> Option<String> {
        let stripped = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = stripped
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// List every file and directory under the root
    ///
    /// An entry that cannot be read is recorded in `Scan::unreadable` and the
    /// walk goes on; only an unreadable root fails the scan.
    pub fn scan(&self) -> SyncResult<Scan> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root).map_err(|e| SyncError::io(&self.root, e))?;
        }

        let mut scan = Scan::default();
        for entry in WalkDir::new(&self.root).min_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let depth = e.depth();
                    let path = e
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.clone());
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                    let not_found = source.kind() == std::io::ErrorKind::NotFound;
                    let error = SyncError::io(&path, source);
                    match self.relative(&path) {
                        // Deleted while we were walking
                        Some(_) if not_found => debug!("{} vanished during scan", path.display()),
                        Some(relative) if depth > 0 => scan.skip(relative, error),
                        _ => return Err(error),
                    }
                    continue;
                }
            };

            if is_temporary(entry.path()) || entry.path_is_symlink() {
                continue;
            }
            let Some(relative_path) = self.relative(entry.path()) else {
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    let source: std::io::Error = e.into();
                    if source.kind() != std::io::ErrorKind::NotFound {
                        scan.skip(relative_path, SyncError::io(entry.path(), source));
                    }
                    continue;
                }
            };
            if !metadata.is_file() && !metadata.is_dir() {
                scan.skip(relative_path, not_regular(entry.path()));
                continue;
            }

            match modified_time(&metadata, entry.path()) {
                Ok(modified_time) => scan.entries.push(LocalEntry {
                    relative_path,
                    is_directory: metadata.is_dir(),
                    size: if metadata.is_dir() { 0 } else { metadata.len() },
                    modified_time,
                }),
                Err(error) => scan.skip(relative_path, error),
            }
        }

        scan
            .entries
            .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(scan)
    }

    /// Get local metadata for one path
    ///
    /// `None` if nothing is there, or if it is neither a file nor a directory.
    pub fn entry(&self, relative: &str) -> SyncResult<Option<LocalEntry>> {
        let path = self.resolve(relative)?;
        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io(&path, e)),
        };
        if !metadata.is_file() && !metadata.is_dir() {
            debug!("Ignoring special file {}", path.display());
            return Ok(None);
        }

        Ok(Some(LocalEntry {
            relative_path: relative.to_string(),
            is_directory: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified_time: modified_time(&metadata, &path)?,
        }))
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.resolve(relative).map(|p| p.exists()).unwrap_or(false)
    }

    /// Resolve a path that must be a regular file; opening a FIFO would block
    fn regular_file(&self, relative: &str) -> SyncResult<PathBuf> {
        let path = self.resolve(relative)?;
        let metadata = fs::metadata(&path).map_err(|e| SyncError::io(&path, e))?;
        if metadata.is_file() {
            Ok(path)
        } else {
            Err(not_regular(&path))
        }
    }

    /// Hash a local file
    pub fn hash(&self, relative: &str) -> SyncResult<String> {
        let path = self.regular_file(relative)?;
        hasher::hash_file(&path)
    }

    /// Read a file's content together with its record
    pub fn read(&self, relative: &str) -> SyncResult<(FileRecord, Vec<u8>)> {
        let path = self.regular_file(relative)?;
        let content = fs::read(&path).map_err(|e| SyncError::io(&path, e))?;
        let metadata = fs::metadata(&path).map_err(|e| SyncError::io(&path, e))?;

        let record = FileRecord::file(
            relative,
            content.len() as u64,
            modified_time(&metadata, &path)?,
            hasher::hash_bytes(&content),
        );
        Ok((record, content))
    }

    /// Write content atomically, creating parent directories as needed
    ///
    /// When `modified` is given the file's modification time is set to it,
    /// so both sides agree on timestamps after a download.
    pub fn write_atomic(
        &self,
        relative: &str,
        content: &[u8],
        modified: Option<DateTime<Utc>>,
    ) -> SyncResult<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
        }

        let temp_path = temp_path_for(&path);
        let result = write_temp(&temp_path, content, modified)
            .and_then(|_| fs::rename(&temp_path, &path).map_err(|e| SyncError::io(&path, e)));

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result?;

        debug!("Wrote {} ({} bytes)", relative, content.len());
        Ok(())
    }

    pub fn create_dir(&self, relative: &str) -> SyncResult<()> {
        let path = self.resolve(relative)?;
        fs::create_dir_all(&path).map_err(|e| SyncError::io(&path, e))
    }

    /// Remove a file or directory tree
    ///
    /// Returns `false` if nothing was there.
    pub fn remove(&self, relative: &str) -> SyncResult<bool> {
        let path = self.resolve(relative)?;
        let metadata = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(SyncError::io(&path, e)),
        };

        if metadata.is_dir() {
            fs::remove_dir_all(&path).map_err(|e| SyncError::io(&path, e))?;
        } else {
            fs::remove_file(&path).map_err(|e| SyncError::io(&path, e))?;
        }
        Ok(true)
    }

    /// Copy a file to another library path, keeping the source untouched
    pub fn copy(&self, from: &str, to: &str) -> SyncResult<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
        }
        fs::copy(&source, &target).map_err(|e| SyncError::io(&source, e))?;
        Ok(())
    }
}

fn not_regular(path: &Path) -> SyncError {
    SyncError::io(path, std::io::Error::other("not a regular file"))
}

/// Check whether a path is an in-progress atomic write
pub fn is_temporary(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}{}", name, TEMP_SUFFIX))
}

fn write_temp(temp_path: &Path, content: &[u8], modified: Option<DateTime<Utc>>) -> SyncResult<()> {
    let mut file = File::create(temp_path).map_err(|e| SyncError::io(temp_path, e))?;
    file.write_all(content)
        .map_err(|e| SyncError::io(temp_path, e))?;
    if let Some(modified) = modified {
        file.set_modified(SystemTime::from(modified))
            .map_err(|e| SyncError::io(temp_path, e))?;
    }
    file.sync_all().map_err(|e| SyncError::io(temp_path, e))
}

fn modified_time(metadata: &fs::Metadata, path: &Path) -> SyncResult<DateTime<Utc>> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .map_err(|e| SyncError::io(path, e))
}

/// Create a named pipe for tests
#[cfg(all(test, unix))]
pub(crate) fn make_fifo(path: &Path) {
    let status = std::process::Command::new("mkfifo")
        .arg(path)
        .status()
        .unwrap();
    assert!(status.success());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_rejects_escapes() {
        let library = LocalLibrary::new("/lib");

        assert_eq!(
            library.resolve("notes/a.md").unwrap(),
            PathBuf::from("/lib/notes/a.md")
        );
        assert!(matches!(library.resolve(""), Err(SyncError::InvalidPath(_))));
        assert!(matches!(
            library.resolve("../etc/passwd"),
            Err(SyncError::InvalidPath(_))
        ));
        assert!(matches!(
            library.resolve("/etc/passwd"),
            Err(SyncError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_relative_uses_posix_separators() {
        let library = LocalLibrary::new("/lib");
        assert_eq!(
            library.relative(Path::new("/lib/notes/deep/a.md")),
            Some("notes/deep/a.md".to_string())
        );
        assert_eq!(library.relative(Path::new("/lib")), None);
        assert_eq!(library.relative(Path::new("/other/a.md")), None);
    }

    #[test]
    fn test_scan_lists_files_and_directories() {
        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());

        library.write_atomic("notes/a.md", b"alpha", None).unwrap();
        library.write_atomic("b.md", b"beta!", None).unwrap();
        fs::write(temp_dir.path().join(".c.md.folio-tmp"), b"partial").unwrap();

        let scan = library.scan().unwrap();
        assert!(scan.unreadable.is_empty());
        let entries = scan.entries;
        let paths: Vec<_> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["b.md", "notes", "notes/a.md"]);

        let notes = entries.iter().find(|e| e.relative_path == "notes").unwrap();
        assert!(notes.is_directory);
        let a = entries
            .iter()
            .find(|e| e.relative_path == "notes/a.md")
            .unwrap();
        assert_eq!(a.size, 5);
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_reports_special_files_without_opening_them() {
        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());
        library.write_atomic("a.md", b"alpha", None).unwrap();
        make_fifo(&temp_dir.path().join("pipe"));

        let scan = library.scan().unwrap();
        let paths: Vec<_> = scan
            .entries
            .iter()
            .map(|e| e.relative_path.as_str())
            .collect();
        assert_eq!(paths, vec!["a.md"]);
        assert_eq!(scan.unreadable.len(), 1);
        assert_eq!(scan.unreadable[0].0, "pipe");
        assert!(scan.covers("pipe"));
        assert!(!scan.covers("pipeline.md"));

        // Would block forever if the pipe were opened
        assert!(library.hash("pipe").is_err());
        assert!(library.read("pipe").is_err());
        assert!(library.entry("pipe").unwrap().is_none());
        assert!(library.exists("pipe"));
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_continues_past_unreadable_directory() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());
        library.write_atomic("locked/inner.md", b"x", None).unwrap();
        library.write_atomic("open.md", b"y", None).unwrap();
        let locked = temp_dir.path().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Privileged users read through the mode bits
        let privileged = fs::read_dir(&locked).is_ok();
        let scan = library.scan();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        let scan = scan.unwrap();

        assert!(scan.entries.iter().any(|e| e.relative_path == "open.md"));
        if !privileged {
            assert!(scan.covers("locked"));
            assert!(scan.covers("locked/inner.md"));
            assert!(!scan.covers("open.md"));
        }
    }

    #[test]
    fn test_write_atomic_sets_modified_time() {
        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());
        let modified = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        library
            .write_atomic("deep/er/a.md", b"content", Some(modified))
            .unwrap();

        let entry = library.entry("deep/er/a.md").unwrap().unwrap();
        assert_eq!(entry.modified_time, modified);
        assert!(!temp_dir.path().join("deep/er/.a.md.folio-tmp").exists());
    }

    #[test]
    fn test_read_returns_hashed_record() {
        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());
        library.write_atomic("a.md", b"abc", None).unwrap();

        let (record, content) = library.read("a.md").unwrap();
        assert_eq!(content, b"abc");
        assert_eq!(record.size, 3);
        assert!(record.has_hash(&hasher::hash_bytes(b"abc")));
        assert_eq!(library.hash("a.md").unwrap(), hasher::hash_bytes(b"abc"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());
        library.write_atomic("dir/a.md", b"x", None).unwrap();

        assert!(library.remove("dir/a.md").unwrap());
        assert!(!library.remove("dir/a.md").unwrap());
        assert!(library.remove("dir").unwrap());
        assert!(!library.exists("dir"));
    }

    #[test]
    fn test_copy_keeps_source() {
        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());
        library.write_atomic("a.md", b"original", None).unwrap();

        library.copy("a.md", "a.conflict.md").unwrap();
        assert_eq!(fs::read(temp_dir.path().join("a.md")).unwrap(), b"original");
        assert_eq!(
            fs::read(temp_dir.path().join("a.conflict.md")).unwrap(),
            b"original"
        );
    }

    #[test]
    fn test_entry_missing() {
        let temp_dir = TempDir::new().unwrap();
        let library = LocalLibrary::new(temp_dir.path());
        assert!(library.entry("nope.md").unwrap().is_none());
    }
}
