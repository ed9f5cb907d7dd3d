//! Snapshot files on the local filesystem.

use super::{BoxFuture, Storage, StorageError, StorageResult};
use std::fs;
use std::path::{Path, PathBuf};

const EXTENSION: &str = "loro";

/// Stores each snapshot as `<dir>/<id>.loro`.
///
/// Ids are escaped for use as file names: lowercase ASCII letters, digits and
/// `-` are kept and every other byte becomes `_xx` (lowercase hex). The
/// mapping is reversible and distinct ids never share a file, even on
/// case-insensitive filesystems.
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    /// Create storage rooted at `base_path`, creating the directory if needed.
    pub fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)
            .map_err(|e| StorageError::Io(format!("Failed to create storage directory: {e}")))?;
        Ok(Self { base_path })
    }

    /// Storage under the platform data directory, e.g.
    /// `~/.local/share/shapesync/snapshots` on Linux.
    pub fn default_location() -> StorageResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StorageError::Io("Could not determine home directory".to_string()))?;
        Self::new(base.join("shapesync").join("snapshots"))
    }

    fn snapshot_path(&self, id: &str) -> PathBuf {
        self.base_path.join(format!("{}.{EXTENSION}", encode_id(id)))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

pub(crate) fn encode_id(id: &str) -> String {
    let mut name = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'-' => name.push(char::from(byte)),
            _ => name.push_str(&format!("_{byte:02x}")),
        }
    }
    name
}

/// Inverse of [`encode_id`]; `None` for names it could not have produced.
pub(crate) fn decode_id(name: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut rest = name.as_bytes();
    while let Some((&first, tail)) = rest.split_first() {
        match first {
            b'a'..=b'z' | b'0'..=b'9' | b'-' => {
                bytes.push(first);
                rest = tail;
            }
            b'_' if tail.len() >= 2 => {
                let hex = std::str::from_utf8(&tail[..2]).ok()?;
                if hex.bytes().any(|b| b.is_ascii_uppercase()) {
                    return None;
                }
                bytes.push(u8::from_str_radix(hex, 16).ok()?);
                rest = &tail[2..];
            }
            _ => return None,
        }
    }
    String::from_utf8(bytes).ok()
}

impl Storage for FileStorage {
    fn save(&self, id: &str, snapshot: &[u8]) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.snapshot_path(id);
        let tmp = path.with_extension("tmp");
        let snapshot = snapshot.to_vec();
        Box::pin(async move {
            fs::write(&tmp, &snapshot)
                .and_then(|_| fs::rename(&tmp, &path))
                .map_err(|e| StorageError::Io(format!("Failed to write {}: {e}", path.display())))
        })
    }

    fn load(&self, id: &str) -> BoxFuture<'_, StorageResult<Vec<u8>>> {
        let path = self.snapshot_path(id);
        let id = id.to_string();
        Box::pin(async move {
            if !path.exists() {
                return Err(StorageError::NotFound(id));
            }
            fs::read(&path).map_err(|e| StorageError::Io(format!("Failed to read {}: {e}", path.display())))
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.snapshot_path(id);
        Box::pin(async move {
            if path.exists() {
                fs::remove_file(&path)
                    .map_err(|e| StorageError::Io(format!("Failed to delete {}: {e}", path.display())))?;
            }
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let base = self.base_path.clone();
        Box::pin(async move {
            let entries =
                fs::read_dir(&base).map_err(|e| StorageError::Io(format!("Failed to read directory: {e}")))?;

            let mut ids: Vec<String> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == EXTENSION))
                .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).and_then(decode_id))
                .collect();
            ids.sort();
            Ok(ids)
        })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let path = self.snapshot_path(id);
        Box::pin(async move { Ok(path.exists()) })
    }
}
