//! JSON file persistence shared by the stores.
//!
//! Every store keeps its state in one pretty-printed JSON document and
//! replaces it wholesale on each mutation: the new document is written to a
//! sibling temp file, synced, then renamed over the old one, so a reader
//! never observes a half-written file.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Load a JSON document, returning `T::default()` when the file is absent.
pub(crate) fn load_or_default<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(Error::Storage {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_str(&content).map_err(|source| Error::Serialization {
        path: path.to_path_buf(),
        source,
    })
}

/// Atomically replace `path` with the JSON rendering of `value`.
pub(crate) fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).map_err(|source| Error::Serialization {
        path: path.to_path_buf(),
        source,
    })?;

    let temp_path = path.with_extension("json.tmp");
    let storage_err = |source: std::io::Error| Error::Storage {
        path: path.to_path_buf(),
        source,
    };

    let mut file = fs::File::create(&temp_path).map_err(storage_err)?;
    file.write_all(content.as_bytes()).map_err(storage_err)?;
    file.sync_all().map_err(storage_err)?;
    drop(file);

    fs::rename(&temp_path, path).map_err(storage_err)
}

/// Create `dir` (and parents) if missing.
pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| Error::Storage {
        path: dir.to_path_buf(),
        source,
    })
}
