//! JSON table persistence shared by the registry, grant table and storage.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use super::PluginResult;

/// Load a JSON table, or its default when the file does not exist yet.
pub(crate) fn load_json<T: DeserializeOwned + Default>(path: &Path) -> PluginResult<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write a JSON table through a sibling temp file so readers never see a
/// half-written table.
pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> PluginResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.flush()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
