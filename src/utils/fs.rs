use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

/// Write `value` as pretty JSON through a sibling `.tmp` file and a rename,
/// so readers never observe a partial file.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    let bytes = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to move temporary file {} to {}",
            tmp.display(),
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn creates_parents_and_replaces_existing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out/nested/report.json");

        write_json_atomic(&path, &[1, 2]).unwrap();
        write_json_atomic(&path, &serde_json::json!({ "runs": 3 })).unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["runs"], 3);
        assert!(!path.with_extension("tmp").exists());
    }
}
