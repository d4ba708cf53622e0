use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Resolve the directory holding `clickmark.db`.
///
/// Priority:
/// 1. `--data-dir` / `CLICKMARK_DATA_DIR`
/// 2. Platform-specific app data dir (`~/.local/share/clickmark/`, etc.)
pub fn data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create data dir: {}", dir.display()))?;
        return Ok(dir.to_owned());
    }

    let dirs = ProjectDirs::from("", "", "clickmark")
        .context("could not determine platform data directory")?;

    let path = dirs.data_dir().to_owned();
    std::fs::create_dir_all(&path).context("create platform data dir")?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_is_created() {
        let root = tempfile::tempdir().unwrap();
        let wanted = root.path().join("nested").join("data");
        let got = data_dir(Some(&wanted)).unwrap();
        assert_eq!(got, wanted);
        assert!(wanted.is_dir());
    }
}
