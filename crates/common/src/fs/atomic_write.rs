use anyhow::{anyhow, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Replace `path` with `content` in one step.
///
/// The bytes land in a hidden sibling file first and are renamed over the
/// target, so readers observe either the old document or the new one.
/// Missing parent directories are created.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("'{}' has no file name", path.display()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directories for '{}'", parent.display())
            })?;
        }
    }

    let staging = staging_path(path, &file_name.to_string_lossy());
    let result = write_staging(&staging, content).and_then(|_| {
        fs::rename(&staging, path).with_context(|| {
            format!(
                "failed to move '{}' into place at '{}'",
                staging.display(),
                path.display()
            )
        })
    });

    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn staging_path(path: &Path, file_name: &str) -> PathBuf {
    let staging_name = format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple());
    path.with_file_name(staging_name)
}

fn write_staging(staging: &Path, content: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(staging)
        .with_context(|| format!("failed to create staging file '{}'", staging.display()))?;
    file.write_all(content)
        .with_context(|| format!("failed to write staging file '{}'", staging.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync staging file '{}'", staging.display()))?;
    Ok(())
}
