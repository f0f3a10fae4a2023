use md5::{Digest, Md5};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{ExpError, Result};

/// MD5 over every regular file below `dir`, visited in sorted order.
///
/// Both the relative path and the content of each file are hashed, so a
/// rename is detected as well as an edit.
pub fn md5_folder(dir: &Path) -> Result<String> {
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| ExpError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        let mut file = fs::File::open(entry.path())?;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Sidecar file holding the MD5 of a model directory: `model/` -> `model.md5`.
pub fn manifest_path(model_dir: &Path) -> PathBuf {
    let mut name = model_dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".md5");
    model_dir.with_file_name(name)
}

pub fn write_manifest(model_dir: &Path) -> Result<String> {
    let digest = md5_folder(model_dir)?;
    fs::write(manifest_path(model_dir), &digest)?;
    Ok(digest)
}

pub fn read_manifest(model_dir: &Path) -> Result<Option<String>> {
    let path = manifest_path(model_dir);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(fs::read_to_string(path)?.trim().to_string()))
}

/// Fail with [`ExpError::Corruption`] if a manifest exists and no longer matches.
pub fn verify_manifest(model_dir: &Path) -> Result<()> {
    let Some(expected) = read_manifest(model_dir)? else {
        return Ok(());
    };
    let actual = md5_folder(model_dir)?;
    if actual != expected {
        return Err(ExpError::Corruption {
            path: model_dir.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// A directory that exists and holds at least one entry.
pub fn has_content(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
