//! Submitted archive handling: bounded extraction, build descriptor lookup
//! and build-context packing.

use std::fs;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::{Archive, EntryType};
use tracing::debug;

use crate::errors::ExecutionError;

/// Extract a gzip-compressed tar into `dest`.
///
/// Every entry path, and every link target, must stay inside `dest`; the
/// first entry that does not aborts extraction with `UnsafeArchivePath`.
/// Lexical checks run per entry; entries are also refused when they would
/// be written through a symlink already on disk, and once everything is
/// unpacked each symlink is canonicalized and must land inside `dest`.
pub fn extract_archive(archive: &[u8], dest: &Path) -> Result<(), ExecutionError> {
    let mut tar = Archive::new(GzDecoder::new(archive));
    tar.set_preserve_permissions(false);
    tar.set_unpack_xattrs(false);

    let entries = tar
        .entries()
        .map_err(|e| ExecutionError::InvalidArchive(e.to_string()))?;
    let mut count = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(|e| ExecutionError::InvalidArchive(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| ExecutionError::InvalidArchive(e.to_string()))?
            .into_owned();
        if !is_plain_relative(&path) {
            return Err(ExecutionError::UnsafeArchivePath {
                path: path.display().to_string(),
            });
        }

        if through_symlink(dest, path.parent().unwrap_or(Path::new(""))) {
            return Err(ExecutionError::UnsafeArchivePath {
                path: path.display().to_string(),
            });
        }

        let kind = entry.header().entry_type();
        if matches!(kind, EntryType::Symlink | EntryType::Link) {
            let target = entry
                .link_name()
                .map_err(|e| ExecutionError::InvalidArchive(e.to_string()))?
                .map(|t| t.into_owned())
                .unwrap_or_default();
            let resolved = match kind {
                // Symlink targets resolve relative to the link's own directory.
                EntryType::Symlink => path.parent().unwrap_or(Path::new("")).join(&target),
                _ => target.clone(),
            };
            let hard_link_via_symlink = kind == EntryType::Link && through_symlink(dest, &target);
            if target.as_os_str().is_empty() || !is_contained(&resolved) || hard_link_via_symlink {
                return Err(ExecutionError::UnsafeArchivePath {
                    path: format!("{} -> {}", path.display(), target.display()),
                });
            }
        }

        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| ExecutionError::InvalidArchive(e.to_string()))?;
        if !unpacked {
            return Err(ExecutionError::UnsafeArchivePath {
                path: path.display().to_string(),
            });
        }
        count += 1;
    }
    verify_links(dest)?;
    debug!(entries = count, dest = %dest.display(), "Archive extracted");
    Ok(())
}

/// True when any prefix of `rel`, joined onto `dest`, is a symlink on disk.
fn through_symlink(dest: &Path, rel: &Path) -> bool {
    let mut current = dest.to_path_buf();
    for component in rel.components() {
        current.push(component);
        if fs::symlink_metadata(&current).is_ok_and(|m| m.file_type().is_symlink()) {
            return true;
        }
    }
    false
}

/// Canonicalize every extracted symlink against the final tree. Chains of
/// links can pass each lexical check and still resolve outside `dest`.
/// Dangling links are left alone: they name nothing that can be read.
fn verify_links(dest: &Path) -> Result<(), ExecutionError> {
    let root = fs::canonicalize(dest)?;
    let mut pending = vec![dest.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_symlink() {
                if let Ok(resolved) = fs::canonicalize(&path)
                    && !resolved.starts_with(&root)
                {
                    let shown = path.strip_prefix(dest).unwrap_or(&path);
                    return Err(ExecutionError::UnsafeArchivePath {
                        path: shown.display().to_string(),
                    });
                }
            } else if file_type.is_dir() {
                pending.push(path);
            }
        }
    }
    Ok(())
}

/// True when `path` is relative with no `..` components.
fn is_plain_relative(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// True when `path` is relative and never climbs above its starting point.
fn is_contained(path: &Path) -> bool {
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Find the directory holding `descriptor`: the extraction root, or else the
/// single top-level directory inside it.
pub fn find_build_context(root: &Path, descriptor: &str) -> Result<PathBuf, ExecutionError> {
    if root.join(descriptor).is_file() {
        return Ok(root.to_path_buf());
    }

    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // Archive tools on macOS add these next to the real content.
        if name.starts_with('.') || name == "__MACOSX" {
            continue;
        }
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }

    if let [only] = dirs.as_slice() {
        if only.join(descriptor).is_file() {
            return Ok(only.clone());
        }
    }
    Err(ExecutionError::NoBuildDescriptor {
        descriptor: descriptor.to_string(),
    })
}

/// Pack `dir` as an uncompressed tar, the body format the image builder takes.
pub fn pack_context(dir: &Path) -> Result<Vec<u8>, ExecutionError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    Ok(builder.into_inner()?)
}

/// Short content digest used in image tags.
pub fn digest(archive: &[u8]) -> String {
    let hash = Sha256::digest(archive);
    hash.iter().take(6).map(|b| format!("{:02x}", b)).collect()
}

/// Read a single file out of a packed (uncompressed) context.
#[cfg(test)]
pub(crate) fn read_packed(packed: &[u8], name: &str) -> Option<String> {
    use std::io::Read;

    let mut tar = Archive::new(packed);
    for entry in tar.entries().ok()? {
        let mut entry = entry.ok()?;
        let path = entry.path().ok()?.into_owned();
        if path.file_name().and_then(|n| n.to_str()) == Some(name) {
            let mut s = String::new();
            entry.read_to_string(&mut s).ok()?;
            return Some(s);
        }
    }
    None
}
