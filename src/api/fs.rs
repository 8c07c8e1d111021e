//! One-shot filesystem endpoints.

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query,
    },
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::envelope::{done, Envelope};
use super::error::ApiError;

#[derive(Debug, Deserialize)]
pub(super) struct PathQuery {
    path: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateRequest {
    path: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct WriteRequest {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RenameRequest {
    old_path: String,
    new_path: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct TransferRequest {
    source: String,
    destination: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct MkdirRequest {
    path: String,
}

/// One directory entry as returned by `listdir`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub mode: String,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
}

impl FileInfo {
    fn new(name: String, path: &Path, meta: &Metadata) -> Self {
        Self {
            name,
            path: path.display().to_string(),
            size: meta.len(),
            mode: format_mode(meta),
            mod_time: meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_default(),
            is_dir: meta.is_dir(),
        }
    }
}

/// Validate a request path: present and absolute.
pub(super) fn absolute(path: &str) -> Result<PathBuf, ApiError> {
    if path.is_empty() {
        return Err(ApiError::InvalidRequest("path is required".to_string()));
    }
    let path = PathBuf::from(path);
    if !path.is_absolute() {
        return Err(ApiError::PathNotAbsolute(path.display().to_string()));
    }
    Ok(path)
}

/// `ls -l` style mode string, e.g. `drwxr-xr-x`.
fn format_mode(meta: &Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;

    let file_type = meta.file_type();
    let mut mode = String::with_capacity(10);
    mode.push(if file_type.is_dir() {
        'd'
    } else if file_type.is_symlink() {
        'L'
    } else {
        '-'
    });
    let bits = meta.permissions().mode();
    for shift in [6, 3, 0] {
        let triple = (bits >> shift) & 0o7;
        mode.push(if triple & 0o4 != 0 { 'r' } else { '-' });
        mode.push(if triple & 0o2 != 0 { 'w' } else { '-' });
        mode.push(if triple & 0o1 != 0 { 'x' } else { '-' });
    }
    mode
}

pub(super) async fn listdir(
    query: Result<Query<PathQuery>, QueryRejection>,
) -> Result<Json<Envelope<Vec<FileInfo>>>, ApiError> {
    let Query(query) = query?;
    let dir = absolute(&query.path)?;

    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| ApiError::io(&dir, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ApiError::io(&dir, e))?
    {
        // Entries that vanish between readdir and stat are skipped.
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        files.push(FileInfo::new(name, &entry.path(), &meta));
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Envelope::ok("Directory listed successfully", files))
}

pub(super) async fn create(
    payload: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let Json(req) = payload?;
    let path = absolute(&req.path)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::io(parent, e))?;
    }
    tokio::fs::write(&path, req.content.unwrap_or_default())
        .await
        .map_err(|e| ApiError::io(&path, e))?;

    tracing::debug!(path = %path.display(), "file created");
    Ok(done("File created successfully"))
}

/// Recursive delete. A path that is already gone counts as deleted.
pub(super) async fn delete(
    query: Result<Query<PathQuery>, QueryRejection>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let Query(query) = query?;
    let path = absolute(&query.path)?;

    match tokio::fs::symlink_metadata(&path).await {
        Ok(meta) => {
            let result = if meta.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            result.map_err(|e| ApiError::io(&path, e))?;
            tracing::debug!(path = %path.display(), "path deleted");
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(ApiError::io(&path, e)),
    }

    Ok(done("File/directory deleted successfully"))
}

pub(super) async fn rename(
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let Json(req) = payload?;
    let from = absolute(&req.old_path)?;
    let to = absolute(&req.new_path)?;

    tokio::fs::rename(&from, &to)
        .await
        .map_err(|e| ApiError::io(&from, e))?;

    Ok(done("File/directory renamed successfully"))
}

pub(super) async fn copy(
    payload: Result<Json<TransferRequest>, JsonRejection>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let Json(req) = payload?;
    let source = absolute(&req.source)?;
    let destination = absolute(&req.destination)?;

    copy_blocking(source, destination).await?;
    Ok(done("File/directory copied successfully"))
}

/// Rename when possible; across filesystems fall back to copy then delete.
pub(super) async fn move_path(
    payload: Result<Json<TransferRequest>, JsonRejection>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let Json(req) = payload?;
    let source = absolute(&req.source)?;
    let destination = absolute(&req.destination)?;

    tokio::fs::symlink_metadata(&source)
        .await
        .map_err(|e| ApiError::io(&source, e))?;
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::io(parent, e))?;
    }

    if let Err(e) = tokio::fs::rename(&source, &destination).await {
        tracing::debug!(
            source = %source.display(),
            error = %e,
            "rename failed, moving by copy"
        );
        copy_blocking(source.clone(), destination).await?;
        let meta = tokio::fs::symlink_metadata(&source)
            .await
            .map_err(|e| ApiError::io(&source, e))?;
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&source).await
        } else {
            tokio::fs::remove_file(&source).await
        };
        removed.map_err(|e| ApiError::io(&source, e))?;
    }

    Ok(done("File/directory moved successfully"))
}

pub(super) async fn read(
    query: Result<Query<PathQuery>, QueryRejection>,
) -> Result<Json<Envelope<String>>, ApiError> {
    let Query(query) = query?;
    let path = absolute(&query.path)?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::io(&path, e))?;

    Ok(Envelope::ok(
        "File read successfully",
        String::from_utf8_lossy(&bytes).into_owned(),
    ))
}

pub(super) async fn write(
    payload: Result<Json<WriteRequest>, JsonRejection>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let Json(req) = payload?;
    let path = absolute(&req.path)?;

    tokio::fs::write(&path, req.content)
        .await
        .map_err(|e| ApiError::io(&path, e))?;

    Ok(done("File written successfully"))
}

pub(super) async fn mkdir(
    payload: Result<Json<MkdirRequest>, JsonRejection>,
) -> Result<Json<Envelope<()>>, ApiError> {
    let Json(req) = payload?;
    let path = absolute(&req.path)?;

    tokio::fs::create_dir_all(&path)
        .await
        .map_err(|e| ApiError::io(&path, e))?;

    Ok(done("Directory created successfully"))
}

async fn copy_blocking(source: PathBuf, destination: PathBuf) -> Result<(), ApiError> {
    if destination.starts_with(&source) && source.is_dir() {
        return Err(ApiError::InvalidRequest(format!(
            "cannot copy {} into itself",
            source.display()
        )));
    }
    tokio::task::spawn_blocking(move || {
        copy_tree(&source, &destination)
            .map(|_| ())
            .map_err(|e| ApiError::io(&source, e))
    })
    .await
    .map_err(|e| ApiError::InternalError(e.to_string()))?
}

/// Copy a file or directory tree. Permissions are preserved and symlinks are
/// recreated rather than followed. Returns the number of files copied.
fn copy_tree(source: &Path, destination: &Path) -> io::Result<u64> {
    let meta = std::fs::metadata(source)?;
    if !meta.is_dir() {
        copy_file(source, destination)?;
        return Ok(1);
    }

    let mut files = 0;
    // Directory modes are applied last so read-only directories can be filled.
    let mut dir_modes = Vec::new();
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            let perms = entry.metadata().map_err(io::Error::from)?.permissions();
            dir_modes.push((target, perms));
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            copy_file(entry.path(), &target)?;
            files += 1;
        }
    }

    for (dir, perms) in dir_modes.into_iter().rev() {
        std::fs::set_permissions(dir, perms)?;
    }
    Ok(files)
}

fn copy_file(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // std::fs::copy carries the permission bits over.
    std::fs::copy(source, destination)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn absolute_rejects_relative_and_empty() {
        assert!(matches!(absolute(""), Err(ApiError::InvalidRequest(_))));
        assert!(matches!(absolute("tmp/x"), Err(ApiError::PathNotAbsolute(_))));
        assert_eq!(absolute("/tmp/x").unwrap(), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn formats_modes_like_ls() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o640)).unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(format_mode(&std::fs::metadata(&file).unwrap()), "-rw-r-----");
        assert_eq!(format_mode(&std::fs::metadata(dir.path()).unwrap()), "drwxr-xr-x");
    }

    #[test]
    fn copy_tree_preserves_layout_modes_and_links() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("a/b/script.sh"), "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(
            src.path().join("a/b/script.sh"),
            std::fs::Permissions::from_mode(0o750),
        )
        .unwrap();
        std::fs::write(src.path().join("top.txt"), "top").unwrap();
        std::os::unix::fs::symlink("top.txt", src.path().join("link")).unwrap();

        let dst_root = tempfile::tempdir().unwrap();
        let dst = dst_root.path().join("copy");
        let copied = copy_tree(src.path(), &dst).unwrap();
        assert_eq!(copied, 2);

        let script = std::fs::metadata(dst.join("a/b/script.sh")).unwrap();
        assert_eq!(script.permissions().mode() & 0o777, 0o750);
        assert_eq!(std::fs::read_to_string(dst.join("top.txt")).unwrap(), "top");
        assert_eq!(
            std::fs::read_link(dst.join("link")).unwrap(),
            PathBuf::from("top.txt")
        );
    }

    #[test]
    fn copy_tree_copies_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("one.txt");
        std::fs::write(&src, "1").unwrap();
        let dst = dir.path().join("nested/two.txt");
        assert_eq!(copy_tree(&src, &dst).unwrap(), 1);
        assert_eq!(std::fs::read_to_string(dst).unwrap(), "1");
    }

    #[tokio::test]
    async fn copy_into_itself_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = copy_blocking(dir.path().to_path_buf(), dir.path().join("inner"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn copy_blocking_copies_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("nested/file"), "payload").unwrap();

        let dst = dir.path().join("dst");
        copy_blocking(src, dst.clone()).await.unwrap();
        assert_eq!(std::fs::read_to_string(dst.join("nested/file")).unwrap(), "payload");
    }

    #[tokio::test]
    async fn copy_blocking_missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = copy_blocking(dir.path().join("absent"), dir.path().join("dst"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
