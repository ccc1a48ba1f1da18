//! Per-user file surface.
//!
//! CRUD over the user's upload directory, which is bind-mounted into the
//! sandbox container at `/app`. Every write re-applies container-user
//! ownership so the in-container user can touch the files. All paths are
//! resolved inside the user root; escapes are rejected at parse time.

use std::path::{Component, Path, PathBuf};

use axum::body::Bytes;
use axum::extract::{Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{error, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::api::{ApiError, AppState};
use crate::auth::Principal;
use crate::container::apply_container_ownership;

/// File surface configuration.
#[derive(Debug, Clone)]
pub struct FilesConfig {
    /// Host directory holding one subdirectory per user.
    pub root: PathBuf,
    /// In-container user that must own everything under the root.
    pub uid: u32,
    pub gid: u32,
}

impl FilesConfig {
    fn user_root(&self, user_id: &str) -> PathBuf {
        self.root.join(user_id)
    }

    fn set_ownership(&self, path: &Path) {
        apply_container_ownership(path, self.uid, self.gid);
    }
}

/// Join `relative` onto `root`, allowing only plain path segments.
fn resolve_relative(root: &Path, relative: &str) -> Result<PathBuf, ApiError> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(relative.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return Err(ApiError::bad_request("Invalid path")),
        }
    }
    Ok(resolved)
}

async fn ensure_user_root(config: &FilesConfig, user_id: &str) -> Result<PathBuf, ApiError> {
    let root = config.user_root(user_id);
    tokio::fs::create_dir_all(&root)
        .await
        .map_err(|err| ApiError::internal(format!("Failed to create upload directory: {err}")))?;
    config.set_ownership(&root);
    Ok(root)
}

/// POST /upload: multipart `files` fields, saved flat into the user root.
pub async fn upload(
    State(state): State<AppState>,
    principal: Principal,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let root = ensure_user_root(&state.files, &principal.user_id).await?;

    let mut saved = 0usize;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("Failed to parse multipart form: {err}")))?
    {
        if field.name() != Some("files") {
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        // Flat upload: only the final path component counts.
        let Some(base_name) = Path::new(&file_name).file_name() else {
            continue;
        };
        let destination = root.join(base_name);

        let contents = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("Failed to read upload: {err}")))?;
        tokio::fs::write(&destination, &contents)
            .await
            .map_err(|err| {
                error!("failed to save file {}: {err}", destination.display());
                ApiError::internal("Failed to save file")
            })?;
        state.files.set_ownership(&destination);
        saved += 1;
    }

    if saved == 0 {
        return Err(ApiError::bad_request("No files provided"));
    }
    Ok(Json(json!({ "message": "File uploaded successfully" })))
}

/// POST /upload-folder: multipart `files` fields whose file names carry
/// relative paths; directory structure is recreated under the user root.
pub async fn upload_folder(
    State(state): State<AppState>,
    principal: Principal,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let root = ensure_user_root(&state.files, &principal.user_id).await?;

    let mut saved = 0usize;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("Failed to parse multipart form: {err}")))?
    {
        if field.name() != Some("files") {
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let Ok(destination) = resolve_relative(&root, &file_name) else {
            warn!("skipping upload with escaping path: {file_name}");
            continue;
        };

        if let Some(parent) = destination.parent() {
            if tokio::fs::create_dir_all(parent).await.is_err() {
                warn!("failed to create directory {}", parent.display());
                continue;
            }
            state.files.set_ownership(parent);
        }

        let contents = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("Failed to read upload: {err}")))?;
        if let Err(err) = tokio::fs::write(&destination, &contents).await {
            warn!("failed to save file {}: {err}", destination.display());
            continue;
        }
        state.files.set_ownership(&destination);
        saved += 1;
    }

    if saved == 0 {
        return Err(ApiError::bad_request("No files provided"));
    }
    Ok(Json(json!({ "message": "Folder uploaded successfully" })))
}

/// GET /list-files: recursive relative listing; directories get a
/// trailing slash.
pub async fn list_files(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Value>, ApiError> {
    let root = state.files.user_root(&principal.user_id);
    if !root.exists() {
        return Ok(Json(json!({ "files": [] })));
    }

    let listing = tokio::task::spawn_blocking(move || relative_listing(&root))
        .await
        .map_err(|_| ApiError::internal("Failed to list files"))?
        .map_err(|err| {
            error!("failed to walk directory: {err}");
            ApiError::internal("Failed to list files")
        })?;

    Ok(Json(json!({ "files": listing })))
}

fn relative_listing(root: &Path) -> Result<Vec<String>, walkdir::Error> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        if entry.file_type().is_dir() {
            entries.push(format!("{relative}/"));
        } else {
            entries.push(relative);
        }
    }
    Ok(entries)
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub overwrite: bool,
}

/// POST /move: rename a file or folder within the user root.
pub async fn move_entry(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<MoveRequest>,
) -> Result<Json<Value>, ApiError> {
    let source = request.source.trim_start_matches('/');
    let destination = request.destination.trim_start_matches('/');
    if source.is_empty() || destination.is_empty() {
        return Err(ApiError::bad_request("Invalid path"));
    }

    let root = state.files.user_root(&principal.user_id);
    let source_path = resolve_relative(&root, source)?;
    let destination_path = resolve_relative(&root, destination)?;

    if tokio::fs::metadata(&source_path).await.is_err() {
        return Err(ApiError::not_found("Source not found"));
    }

    // Moving a folder into itself would recurse forever.
    if destination_path == source_path || destination_path.starts_with(&source_path) {
        return Err(ApiError::bad_request(
            "Cannot move a folder into itself or its subdirectory",
        ));
    }

    if let Some(parent) = destination_path.parent() {
        if parent != root {
            tokio::fs::create_dir_all(parent).await.map_err(|_| {
                ApiError::conflict("A file exists in the destination path")
            })?;
            state.files.set_ownership(parent);
        }
    }

    if tokio::fs::metadata(&destination_path).await.is_ok() {
        if !request.overwrite {
            return Err(ApiError::conflict("Destination already exists"));
        }
        remove_path(&destination_path)
            .await
            .map_err(|err| ApiError::internal(format!("Failed to replace destination: {err}")))?;
    }

    tokio::fs::rename(&source_path, &destination_path)
        .await
        .map_err(|err| ApiError::internal(format!("Failed to move: {err}")))?;
    state.files.set_ownership(&destination_path);

    Ok(Json(json!({ "message": "Moved successfully" })))
}

/// GET /file/{*path}: file contents, as text when valid UTF-8.
pub async fn get_file(
    State(state): State<AppState>,
    principal: Principal,
    axum::extract::Path(path): axum::extract::Path<String>,
) -> Result<Response, ApiError> {
    let root = state.files.user_root(&principal.user_id);
    let file_path = resolve_relative(&root, &path)?;

    let contents = match tokio::fs::read(&file_path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"));
        }
        Err(_) => return Err(ApiError::internal("Failed to read file")),
    };

    match String::from_utf8(contents) {
        Ok(text) => Ok(text.into_response()),
        Err(binary) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            binary.into_bytes(),
        )
            .into_response()),
    }
}

/// PUT /file/{*path}: overwrite a file with the request body.
pub async fn update_file(
    State(state): State<AppState>,
    principal: Principal,
    axum::extract::Path(path): axum::extract::Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let root = ensure_user_root(&state.files, &principal.user_id).await?;
    let file_path = resolve_relative(&root, &path)?;

    tokio::fs::write(&file_path, &body)
        .await
        .map_err(|_| ApiError::internal("Failed to write file"))?;
    state.files.set_ownership(&file_path);

    Ok(Json(json!({ "message": "File updated successfully" })))
}

/// DELETE /file/{*path}: remove a file or directory tree.
pub async fn delete_file(
    State(state): State<AppState>,
    principal: Principal,
    axum::extract::Path(path): axum::extract::Path<String>,
) -> Result<Json<Value>, ApiError> {
    let root = state.files.user_root(&principal.user_id);
    let file_path = resolve_relative(&root, &path)?;

    if let Err(err) = remove_path(&file_path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            return Err(ApiError::internal("Failed to delete file"));
        }
    }
    Ok(Json(json!({ "message": "File deleted successfully" })))
}

/// POST /file/{*path}: create an empty file, or a directory when the path
/// ends with a slash.
pub async fn create_entry(
    State(state): State<AppState>,
    principal: Principal,
    axum::extract::Path(path): axum::extract::Path<String>,
) -> Result<Json<Value>, ApiError> {
    let root = ensure_user_root(&state.files, &principal.user_id).await?;
    let wants_directory = path.ends_with('/');
    let target = resolve_relative(&root, &path)?;

    if wants_directory {
        if let Ok(metadata) = tokio::fs::metadata(&target).await {
            if !metadata.is_dir() {
                return Err(ApiError::conflict(
                    "A file with the same name already exists",
                ));
            }
        }
        tokio::fs::create_dir_all(&target).await.map_err(|_| {
            ApiError::conflict("A file exists in the path; cannot create directory")
        })?;
        state.files.set_ownership(&target);
        return Ok(Json(json!({ "message": "Directory created successfully" })));
    }

    if let Some(parent) = target.parent() {
        if parent != root {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|_| ApiError::internal("Failed to create directory"))?;
            state.files.set_ownership(parent);
        }
    }

    match tokio::fs::metadata(&target).await {
        Ok(metadata) if metadata.is_dir() => {
            return Err(ApiError::conflict(
                "A folder with the same name already exists",
            ));
        }
        Ok(_) => return Err(ApiError::bad_request("File already exists")),
        Err(_) => {}
    }

    tokio::fs::write(&target, b"")
        .await
        .map_err(|_| ApiError::internal("Failed to create file"))?;
    state.files.set_ownership(&target);

    Ok(Json(json!({ "message": "File created successfully" })))
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(err) => Err(err),
    }
}
