//! Media upload and download

use super::logged;
use crate::config::AppState;
use crate::error::{Error, Result};
use crate::models::MediaRef;
use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    Json,
};
use bytes::Bytes;
use tracing::{error, info};

/// POST /media
pub async fn upload_media(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<MediaRef>)> {
    info!("POST /media - uploading media");

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        error!("Failed to read multipart field: {}", e);
        Error::ValidationFailed(format!("malformed multipart body: {}", e))
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("unnamed").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field.bytes().await.map_err(|e| {
            error!("Failed to read file data: {}", e);
            Error::ValidationFailed(format!("unreadable file field: {}", e))
        })?;
        upload = Some((data, filename, content_type));
    }

    let (data, filename, content_type) =
        upload.ok_or_else(|| Error::ValidationFailed("a `file` field is required".into()))?;
    let media = state
        .media
        .put(data, &filename, &content_type)
        .await
        .map_err(logged("upload-media"))?;
    Ok((StatusCode::CREATED, Json(media)))
}

/// GET /media/{hash}
pub async fn get_media(
    Path(hash): Path<String>,
    State(state): State<AppState>,
) -> Result<(HeaderMap, Bytes)> {
    info!("GET /media/{}", hash);

    let (data, media) = state.media.get(&hash).await.map_err(logged("get-media"))?;

    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&media.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    Ok((headers, data))
}
