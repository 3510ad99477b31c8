use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use tracing::{debug, warn};

use crate::llm::media::detect_mime_type;

/// Types advertised to users when asking for uploads. Acceptance itself only
/// checks for the `image/` prefix.
pub const ADVERTISED_UPLOAD_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];

const IMAGE_ID_NAME_LIMIT: usize = 32;

/// A candidate file handed to intake by any entry point (Telegram upload,
/// album, CLI path).
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub file_name: String,
    pub declared_mime: Option<String>,
    pub bytes: Vec<u8>,
}

impl IncomingFile {
    pub fn new(file_name: impl Into<String>, declared_mime: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            declared_mime,
            bytes,
        }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| anyhow!("Failed to read {}: {}", path.display(), err))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());
        let declared_mime = mime_guess::from_path(path)
            .first()
            .map(|mime| mime.essence_str().to_string());
        Ok(Self::new(file_name, declared_mime, bytes))
    }

    /// Declared type when present, otherwise the type sniffed from the bytes.
    pub fn resolved_mime_type(&self) -> Option<String> {
        match self.declared_mime.as_deref().map(str::trim) {
            Some(declared) if !declared.is_empty() => Some(declared.to_ascii_lowercase()),
            _ => detect_mime_type(&self.bytes),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub(crate) id: String,
    file_name: String,
    mime_type: String,
    preview: Arc<str>,
}

impl UploadedImage {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Self-contained `data:` URL of the image.
    pub fn preview(&self) -> &str {
        &self.preview
    }

    /// Base64 payload of the preview.
    pub fn base64_data(&self) -> &str {
        split_data_url(&self.preview)
            .map(|(_, payload)| payload)
            .unwrap_or_default()
    }
}

pub fn is_image_mime(mime_type: &str) -> bool {
    mime_type.trim().to_ascii_lowercase().starts_with("image/")
}

pub fn image_id(file_name: &str, timestamp_millis: i64) -> String {
    let name: String = file_name.chars().take(IMAGE_ID_NAME_LIMIT).collect();
    format!("{}-{}", name, timestamp_millis)
}

pub fn encode_data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime_type,
        general_purpose::STANDARD.encode(bytes)
    )
}

/// Splits a `data:<mime>;base64,<payload>` URL into its MIME type and payload.
pub fn split_data_url(data_url: &str) -> Option<(&str, &str)> {
    let rest = data_url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime_type = header.split(';').next().unwrap_or_default();
    Some((mime_type, payload))
}

fn build_uploaded_image(file: IncomingFile, mime_type: String, timestamp_millis: i64) -> UploadedImage {
    let preview = encode_data_url(&mime_type, &file.bytes);
    UploadedImage {
        id: image_id(&file.file_name, timestamp_millis),
        file_name: file.file_name,
        mime_type,
        preview: Arc::from(preview),
    }
}

/// Accepts one file if its type is an image. Non-image files are dropped
/// without an error.
pub async fn ingest_file(file: IncomingFile) -> Option<UploadedImage> {
    let Some(mime_type) = file.resolved_mime_type() else {
        debug!(file = %file.file_name, "Dropping upload with unknown type");
        return None;
    };
    if !is_image_mime(&mime_type) {
        debug!(file = %file.file_name, mime = %mime_type, "Dropping non-image upload");
        return None;
    }

    let timestamp_millis = Utc::now().timestamp_millis();
    let file_name = file.file_name.clone();
    match tokio::task::spawn_blocking(move || build_uploaded_image(file, mime_type, timestamp_millis))
        .await
    {
        Ok(image) => Some(image),
        Err(err) => {
            warn!(file = %file_name, "Failed to encode upload: {err}");
            None
        }
    }
}

/// Accepts every image in `files`, preserving their order.
pub async fn ingest_files(files: Vec<IncomingFile>) -> Vec<UploadedImage> {
    let mut accepted = Vec::with_capacity(files.len());
    for file in files {
        if let Some(image) = ingest_file(file).await {
            accepted.push(image);
        }
    }
    accepted
}

#[cfg(test)]
pub(crate) fn test_image(id: &str, mime_type: &str, bytes: &[u8]) -> UploadedImage {
    UploadedImage {
        id: id.to_string(),
        file_name: format!("{id}.bin"),
        mime_type: mime_type.to_string(),
        preview: Arc::from(encode_data_url(mime_type, bytes)),
    }
}
