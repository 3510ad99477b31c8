use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};

pub const RESULT_FILE_STEM: &str = "styled-image";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("API returned a text response instead of an image: {0}")]
    UnexpectedText(String),
    #[error("No image was generated. The model may have refused the request due to safety policies.")]
    NoImage,
    #[error("Failed to generate image. Please try again later.")]
    Transport,
}

/// Image bytes embedded in a request, base64 encoded and tagged with a MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
    pub file_name: String,
}

/// One styling attempt: the base photo, the items to apply, and the
/// instruction text. Part order on the wire follows field order.
#[derive(Debug, Clone)]
pub struct StyleEditRequest {
    pub base: InlineImage,
    pub items: Vec<InlineImage>,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub data: String,
}

impl GeneratedImage {
    #[cfg(test)]
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        general_purpose::STANDARD.decode(self.data.trim())
    }

    pub fn file_extension(&self) -> &'static str {
        match self.mime_type.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        }
    }

    pub fn download_file_name(&self) -> String {
        format!("{}.{}", RESULT_FILE_STEM, self.file_extension())
    }
}

/// Remote capability that composites item images onto a base photo.
#[async_trait]
pub trait ImageEditor: Send + Sync {
    fn model_name(&self) -> &str;

    async fn edit(&self, request: &StyleEditRequest) -> Result<GeneratedImage, GenerationError>;
}
