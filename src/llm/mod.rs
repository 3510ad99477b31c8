pub mod editor;
pub mod gemini;
pub mod media;

pub use editor::{GeneratedImage, GenerationError, ImageEditor, InlineImage, StyleEditRequest};
pub use gemini::GeminiImageEditor;
