pub mod generate;
pub mod intake;
pub mod prompt;
pub mod session;

pub use generate::{finish_generation, run_generation, start_generation, GenerateOutcome};
pub use intake::{ingest_file, ingest_files, IncomingFile, UploadedImage};
pub use prompt::Intensity;
pub use session::{GenerateRejection, StyleSession};
