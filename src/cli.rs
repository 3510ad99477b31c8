use std::path::PathBuf;

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::llm::ImageEditor;
use crate::state::SessionStore;
use crate::stylist::{
    ingest_file, ingest_files, run_generation, GenerateOutcome, GenerateRejection, IncomingFile,
    Intensity,
};

const CLI_SESSION_KEY: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleArgs {
    pub base: PathBuf,
    pub items: Vec<PathBuf>,
    pub intensity: Intensity,
    pub out_dir: PathBuf,
}

pub fn style_usage() -> &'static str {
    "Usage: cargo run -- style --base <path> --item <path> [--item <path>...] [--intensity <0-100>] [--out-dir <dir>]"
}

pub fn parse_style_args(args: &[String]) -> Result<Option<StyleArgs>> {
    if args.get(1).map(|value| value.as_str()) != Some("style") {
        return Ok(None);
    }

    let mut base: Option<PathBuf> = None;
    let mut items = Vec::new();
    let mut intensity = Intensity::new(CONFIG.default_style_intensity);
    let mut out_dir = PathBuf::from(".");

    let mut index = 2;
    while index < args.len() {
        match args[index].as_str() {
            "--base" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --base"))?;
                base = Some(PathBuf::from(value));
            }
            "--item" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --item"))?;
                items.push(PathBuf::from(value));
            }
            "--intensity" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --intensity"))?;
                let parsed = value
                    .parse::<u8>()
                    .ok()
                    .filter(|parsed| *parsed <= 100)
                    .ok_or_else(|| anyhow!("Invalid --intensity value: {value}"))?;
                intensity = Intensity::new(parsed);
            }
            "--out-dir" => {
                index += 1;
                let value = args
                    .get(index)
                    .ok_or_else(|| anyhow!("Missing value for --out-dir"))?;
                out_dir = PathBuf::from(value);
            }
            "--help" | "-h" => {
                return Err(anyhow!(style_usage()));
            }
            other => {
                return Err(anyhow!(
                    "Unknown style argument: {other}\n{}",
                    style_usage()
                ));
            }
        }
        index += 1;
    }

    let base = base.ok_or_else(|| anyhow!("--base is required\n{}", style_usage()))?;
    if items.is_empty() {
        return Err(anyhow!("At least one --item is required\n{}", style_usage()));
    }

    Ok(Some(StyleArgs {
        base,
        items,
        intensity,
        out_dir,
    }))
}

/// Runs one styling attempt from files on disk and writes the result into
/// `out_dir`. Returns the written path.
pub async fn run_style(args: StyleArgs, editor: &dyn ImageEditor) -> Result<PathBuf> {
    let base = ingest_file(IncomingFile::from_path(&args.base).await?)
        .await
        .ok_or_else(|| anyhow!("{} is not an image", args.base.display()))?;

    let mut files = Vec::with_capacity(args.items.len());
    for path in &args.items {
        files.push(IncomingFile::from_path(path).await?);
    }
    let items = ingest_files(files).await;
    if items.len() < args.items.len() {
        warn!(
            "Skipped {} item file(s) that are not images",
            args.items.len() - items.len()
        );
    }

    let store = SessionStore::new(args.intensity);
    store.with_session(CLI_SESSION_KEY, |session| {
        session.set_base_image(base);
        for image in items {
            session.add_item_image(image);
        }
    });

    info!(
        intensity = args.intensity.value(),
        model = editor.model_name(),
        "Running style generation from files"
    );
    let image = match run_generation(&store, CLI_SESSION_KEY, editor).await {
        GenerateOutcome::Succeeded(image) => image,
        GenerateOutcome::Failed(err) => return Err(err.into()),
        GenerateOutcome::Rejected(GenerateRejection::Invalid(err)) => return Err(err.into()),
        GenerateOutcome::Rejected(GenerateRejection::InFlight) | GenerateOutcome::Discarded => {
            return Err(anyhow!("Generation did not complete"))
        }
    };

    let bytes = image
        .decode()
        .map_err(|err| anyhow!("Generated image is not valid base64: {err}"))?;
    tokio::fs::create_dir_all(&args.out_dir)
        .await
        .map_err(|err| anyhow!("Failed to create {}: {}", args.out_dir.display(), err))?;
    let output_path = args.out_dir.join(image.download_file_name());
    tokio::fs::write(&output_path, bytes)
        .await
        .map_err(|err| anyhow!("Failed to write {}: {}", output_path.display(), err))?;
    Ok(output_path)
}
