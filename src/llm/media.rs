use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::StatusCode;
use tracing::{error, warn};

use crate::utils::http::get_http_client;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    if data.len() > 12 {
        let ftyp = &data[4..12];
        if ftyp.starts_with(b"ftyp") {
            let brand = &ftyp[4..8];
            if brand == b"heic" || brand == b"heif" || brand == b"hevc" {
                return Some("image/heic".to_string());
            }
        }
    }

    infer::get(data).map(|kind| kind.mime_type().to_string())
}

const MEDIA_DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const MEDIA_DOWNLOAD_BASE_DELAY_MS: u64 = 400;
const MEDIA_DOWNLOAD_ERROR_BODY_LIMIT: usize = 800;

pub fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Fetches an uploaded file. `log_label` is what appears in logs instead of
/// the URL, since Telegram file URLs embed the bot token.
pub async fn download_media(url: &str, log_label: &str) -> Result<Vec<u8>> {
    let client = get_http_client();
    let mut last_error = anyhow!("no download attempt made for {log_label}");
    for attempt in 0..MEDIA_DOWNLOAD_MAX_ATTEMPTS {
        let delay = Duration::from_millis(MEDIA_DOWNLOAD_BASE_DELAY_MS << attempt);
        let is_last_attempt = attempt + 1 == MEDIA_DOWNLOAD_MAX_ATTEMPTS;

        let response = match client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    "Failed to fetch media {log_label}: timeout={}, connect={}, status={:?}, attempt={}/{}",
                    err.is_timeout(),
                    err.is_connect(),
                    err.status(),
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                let retryable = should_retry_error(&err);
                last_error = anyhow!("media download failed for {log_label}: {}", err.without_url());
                if !retryable || is_last_attempt {
                    return Err(last_error);
                }
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Media download failed for {log_label} with status {}: {}",
                status,
                truncate_for_log(&body, MEDIA_DOWNLOAD_ERROR_BODY_LIMIT)
            );
            last_error = anyhow!("media download failed for {log_label} with status {status}");
            if !should_retry_status(status) || is_last_attempt {
                return Err(last_error);
            }
            tokio::time::sleep(delay).await;
            continue;
        }

        match response.bytes().await {
            Ok(bytes) => return Ok(bytes.to_vec()),
            Err(err) => {
                error!(
                    "Failed to read media bytes {log_label} (attempt={}/{})",
                    attempt + 1,
                    MEDIA_DOWNLOAD_MAX_ATTEMPTS
                );
                last_error = anyhow!("failed to read media bytes for {log_label}: {}", err.without_url());
                if is_last_attempt {
                    return Err(last_error);
                }
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_error)
}
