use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::llm::editor::{
    GeneratedImage, GenerationError, ImageEditor, InlineImage, StyleEditRequest,
};
use crate::llm::media::truncate_for_log;
use crate::utils::http::get_http_client;
use crate::utils::timing::log_llm_timing;

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
    Other(IgnoredAny),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

/// What a `generateContent` reply amounts to once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Image(GeneratedImage),
    Text(String),
    Empty,
}

impl GenerationOutcome {
    pub fn into_result(self) -> Result<GeneratedImage, GenerationError> {
        match self {
            GenerationOutcome::Image(image) => Ok(image),
            GenerationOutcome::Text(text) => Err(GenerationError::UnexpectedText(text)),
            GenerationOutcome::Empty => Err(GenerationError::NoImage),
        }
    }
}

pub struct GeminiImageEditor {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    safety_profile: String,
    timeout: Duration,
}

impl GeminiImageEditor {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        safety_profile: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: get_http_client().clone(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            safety_profile: safety_profile.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.gemini_api_key.clone(),
            config.gemini_api_base_url.clone(),
            config.gemini_image_model.clone(),
            config.gemini_safety_settings.clone(),
            Duration::from_secs(config.gemini_request_timeout_seconds),
        )
    }

    fn redact_api_key(&self, text: &str) -> String {
        let key = self.api_key.trim();
        if key.is_empty() {
            return text.to_string();
        }
        text.replace(key, "[redacted]")
    }

    async fn call_gemini_api(&self, payload: &Value) -> Result<GeminiResponse> {
        if self.api_key.trim().is_empty() {
            return Err(anyhow!("GEMINI_API_KEY is not configured"));
        }

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        if tracing::enabled!(tracing::Level::DEBUG) {
            let payload_summary = summarize_gemini_payload(payload);
            debug!(target: "llm.gemini", model = %self.model, payload = %payload_summary);
        }

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                warn!(
                    "Gemini request failed to send (timeout={}, connect={}, status={:?})",
                    err.is_timeout(),
                    err.is_connect(),
                    err.status()
                );
                anyhow!("Gemini request failed: {}", self.redact_api_key(&err.to_string()))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (message, body_summary) = summarize_error_body(&body);
            warn!("Gemini API error: status={}, body={}", status, body_summary);
            let detail = message.unwrap_or(body_summary);
            return Err(anyhow!(
                "Gemini request failed with status {}: {}",
                status,
                self.redact_api_key(&detail)
            ));
        }

        let value = response
            .json::<GeminiResponse>()
            .await
            .map_err(|err| anyhow!("Gemini response could not be parsed: {}", err))?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            let response_summary = summarize_gemini_response(&value);
            debug!(target: "llm.gemini", model = %self.model, response = %response_summary);
        }
        Ok(value)
    }
}

#[async_trait]
impl ImageEditor for GeminiImageEditor {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn edit(&self, request: &StyleEditRequest) -> Result<GeneratedImage, GenerationError> {
        let payload = build_edit_payload(request, &self.safety_profile);
        let metadata = json!({ "items": request.items.len() });

        let response = log_llm_timing("gemini", &self.model, "style_edit", Some(metadata), || {
            self.call_gemini_api(&payload)
        })
        .await;

        match response {
            Ok(response) => classify_response(response).into_result(),
            Err(err) => {
                error!(target: "llm.gemini", model = %self.model, "Gemini style edit failed: {:#}", err);
                Err(GenerationError::Transport)
            }
        }
    }
}

fn build_safety_settings(profile: &str) -> Vec<Value> {
    let threshold = match profile {
        "standard" => "BLOCK_MEDIUM_AND_ABOVE",
        "permissive" => "OFF",
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}', using permissive defaults.",
                profile
            );
            "OFF"
        }
    };

    vec![
        json!({ "category": "HARM_CATEGORY_HARASSMENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": threshold }),
    ]
}

fn normalize_gemini_mime_type(mime_type: &str) -> String {
    let lowered = mime_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "image/x-png" => "image/png".to_string(),
        _ => lowered,
    }
}

/// MIME tag sent with an inline image. A declared `image/*` type wins;
/// anything else falls back to the file extension, then to PNG.
pub fn request_mime_type(declared: &str, file_name: &str) -> String {
    if declared.trim().to_ascii_lowercase().starts_with("image/") {
        return normalize_gemini_mime_type(declared);
    }

    let source = if file_name.contains('.') {
        file_name
    } else {
        declared
    };
    let extension = source
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "image/png",
    }
    .to_string()
}

fn inline_data_part(image: &InlineImage) -> Value {
    json!({
        "inlineData": {
            "mimeType": request_mime_type(&image.mime_type, &image.file_name),
            "data": image.data
        }
    })
}

/// Base image first, items in collection order, instruction text last.
pub fn build_request_parts(request: &StyleEditRequest) -> Vec<Value> {
    let mut parts = Vec::with_capacity(request.items.len() + 2);
    parts.push(inline_data_part(&request.base));
    parts.extend(request.items.iter().map(inline_data_part));
    parts.push(json!({ "text": request.prompt }));
    parts
}

fn build_edit_payload(request: &StyleEditRequest, safety_profile: &str) -> Value {
    json!({
        "contents": [{ "role": "user", "parts": build_request_parts(request) }],
        "generationConfig": {
            "responseModalities": ["IMAGE", "TEXT"]
        },
        "safetySettings": build_safety_settings(safety_profile),
    })
}

fn classify_response(response: GeminiResponse) -> GenerationOutcome {
    let parts = response
        .candidates
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .and_then(|content| content.parts)
        .unwrap_or_default();

    let mut text = String::new();
    for part in parts {
        match part {
            GeminiPart::InlineData { inline_data } => {
                return GenerationOutcome::Image(GeneratedImage {
                    mime_type: inline_data.mime_type,
                    data: inline_data.data,
                });
            }
            GeminiPart::Text { text: part_text } => text.push_str(&part_text),
            GeminiPart::Other(_) => {}
        }
    }

    let text = text.trim();
    if text.is_empty() {
        GenerationOutcome::Empty
    } else {
        GenerationOutcome::Text(text.to_string())
    }
}

fn summarize_gemini_parts(parts: &[Value]) -> Vec<Value> {
    parts
        .iter()
        .map(|part| {
            if let Some(text) = part.get("text").and_then(|value| value.as_str()) {
                json!({ "text": truncate_for_log(text, 200) })
            } else if let Some(inline_data) = part.get("inlineData") {
                let mime_type = inline_data
                    .get("mimeType")
                    .and_then(|value| value.as_str())
                    .unwrap_or("unknown");
                let data_len = inline_data
                    .get("data")
                    .and_then(|value| value.as_str())
                    .map(|value| value.len())
                    .unwrap_or(0);
                json!({ "inlineData": { "mimeType": mime_type, "dataLen": data_len } })
            } else {
                json!({ "unknownPart": true })
            }
        })
        .collect()
}

fn summarize_gemini_payload(payload: &Value) -> Value {
    let mut summary = Map::new();

    if let Some(contents) = payload.get("contents").and_then(|value| value.as_array()) {
        let summarized_contents = contents
            .iter()
            .map(|content| {
                let role = content
                    .get("role")
                    .and_then(|value| value.as_str())
                    .unwrap_or("user");
                let parts = content
                    .get("parts")
                    .and_then(|value| value.as_array())
                    .map(|parts| summarize_gemini_parts(parts))
                    .unwrap_or_default();
                json!({ "role": role, "parts": parts })
            })
            .collect::<Vec<_>>();
        summary.insert("contents".to_string(), Value::Array(summarized_contents));
    }

    if let Some(config) = payload.get("generationConfig") {
        summary.insert("generationConfig".to_string(), config.clone());
    }

    if let Some(safety) = payload
        .get("safetySettings")
        .and_then(|value| value.as_array())
    {
        summary.insert("safetySettingsCount".to_string(), json!(safety.len()));
    }

    Value::Object(summary)
}

fn summarize_gemini_response(response: &GeminiResponse) -> Value {
    let mut text_parts = 0usize;
    let mut image_parts = 0usize;
    let mut text_preview = None;

    let candidates = response.candidates.as_deref().unwrap_or(&[]);
    for candidate in candidates {
        let parts = candidate
            .content
            .as_ref()
            .and_then(|content| content.parts.as_deref())
            .unwrap_or(&[]);
        for part in parts {
            match part {
                GeminiPart::Text { text } => {
                    text_parts += 1;
                    if text_preview.is_none() && !text.trim().is_empty() {
                        text_preview = Some(truncate_for_log(text, 200));
                    }
                }
                GeminiPart::InlineData { .. } => image_parts += 1,
                GeminiPart::Other(_) => {}
            }
        }
    }

    json!({
        "candidates": candidates.len(),
        "textParts": text_parts,
        "imageParts": image_parts,
        "textPreview": text_preview
    })
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    fn inline(mime_type: &str, data: &str, file_name: &str) -> InlineImage {
        InlineImage {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
            file_name: file_name.to_string(),
        }
    }

    fn request_with_items(items: Vec<InlineImage>) -> StyleEditRequest {
        StyleEditRequest {
            base: inline("image/jpeg", "BASE", "me.jpg"),
            items,
            prompt: "apply the items".to_string(),
        }
    }

    fn parse(body: &str) -> GenerationOutcome {
        let response: GeminiResponse = serde_json::from_str(body).expect("valid response json");
        classify_response(response)
    }

    fn request_complete(received: &[u8]) -> bool {
        let text = String::from_utf8_lossy(received);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        received.len() >= header_end + 4 + content_length
    }

    async fn serve_once(status_line: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut received = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let read = socket.read(&mut buf).await.expect("read");
                if read == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..read]);
                if request_complete(&received) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&received).to_string()
        });
        (format!("http://{addr}/v1beta"), handle)
    }

    fn editor_for(base_url: &str) -> GeminiImageEditor {
        GeminiImageEditor::new(
            "test-key",
            base_url,
            "gemini-test-image",
            "permissive",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn parts_put_base_first_and_prompt_last() {
        let request = request_with_items(vec![inline("image/png", "ITEM", "hat.png")]);
        let parts = build_request_parts(&request);

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["inlineData"]["data"], "BASE");
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[1]["inlineData"]["data"], "ITEM");
        assert_eq!(parts[2]["text"], "apply the items");
    }

    #[test]
    fn parts_keep_item_collection_order() {
        let items = (0..4)
            .map(|index| inline("image/png", &format!("ITEM{index}"), "item.png"))
            .collect::<Vec<_>>();
        let parts = build_request_parts(&request_with_items(items));

        let item_data = parts[1..parts.len() - 1]
            .iter()
            .map(|part| part["inlineData"]["data"].as_str().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(item_data, vec!["ITEM0", "ITEM1", "ITEM2", "ITEM3"]);
    }

    #[test]
    fn items_forward_their_own_type() {
        let request = request_with_items(vec![inline("image/webp", "ITEM", "scarf.webp")]);
        let parts = build_request_parts(&request);
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/webp");
    }

    #[test]
    fn request_mime_falls_back_to_extension() {
        assert_eq!(request_mime_type("image/JPG", "x"), "image/jpeg");
        assert_eq!(request_mime_type("", "photo.JPEG"), "image/jpeg");
        assert_eq!(request_mime_type("application/octet-stream", "look.webp"), "image/webp");
        assert_eq!(request_mime_type("", "shot.png"), "image/png");
        assert_eq!(request_mime_type("", "scan.tiff"), "image/png");
        assert_eq!(request_mime_type("", "noextension"), "image/png");
    }

    #[test]
    fn payload_requests_image_and_text_modalities() {
        let payload = build_edit_payload(&request_with_items(vec![]), "standard");
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["IMAGE", "TEXT"])
        );
        assert_eq!(
            payload["safetySettings"][0]["threshold"],
            "BLOCK_MEDIUM_AND_ABOVE"
        );
        assert_eq!(payload["contents"][0]["role"], "user");
    }

    #[test]
    fn payload_summary_hides_image_data() {
        let payload = build_edit_payload(
            &request_with_items(vec![inline("image/png", "SECRETDATA", "a.png")]),
            "permissive",
        );
        let summary = summarize_gemini_payload(&payload).to_string();
        assert!(!summary.contains("SECRETDATA"));
        assert!(summary.contains("\"dataLen\":10"));
    }

    #[test]
    fn first_image_part_wins() {
        let outcome = parse(
            r#"{"candidates":[{"content":{"parts":[
                {"text":"Here you go"},
                {"inlineData":{"mimeType":"image/jpeg","data":"XYZ"}},
                {"inlineData":{"mimeType":"image/png","data":"LATER"}}
            ]}}]}"#,
        );
        let image = outcome.into_result().expect("image");
        assert_eq!(image.data_url(), "data:image/jpeg;base64,XYZ");
    }

    #[test]
    fn unknown_parts_are_skipped() {
        let outcome = parse(
            r#"{"candidates":[{"content":{"parts":[
                {"thoughtSignature":"c2ln"},
                {"functionCall":{"name":"noop","args":{}}},
                {"inlineData":{"mimeType":"image/webp","data":"WEBP"}}
            ]}}]}"#,
        );
        let image = outcome.into_result().expect("image");
        assert_eq!(image.mime_type, "image/webp");
        assert_eq!(image.data, "WEBP");
    }

    #[test]
    fn text_only_reply_becomes_refusal_with_text() {
        let outcome = parse(r#"{"candidates":[{"content":{"parts":[{"text":"blocked by policy"}]}}]}"#);
        let err = outcome.into_result().expect_err("text is not an image");
        assert!(err.to_string().contains("blocked by policy"));
        assert_eq!(err, GenerationError::UnexpectedText("blocked by policy".to_string()));
    }

    #[test]
    fn empty_reply_is_generic_refusal() {
        assert_eq!(parse(r#"{}"#), GenerationOutcome::Empty);
        assert_eq!(parse(r#"{"candidates":[]}"#), GenerationOutcome::Empty);
        assert_eq!(
            parse(r#"{"candidates":[{"content":{"role":"model"}}]}"#),
            GenerationOutcome::Empty
        );
        assert_eq!(
            parse(r#"{"candidates":[{"content":{"parts":[{"text":"  "}]}}]}"#)
                .into_result()
                .expect_err("blank text"),
            GenerationError::NoImage
        );
    }

    #[test]
    fn only_first_candidate_is_considered() {
        let outcome = parse(
            r#"{"candidates":[
                {"content":{"parts":[{"text":"refused"}]}},
                {"content":{"parts":[{"inlineData":{"mimeType":"image/png","data":"AAA"}}]}}
            ]}"#,
        );
        assert_eq!(outcome, GenerationOutcome::Text("refused".to_string()));
    }

    #[test]
    fn error_body_prefers_api_message() {
        let (message, _) = summarize_error_body(r#"{"error":{"code":403,"message":"API key not valid"}}"#);
        assert_eq!(message.as_deref(), Some("API key not valid"));
        let (message, summary) = summarize_error_body("  ");
        assert!(message.is_none());
        assert_eq!(summary, "empty response body");
    }

    #[tokio::test]
    async fn edit_returns_image_from_service() {
        let body = json!({
            "candidates": [{ "content": { "parts": [
                { "inlineData": { "mimeType": "image/png", "data": "AQID" } }
            ]}}]
        })
        .to_string();
        let (base_url, server) = serve_once("200 OK", body).await;
        let editor = editor_for(&base_url);

        let image = editor
            .edit(&request_with_items(vec![inline("image/png", "ITEM", "hat.png")]))
            .await
            .expect("image returned");
        assert_eq!(image.data_url(), "data:image/png;base64,AQID");

        let raw_request = server.await.expect("server task");
        assert!(raw_request.starts_with("POST /v1beta/models/gemini-test-image:generateContent"));
        assert!(raw_request.to_ascii_lowercase().contains("x-goog-api-key: test-key"));
    }

    #[tokio::test]
    async fn edit_maps_http_failure_to_transport_error() {
        let body = json!({ "error": { "code": 500, "message": "backend exploded" } }).to_string();
        let (base_url, server) = serve_once("500 Internal Server Error", body).await;
        let editor = editor_for(&base_url);

        let err = editor
            .edit(&request_with_items(vec![inline("image/png", "ITEM", "hat.png")]))
            .await
            .expect_err("server error");
        assert_eq!(err, GenerationError::Transport);
        assert!(!err.to_string().contains("backend exploded"));
        let _ = server.await;
    }

    #[tokio::test]
    async fn edit_maps_malformed_body_to_transport_error() {
        let (base_url, server) = serve_once("200 OK", "not json".to_string()).await;
        let editor = editor_for(&base_url);

        let err = editor
            .edit(&request_with_items(vec![]))
            .await
            .expect_err("malformed body");
        assert_eq!(err, GenerationError::Transport);
        let _ = server.await;
    }

    #[tokio::test]
    async fn edit_without_api_key_fails_as_transport() {
        let editor = GeminiImageEditor::new(
            "",
            "http://127.0.0.1:9/v1beta",
            "gemini-test-image",
            "permissive",
            Duration::from_secs(1),
        );
        let err = editor
            .edit(&request_with_items(vec![]))
            .await
            .expect_err("missing key");
        assert_eq!(err, GenerationError::Transport);
    }
}
