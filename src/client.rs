use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::envelope::Envelope;
use crate::tools::{ResponseKind, ToolProfile, join_url};
use crate::upload::{UploadedFile, has_allowed_extension, sanitize_filename};

lazy_static! {
    static ref QUOTED_FILENAME: Regex = Regex::new(r#"filename="(.+?)""#).unwrap();
    static ref EXTENDED_FILENAME: Regex = Regex::new(r"filename\*=UTF-8''([^;\s]+)").unwrap();
}

/// Failures of a relay call, worded for the person who clicked the button
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Validation(String),

    /// Non-2xx answer; `message` is the backend's `error` field or the status text
    #[error("{message}")]
    Http { status: u16, message: String },

    #[error("Could not reach {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("{feature} is not available for {tool}")]
    Unsupported {
        feature: &'static str,
        tool: &'static str,
    },

    #[error("File is still being processed")]
    StillPending,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A file returned by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl DownloadedFile {
    /// Write the file into `dir` under its (sanitised) filename
    pub async fn save_in(&self, dir: impl AsRef<Path>) -> std::io::Result<PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(sanitize_filename(&self.filename));
        tokio::fs::write(&path, &self.bytes).await?;
        Ok(path)
    }
}

/// What a successful relay call produced
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    /// The backend sent a file to save
    Download(DownloadedFile),
    /// The backend sent a status message (possibly carrying a file id)
    Status(Envelope),
}

/// Body of a `/health` answer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub status: String,

    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Talks to one tool's backend the way its page does
pub struct RelayClient {
    http: reqwest::Client,
    tool: &'static ToolProfile,
    base_url: String,
}

impl RelayClient {
    /// Client for `tool` at its hardcoded backend address
    pub fn new(tool: &'static ToolProfile) -> Self {
        Self::with_base_url(tool, tool.base_url)
    }

    /// Client for `tool` with the backend at a different address
    pub fn with_base_url(tool: &'static ToolProfile, base_url: impl Into<String>) -> Self {
        RelayClient {
            http: reqwest::Client::new(),
            tool,
            base_url: base_url.into(),
        }
    }

    pub fn tool(&self) -> &'static ToolProfile {
        self.tool
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Upload one file and interpret the answer
    ///
    /// The extension is checked before any request is made. Nothing is
    /// retried.
    pub async fn submit(&self, file: UploadedFile) -> Result<RelayOutcome, ClientError> {
        if !has_allowed_extension(&file.original_name, self.tool.extensions) {
            return Err(ClientError::Validation(self.tool.extension_hint()));
        }
        if file.bytes.is_empty() {
            return Err(ClientError::Validation("Uploaded file is empty".to_string()));
        }

        let url = self.url(self.tool.upload_path);
        info!("Uploading {} to {}", file.original_name, url);
        let response = forward(&self.http, &url, self.tool.field_name, &file).await?;
        interpret(response, self.tool.default_filename).await
    }

    /// Fetch the result of a two-step upload
    pub async fn download(&self, file_id: &str) -> Result<RelayOutcome, ClientError> {
        let path = self
            .tool
            .download_path
            .ok_or(ClientError::Unsupported {
                feature: "Download by file ID",
                tool: self.tool.slug,
            })?
            .replace("{id}", file_id);
        let url = self.url(&path);
        let response = self.get(&url).await?;
        interpret(response, self.tool.default_filename).await
    }

    /// Poll the download endpoint until the file is ready
    ///
    /// # Arguments
    /// * `file_id` - Id returned by the upload
    /// * `interval` - Pause between polls
    /// * `attempts` - Maximum number of polls
    ///
    /// # Returns
    /// * `Result<DownloadedFile, ClientError>` - The file, or `StillPending` once attempts run out
    pub async fn wait_for_download(
        &self,
        file_id: &str,
        interval: Duration,
        attempts: usize,
    ) -> Result<DownloadedFile, ClientError> {
        for attempt in 1..=attempts.max(1) {
            match self.download(file_id).await? {
                RelayOutcome::Download(file) => return Ok(file),
                RelayOutcome::Status(envelope) if envelope.is_pending() => {
                    debug!("{} still pending (poll {}/{})", file_id, attempt, attempts);
                    tokio::time::sleep(interval).await;
                }
                RelayOutcome::Status(envelope) => {
                    return Err(ClientError::Decode(
                        envelope
                            .user_message()
                            .unwrap_or("expected a file, got a status message")
                            .to_string(),
                    ));
                }
            }
        }
        Err(ClientError::StillPending)
    }

    /// Upload, then follow up with a download for two-step tools
    ///
    /// Tools answering with the file itself or with a status message return
    /// whatever `submit` produced.
    pub async fn submit_and_fetch(
        &self,
        file: UploadedFile,
        interval: Duration,
        attempts: usize,
    ) -> Result<RelayOutcome, ClientError> {
        match self.submit(file).await? {
            RelayOutcome::Status(envelope) if self.tool.response == ResponseKind::TwoStep => {
                let Some(id) = envelope.file_id.clone() else {
                    return Ok(RelayOutcome::Status(envelope));
                };
                let file = self.wait_for_download(&id, interval, attempts).await?;
                Ok(RelayOutcome::Download(file))
            }
            outcome => Ok(outcome),
        }
    }

    /// Download the tool's blank input template
    pub async fn fetch_template(&self) -> Result<DownloadedFile, ClientError> {
        let (path, default_name) = self.tool.template_download.ok_or(ClientError::Unsupported {
            feature: "Template download",
            tool: self.tool.slug,
        })?;
        let url = self.url(path);
        match interpret(self.get(&url).await?, default_name).await? {
            RelayOutcome::Download(file) => Ok(file),
            RelayOutcome::Status(envelope) => Err(ClientError::Decode(
                envelope.user_message().unwrap_or("no template in response").to_string(),
            )),
        }
    }

    pub async fn health(&self) -> Result<HealthReport, ClientError> {
        let path = self.tool.health_path.ok_or(ClientError::Unsupported {
            feature: "Health check",
            tool: self.tool.slug,
        })?;
        let url = self.url(path);
        let response = self.get(&url).await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        response
            .json::<HealthReport>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Ask the backend to reset its shared template
    pub async fn clear_template(&self) -> Result<String, ClientError> {
        let path = self.tool.clear_template_path.ok_or(ClientError::Unsupported {
            feature: "Clearing the template",
            tool: self.tool.slug,
        })?;
        let url = self.url(path);
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|source| ClientError::Transport { url: url.clone(), source })?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(envelope
            .message
            .unwrap_or_else(|| "Template cleared successfully".to_string()))
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ClientError> {
        self.http
            .get(url)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.to_string(),
                source,
            })
    }
}

/// Send one file as a multipart form and return the raw response
///
/// Shared by the client and by the proxy when it forwards to a backend.
pub async fn forward(
    http: &reqwest::Client,
    url: &str,
    field_name: &str,
    file: &UploadedFile,
) -> Result<reqwest::Response, ClientError> {
    let mut part = Part::bytes(file.bytes.clone()).file_name(file.original_name.clone());
    if let Some(content_type) = &file.content_type {
        part = part
            .mime_str(content_type)
            .map_err(|e| ClientError::Validation(format!("Invalid content type: {}", e)))?;
    }
    let form = Form::new().part(field_name.to_string(), part);

    http.post(url)
        .header(
            reqwest::header::ACCEPT,
            "application/json, application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        )
        .multipart(form)
        .send()
        .await
        .map_err(|source| ClientError::Transport {
            url: url.to_string(),
            source,
        })
}

/// Filename from a `Content-Disposition` header
///
/// Prefers the RFC 5987 `filename*` form when present, then `filename="..."`.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    if let Some(encoded) = EXTENDED_FILENAME.captures(header).and_then(|c| c.get(1)) {
        if let Ok(decoded) = urlencoding::decode(encoded.as_str()) {
            return Some(decoded.into_owned());
        }
    }
    QUOTED_FILENAME
        .captures(header)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether a response should be saved as a file rather than read as a message
pub fn is_attachment(content_type: &str, disposition: Option<&str>) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    if content_type.contains("application/json") {
        return false;
    }
    if disposition.is_some_and(|d| d.to_ascii_lowercase().starts_with("attachment")) {
        return true;
    }
    ["spreadsheet", "officedocument", "ms-excel", "msword", "zip", "octet-stream"]
        .iter()
        .any(|marker| content_type.contains(marker))
}

fn header_str<'a>(headers: &'a HeaderMap, name: reqwest::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Turn a backend response into an outcome or a user-facing error
async fn interpret(response: reqwest::Response, default_name: &str) -> Result<RelayOutcome, ClientError> {
    if !response.status().is_success() {
        return Err(http_error(response).await);
    }

    let headers = response.headers().clone();
    let content_type = header_str(&headers, CONTENT_TYPE).unwrap_or_default().to_string();
    let disposition = header_str(&headers, CONTENT_DISPOSITION);

    if is_attachment(&content_type, disposition) {
        let filename = disposition
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| default_name.to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?
            .to_vec();
        info!("Received {} ({} bytes)", filename, bytes.len());
        return Ok(RelayOutcome::Download(DownloadedFile {
            filename,
            content_type,
            bytes,
        }));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| ClientError::Decode(e.to_string()))?;
    match serde_json::from_slice::<Envelope>(&body) {
        Ok(envelope) => Ok(RelayOutcome::Status(envelope)),
        Err(e) if content_type.contains("application/json") => match json_message(&body) {
            Some(message) => Ok(RelayOutcome::Status(Envelope::ok(message))),
            None => Err(ClientError::Decode(e.to_string())),
        },
        Err(_) => {
            let text = String::from_utf8_lossy(&body).trim().to_string();
            Ok(RelayOutcome::Status(Envelope::ok(if text.is_empty() {
                "File processed successfully!".to_string()
            } else {
                text
            })))
        }
    }
}

/// Message for a non-2xx response: the JSON `error` if there is one, else the status text
async fn http_error(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let fallback = status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16()));

    let message = match response.bytes().await {
        Ok(body) => serde_json::from_slice::<Envelope>(&body)
            .ok()
            .and_then(|envelope| envelope.user_message().map(str::to_string))
            .or_else(|| json_message(&body))
            .unwrap_or(fallback),
        Err(e) => {
            warn!("Could not read error body: {}", e);
            fallback
        }
    };

    ClientError::Http {
        status: status.as_u16(),
        message,
    }
}

/// `error` or `message` from a JSON body that does not fit the envelope
fn json_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    ["error", "message", "detail"]
        .iter()
        .find_map(|key| match value.get(key)? {
            Value::Null => None,
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_read_from_disposition() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"RCM-High-Level-View.xlsx\"").as_deref(),
            Some("RCM-High-Level-View.xlsx")
        );
        assert_eq!(
            filename_from_disposition(
                "attachment; filename=\"Pr_fung.xlsx\"; filename*=UTF-8''Pr%C3%BCfung.xlsx"
            )
            .as_deref(),
            Some("Prüfung.xlsx")
        );
        assert_eq!(filename_from_disposition("attachment"), None);
    }

    #[test]
    fn messages_are_found_in_odd_json_shapes() {
        assert_eq!(
            json_message(br#"{"error": {"code": 7}, "message": "ignored"}"#).as_deref(),
            Some(r#"{"code":7}"#)
        );
        assert_eq!(
            json_message(br#"{"error": null, "message": "Gaps generated"}"#).as_deref(),
            Some("Gaps generated")
        );
        assert_eq!(json_message(b"[1, 2]"), None);
        assert_eq!(json_message(b"not json"), None);
    }

    #[test]
    fn attachment_detection_follows_content_type() {
        assert!(is_attachment(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            None
        ));
        assert!(is_attachment("application/zip", None));
        assert!(is_attachment("text/plain", Some("attachment; filename=\"a.mmd\"")));
        assert!(!is_attachment("application/json; charset=utf-8", Some("attachment")));
        assert!(!is_attachment("text/html", None));
    }

    #[test]
    fn client_rejects_wrong_extension_without_a_request() {
        let tool = crate::tools::find_tool("rcm-converter").unwrap();
        // nothing listens on port 9; a request would fail with Transport instead
        let client = RelayClient::with_base_url(tool, "http://127.0.0.1:9");
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let result = runtime.block_on(client.submit(UploadedFile::new("notes.txt", vec![1])));
        match result {
            Err(ClientError::Validation(msg)) => {
                assert_eq!(msg, "Only .xlsx or .xls files are allowed")
            }
            other => panic!("expected a validation error, got {other:?}"),
        }
    }
}
