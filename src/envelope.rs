use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::correlation::CorrelationId;

/// Version written into every envelope produced by this crate
pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Ok,
    Completed,
    Pending,
    Failed,
    Error,
    /// Any other value a backend sends (`success`, `fail`, ...)
    #[serde(other)]
    Unknown,
}

/// JSON body of every non-file response
///
/// The field names keep the shapes the tool pages already read (`message`,
/// `error`, `fileId`, `originalName`). Bodies from older backends that carry
/// no `version` or `status` still deserialize; unknown fields such as
/// `mermaid_code` are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, deserialize_with = "lenient_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EnvelopeStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    fn with_status(status: EnvelopeStatus) -> Self {
        Envelope {
            version: ENVELOPE_VERSION,
            status: Some(status),
            message: None,
            error: None,
            file_id: None,
            original_name: None,
            download_url: None,
            extra: Map::new(),
        }
    }

    /// Plain acknowledgement, e.g. after clearing a template
    pub fn ok(message: impl Into<String>) -> Self {
        Envelope {
            message: Some(message.into()),
            ..Envelope::with_status(EnvelopeStatus::Ok)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope {
            error: Some(message.into()),
            ..Envelope::with_status(EnvelopeStatus::Error)
        }
    }

    /// Upload processed; the result can be fetched with `download_url`
    pub fn completed(id: &CorrelationId, original_name: &str, download_url: String) -> Self {
        Envelope {
            message: Some("File processed successfully".to_string()),
            file_id: Some(id.to_string()),
            original_name: Some(original_name.to_string()),
            download_url: Some(download_url),
            ..Envelope::with_status(EnvelopeStatus::Completed)
        }
    }

    /// Upload accepted and queued; poll `download_url` until it stops answering pending
    pub fn pending(id: &CorrelationId, original_name: Option<&str>, download_url: String) -> Self {
        Envelope {
            message: Some("File accepted for processing".to_string()),
            file_id: Some(id.to_string()),
            original_name: original_name.map(str::to_string),
            download_url: Some(download_url),
            ..Envelope::with_status(EnvelopeStatus::Pending)
        }
    }

    pub fn failed(id: &CorrelationId, message: impl Into<String>) -> Self {
        Envelope {
            error: Some(message.into()),
            file_id: Some(id.to_string()),
            ..Envelope::with_status(EnvelopeStatus::Failed)
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == Some(EnvelopeStatus::Pending)
    }

    /// The text a tool page would show for this body
    pub fn user_message(&self) -> Option<&str> {
        self.error.as_deref().or(self.message.as_deref())
    }
}

/// Versions that are not a small unsigned integer read as 0 (unversioned)
fn lenient_version<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completed_envelope_keeps_legacy_field_names() {
        let id = CorrelationId::parse("1700000000000-42").unwrap();
        let body = serde_json::to_value(Envelope::completed(
            &id,
            "report.xlsx",
            "/download/1700000000000-42".to_string(),
        ))
        .unwrap();

        assert_eq!(
            body,
            json!({
                "version": 1,
                "status": "completed",
                "message": "File processed successfully",
                "fileId": "1700000000000-42",
                "originalName": "report.xlsx",
                "downloadUrl": "/download/1700000000000-42",
            })
        );
    }

    #[test]
    fn legacy_bodies_still_parse() {
        let legacy: Envelope = serde_json::from_value(json!({ "error": "No file part" })).unwrap();
        assert_eq!(legacy.version, 0);
        assert_eq!(legacy.status, None);
        assert_eq!(legacy.user_message(), Some("No file part"));

        let flowchart: Envelope =
            serde_json::from_value(json!({ "mermaid_code": "graph TD\n A-->B" })).unwrap();
        assert_eq!(flowchart.user_message(), None);
        assert_eq!(flowchart.extra["mermaid_code"], json!("graph TD\n A-->B"));
    }

    #[test]
    fn foreign_status_and_version_values_still_parse() {
        let success: Envelope = serde_json::from_value(json!({
            "status": "success",
            "message": "Gaps generated",
            "version": "2",
        }))
        .unwrap();
        assert_eq!(success.status, Some(EnvelopeStatus::Unknown));
        assert_eq!(success.version, 2);
        assert_eq!(success.user_message(), Some("Gaps generated"));
        assert!(!success.is_pending());

        let fail: Envelope = serde_json::from_value(json!({
            "status": "fail",
            "error": "Missing column 'Control ID'",
            "version": "beta",
        }))
        .unwrap();
        assert_eq!(fail.version, 0);
        assert_eq!(fail.user_message(), Some("Missing column 'Control ID'"));
    }

    #[test]
    fn error_wins_over_message() {
        let mut envelope = Envelope::ok("done");
        envelope.error = Some("broken".to_string());
        assert_eq!(envelope.user_message(), Some("broken"));
    }
}
