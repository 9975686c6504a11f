use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use std::path::{Path, PathBuf};

/// MIME type of `.xlsx` workbooks
pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Content type for a download, guessed from its filename
///
/// Office formats, zip archives and the rest are all resolved through
/// `mime_guess`; anything unknown is served as `application/octet-stream`.
///
/// # Arguments
/// * `filename` - Name the browser will save the file under
///
/// # Returns
/// * `String` - The MIME type to send
///
/// # Examples
/// ```
/// use ra_tools_hub::downloader::{content_type_for, XLSX_MIME};
///
/// assert_eq!(content_type_for("RCM-High-Level-View.xlsx"), XLSX_MIME);
/// assert_eq!(content_type_for("testing_templates.zip"), "application/zip");
/// ```
pub fn content_type_for(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// `Content-Disposition` value that makes a browser save the body as `filename`
///
/// The quoted `filename` parameter is restricted to printable ASCII so the
/// tool pages' `filename="(.+)"` match keeps working; names with other
/// characters also get an RFC 5987 `filename*` parameter.
///
/// # Examples
/// ```
/// use ra_tools_hub::downloader::content_disposition;
///
/// assert_eq!(
///     content_disposition("RCM-High-Level-View.xlsx"),
///     "attachment; filename=\"RCM-High-Level-View.xlsx\""
/// );
/// ```
pub fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();

    if ascii == filename {
        format!("attachment; filename=\"{}\"", ascii)
    } else {
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            ascii,
            urlencoding::encode(filename)
        )
    }
}

/// First path in `candidates` that exists as a file
pub fn first_existing(candidates: &[PathBuf]) -> Option<&PathBuf> {
    candidates.iter().find(|path| path.is_file())
}

/// Build an attachment response from bytes already in memory
pub fn attachment(bytes: Vec<u8>, download_name: &str) -> Response {
    let content_type = content_type_for(download_name);
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&content_disposition(download_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

/// Read a file from disk and serve it as `download_name`
pub async fn file_response(path: &Path, download_name: &str) -> std::io::Result<Response> {
    let bytes = tokio::fs::read(path).await?;
    Ok(attachment(bytes, download_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn office_types_are_recognised() {
        assert_eq!(content_type_for("a.xlsx"), XLSX_MIME);
        assert_eq!(
            content_type_for("Scoping.docx"),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        assert_eq!(content_type_for("no-extension"), "application/octet-stream");
    }

    #[test]
    fn non_ascii_names_get_an_encoded_parameter() {
        assert_eq!(
            content_disposition("Prüfung \"Q3\".xlsx"),
            "attachment; filename=\"Pr_fung _Q3_.xlsx\"; filename*=UTF-8''Pr%C3%BCfung%20%22Q3%22.xlsx"
        );
    }

    #[test]
    fn first_existing_skips_missing_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("template.xlsx");
        std::fs::write(&file, b"t").unwrap();
        let candidates = vec![tmp.path().join("missing.xlsx"), tmp.path().to_path_buf(), file.clone()];
        assert_eq!(first_existing(&candidates), Some(&file));
        assert_eq!(first_existing(&candidates[..2]), None);
    }

    #[tokio::test]
    async fn file_response_sets_download_headers() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.xlsx");
        std::fs::write(&path, b"workbook").unwrap();

        let response = file_response(&path, "RCM-High-Level-View.xlsx").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], XLSX_MIME);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"RCM-High-Level-View.xlsx\""
        );
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"workbook");
    }
}
