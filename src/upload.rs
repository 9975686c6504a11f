use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

use crate::tools::describe_extensions;

lazy_static! {
    static ref UNSAFE_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._-]+").unwrap();
}

/// A file received from (or about to be sent in) a form submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Raw file contents
    pub bytes: Vec<u8>,

    /// Filename as chosen by the user
    pub original_name: String,

    /// MIME type declared by the browser, if any
    pub content_type: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("No file uploaded")]
    Missing,

    #[error("Uploaded file is empty")]
    Empty,

    #[error("{0}")]
    InvalidExtension(String),
}

impl UploadedFile {
    pub fn new(original_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        UploadedFile {
            bytes,
            original_name: original_name.into(),
            content_type: None,
        }
    }

    /// Read a file from disk, keeping its name as the original filename
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let original_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(UploadedFile::new(original_name, bytes))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Check the file has content and an accepted extension
    ///
    /// Only the filename suffix is inspected; the contents are never sniffed.
    pub fn validate<S: AsRef<str>>(&self, allowed: &[S]) -> Result<(), UploadError> {
        if !has_allowed_extension(&self.original_name, allowed) {
            return Err(UploadError::InvalidExtension(describe_extensions(
                allowed.iter().map(|ext| ext.as_ref()),
            )));
        }
        if self.bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        Ok(())
    }

    /// Filename that is safe to join onto a directory
    pub fn safe_name(&self) -> String {
        sanitize_filename(&self.original_name)
    }
}

/// Lowercase extension of a filename, without the dot
pub fn extension_of(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Case-insensitive suffix check against a list of extensions
pub fn has_allowed_extension<S: AsRef<str>>(name: &str, allowed: &[S]) -> bool {
    match extension_of(name) {
        Some(ext) => allowed
            .iter()
            .any(|candidate| candidate.as_ref().trim_start_matches('.').eq_ignore_ascii_case(&ext)),
        None => false,
    }
}

/// Strip directory components and replace anything outside `[A-Za-z0-9._-]`
///
/// Mirrors what the backends expect from `secure_filename`: the result never
/// contains a separator, never starts with a dot and is never empty.
pub fn sanitize_filename(name: &str) -> String {
    let last = name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    let replaced = UNSAFE_CHARS.replace_all(last.trim(), "_");
    let cleaned = replaced.trim_start_matches(['.', '_']).trim_end_matches('_');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
