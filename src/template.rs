use log::info;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template file not found")]
    Missing(PathBuf),

    #[error("Failed to rewrite template: {0}")]
    Write(#[from] XlsxError),

    #[error("Failed to rewrite template: {0}")]
    Io(#[from] std::io::Error),
}

/// Reset a shared working template to its header row
///
/// Rows written by earlier runs are dropped by writing a fresh workbook with
/// only `headers` in row 1 over the existing file. The file must already
/// exist; a missing template is reported rather than created.
pub fn reset_to_headers(path: &Path, headers: &[String]) -> Result<(), TemplateError> {
    if !path.is_file() {
        return Err(TemplateError::Missing(path.to_path_buf()));
    }

    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let worksheet = workbook.add_worksheet();
    for (col, header) in headers.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, header.as_str(), &bold)?;
    }

    let buffer = workbook.save_to_buffer()?;
    std::fs::write(path, buffer)?;

    info!("Reset {} to {} header column(s)", path.display(), headers.len());
    Ok(())
}
