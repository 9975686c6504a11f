use serde::Serialize;

/// How a tool's backend answers a successful upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseKind {
    /// The upload response body is the generated file
    Attachment,
    /// The upload response carries a `fileId`; the file is fetched from the download path
    TwoStep,
    /// The upload response is a JSON status message
    Status,
}

/// Static description of one tool page in the hub
///
/// Every tool talks to its own backend on a fixed host and port. The profile
/// records everything the relay needs to reach it and to name the result.
#[derive(Debug, Clone, Serialize)]
pub struct ToolProfile {
    /// URL-safe identifier, also used by `RA_TOOL`
    pub slug: &'static str,

    /// Human readable name shown on the hub
    pub name: &'static str,

    /// Backend base URL (scheme, host, port and optional path prefix)
    pub base_url: &'static str,

    /// Path of the upload endpoint relative to `base_url`
    pub upload_path: &'static str,

    /// Multipart field the backend reads the file from
    pub field_name: &'static str,

    /// Accepted file extensions, lowercase and without the dot
    pub extensions: &'static [&'static str],

    /// Name used when the backend does not send a `Content-Disposition`
    pub default_filename: &'static str,

    pub response: ResponseKind,

    /// Download path for two-step tools; `{id}` is replaced by the file id
    pub download_path: Option<&'static str>,

    pub health_path: Option<&'static str>,

    pub clear_template_path: Option<&'static str>,

    /// Path serving a blank input template, with its default filename
    pub template_download: Option<(&'static str, &'static str)>,

    /// Local processing command used when this tool is served by the proxy
    ///
    /// Empty for tools whose backend is a long-running service; the proxy
    /// forwards to `upload_url()` instead.
    pub default_command: &'static [&'static str],

    /// Template the processing command starts from
    pub template_file: Option<&'static str>,

    /// Header row kept when the working template is cleared
    pub template_headers: &'static [&'static str],
}

const EXCEL: &[&str] = &["xlsx", "xls"];
const WORD: &[&str] = &["docx"];

/// Every tool reachable from the hub
pub static TOOLS: &[ToolProfile] = &[
    ToolProfile {
        slug: "rcm-converter",
        name: "RCM High-Level View Converter",
        base_url: "http://localhost:3000/api/rcm-converter",
        upload_path: "/upload",
        field_name: "file",
        extensions: EXCEL,
        default_filename: "RCM-High-Level-View.xlsx",
        response: ResponseKind::TwoStep,
        download_path: Some("/download/{id}"),
        health_path: Some("/health"),
        clear_template_path: None,
        template_download: None,
        default_command: &[
            "python",
            "backends/rcm-converter/app/main.py",
            "{input}",
            "{template}",
        ],
        template_file: Some("rcm-control-view.xlsx"),
        template_headers: &[],
    },
    ToolProfile {
        slug: "scoping-document",
        name: "Scoping Document Builder",
        base_url: "http://localhost:5000",
        upload_path: "/upload",
        field_name: "file",
        extensions: WORD,
        default_filename: "Scoping Document - Updated.xlsx",
        response: ResponseKind::Attachment,
        download_path: None,
        health_path: Some("/health"),
        clear_template_path: Some("/clear-template"),
        template_download: None,
        default_command: &[],
        template_file: Some("Scoping Document.xlsx"),
        template_headers: &[
            "Process",
            "Sub-Process",
            "Application",
            "Control Description",
            "Owner",
        ],
    },
    ToolProfile {
        slug: "step-writer",
        name: "SOX Step Writer",
        base_url: "http://localhost:3002",
        upload_path: "/generate-test-steps",
        field_name: "files",
        extensions: EXCEL,
        default_filename: "SOX_Test_Steps_Template.xlsx",
        response: ResponseKind::Attachment,
        download_path: None,
        health_path: None,
        clear_template_path: None,
        template_download: None,
        default_command: &[],
        template_file: None,
        template_headers: &[],
    },
    ToolProfile {
        slug: "gap-builder",
        name: "ITGC Gap Builder",
        base_url: "http://localhost:5002",
        upload_path: "/api/generate-gaps",
        field_name: "file",
        extensions: EXCEL,
        default_filename: "itgc_gaps_recommendations.xlsx",
        response: ResponseKind::Attachment,
        download_path: None,
        health_path: None,
        clear_template_path: None,
        template_download: None,
        default_command: &[],
        template_file: None,
        template_headers: &[],
    },
    ToolProfile {
        slug: "rcm-testing",
        name: "RCM Testing Template Generator",
        base_url: "http://localhost:3003",
        upload_path: "/api/generate-testing",
        field_name: "file",
        extensions: EXCEL,
        default_filename: "testing_templates.zip",
        response: ResponseKind::Attachment,
        download_path: None,
        health_path: Some("/health"),
        clear_template_path: None,
        template_download: Some((
            "/api/download-template",
            "ITGC Testing Upload Template.xlsx",
        )),
        default_command: &[],
        template_file: Some("Testing Template.xlsx"),
        template_headers: &[],
    },
    ToolProfile {
        slug: "rcm-builder",
        name: "Risk Control Matrix Builder",
        base_url: "http://localhost:3001",
        upload_path: "/api/generate-matrix",
        field_name: "file",
        extensions: WORD,
        default_filename: "risk_control_matrix.xlsx",
        response: ResponseKind::Attachment,
        download_path: None,
        health_path: None,
        clear_template_path: None,
        template_download: None,
        default_command: &[],
        template_file: None,
        template_headers: &[],
    },
    ToolProfile {
        slug: "flowchart-creator",
        name: "Process Flowchart Creator",
        base_url: "http://localhost:3003",
        upload_path: "/api/create-flowchart",
        field_name: "document",
        extensions: WORD,
        default_filename: "flowchart.mmd",
        response: ResponseKind::Status,
        download_path: None,
        health_path: None,
        clear_template_path: None,
        template_download: None,
        default_command: &[],
        template_file: None,
        template_headers: &[],
    },
];

/// Look up a tool by slug
pub fn find_tool(slug: &str) -> Option<&'static ToolProfile> {
    TOOLS.iter().find(|tool| tool.slug.eq_ignore_ascii_case(slug.trim()))
}

impl ToolProfile {
    pub fn upload_url(&self) -> String {
        join_url(self.base_url, self.upload_path)
    }

    /// "Only .xlsx or .xls files are allowed" style message for this tool
    pub fn extension_hint(&self) -> String {
        describe_extensions(self.extensions.iter().copied())
    }
}

/// Render an extension list as a user-facing sentence
pub fn describe_extensions<'a>(extensions: impl IntoIterator<Item = &'a str>) -> String {
    let dotted: Vec<String> = extensions
        .into_iter()
        .map(|ext| format!(".{}", ext.trim_start_matches('.')))
        .collect();
    match dotted.len() {
        0 => "No file types are accepted".to_string(),
        1 => format!("Only {} files are allowed", dotted[0]),
        n => format!(
            "Only {} or {} files are allowed",
            dotted[..n - 1].join(", "),
            dotted[n - 1]
        ),
    }
}

/// Join a base URL and a path without doubling or dropping the slash
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_unique() {
        for (i, tool) in TOOLS.iter().enumerate() {
            assert!(
                TOOLS[i + 1..].iter().all(|other| other.slug != tool.slug),
                "duplicate slug {}",
                tool.slug
            );
        }
    }

    #[test]
    fn find_tool_ignores_case() {
        let tool = find_tool("RCM-Converter").expect("rcm converter is registered");
        assert_eq!(tool.default_filename, "RCM-High-Level-View.xlsx");
        assert!(find_tool("does-not-exist").is_none());
    }

    #[test]
    fn urls_are_joined_cleanly() {
        let tool = find_tool("rcm-converter").unwrap();
        assert_eq!(
            tool.upload_url(),
            "http://localhost:3000/api/rcm-converter/upload"
        );
        assert_eq!(tool.response, ResponseKind::TwoStep);
        assert_eq!(tool.download_path, Some("/download/{id}"));
        assert_eq!(join_url("http://a/", "/b"), "http://a/b");
    }

    #[test]
    fn attachment_tools_have_no_download_path() {
        let tool = find_tool("gap-builder").unwrap();
        assert_eq!(tool.response, ResponseKind::Attachment);
        assert!(tool.download_path.is_none());
    }

    #[test]
    fn extension_hint_reads_naturally() {
        assert_eq!(
            find_tool("step-writer").unwrap().extension_hint(),
            "Only .xlsx or .xls files are allowed"
        );
        assert_eq!(
            find_tool("flowchart-creator").unwrap().extension_hint(),
            "Only .docx files are allowed"
        );
    }
}
